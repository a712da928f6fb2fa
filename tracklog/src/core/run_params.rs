//! Deciding how a training job maps onto a tracking run.
//!
//! A job either starts a fresh run, resumes an existing run in place, resumes
//! as a child of an existing run, or forks from one. The decision and the tags
//! it implies are pure functions of the configuration and the command line.

use std::collections::BTreeMap;

pub const TAG_PROJECT_NAME: &str = "projectName";
pub const TAG_COMMAND: &str = "command";
pub const TAG_PARENT_RUN_ID: &str = "mlflow.parentRunId";
pub const TAG_RESUMED_RUN: &str = "resumedRun";
pub const TAG_FORKED_RUN: &str = "forkedRun";
pub const TAG_FORKED_RUN_ID: &str = "forkedRunId";

/// The run-selection subset of the tracking configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunSelection<'a> {
    pub project_name: &'a str,
    pub run_name: Option<&'a str>,
    pub run_id: Option<&'a str>,
    pub fork_run_id: Option<&'a str>,
    pub on_resume_create_child: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    /// Create a brand new run.
    New,
    /// Create a new run nested under `parent_run_id`.
    ResumeChild { parent_run_id: String },
    /// Keep logging into `run_id`.
    ResumeInPlace { run_id: String },
    /// Create a new run that records where it was forked from.
    Fork { parent_run_id: String },
}

impl RunMode {
    /// Run whose name a new run inherits when none is configured.
    pub fn inherited_from(&self) -> Option<&str> {
        match self {
            RunMode::ResumeChild { parent_run_id } => Some(parent_run_id),
            RunMode::ResumeInPlace { run_id } => Some(run_id),
            RunMode::New | RunMode::Fork { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlan {
    pub mode: RunMode,
    pub tags: BTreeMap<String, String>,
    pub run_name: Option<String>,
}

/// Render the job's command line as a tag value: script file name plus arguments.
pub fn command_tag(argv: &[String]) -> String {
    let Some((program, args)) = argv.split_first() else {
        return String::new();
    };
    let script = program.rsplit('/').next().unwrap_or(program);
    if args.is_empty() {
        script.to_string()
    } else {
        format!("{} {}", script, args.join(" "))
    }
}

pub fn plan_run(selection: &RunSelection<'_>, argv: &[String]) -> RunPlan {
    let mut tags = BTreeMap::new();
    tags.insert(
        TAG_PROJECT_NAME.to_string(),
        selection.project_name.to_string(),
    );
    tags.insert(TAG_COMMAND.to_string(), command_tag(argv));

    let mode = match (selection.run_id, selection.fork_run_id) {
        (Some(run_id), _) if selection.on_resume_create_child => {
            tags.insert(TAG_PARENT_RUN_ID.to_string(), run_id.to_string());
            tags.insert(TAG_RESUMED_RUN.to_string(), "True".to_string());
            RunMode::ResumeChild {
                parent_run_id: run_id.to_string(),
            }
        }
        (Some(run_id), _) => {
            tags.insert(TAG_RESUMED_RUN.to_string(), "True".to_string());
            RunMode::ResumeInPlace {
                run_id: run_id.to_string(),
            }
        }
        (None, Some(fork_id)) => {
            tags.insert(TAG_FORKED_RUN.to_string(), "True".to_string());
            tags.insert(TAG_FORKED_RUN_ID.to_string(), fork_id.to_string());
            RunMode::Fork {
                parent_run_id: fork_id.to_string(),
            }
        }
        (None, None) => RunMode::New,
    };

    RunPlan {
        mode,
        tags,
        run_name: selection.run_name.map(str::to_string),
    }
}

/// Configured name wins; otherwise inherit the resumed run's name.
pub fn choose_run_name(configured: Option<&str>, inherited: Option<&str>) -> Option<String> {
    configured.or(inherited).map(str::to_string)
}
