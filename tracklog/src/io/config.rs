//! Tracking configuration (TOML).

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::params::{
    DEFAULT_BATCH_SIZE, DEFAULT_IGNORED_PREFIXES, DEFAULT_MAX_VALUE_LEN, ParamRules,
};
use crate::core::run_params::RunSelection;
use crate::io::monitor::MonitorOptions;

pub const TRACKING_URI_ENV: &str = "MLFLOW_TRACKING_URI";

/// Logger configuration.
///
/// Missing fields take defaults so a minimal file only names what differs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrackingConfig {
    pub experiment_name: String,
    /// Recorded as the `projectName` tag.
    pub project_name: String,
    pub run_name: Option<String>,
    /// Existing run to resume.
    pub run_id: Option<String>,
    /// Existing run to fork from.
    pub fork_run_id: Option<String>,
    /// Resume into a child run instead of reopening `run_id` itself.
    pub on_resume_create_child: bool,

    /// Tracking server; `MLFLOW_TRACKING_URI` is used when unset.
    pub tracking_uri: Option<String>,
    /// Log to `save_dir` instead of a server.
    pub offline: bool,
    pub authentication: bool,
    pub token_file: Option<PathBuf>,
    pub save_dir: PathBuf,

    pub log_hyperparams: bool,
    pub hyperparams: HyperparamsConfig,
    pub terminal_log: TerminalLogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HyperparamsConfig {
    /// Flattened keys starting with any of these are not logged.
    pub ignored_prefixes: Vec<String>,
    /// Values longer than this many characters are truncated.
    pub max_value_len: usize,
    pub batch_size: usize,
}

impl Default for HyperparamsConfig {
    fn default() -> Self {
        Self {
            ignored_prefixes: DEFAULT_IGNORED_PREFIXES
                .iter()
                .map(|prefix| prefix.to_string())
                .collect(),
            max_value_len: DEFAULT_MAX_VALUE_LEN,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TerminalLogConfig {
    pub enabled: bool,
    /// Local root for terminal logs; defaults to `save_dir`.
    pub artifact_save_dir: Option<PathBuf>,
    pub flush_interval_secs: u64,
    pub check_interval_ms: u64,
}

impl Default for TerminalLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            artifact_save_dir: None,
            flush_interval_secs: 30,
            check_interval_ms: 1000,
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            experiment_name: "lightning_logs".to_string(),
            project_name: String::new(),
            run_name: None,
            run_id: None,
            fork_run_id: None,
            on_resume_create_child: true,
            tracking_uri: None,
            offline: false,
            authentication: false,
            token_file: None,
            save_dir: PathBuf::from("./mlruns"),
            log_hyperparams: true,
            hyperparams: HyperparamsConfig::default(),
            terminal_log: TerminalLogConfig::default(),
        }
    }
}

impl TrackingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.experiment_name.trim().is_empty() {
            return Err(anyhow!("experiment_name must be non-empty"));
        }
        if self.hyperparams.batch_size == 0 {
            return Err(anyhow!("hyperparams.batch_size must be > 0"));
        }
        if self.hyperparams.max_value_len == 0 {
            return Err(anyhow!("hyperparams.max_value_len must be > 0"));
        }
        if self.terminal_log.flush_interval_secs == 0 {
            return Err(anyhow!("terminal_log.flush_interval_secs must be > 0"));
        }
        if self.terminal_log.check_interval_ms == 0 {
            return Err(anyhow!("terminal_log.check_interval_ms must be > 0"));
        }
        let options = self.monitor_options();
        if options.check_interval > options.flush_interval {
            return Err(anyhow!(
                "terminal_log.check_interval_ms must not exceed terminal_log.flush_interval_secs"
            ));
        }
        if self.run_id.is_some() && self.fork_run_id.is_some() {
            return Err(anyhow!("run_id and fork_run_id are mutually exclusive"));
        }
        if !self.offline && self.resolved_tracking_uri().is_none() {
            return Err(anyhow!(
                "tracking_uri must be set (or {TRACKING_URI_ENV} exported) unless offline = true"
            ));
        }
        Ok(())
    }

    /// Configured tracking URI, else `MLFLOW_TRACKING_URI`.
    pub fn resolved_tracking_uri(&self) -> Option<String> {
        self.tracking_uri
            .clone()
            .or_else(|| env::var(TRACKING_URI_ENV).ok())
            .filter(|uri| !uri.trim().is_empty())
    }

    pub fn run_selection(&self) -> RunSelection<'_> {
        RunSelection {
            project_name: &self.project_name,
            run_name: self.run_name.as_deref(),
            run_id: self.run_id.as_deref(),
            fork_run_id: self.fork_run_id.as_deref(),
            on_resume_create_child: self.on_resume_create_child,
        }
    }

    pub fn param_rules(&self) -> ParamRules {
        ParamRules {
            ignored_prefixes: self.hyperparams.ignored_prefixes.clone(),
            max_value_len: self.hyperparams.max_value_len,
        }
    }

    pub fn monitor_options(&self) -> MonitorOptions {
        MonitorOptions {
            flush_interval: Duration::from_secs(self.terminal_log.flush_interval_secs),
            check_interval: Duration::from_millis(self.terminal_log.check_interval_ms),
        }
    }

    pub fn artifact_save_dir(&self) -> &Path {
        self.terminal_log
            .artifact_save_dir
            .as_deref()
            .unwrap_or(&self.save_dir)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `TrackingConfig::default()`.
pub fn load_config(path: &Path) -> Result<TrackingConfig> {
    let cfg = if path.exists() {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?
    } else {
        TrackingConfig::default()
    };
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline() -> TrackingConfig {
        TrackingConfig {
            offline: true,
            ..TrackingConfig::default()
        }
    }

    #[test]
    fn minimal_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("tracking.toml");
        fs::write(
            &path,
            "offline = true\nproject_name = \"demo\"\n\n[terminal_log]\nflush_interval_secs = 5\n",
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.project_name, "demo");
        assert_eq!(cfg.experiment_name, "lightning_logs");
        assert!(cfg.on_resume_create_child);
        assert_eq!(cfg.hyperparams.batch_size, 100);
        assert_eq!(
            cfg.monitor_options(),
            MonitorOptions {
                flush_interval: Duration::from_secs(5),
                check_interval: Duration::from_secs(1),
            }
        );
    }

    #[test]
    fn validation_rejects_bad_intervals() {
        let mut cfg = offline();
        cfg.terminal_log.check_interval_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = offline();
        cfg.terminal_log.flush_interval_secs = 1;
        cfg.terminal_log.check_interval_ms = 2000;
        assert!(cfg.validate().is_err());

        let mut cfg = offline();
        cfg.hyperparams.batch_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn resume_and_fork_are_exclusive() {
        let cfg = TrackingConfig {
            run_id: Some("a".to_string()),
            fork_run_id: Some("b".to_string()),
            ..offline()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn explicit_uri_satisfies_online_mode() {
        let cfg = TrackingConfig {
            tracking_uri: Some("http://tracking:5000".to_string()),
            ..TrackingConfig::default()
        };
        cfg.validate().expect("valid");
        assert_eq!(
            cfg.resolved_tracking_uri().as_deref(),
            Some("http://tracking:5000")
        );
    }

    #[test]
    fn artifact_dir_defaults_to_save_dir() {
        let mut cfg = offline();
        assert_eq!(cfg.artifact_save_dir(), Path::new("./mlruns"));
        cfg.terminal_log.artifact_save_dir = Some(PathBuf::from("/scratch/logs"));
        assert_eq!(cfg.artifact_save_dir(), Path::new("/scratch/logs"));
    }
}
