//! Offline tracking store on the local filesystem.
//!
//! Layout under the store root:
//!
//! ```text
//! <experiment_id>/meta.json
//! <experiment_id>/<run_id>/meta.json
//! <experiment_id>/<run_id>/params/<key>
//! <experiment_id>/<run_id>/tags/<key>
//! <experiment_id>/<run_id>/artifacts/<file name>
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::core::types::{Param, RunInfo, RunStatus};
use crate::io::files::write_atomic;
use crate::io::tracking::{ArtifactStore, TrackingClient};

const META_FILE: &str = "meta.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct ExperimentMeta {
    experiment_id: String,
    name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct RunMeta {
    run_id: String,
    run_name: String,
    experiment_id: String,
    status: RunStatus,
    start_time: i64,
    end_time: Option<i64>,
    artifact_uri: String,
}

impl From<RunMeta> for RunInfo {
    fn from(meta: RunMeta) -> Self {
        RunInfo {
            run_id: meta.run_id,
            run_name: meta.run_name,
            experiment_id: meta.experiment_id,
            status: meta.status,
            artifact_uri: meta.artifact_uri,
        }
    }
}

/// File-backed [`TrackingClient`] used when logging offline.
#[derive(Debug, Clone)]
pub struct LocalTrackingStore {
    root: PathBuf,
}

impl LocalTrackingStore {
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("create tracking store {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn experiments(&self) -> Result<Vec<ExperimentMeta>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("read tracking store {}", self.root.display()))?
        {
            let entry = entry.context("read store entry")?;
            let meta_path = entry.path().join(META_FILE);
            if meta_path.is_file() {
                found.push(read_json::<ExperimentMeta>(&meta_path)?);
            }
        }
        found.sort_by(|a, b| a.experiment_id.cmp(&b.experiment_id));
        Ok(found)
    }

    fn run_dir(&self, run_id: &str) -> Result<PathBuf> {
        validate_component(run_id)?;
        for experiment in self.experiments()? {
            let dir = self.root.join(&experiment.experiment_id).join(run_id);
            if dir.join(META_FILE).is_file() {
                return Ok(dir);
            }
        }
        Err(anyhow!("run {run_id} not found in {}", self.root.display()))
    }

    fn load_run(&self, run_id: &str) -> Result<(PathBuf, RunMeta)> {
        let dir = self.run_dir(run_id)?;
        let meta = read_json(&dir.join(META_FILE))?;
        Ok((dir, meta))
    }
}

/// Keys become file names; reject anything that could escape the run directory.
fn validate_component(value: &str) -> Result<()> {
    if value.is_empty()
        || value.starts_with('/')
        || value.split('/').any(|part| part.is_empty() || part == "." || part == "..")
    {
        bail!("invalid store key {value:?}");
    }
    Ok(())
}

fn write_entries(dir: &Path, entries: impl IntoIterator<Item = (String, String)>) -> Result<()> {
    for (key, value) in entries {
        validate_component(&key)?;
        let path = dir.join(&key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&path, value).with_context(|| format!("write {}", path.display()))?;
    }
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

impl ArtifactStore for LocalTrackingStore {
    #[instrument(skip_all, fields(run_id = %run_id, path = %local_path.display()))]
    fn log_artifact(&self, run_id: &str, local_path: &Path) -> Result<()> {
        let (dir, _) = self.load_run(run_id)?;
        let file_name = local_path
            .file_name()
            .ok_or_else(|| anyhow!("artifact path has no file name {}", local_path.display()))?;
        let artifacts = dir.join("artifacts");
        fs::create_dir_all(&artifacts)
            .with_context(|| format!("create directory {}", artifacts.display()))?;
        let target = artifacts.join(file_name);
        fs::copy(local_path, &target).with_context(|| {
            format!("copy {} to {}", local_path.display(), target.display())
        })?;
        debug!("artifact stored");
        Ok(())
    }
}

impl TrackingClient for LocalTrackingStore {
    fn get_or_create_experiment(&self, name: &str) -> Result<String> {
        let experiments = self.experiments()?;
        if let Some(existing) = experiments.iter().find(|e| e.name == name) {
            return Ok(existing.experiment_id.clone());
        }
        let next_id = experiments
            .iter()
            .filter_map(|e| e.experiment_id.parse::<u64>().ok())
            .max()
            .map_or(0, |id| id + 1)
            .to_string();
        let dir = self.root.join(&next_id);
        fs::create_dir_all(&dir).with_context(|| format!("create directory {}", dir.display()))?;
        write_json(
            &dir.join(META_FILE),
            &ExperimentMeta {
                experiment_id: next_id.clone(),
                name: name.to_string(),
            },
        )?;
        debug!(name, experiment_id = %next_id, "experiment created");
        Ok(next_id)
    }

    fn create_run(
        &self,
        experiment_id: &str,
        run_name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<RunInfo> {
        validate_component(experiment_id)?;
        let run_id = Uuid::new_v4().simple().to_string();
        let dir = self.root.join(experiment_id).join(&run_id);
        fs::create_dir_all(&dir).with_context(|| format!("create directory {}", dir.display()))?;
        let meta = RunMeta {
            run_id: run_id.clone(),
            run_name: run_name.to_string(),
            experiment_id: experiment_id.to_string(),
            status: RunStatus::Running,
            start_time: Utc::now().timestamp_millis(),
            end_time: None,
            artifact_uri: dir.join("artifacts").display().to_string(),
        };
        write_json(&dir.join(META_FILE), &meta)?;
        write_entries(
            &dir.join("tags"),
            tags.iter().map(|(k, v)| (k.clone(), v.clone())),
        )?;
        Ok(meta.into())
    }

    fn get_run(&self, run_id: &str) -> Result<RunInfo> {
        let (_, meta) = self.load_run(run_id)?;
        Ok(meta.into())
    }

    fn update_run(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let (dir, mut meta) = self.load_run(run_id)?;
        meta.status = status;
        meta.end_time = match status {
            RunStatus::Running | RunStatus::Scheduled => None,
            RunStatus::Finished | RunStatus::Failed | RunStatus::Killed => {
                Some(Utc::now().timestamp_millis())
            }
        };
        write_json(&dir.join(META_FILE), &meta)
    }

    fn log_batch(&self, run_id: &str, params: &[Param]) -> Result<()> {
        let (dir, _) = self.load_run(run_id)?;
        write_entries(
            &dir.join("params"),
            params.iter().map(|p| (p.key.clone(), p.value.clone())),
        )
    }

    fn set_tags(&self, run_id: &str, tags: &BTreeMap<String, String>) -> Result<()> {
        let (dir, _) = self.load_run(run_id)?;
        write_entries(
            &dir.join("tags"),
            tags.iter().map(|(k, v)| (k.clone(), v.clone())),
        )
    }
}
