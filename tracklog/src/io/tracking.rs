//! Tracking backend abstraction and the MLflow REST client.
//!
//! The [`TrackingClient`] trait decouples the logger from the actual tracking
//! server. [`RestTrackingClient`] talks to an MLflow-compatible server; the
//! offline store lives in [`crate::io::local_store`], and tests use
//! `test_support::RecordingTracker`.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::core::types::{Param, RunInfo, RunStatus};
use crate::io::auth::Authenticator;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const ARTIFACT_SCHEME: &str = "mlflow-artifacts:/";

/// Destination for run artifacts.
pub trait ArtifactStore: Send + Sync {
    /// Upload `local_path` to the root of `run_id`'s artifacts.
    fn log_artifact(&self, run_id: &str, local_path: &Path) -> Result<()>;
}

/// Operations the logger needs from a tracking server.
pub trait TrackingClient: ArtifactStore {
    /// Look up an experiment by name, creating it if missing. Returns its id.
    fn get_or_create_experiment(&self, name: &str) -> Result<String>;
    fn create_run(
        &self,
        experiment_id: &str,
        run_name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<RunInfo>;
    fn get_run(&self, run_id: &str) -> Result<RunInfo>;
    fn update_run(&self, run_id: &str, status: RunStatus) -> Result<()>;
    fn log_batch(&self, run_id: &str, params: &[Param]) -> Result<()>;
    fn set_tags(&self, run_id: &str, tags: &BTreeMap<String, String>) -> Result<()>;
}

/// Exposes a shared [`TrackingClient`] as a plain [`ArtifactStore`].
pub struct ClientArtifacts(pub Arc<dyn TrackingClient>);

impl ArtifactStore for ClientArtifacts {
    fn log_artifact(&self, run_id: &str, local_path: &Path) -> Result<()> {
        self.0.log_artifact(run_id, local_path)
    }
}

/// Non-success response from the tracking server.
#[derive(Debug, thiserror::Error)]
#[error("tracking server returned {status} for {endpoint}: {body}")]
pub struct ApiError {
    pub endpoint: String,
    pub status: StatusCode,
    pub body: String,
}

impl ApiError {
    fn is_not_found(&self) -> bool {
        self.status == StatusCode::NOT_FOUND || self.body.contains("RESOURCE_DOES_NOT_EXIST")
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireTag {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct WireRunInfo {
    run_id: String,
    #[serde(default)]
    run_name: Option<String>,
    experiment_id: String,
    status: RunStatus,
    #[serde(default)]
    artifact_uri: Option<String>,
}

impl From<WireRunInfo> for RunInfo {
    fn from(info: WireRunInfo) -> Self {
        RunInfo {
            run_name: info.run_name.unwrap_or_default(),
            run_id: info.run_id,
            experiment_id: info.experiment_id,
            status: info.status,
            artifact_uri: info.artifact_uri.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireRun {
    info: WireRunInfo,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    run: WireRun,
}

#[derive(Debug, Deserialize)]
struct WireExperiment {
    experiment_id: String,
}

#[derive(Debug, Deserialize)]
struct ExperimentResponse {
    experiment: WireExperiment,
}

#[derive(Debug, Deserialize)]
struct CreateExperimentResponse {
    experiment_id: String,
}

#[derive(Debug, Serialize)]
struct CreateRunRequest<'a> {
    experiment_id: &'a str,
    run_name: &'a str,
    start_time: i64,
    tags: Vec<WireTag>,
}

#[derive(Debug, Serialize)]
struct UpdateRunRequest<'a> {
    run_id: &'a str,
    status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_time: Option<i64>,
}

#[derive(Debug, Serialize)]
struct LogBatchRequest<'a> {
    run_id: &'a str,
    #[serde(skip_serializing_if = "no_params")]
    params: &'a [Param],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tags: Vec<WireTag>,
}

fn no_params(params: &&[Param]) -> bool {
    params.is_empty()
}

fn wire_tags(tags: &BTreeMap<String, String>) -> Vec<WireTag> {
    tags.iter()
        .map(|(key, value)| WireTag {
            key: key.clone(),
            value: value.clone(),
        })
        .collect()
}

/// MLflow REST API client (blocking).
pub struct RestTrackingClient {
    base: String,
    http: Client,
    auth: Arc<dyn Authenticator>,
    artifact_roots: Mutex<HashMap<String, String>>,
}

impl RestTrackingClient {
    pub fn new(tracking_uri: &str, auth: Arc<dyn Authenticator>) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("build tracking http client")?;
        Ok(Self {
            base: tracking_uri.trim_end_matches('/').to_string(),
            http,
            auth,
            artifact_roots: Mutex::new(HashMap::new()),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/api/2.0/{}", self.base, endpoint)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.auth.token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Re-authenticates before each request so a refreshed token is sent.
    fn execute(&self, endpoint: &str, request: RequestBuilder) -> Result<Response> {
        self.auth
            .authenticate()
            .with_context(|| format!("authenticate for {endpoint}"))?;
        let response = self
            .authorized(request)
            .send()
            .with_context(|| format!("request {endpoint}"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ApiError {
                endpoint: endpoint.to_string(),
                status,
                body,
            }
            .into());
        }
        Ok(response)
    }

    fn send<T: DeserializeOwned>(&self, endpoint: &str, request: RequestBuilder) -> Result<T> {
        self.execute(endpoint, request)?
            .json()
            .with_context(|| format!("decode response from {endpoint}"))
    }

    fn get<T: DeserializeOwned>(&self, endpoint: &str, query: &[(&str, &str)]) -> Result<T> {
        let request = self.http.get(self.url(endpoint)).query(query);
        self.send(endpoint, request)
    }

    fn post<B: Serialize, T: DeserializeOwned>(&self, endpoint: &str, body: &B) -> Result<T> {
        let request = self.http.post(self.url(endpoint)).json(body);
        self.send(endpoint, request)
    }

    fn remember_artifact_root(&self, info: &RunInfo) {
        if !info.artifact_uri.is_empty() {
            self.artifact_roots
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(info.run_id.clone(), info.artifact_uri.clone());
        }
    }

    fn artifact_root(&self, run_id: &str) -> Result<String> {
        let cached = self
            .artifact_roots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .cloned();
        match cached {
            Some(root) => Ok(root),
            None => Ok(self.get_run(run_id)?.artifact_uri),
        }
    }
}

/// Path of an artifact root relative to the artifact proxy endpoint.
fn proxied_artifact_path(artifact_uri: &str) -> Result<&str> {
    let path = artifact_uri
        .strip_prefix(ARTIFACT_SCHEME)
        .ok_or_else(|| {
            anyhow!("unsupported artifact root {artifact_uri:?} (expected {ARTIFACT_SCHEME})")
        })?;
    Ok(path.trim_matches('/'))
}

impl ArtifactStore for RestTrackingClient {
    #[instrument(skip_all, fields(run_id = %run_id, path = %local_path.display()))]
    fn log_artifact(&self, run_id: &str, local_path: &Path) -> Result<()> {
        let file_name = local_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| anyhow!("artifact path has no file name {}", local_path.display()))?;
        let root = self.artifact_root(run_id)?;
        let relative = proxied_artifact_path(&root)?;
        let body = fs::read(local_path)
            .with_context(|| format!("read artifact {}", local_path.display()))?;

        let endpoint = format!("mlflow-artifacts/artifacts/{relative}/{file_name}");
        let request = self.http.put(self.url(&endpoint)).body(body);
        self.execute(&endpoint, request)?;
        debug!("artifact uploaded");
        Ok(())
    }
}

impl TrackingClient for RestTrackingClient {
    fn get_or_create_experiment(&self, name: &str) -> Result<String> {
        match self.get::<ExperimentResponse>(
            "mlflow/experiments/get-by-name",
            &[("experiment_name", name)],
        ) {
            Ok(found) => return Ok(found.experiment.experiment_id),
            Err(err) => match err.downcast_ref::<ApiError>() {
                Some(api) if api.is_not_found() => {}
                _ => return Err(err),
            },
        }
        debug!(name, "creating experiment");
        let created: CreateExperimentResponse = self.post(
            "mlflow/experiments/create",
            &serde_json::json!({ "name": name }),
        )?;
        Ok(created.experiment_id)
    }

    fn create_run(
        &self,
        experiment_id: &str,
        run_name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<RunInfo> {
        let request = CreateRunRequest {
            experiment_id,
            run_name,
            start_time: Utc::now().timestamp_millis(),
            tags: wire_tags(tags),
        };
        let response: RunResponse = self.post("mlflow/runs/create", &request)?;
        let info = RunInfo::from(response.run.info);
        self.remember_artifact_root(&info);
        Ok(info)
    }

    fn get_run(&self, run_id: &str) -> Result<RunInfo> {
        let response: RunResponse = self.get("mlflow/runs/get", &[("run_id", run_id)])?;
        let info = RunInfo::from(response.run.info);
        self.remember_artifact_root(&info);
        Ok(info)
    }

    fn update_run(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let end_time = match status {
            RunStatus::Running | RunStatus::Scheduled => None,
            RunStatus::Finished | RunStatus::Failed | RunStatus::Killed => {
                Some(Utc::now().timestamp_millis())
            }
        };
        let request = self.http.post(self.url("mlflow/runs/update")).json(&UpdateRunRequest {
            run_id,
            status,
            end_time,
        });
        self.execute("mlflow/runs/update", request)?;
        Ok(())
    }

    fn log_batch(&self, run_id: &str, params: &[Param]) -> Result<()> {
        if params.is_empty() {
            return Ok(());
        }
        let request = self
            .http
            .post(self.url("mlflow/runs/log-batch"))
            .json(&LogBatchRequest {
                run_id,
                params,
                tags: Vec::new(),
            });
        self.execute("mlflow/runs/log-batch", request)?;
        Ok(())
    }

    fn set_tags(&self, run_id: &str, tags: &BTreeMap<String, String>) -> Result<()> {
        if tags.is_empty() {
            return Ok(());
        }
        let request = self
            .http
            .post(self.url("mlflow/runs/log-batch"))
            .json(&LogBatchRequest {
                run_id,
                params: &[],
                tags: wire_tags(tags),
            });
        self.execute("mlflow/runs/log-batch", request)?;
        Ok(())
    }
}
