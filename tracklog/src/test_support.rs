//! Test-only tracking fakes and a one-shot HTTP server.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use anyhow::{Result, anyhow, bail};

use crate::core::types::{Param, RunInfo, RunStatus};
use crate::io::auth::Authenticator;
use crate::io::tracking::{ArtifactStore, TrackingClient};

#[derive(Debug, Default)]
struct Recorded {
    experiments: Vec<String>,
    created: Vec<(String, String, BTreeMap<String, String>)>,
    runs: BTreeMap<String, RunInfo>,
    batches: Vec<(String, Vec<Param>)>,
    tags: Vec<(String, BTreeMap<String, String>)>,
    updates: Vec<(String, RunStatus)>,
    uploads: Vec<(String, PathBuf)>,
}

/// In-memory [`TrackingClient`] that records every call.
///
/// Created runs get ids `run-0`, `run-1`, ... in creation order.
#[derive(Debug, Default)]
pub struct RecordingTracker {
    state: Mutex<Recorded>,
    fail_uploads: bool,
}

impl RecordingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `log_artifact` call fails (after being recorded).
    pub fn failing_uploads(mut self) -> Self {
        self.fail_uploads = true;
        self
    }

    /// Seed an existing run for `get_run`.
    pub fn with_run(self, run_id: &str, run_name: &str) -> Self {
        self.lock().runs.insert(
            run_id.to_string(),
            RunInfo {
                run_id: run_id.to_string(),
                run_name: run_name.to_string(),
                experiment_id: "0".to_string(),
                status: RunStatus::Finished,
                artifact_uri: format!("mlflow-artifacts:/0/{run_id}/artifacts"),
            },
        );
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn experiments(&self) -> Vec<String> {
        self.lock().experiments.clone()
    }

    /// `(experiment_id, run_name, tags)` per `create_run` call.
    pub fn created(&self) -> Vec<(String, String, BTreeMap<String, String>)> {
        self.lock().created.clone()
    }

    pub fn batches(&self) -> Vec<(String, Vec<Param>)> {
        self.lock().batches.clone()
    }

    /// Tags set after creation, per `set_tags` call.
    pub fn tags(&self) -> Vec<(String, BTreeMap<String, String>)> {
        self.lock().tags.clone()
    }

    pub fn updates(&self) -> Vec<(String, RunStatus)> {
        self.lock().updates.clone()
    }

    pub fn uploads(&self) -> Vec<(String, PathBuf)> {
        self.lock().uploads.clone()
    }
}

impl ArtifactStore for RecordingTracker {
    fn log_artifact(&self, run_id: &str, local_path: &Path) -> Result<()> {
        self.lock()
            .uploads
            .push((run_id.to_string(), local_path.to_path_buf()));
        if self.fail_uploads {
            bail!("upload rejected");
        }
        Ok(())
    }
}

impl TrackingClient for RecordingTracker {
    fn get_or_create_experiment(&self, name: &str) -> Result<String> {
        let mut state = self.lock();
        let id = match state.experiments.iter().position(|e| e == name) {
            Some(index) => index,
            None => {
                state.experiments.push(name.to_string());
                state.experiments.len() - 1
            }
        };
        Ok(id.to_string())
    }

    fn create_run(
        &self,
        experiment_id: &str,
        run_name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<RunInfo> {
        let mut state = self.lock();
        let run_id = format!("run-{}", state.created.len());
        state.created.push((
            experiment_id.to_string(),
            run_name.to_string(),
            tags.clone(),
        ));
        let info = RunInfo {
            run_id: run_id.clone(),
            run_name: run_name.to_string(),
            experiment_id: experiment_id.to_string(),
            status: RunStatus::Running,
            artifact_uri: format!("mlflow-artifacts:/{experiment_id}/{run_id}/artifacts"),
        };
        state.runs.insert(run_id, info.clone());
        Ok(info)
    }

    fn get_run(&self, run_id: &str) -> Result<RunInfo> {
        self.lock()
            .runs
            .get(run_id)
            .cloned()
            .ok_or_else(|| anyhow!("run {run_id} not found"))
    }

    fn update_run(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let mut state = self.lock();
        if let Some(run) = state.runs.get_mut(run_id) {
            run.status = status;
        }
        state.updates.push((run_id.to_string(), status));
        Ok(())
    }

    fn log_batch(&self, run_id: &str, params: &[Param]) -> Result<()> {
        self.lock()
            .batches
            .push((run_id.to_string(), params.to_vec()));
        Ok(())
    }

    fn set_tags(&self, run_id: &str, tags: &BTreeMap<String, String>) -> Result<()> {
        self.lock().tags.push((run_id.to_string(), tags.clone()));
        Ok(())
    }
}

/// Authenticator with a fixed token that counts authentications and saves.
#[derive(Debug, Default)]
pub struct StaticAuth {
    token: Option<String>,
    authentications: Mutex<usize>,
    saves: Mutex<usize>,
}

impl StaticAuth {
    pub fn new(token: Option<&str>) -> Self {
        Self {
            token: token.map(str::to_string),
            authentications: Mutex::new(0),
            saves: Mutex::new(0),
        }
    }

    pub fn authentications(&self) -> usize {
        *self
            .authentications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn saves(&self) -> usize {
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Authenticator for StaticAuth {
    fn authenticate(&self) -> Result<()> {
        *self
            .authentications
            .lock()
            .unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }

    fn save(&self) -> Result<()> {
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }

    fn token(&self) -> Option<String> {
        self.token.clone()
    }
}

/// HTTP server that answers exactly one request.
pub struct OneShotServer {
    /// Base URI, e.g. `http://127.0.0.1:41234`.
    pub uri: String,
    handle: JoinHandle<String>,
}

impl OneShotServer {
    /// Wait for the request to be served and return its raw head and body.
    pub fn request(self) -> String {
        self.handle.join().expect("one-shot server thread")
    }
}

/// Serve a single `status` response with a plain-text `body` on localhost.
pub fn serve_once(status: u16, body: &str) -> OneShotServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind one-shot server");
    let addr = listener.local_addr().expect("one-shot server address");
    let body = body.to_string();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
        let request = read_request(&mut reader);
        let reason = if status == 200 { "OK" } else { "Status" };
        let response = format!(
            "HTTP/1.1 {status} {reason}\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        let mut stream = stream;
        stream
            .write_all(response.as_bytes())
            .expect("write response");
        stream.flush().expect("flush response");
        request
    });
    OneShotServer {
        uri: format!("http://{addr}"),
        handle,
    }
}

fn read_request<R: BufRead>(reader: &mut R) -> String {
    let mut head = String::new();
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).expect("read request line") == 0 {
            break;
        }
        if let Some((name, value)) = line.split_once(':')
            && name.eq_ignore_ascii_case("content-length")
        {
            content_length = value.trim().parse().unwrap_or(0);
        }
        let end_of_head = line == "\r\n";
        head.push_str(&line);
        if end_of_head {
            break;
        }
    }
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).expect("read request body");
    head.push_str(&String::from_utf8_lossy(&body));
    head
}
