//! Experiment logger: run resolution, hyperparameters, terminal capture.
//!
//! Only rank zero talks to the tracking backend. On every other rank each
//! operation returns immediately without side effects, so the same code can
//! run unchanged in every process of a distributed job.

use std::env;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::core::params::prepare_params;
use crate::core::run_params::{RunMode, RunPlan, choose_run_name, plan_run};
use crate::core::types::{RunInfo, RunStatus};
use crate::io::auth::{Authenticator, TokenAuth};
use crate::io::capture::Interceptor;
use crate::io::config::TrackingConfig;
use crate::io::health::health_check;
use crate::io::local_store::LocalTrackingStore;
use crate::io::monitor::LogsMonitor;
use crate::io::tracking::{ArtifactStore, ClientArtifacts, RestTrackingClient, TrackingClient};

/// Environment variables consulted for the process rank, in order.
pub const RANK_ENV_VARS: [&str; 3] = ["RANK", "LOCAL_RANK", "SLURM_PROCID"];

/// Rank of this process in a distributed job; `0` when not distributed.
pub fn rank_from_env() -> usize {
    RANK_ENV_VARS
        .iter()
        .find_map(|name| env::var(name).ok()?.trim().parse().ok())
        .unwrap_or(0)
}

pub struct TrackingLogger {
    config: TrackingConfig,
    rank: usize,
    argv: Vec<String>,
    client: Option<Arc<dyn TrackingClient>>,
    auth: Arc<dyn Authenticator>,
    interceptor: Option<Arc<Interceptor>>,
    run: Option<RunInfo>,
    monitor: Option<LogsMonitor>,
    finalized: bool,
}

impl TrackingLogger {
    /// Logger backed by a tracking server.
    ///
    /// On rank zero this authenticates and runs the health preflight before
    /// any run exists.
    #[instrument(skip_all, fields(rank = rank))]
    pub fn online(config: TrackingConfig, rank: usize, argv: Vec<String>) -> Result<Self> {
        config.validate()?;
        let uri = config
            .resolved_tracking_uri()
            .ok_or_else(|| anyhow!("no tracking uri configured"))?;
        let auth: Arc<dyn Authenticator> = Arc::new(TokenAuth::new(
            Some(&uri),
            config.authentication,
            config.token_file.as_deref(),
        ));
        if rank != 0 {
            return Ok(Self::build(config, rank, argv, None, auth));
        }

        auth.authenticate().context("authenticate with tracking server")?;
        health_check(&uri, auth.token().as_deref())?;
        info!(tracking_uri = %uri, "tracking server is healthy");
        let client: Arc<dyn TrackingClient> =
            Arc::new(RestTrackingClient::new(&uri, Arc::clone(&auth))?);
        Ok(Self::build(config, rank, argv, Some(client), auth))
    }

    /// Logger backed by a [`LocalTrackingStore`] under `save_dir`.
    pub fn offline(config: TrackingConfig, rank: usize, argv: Vec<String>) -> Result<Self> {
        config.validate()?;
        let auth: Arc<dyn Authenticator> = Arc::new(TokenAuth::disabled());
        if rank != 0 {
            return Ok(Self::build(config, rank, argv, None, auth));
        }
        let client: Arc<dyn TrackingClient> = Arc::new(LocalTrackingStore::new(&config.save_dir)?);
        info!(save_dir = %config.save_dir.display(), "logging offline");
        Ok(Self::build(config, rank, argv, Some(client), auth))
    }

    /// `online` or `offline` as the config says.
    pub fn from_config(config: TrackingConfig, rank: usize, argv: Vec<String>) -> Result<Self> {
        if config.offline {
            Self::offline(config, rank, argv)
        } else {
            Self::online(config, rank, argv)
        }
    }

    /// Logger over an existing client; no preflight is performed.
    pub fn with_client(
        config: TrackingConfig,
        rank: usize,
        argv: Vec<String>,
        client: Arc<dyn TrackingClient>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        Self::build(config, rank, argv, Some(client), auth)
    }

    fn build(
        config: TrackingConfig,
        rank: usize,
        argv: Vec<String>,
        client: Option<Arc<dyn TrackingClient>>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            config,
            rank,
            argv,
            client,
            auth,
            interceptor: None,
            run: None,
            monitor: None,
            finalized: false,
        }
    }

    /// Capture terminal output from `interceptor` instead of the process-wide one.
    pub fn with_interceptor(mut self, interceptor: Arc<Interceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    pub fn is_rank_zero(&self) -> bool {
        self.rank == 0
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    fn client(&self) -> Result<Arc<dyn TrackingClient>> {
        self.client
            .clone()
            .ok_or_else(|| anyhow!("no tracking client on rank {}", self.rank))
    }

    /// Id of this job's run, creating or resuming it on first use.
    ///
    /// `None` on non-zero ranks.
    pub fn run_id(&mut self) -> Result<Option<String>> {
        if !self.is_rank_zero() {
            return Ok(None);
        }
        if self.run.is_none() {
            let plan = plan_run(&self.config.run_selection(), &self.argv);
            self.run = Some(self.resolve_run(&plan)?);
        }
        Ok(self.run.as_ref().map(|run| run.run_id.clone()))
    }

    /// Run details once [`TrackingLogger::run_id`] has resolved them.
    pub fn run(&self) -> Option<&RunInfo> {
        self.run.as_ref()
    }

    #[instrument(skip_all, fields(mode = ?plan.mode))]
    fn resolve_run(&self, plan: &RunPlan) -> Result<RunInfo> {
        let client = self.client()?;

        if let RunMode::ResumeInPlace { run_id } = &plan.mode {
            let mut run = client
                .get_run(run_id)
                .with_context(|| format!("look up run {run_id} to resume"))?;
            if let Some(name) = &plan.run_name
                && *name != run.run_name
            {
                warn!(configured = %name, existing = %run.run_name, "resumed run keeps its name");
            }
            client.update_run(run_id, RunStatus::Running)?;
            client.set_tags(run_id, &plan.tags)?;
            run.status = RunStatus::Running;
            info!(run_id = %run.run_id, run_name = %run.run_name, "resumed tracking run");
            return Ok(run);
        }

        let inherited = match plan.mode.inherited_from() {
            Some(parent) => Some(
                client
                    .get_run(parent)
                    .with_context(|| format!("look up parent run {parent}"))?
                    .run_name,
            ),
            None => None,
        };
        let run_name = choose_run_name(
            plan.run_name.as_deref(),
            inherited.as_deref().filter(|name| !name.is_empty()),
        )
        .unwrap_or_else(|| Uuid::new_v4().to_string());

        let experiment_id = client
            .get_or_create_experiment(&self.config.experiment_name)
            .with_context(|| format!("get experiment {}", self.config.experiment_name))?;
        let run = client.create_run(&experiment_id, &run_name, &plan.tags)?;
        info!(
            run_id = %run.run_id,
            run_name = %run.run_name,
            experiment_id = %experiment_id,
            "created tracking run"
        );
        Ok(run)
    }

    /// Flatten, filter and log `params` in batches.
    pub fn log_hyperparams(&mut self, params: &Value) -> Result<()> {
        if !self.is_rank_zero() || !self.config.log_hyperparams {
            return Ok(());
        }
        let prepared = prepare_params(params, &self.config.param_rules());
        if prepared.is_empty() {
            return Ok(());
        }
        let run_id = self.require_run_id()?;
        let client = self.client()?;
        for batch in prepared.chunks(self.config.hyperparams.batch_size) {
            client
                .log_batch(&run_id, batch)
                .with_context(|| format!("log {} params", batch.len()))?;
        }
        debug!(count = prepared.len(), "hyperparameters logged");
        Ok(())
    }

    /// Start capturing terminal output into `artifact_save_dir`.
    ///
    /// Calling again while capture is active has no effect.
    pub fn log_terminal_output(&mut self, artifact_save_dir: &Path) -> Result<()> {
        if !self.is_rank_zero() || self.monitor.is_some() || self.finalized {
            return Ok(());
        }
        let run_id = self.require_run_id()?;
        let store: Arc<dyn ArtifactStore> = Arc::new(ClientArtifacts(self.client()?));
        let mut monitor = LogsMonitor::new(
            artifact_save_dir,
            &run_id,
            store,
            self.config.monitor_options(),
        )?;
        if let Some(interceptor) = &self.interceptor {
            monitor = monitor.with_interceptor(Arc::clone(interceptor));
        }
        monitor.start()?;
        self.monitor = Some(monitor);
        Ok(())
    }

    pub fn terminal_log_path(&self) -> Option<&Path> {
        self.monitor.as_ref().map(LogsMonitor::path)
    }

    /// Close out the job: save credentials, stop terminal capture, and mark
    /// the run with the status matching `status`.
    ///
    /// `status` is an outcome such as `success`, `failed` or `killed`.
    /// Calling again has no effect.
    #[instrument(skip(self))]
    pub fn finalize(&mut self, status: &str) -> Result<()> {
        if !self.is_rank_zero() || self.finalized {
            return Ok(());
        }
        let run_status = RunStatus::from_outcome(status)?;
        self.finalized = true;

        let saved = self.auth.save().context("save tracking credentials");
        let monitored = match self.monitor.as_mut() {
            Some(monitor) => monitor.finish(status),
            None => Ok(()),
        };
        let terminated = match &self.run {
            Some(run) => self
                .client()
                .and_then(|client| client.update_run(&run.run_id, run_status))
                .with_context(|| format!("mark run {} {}", run.run_id, run_status)),
            None => Ok(()),
        };
        if terminated.is_ok() && self.run.is_some() {
            info!(status = %run_status, "tracking run finalized");
        }

        saved?;
        monitored?;
        terminated
    }

    fn require_run_id(&mut self) -> Result<String> {
        self.run_id()?
            .ok_or_else(|| anyhow!("no tracking run on rank {}", self.rank))
    }
}
