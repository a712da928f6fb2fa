//! Experiment tracking CLI.
//!
//! `tracklog health` checks that a tracking server is reachable.
//! `tracklog run` wraps a training command: it creates (or resumes) a run,
//! logs hyperparameters, captures the command's terminal output into the
//! run's `terminal_log.txt`, and marks the run finished or failed.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command as ChildCommand;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};

use tracklog::exit_codes;
use tracklog::io::auth::{Authenticator, TOKEN_ENV, TokenAuth};
use tracklog::io::capture::Interceptor;
use tracklog::io::config::{TRACKING_URI_ENV, load_config};
use tracklog::io::health::health_check;
use tracklog::io::process::run_captured;
use tracklog::logger::{TrackingLogger, rank_from_env};
use tracklog::logging;

#[derive(Parser)]
#[command(
    name = "tracklog",
    version,
    about = "Experiment tracking with terminal output capture"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check that the tracking server answers `GET /health` with `OK`.
    Health {
        /// Tracking server URI (defaults to `MLFLOW_TRACKING_URI`).
        #[arg(long)]
        tracking_uri: Option<String>,
        /// Token file to authenticate with (`MLFLOW_TRACKING_TOKEN` takes precedence).
        #[arg(long)]
        token_file: Option<PathBuf>,
    },
    /// Run a command as a tracked run, capturing its terminal output.
    Run {
        /// Tracking config (TOML). Missing file means defaults.
        #[arg(long)]
        config: PathBuf,
        /// Hyperparameters to log (JSON file).
        #[arg(long)]
        params: Option<PathBuf>,
        /// Kill the command after this many seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Command and arguments, after `--`.
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Health {
            tracking_uri,
            token_file,
        } => cmd_health(tracking_uri, token_file.as_deref()),
        Command::Run {
            config,
            params,
            timeout_secs,
            command,
        } => cmd_run(
            &config,
            params.as_deref(),
            timeout_secs.map(Duration::from_secs),
            command,
        ),
    }
}

fn cmd_health(tracking_uri: Option<String>, token_file: Option<&Path>) -> Result<i32> {
    let uri = tracking_uri
        .or_else(|| env::var(TRACKING_URI_ENV).ok())
        .with_context(|| {
            format!("no tracking uri: pass --tracking-uri or set {TRACKING_URI_ENV}")
        })?;
    let authenticate = token_file.is_some() || env::var(TOKEN_ENV).is_ok();
    let auth = TokenAuth::new(Some(&uri), authenticate, token_file);
    auth.authenticate()?;
    health_check(&uri, auth.token().as_deref())?;
    println!("ok");
    Ok(exit_codes::OK)
}

fn cmd_run(
    config_path: &Path,
    params_path: Option<&Path>,
    timeout: Option<Duration>,
    argv: Vec<String>,
) -> Result<i32> {
    let config = load_config(config_path)?;
    let params = params_path.map(read_params).transpose()?;
    let Some((program, args)) = argv.split_first() else {
        bail!("missing command to run");
    };
    let mut child = ChildCommand::new(program);
    child.args(args);

    let mut logger = TrackingLogger::from_config(config, rank_from_env(), argv.clone())?;
    if let Err(err) = prepare_run(&mut logger, params.as_ref()) {
        if let Err(finalize_err) = logger.finalize("failed") {
            warn!(error = %format!("{finalize_err:#}"), "finalize after setup failure failed");
        }
        return Err(err);
    }

    let outcome = run_captured(child, timeout, &Interceptor::global());
    let (status, code) = match &outcome {
        Ok(run) if run.success() => ("success", exit_codes::OK),
        Ok(run) if run.timed_out => ("killed", exit_codes::TIMED_OUT),
        Ok(_) => ("failed", exit_codes::CHILD_FAILED),
        Err(_) => ("failed", exit_codes::INVALID),
    };
    if let Ok(run) = &outcome {
        info!(exit_code = ?run.status.code(), timed_out = run.timed_out, "command finished");
    }
    logger.finalize(status)?;
    outcome?;
    Ok(code)
}

/// Everything between creating the logger and starting the command.
fn prepare_run(logger: &mut TrackingLogger, params: Option<&Value>) -> Result<()> {
    if let Some(params) = params {
        logger.log_hyperparams(params)?;
    }
    if logger.config().terminal_log.enabled {
        let dir = logger.config().artifact_save_dir().to_path_buf();
        logger.log_terminal_output(&dir)?;
    }
    Ok(())
}

fn read_params(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}
