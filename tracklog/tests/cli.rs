//! CLI tests for `tracklog health` and `tracklog run`.
//!
//! Spawns the tracklog binary and checks exit codes and the files it leaves
//! behind.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracklog::exit_codes;
use tracklog::io::auth::TOKEN_ENV;
use tracklog::io::config::TRACKING_URI_ENV;
use tracklog::test_support::serve_once;

fn tracklog() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_tracklog"));
    cmd.env_remove(TOKEN_ENV)
        .env_remove(TRACKING_URI_ENV)
        .env_remove("RANK")
        .env_remove("LOCAL_RANK")
        .env_remove("SLURM_PROCID");
    cmd
}

fn write_offline_config(dir: &Path) -> PathBuf {
    let path = dir.join("tracking.toml");
    let contents = format!(
        "offline = true\nproject_name = \"cli\"\nsave_dir = {:?}\n\n[terminal_log]\nartifact_save_dir = {:?}\n",
        dir.join("mlruns").display().to_string(),
        dir.join("artifacts").display().to_string(),
    );
    fs::write(&path, contents).expect("write config");
    path
}

/// The single terminal log written under `artifacts/<run_id>/plots/`.
fn terminal_log(dir: &Path) -> String {
    let runs: Vec<PathBuf> = fs::read_dir(dir.join("artifacts"))
        .expect("artifacts dir")
        .map(|entry| entry.expect("entry").path())
        .collect();
    assert_eq!(runs.len(), 1, "expected one run directory: {runs:?}");
    fs::read_to_string(runs[0].join("plots/terminal_log.txt")).expect("terminal log")
}

/// Status recorded in the only run of the offline store's first experiment.
fn run_status(dir: &Path) -> String {
    let run_meta = fs::read_dir(dir.join("mlruns/0"))
        .expect("experiment dir")
        .map(|entry| entry.expect("entry").path())
        .find(|path| path.is_dir())
        .expect("run dir")
        .join("meta.json");
    let meta: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(run_meta).expect("meta")).expect("parse meta");
    meta["status"].as_str().expect("status string").to_string()
}

#[test]
fn health_ok_exits_zero() {
    let server = serve_once(200, "OK");
    let status = tracklog()
        .args(["health", "--tracking-uri", &server.uri])
        .status()
        .expect("tracklog health");
    assert_eq!(status.code(), Some(exit_codes::OK));
    assert!(server.request().starts_with("GET /health "));
}

#[test]
fn unhealthy_server_exits_invalid() {
    let server = serve_once(503, "starting");
    let output = tracklog()
        .args(["health", "--tracking-uri", &server.uri])
        .output()
        .expect("tracklog health");
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("authentication"));
}

#[cfg(unix)]
#[test]
fn run_captures_child_output_into_terminal_log() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = write_offline_config(temp.path());

    let output = tracklog()
        .arg("run")
        .arg("--config")
        .arg(&config)
        .args(["--", "sh", "-c", "echo hello; echo oops 1>&2"])
        .output()
        .expect("tracklog run");
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&output.stdout).contains("hello"));

    let log = terminal_log(temp.path());
    assert!(log.contains("hello\n"));
    assert!(log.contains("oops\n"));
    assert!(log.ends_with("\n\n"));
}

#[cfg(unix)]
#[test]
fn failing_child_marks_run_failed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = write_offline_config(temp.path());

    let status = tracklog()
        .arg("run")
        .arg("--config")
        .arg(&config)
        .args(["--", "sh", "-c", "exit 4"])
        .status()
        .expect("tracklog run");
    assert_eq!(status.code(), Some(exit_codes::CHILD_FAILED));
    assert_eq!(run_status(temp.path()), "FAILED");
}

#[cfg(unix)]
#[test]
fn setup_failure_after_run_creation_marks_run_failed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = write_offline_config(temp.path());
    // A plain file where the artifact directory should be makes terminal
    // capture fail after the run exists.
    fs::write(temp.path().join("artifacts"), "not a directory").expect("block artifacts");
    let marker = temp.path().join("ran");

    let output = tracklog()
        .arg("run")
        .arg("--config")
        .arg(&config)
        .args(["--", "touch"])
        .arg(&marker)
        .output()
        .expect("tracklog run");
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(!marker.exists(), "command must not start after a setup failure");
    assert_eq!(run_status(temp.path()), "FAILED");
}

#[cfg(unix)]
#[test]
fn timed_out_child_exits_timed_out() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = write_offline_config(temp.path());

    let status = tracklog()
        .arg("run")
        .arg("--config")
        .arg(&config)
        .args(["--timeout-secs", "1", "--", "sh", "-c", "exec sleep 30"])
        .status()
        .expect("tracklog run");
    assert_eq!(status.code(), Some(exit_codes::TIMED_OUT));
}
