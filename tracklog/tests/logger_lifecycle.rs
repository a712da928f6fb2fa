//! Logger lifecycle against the offline file store.

use std::fs;
use std::io::{self, Write};
use std::sync::Arc;

use tracklog::io::capture::{Interceptor, SinkFn};
use tracklog::io::config::TrackingConfig;
use tracklog::io::local_store::LocalTrackingStore;
use tracklog::io::tracking::TrackingClient;
use tracklog::logger::TrackingLogger;
use tracklog::test_support::StaticAuth;

fn quiet_interceptor() -> Arc<Interceptor> {
    let discard: SinkFn = Arc::new(|_: &[u8]| -> io::Result<()> { Ok(()) });
    Interceptor::with_sinks(Arc::clone(&discard), discard)
}

fn offline_config(save_dir: &std::path::Path) -> TrackingConfig {
    TrackingConfig {
        offline: true,
        project_name: "demo".to_string(),
        run_name: Some("baseline".to_string()),
        save_dir: save_dir.to_path_buf(),
        ..TrackingConfig::default()
    }
}

#[test]
fn offline_run_records_params_log_and_status() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store_dir = temp.path().join("mlruns");
    let artifacts_dir = temp.path().join("artifacts");
    let interceptor = quiet_interceptor();

    let mut logger = TrackingLogger::offline(
        offline_config(&store_dir),
        0,
        vec!["train.py".to_string(), "--epochs".to_string(), "2".to_string()],
    )
    .expect("logger")
    .with_interceptor(Arc::clone(&interceptor));

    logger
        .log_hyperparams(&serde_json::json!({
            "optimizer": {"lr": 0.01},
            "hardware": {"gpus": 8},
            "note": "x".repeat(300)
        }))
        .expect("params");
    logger.log_terminal_output(&artifacts_dir).expect("terminal");
    interceptor
        .stdout()
        .write_all(b"epoch 1 loss 0.5\n")
        .expect("write");
    logger.finalize("success").expect("finalize");

    let run = logger.run().expect("run").clone();
    let run_dir = store_dir.join(&run.experiment_id).join(&run.run_id);
    assert_eq!(
        fs::read_to_string(run_dir.join("params/optimizer.lr")).expect("lr"),
        "0.01"
    );
    assert!(!run_dir.join("params/hardware.gpus").exists());
    assert_eq!(
        fs::read_to_string(run_dir.join("params/note"))
            .expect("note")
            .chars()
            .count(),
        250
    );
    assert_eq!(
        fs::read_to_string(run_dir.join("tags/command")).expect("command tag"),
        "train.py --epochs 2"
    );

    let log = artifacts_dir
        .join(&run.run_id)
        .join("plots/terminal_log.txt");
    assert_eq!(
        fs::read_to_string(&log).expect("log"),
        "epoch 1 loss 0.5\n\n\n"
    );
    assert_eq!(
        fs::read_to_string(run_dir.join("artifacts/terminal_log.txt")).expect("artifact"),
        "epoch 1 loss 0.5\n"
    );

    let store = LocalTrackingStore::new(&store_dir).expect("store");
    let stored = store.get_run(&run.run_id).expect("get run");
    assert_eq!(stored.run_name, "baseline");
    assert_eq!(stored.status.as_str(), "FINISHED");
}

#[test]
fn resumed_run_is_reopened_in_place() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store_dir = temp.path().join("mlruns");
    let store = Arc::new(LocalTrackingStore::new(&store_dir).expect("store"));

    let mut first = TrackingLogger::with_client(
        offline_config(&store_dir),
        0,
        vec!["train.py".to_string()],
        store.clone(),
        Arc::new(StaticAuth::new(None)),
    );
    let run_id = first.run_id().expect("run id").expect("rank zero");
    first.finalize("failed").expect("finalize");

    let auth = Arc::new(StaticAuth::new(None));
    let mut resumed = TrackingLogger::with_client(
        TrackingConfig {
            run_id: Some(run_id.clone()),
            on_resume_create_child: false,
            ..offline_config(&store_dir)
        },
        0,
        vec!["train.py".to_string()],
        store.clone(),
        auth.clone(),
    );
    assert_eq!(resumed.run_id().expect("run id"), Some(run_id.clone()));
    assert_eq!(store.get_run(&run_id).expect("run").status.as_str(), "RUNNING");

    resumed.finalize("success").expect("finalize");
    assert_eq!(auth.saves(), 1);
    let run_dir = store_dir
        .join(&store.get_run(&run_id).expect("run").experiment_id)
        .join(&run_id);
    assert_eq!(
        fs::read_to_string(run_dir.join("tags/resumedRun")).expect("tag"),
        "True"
    );
    assert_eq!(
        store.get_run(&run_id).expect("run").status.as_str(),
        "FINISHED"
    );
}
