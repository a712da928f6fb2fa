//! End-to-end terminal capture through the process-wide interceptor.
//!
//! Kept to a single test: the global interceptor is shared by every test in
//! this binary.

use std::fs;
use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracklog::io::capture::{self, Interceptor};
use tracklog::io::monitor::{LogsMonitor, MonitorOptions};
use tracklog::io::tracking::ArtifactStore;
use tracklog::test_support::RecordingTracker;

#[test]
fn captured_output_is_flushed_uploaded_and_closed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let tracker = Arc::new(RecordingTracker::new());
    let store: Arc<dyn ArtifactStore> = tracker.clone();
    let options = MonitorOptions {
        flush_interval: Duration::from_secs(1),
        check_interval: Duration::from_millis(100),
    };

    let global = Interceptor::global();
    let installs_before = global.install_count();
    let mut monitor = LogsMonitor::new(temp.path(), "run-e2e", store, options).expect("monitor");
    monitor.start().expect("start");
    assert!(global.is_installed());

    capture::stdout().write_all(b"hello\n").expect("write");
    thread::sleep(Duration::from_secs(2));

    let periodic = fs::read_to_string(monitor.path()).expect("read log");
    assert!(periodic.contains("hello"));
    assert!(!tracker.uploads().is_empty());

    monitor.finish("success").expect("finish");
    let closed = fs::read_to_string(monitor.path()).expect("read log");
    assert!(closed.starts_with(&periodic));
    assert!(closed.ends_with("\n\n"));
    assert!(!global.is_installed());
    assert_eq!(global.install_count(), installs_before + 1);
    assert!(
        tracker
            .uploads()
            .iter()
            .all(|(run_id, path)| run_id == "run-e2e" && path == monitor.path())
    );

    let len = fs::metadata(monitor.path()).expect("stat").len();
    monitor.finish("success").expect("finish again");
    assert_eq!(fs::metadata(monitor.path()).expect("stat").len(), len);
}
