//! Terminal log monitor: captures process output into a per-run log artifact.
//!
//! A [`LogsMonitor`] registers a [`CaptureBuffer`] with the [`Interceptor`] and
//! runs a collector thread that periodically drains the buffer, filters cursor
//! movement out of it, appends it to `<artifact_save_dir>/<run_id>/plots/terminal_log.txt`,
//! and uploads the file through an [`ArtifactStore`].
//!
//! Capture is best effort: bytes written between the last periodic flush and a
//! crash are lost. `finish` performs a final synchronous flush so everything
//! written before it returns is in the file.

use std::env;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, warn};

use crate::core::ansi::render_chunk;
use crate::io::capture::{CaptureBuffer, Interceptor, Registration};
use crate::io::tracking::ArtifactStore;

pub const TERMINAL_LOG_FILE: &str = "terminal_log.txt";
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(1);
pub const SLURM_JOB_ID_ENV: &str = "SLURM_JOB_ID";

const SESSION_TRAILER: &[u8] = b"\n\n";

/// Location of the terminal log for `run_id`.
pub fn terminal_log_path(artifact_save_dir: &Path, run_id: &str) -> PathBuf {
    artifact_save_dir
        .join(run_id)
        .join("plots")
        .join(TERMINAL_LOG_FILE)
}

/// Collector timing.
///
/// The collector wakes every `check_interval` and flushes once the time since
/// the last flush reaches `flush_interval`. Shutdown interrupts the wait
/// immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorOptions {
    pub flush_interval: Duration,
    pub check_interval: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }
}

/// Drains a capture buffer into the log file and ships the file.
struct LogShipper {
    path: PathBuf,
    run_id: String,
    store: Arc<dyn ArtifactStore>,
    buffer: Arc<CaptureBuffer>,
    scratch: Mutex<Vec<u8>>,
}

impl LogShipper {
    /// Returns `false` when nothing was buffered (no file access, no upload).
    fn flush(&self, shutting_down: bool) -> Result<bool> {
        let mut scratch = self.scratch.lock().unwrap_or_else(PoisonError::into_inner);
        scratch.clear();
        if self.buffer.drain_into(&mut scratch) == 0 {
            return Ok(false);
        }

        let rendered = render_chunk(&scratch, shutting_down);
        let text = String::from_utf8_lossy(&rendered);
        append_to_log(&self.path, text.as_bytes())?;
        debug!(
            drained = scratch.len(),
            written = text.len(),
            "terminal log flushed"
        );

        if let Err(err) = self.store.log_artifact(&self.run_id, &self.path) {
            warn!(
                run_id = %self.run_id,
                path = %self.path.display(),
                err = %format!("{err:#}"),
                "terminal log upload failed"
            );
        }
        Ok(true)
    }
}

fn append_to_log(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open terminal log {}", path.display()))?;
    file.write_all(bytes)
        .with_context(|| format!("write terminal log {}", path.display()))?;
    file.flush()
        .with_context(|| format!("flush terminal log {}", path.display()))?;
    Ok(())
}

struct Collector {
    shutdown: Sender<()>,
    handle: JoinHandle<Result<()>>,
}

impl Collector {
    fn spawn(shipper: Arc<LogShipper>, options: MonitorOptions) -> Result<Self> {
        let (shutdown, signal) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("terminal-log-collector".to_string())
            .spawn(move || collect(&shipper, &signal, options))
            .context("spawn terminal log collector")?;
        Ok(Self { shutdown, handle })
    }

    /// Signal shutdown and wait for the thread, surfacing its error.
    fn stop(self) -> Result<()> {
        // The receiver is gone if the collector already exited on an error.
        let _ = self.shutdown.send(());
        match self.handle.join() {
            Ok(result) => result.context("terminal log collector failed"),
            Err(_) => Err(anyhow!("terminal log collector thread panicked")),
        }
    }
}

fn collect(shipper: &LogShipper, signal: &Receiver<()>, options: MonitorOptions) -> Result<()> {
    let mut since_flush = Duration::ZERO;
    loop {
        match signal.recv_timeout(options.check_interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return Ok(()),
            Err(RecvTimeoutError::Timeout) => {}
        }
        since_flush += options.check_interval;
        if since_flush >= options.flush_interval {
            shipper.flush(false)?;
            since_flush = Duration::ZERO;
        }
    }
}

/// One run's terminal capture session.
///
/// Dropping a started monitor without calling [`LogsMonitor::finish`] stops
/// the collector and unregisters the buffer, but skips the final flush and the
/// session trailer.
pub struct LogsMonitor {
    shipper: Arc<LogShipper>,
    interceptor: Arc<Interceptor>,
    options: MonitorOptions,
    registration: Option<Registration>,
    collector: Option<Collector>,
    started: bool,
    finished: bool,
}

impl LogsMonitor {
    /// Prepare a monitor for `run_id`, creating the log directory.
    pub fn new(
        artifact_save_dir: &Path,
        run_id: &str,
        store: Arc<dyn ArtifactStore>,
        options: MonitorOptions,
    ) -> Result<Self> {
        let path = terminal_log_path(artifact_save_dir, run_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create terminal log dir {}", parent.display()))?;
        }
        Ok(Self {
            shipper: Arc::new(LogShipper {
                path,
                run_id: run_id.to_string(),
                store,
                buffer: Arc::new(CaptureBuffer::new()),
                scratch: Mutex::new(Vec::new()),
            }),
            interceptor: Interceptor::global(),
            options,
            registration: None,
            collector: None,
            started: false,
            finished: false,
        })
    }

    /// Capture from `interceptor` instead of the process-wide one.
    ///
    /// Only meaningful before [`LogsMonitor::start`].
    pub fn with_interceptor(mut self, interceptor: Arc<Interceptor>) -> Self {
        self.interceptor = interceptor;
        self
    }

    pub fn path(&self) -> &Path {
        &self.shipper.path
    }

    pub fn run_id(&self) -> &str {
        &self.shipper.run_id
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Begin capturing. Calling again (or after `finish`) has no effect.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        let registration = self.interceptor.register(&self.shipper.buffer);
        let collector = Collector::spawn(Arc::clone(&self.shipper), self.options)?;
        self.registration = Some(registration);
        self.collector = Some(collector);
        self.started = true;

        info!(path = %self.shipper.path.display(), "terminal log path");
        if let Ok(job_id) = env::var(SLURM_JOB_ID_ENV)
            && !job_id.is_empty()
        {
            info!(slurm_job_id = %job_id, "SLURM job id");
        }
        Ok(())
    }

    /// Flush buffered output now. Returns `false` if nothing was buffered.
    pub fn flush(&self) -> Result<bool> {
        self.shipper.flush(self.finished)
    }

    /// Stop capturing and close the session with a trailer.
    ///
    /// No-op unless started and not yet finished. Errors from the collector
    /// thread, the final flush, or the trailer write are returned after the
    /// buffer has been unregistered.
    pub fn finish(&mut self, status: &str) -> Result<()> {
        if !self.started || self.finished {
            return Ok(());
        }
        self.finished = true;
        info!(
            "stopping terminal log monitoring and saving buffered terminal outputs, final status: {}",
            status.to_uppercase()
        );

        let collected = match self.collector.take() {
            Some(collector) => collector.stop(),
            None => Ok(()),
        };
        let flushed = self.shipper.flush(true);
        if let Some(registration) = self.registration.take() {
            registration.release();
        }
        let closed = append_to_log(&self.shipper.path, SESSION_TRAILER);

        collected?;
        flushed?;
        closed
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Write};

    use super::*;
    use crate::io::capture::SinkFn;
    use crate::test_support::RecordingTracker;

    fn quiet_interceptor() -> Arc<Interceptor> {
        let discard: SinkFn = Arc::new(|_: &[u8]| -> io::Result<()> { Ok(()) });
        Interceptor::with_sinks(Arc::clone(&discard), discard)
    }

    fn monitor(
        dir: &Path,
        store: &Arc<RecordingTracker>,
        options: MonitorOptions,
    ) -> (LogsMonitor, Arc<Interceptor>) {
        let interceptor = quiet_interceptor();
        let store: Arc<dyn ArtifactStore> = store.clone();
        let monitor = LogsMonitor::new(dir, "run-1", store, options)
            .expect("monitor")
            .with_interceptor(Arc::clone(&interceptor));
        (monitor, interceptor)
    }

    fn slow() -> MonitorOptions {
        MonitorOptions {
            flush_interval: Duration::from_secs(3600),
            check_interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn log_path_layout_is_stable() {
        let path = terminal_log_path(Path::new("/artifacts"), "abc");
        assert_eq!(path, Path::new("/artifacts/abc/plots/terminal_log.txt"));
    }

    #[test]
    fn new_creates_log_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(RecordingTracker::new());
        let (monitor, _) = monitor(temp.path(), &store, slow());
        assert!(temp.path().join("run-1/plots").is_dir());
        assert!(!monitor.path().exists());
    }

    #[test]
    fn empty_flush_touches_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(RecordingTracker::new());
        let (mut monitor, _) = monitor(temp.path(), &store, slow());
        monitor.start().expect("start");

        assert!(!monitor.flush().expect("flush"));
        assert!(!monitor.path().exists());
        assert!(store.uploads().is_empty());
        monitor.finish("success").expect("finish");
    }

    #[test]
    fn finish_flushes_and_writes_trailer() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(RecordingTracker::new());
        let (mut monitor, interceptor) = monitor(temp.path(), &store, slow());
        monitor.start().expect("start");

        interceptor.stdout().write_all(b"hello\n").expect("write");
        monitor.finish("success").expect("finish");

        let contents = fs::read_to_string(monitor.path()).expect("read log");
        assert_eq!(contents, "hello\n\n\n");
        assert_eq!(
            store.uploads(),
            vec![("run-1".to_string(), monitor.path().to_path_buf())]
        );
        assert!(!interceptor.is_installed());
    }

    #[test]
    fn second_finish_is_a_noop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(RecordingTracker::new());
        let (mut monitor, interceptor) = monitor(temp.path(), &store, slow());
        monitor.start().expect("start");
        interceptor.stderr().write_all(b"warn\n").expect("write");
        monitor.finish("failed").expect("finish");
        let len = fs::metadata(monitor.path()).expect("stat").len();

        monitor.finish("failed").expect("finish again");
        assert_eq!(fs::metadata(monitor.path()).expect("stat").len(), len);
        assert_eq!(store.uploads().len(), 1);
    }

    #[test]
    fn finish_without_start_is_a_noop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(RecordingTracker::new());
        let (mut monitor, _) = monitor(temp.path(), &store, slow());
        monitor.finish("success").expect("finish");
        assert!(!monitor.path().exists());
        assert!(!monitor.is_started());
        assert!(!monitor.is_finished());
    }

    #[test]
    fn start_is_idempotent_and_not_restartable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(RecordingTracker::new());
        let (mut monitor, interceptor) = monitor(temp.path(), &store, slow());
        monitor.start().expect("start");
        monitor.start().expect("start again");
        assert!(monitor.is_started());
        assert_eq!(interceptor.registered(), 1);

        monitor.finish("success").expect("finish");
        monitor.start().expect("start after finish");
        assert_eq!(interceptor.registered(), 0);
    }

    #[test]
    fn collector_flushes_on_interval() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(RecordingTracker::new());
        let options = MonitorOptions {
            flush_interval: Duration::from_millis(50),
            check_interval: Duration::from_millis(10),
        };
        let (mut monitor, interceptor) = monitor(temp.path(), &store, options);
        monitor.start().expect("start");

        interceptor.stdout().write_all(b"step 1\n").expect("write");
        thread::sleep(Duration::from_millis(400));

        let contents = fs::read_to_string(monitor.path()).expect("read log");
        assert_eq!(contents, "step 1\n");
        assert!(!store.uploads().is_empty());
        monitor.finish("success").expect("finish");
    }

    #[test]
    fn final_flush_keeps_last_progress_redraw() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(RecordingTracker::new());
        let (mut monitor, interceptor) = monitor(temp.path(), &store, slow());
        monitor.start().expect("start");
        interceptor
            .stderr()
            .write_all(b"epoch 0:  37%|###  | 37/100\x1b[A\n")
            .expect("write");
        monitor.finish("success").expect("finish");

        let contents = fs::read_to_string(monitor.path()).expect("read log");
        assert_eq!(contents, "epoch 0:  37%|###  | 37/100\n\n\n");
    }

    #[test]
    fn upload_failures_do_not_fail_flush() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(RecordingTracker::new().failing_uploads());
        let (mut monitor, interceptor) = monitor(temp.path(), &store, slow());
        monitor.start().expect("start");
        interceptor.stdout().write_all(b"x\n").expect("write");
        assert!(monitor.flush().expect("flush"));
        monitor.finish("success").expect("finish");
    }

    #[test]
    fn collector_errors_surface_from_finish() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(RecordingTracker::new());
        let options = MonitorOptions {
            flush_interval: Duration::from_millis(20),
            check_interval: Duration::from_millis(10),
        };
        let (mut monitor, interceptor) = monitor(temp.path(), &store, options);
        // A directory where the log file should be makes every append fail.
        fs::create_dir_all(monitor.path()).expect("block log path");
        monitor.start().expect("start");

        interceptor.stdout().write_all(b"doomed\n").expect("write");
        thread::sleep(Duration::from_millis(200));

        let err = monitor.finish("failed").expect_err("finish should fail");
        assert!(format!("{err:#}").contains("terminal log"));
        assert_eq!(interceptor.registered(), 0);
        assert!(!interceptor.is_installed());
    }

    #[test]
    fn dropping_started_monitor_unregisters() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(RecordingTracker::new());
        let (mut monitor, interceptor) = monitor(temp.path(), &store, slow());
        monitor.start().expect("start");
        assert!(interceptor.is_installed());

        drop(monitor);
        assert_eq!(interceptor.registered(), 0);
        assert!(!interceptor.is_installed());
    }
}
