//! Running a child process with its output routed through the capture sinks.
//!
//! The child's stdout/stderr are piped and copied chunk by chunk into the
//! [`Interceptor`]'s writers, so they reach the real terminal and every
//! registered terminal-log buffer alike.

use std::io::{Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::capture::{CapturedStream, Interceptor};

/// Outcome of a captured child process.
#[derive(Debug)]
pub struct CapturedRun {
    pub status: ExitStatus,
    /// Bytes copied from the child's stdout and stderr.
    pub stdout_bytes: usize,
    pub stderr_bytes: usize,
    pub timed_out: bool,
}

impl CapturedRun {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }
}

/// Run `cmd`, streaming its output through `interceptor`.
///
/// With a `timeout`, the child is killed once it elapses and the result is
/// marked `timed_out`.
#[instrument(skip_all, fields(timeout_secs = timeout.map(|t| t.as_secs())))]
pub fn run_captured(
    mut cmd: Command,
    timeout: Option<Duration>,
    interceptor: &Arc<Interceptor>,
) -> Result<CapturedRun> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!(program = ?cmd.get_program(), "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {:?}", cmd.get_program()));
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = pump(stdout, interceptor.stdout(), "stdout")?;
    let stderr_handle = pump(stderr, interceptor.stderr(), "stderr")?;

    let mut timed_out = false;
    let status = match timeout {
        None => child.wait().context("wait for command")?,
        Some(timeout) => match child.wait_timeout(timeout).context("wait for command")? {
            Some(status) => status,
            None => {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "command timed out, killing"
                );
                timed_out = true;
                child.kill().context("kill command")?;
                child.wait().context("wait command after kill")?
            }
        },
    };

    let stdout_bytes = join_pump(stdout_handle).context("join stdout")?;
    let stderr_bytes = join_pump(stderr_handle).context("join stderr")?;

    debug!(exit_code = ?status.code(), timed_out, stdout_bytes, stderr_bytes, "command finished");
    Ok(CapturedRun {
        status,
        stdout_bytes,
        stderr_bytes,
        timed_out,
    })
}

fn pump<R: Read + Send + 'static>(
    reader: R,
    sink: CapturedStream,
    label: &'static str,
) -> Result<JoinHandle<Result<usize>>> {
    thread::Builder::new()
        .name(format!("child-{label}"))
        .spawn(move || copy_stream(reader, sink))
        .with_context(|| format!("spawn {label} pump"))
}

fn copy_stream<R: Read, W: Write>(mut reader: R, mut sink: W) -> Result<usize> {
    let mut total = 0usize;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read child output")?;
        if n == 0 {
            break;
        }
        sink.write_all(&chunk[..n]).context("forward child output")?;
        total += n;
    }
    sink.flush().context("flush child output")?;
    Ok(total)
}

fn join_pump(handle: JoinHandle<Result<usize>>) -> Result<usize> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output pump thread panicked")),
    }
}
