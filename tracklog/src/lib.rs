//! Experiment tracking with terminal output capture.
//!
//! A training job's stdout/stderr are mirrored into a per-run
//! `terminal_log.txt`, with progress-bar redraws filtered out, and the file is
//! shipped periodically as a run artifact. Around that sits a small tracking
//! client: run creation/resume/fork, hyperparameter logging, token auth and a
//! server health preflight.
//!
//! - **[`core`]**: Pure logic (control-sequence filtering, parameter
//!   flattening, run planning). No I/O.
//! - **[`io`]**: Side effects (stream interception, the log monitor, HTTP and
//!   local tracking backends, config files, child processes).
//!
//! [`logger::TrackingLogger`] ties them together; the `tracklog` binary
//! wraps a command with it.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logger;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
