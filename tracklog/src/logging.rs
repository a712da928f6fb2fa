//! Diagnostics via `tracing`.
//!
//! The fmt layer writes through [`capture::stderr`], so once a terminal log
//! monitor is running, tracklog's own diagnostics land in the captured log
//! next to the program's output.

use std::io::IsTerminal;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::io::capture;

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `tracklog=info` if unset.
/// Colors only when stderr is a terminal, so captured logs stay plain.
///
/// # Example
/// ```bash
/// RUST_LOG=tracklog=debug tracklog run --config tracking.toml -- python train.py
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tracklog=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(capture::stderr)
                .with_ansi(std::io::stderr().is_terminal())
                .compact(),
        )
        .init();
}
