//! Stable exit codes for tracklog CLI commands.

/// Command succeeded (health check passed, or the wrapped command succeeded).
pub const OK: i32 = 0;
/// Invalid config, failed health check, or any tracking error.
pub const INVALID: i32 = 1;
/// `tracklog run`: the wrapped command exited unsuccessfully.
pub const CHILD_FAILED: i32 = 2;
/// `tracklog run`: the wrapped command was killed after `--timeout-secs`.
pub const TIMED_OUT: i32 = 3;
