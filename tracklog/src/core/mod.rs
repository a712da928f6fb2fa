//! Deterministic, pure logic shared by the tracking layer.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod ansi;
pub mod params;
pub mod run_params;
pub mod types;
