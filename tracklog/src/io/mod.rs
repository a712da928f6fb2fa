//! Side-effecting parts of the logger: capture, files, network, processes.

pub mod auth;
pub mod capture;
pub mod config;
pub mod files;
pub mod health;
pub mod local_store;
pub mod monitor;
pub mod process;
pub mod tracking;
