//! Library half of the `pgque` binary: argument parsing, configuration
//! translation and logging setup.

pub mod cli;
pub mod config_helpers;
pub mod tracing_setup;
