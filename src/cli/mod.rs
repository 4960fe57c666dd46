//! Command-line interface for factmill.
//!
//! Provides commands for running extraction plans and inspecting their
//! resolved execution order.

mod commands;

pub use commands::{parse_cli, run, run_with_cli};
