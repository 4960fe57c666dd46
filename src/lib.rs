//! factmill: streaming data-extraction pipeline runner.
//!
//! This library streams records from a data store through pools of external
//! UDF processes and collects their output back into the store, one task at
//! a time under a dependency-ordered plan.

// Core modules
pub mod cli;
pub mod config;
pub mod error;
pub mod extract;
pub mod plan;
pub mod store;
pub mod task;

// Re-export commonly used error types
pub use error::{ConfigError, ExtractionError, PlanError, StoreError};
