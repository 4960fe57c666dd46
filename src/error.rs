//! Error types for factmill operations.
//!
//! Defines error types for the major subsystems:
//! - Task extraction (worker pool, feeding, result collection)
//! - Data store access (queries, bulk appends)
//! - Plan resolution and execution
//! - Configuration loading and validation

use thiserror::Error;

/// Errors that terminate an extraction task.
///
/// Any of these aborts the running task: workers are killed, the feeder is
/// stopped and buffered output is dropped rather than flushed.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Script '{script}' exited with code {code}")]
    ScriptFailure { script: String, code: i32 },

    #[error("Worker {worker} exited with code {code} before its input was closed")]
    WorkerCrash { worker: usize, code: i32 },

    #[error("Failed to write batch to worker {worker}: {reason}")]
    WriteFailure { worker: usize, reason: String },

    #[error("Batch acknowledgment overdue after {seconds} seconds")]
    AckTimeout { seconds: u64 },

    #[error("Worker output is not valid JSON: {source} (line: {line:?})")]
    ParseError {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to append results to '{relation}': {source}")]
    StoreWriteError {
        relation: String,
        #[source]
        source: StoreError,
    },

    #[error("Extraction style '{style}' is not supported by the '{driver}' store")]
    UnsupportedStyleOnDriver { style: String, driver: String },

    #[error("Store statement failed: {0}")]
    StatementFailure(#[source] StoreError),

    #[error("Failed to read task input: {0}")]
    InputError(#[source] StoreError),

    #[error("Task '{task}' failed validation: {reason}")]
    InvalidTask { task: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the data store layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to connect to store at '{url}': {message}")]
    ConnectionFailed { url: String, message: String },

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Bulk append to '{relation}' failed: {message}")]
    AppendFailed { relation: String, message: String },

    #[error("Relation '{0}' does not exist")]
    UnknownRelation(String),

    #[error("Record is not in the shape '{relation}' expects: {reason}")]
    MalformedRecord { relation: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from plan resolution and execution.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Task '{0}' not found in plan")]
    UnknownTask(String),

    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("Dependency cycle involving task '{0}'")]
    DependencyCycle(String),

    #[error("Duplicate task name '{0}' in plan")]
    DuplicateTask(String),

    #[error("Task '{task}' failed: {source}")]
    TaskFailed {
        task: String,
        #[source]
        source: ExtractionError,
    },
}

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {message}")]
    ReadFailed { path: String, message: String },

    #[error("Invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Missing required config field: {0}")]
    MissingField(String),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
