//! Extraction task definitions.
//!
//! This module defines the descriptor types for extraction tasks:
//!
//! - `ExtractionTask`: an immutable description of one extraction
//! - `ExtractionStyle`: how the UDF is executed (worker pool vs. synchronous)
//! - `InputSource`: where input records come from

use serde::{Deserialize, Serialize};

use crate::error::ExtractionError;

/// Default number of worker processes for streaming tasks.
const DEFAULT_PARALLELISM: usize = 1;

/// Default number of records per input batch.
const DEFAULT_INPUT_BATCH_SIZE: usize = 10_000;

/// Default number of records per output append.
const DEFAULT_OUTPUT_BATCH_SIZE: usize = 50_000;

fn default_parallelism() -> usize {
    DEFAULT_PARALLELISM
}

fn default_input_batch_size() -> usize {
    DEFAULT_INPUT_BATCH_SIZE
}

fn default_output_batch_size() -> usize {
    DEFAULT_OUTPUT_BATCH_SIZE
}

fn default_separator() -> char {
    '\t'
}

/// How a task's UDF is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStyle {
    /// Stream records through a pool of long-lived UDF processes
    /// (one JSON value per line on stdin and stdout).
    Streaming,
    /// Materialize the input to a delimited temp file and run the UDF
    /// once over the whole file.
    LineOriented,
    /// The UDF field is a SQL statement executed directly by the store.
    DirectQuery,
    /// The UDF field is a shell command run once, with no managed input.
    ShellCommand,
    /// The UDF field is a SQL function definition; the store installs it
    /// and the input query populates the output relation in-database.
    CompiledFunction,
}

impl std::fmt::Display for ExtractionStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractionStyle::Streaming => write!(f, "streaming"),
            ExtractionStyle::LineOriented => write!(f, "line_oriented"),
            ExtractionStyle::DirectQuery => write!(f, "direct_query"),
            ExtractionStyle::ShellCommand => write!(f, "shell_command"),
            ExtractionStyle::CompiledFunction => write!(f, "compiled_function"),
        }
    }
}

/// Where a task's input records come from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum InputSource {
    /// A query against the configured data store. Rows become JSON objects.
    Query { query: String },
    /// A delimited text file. Lines become JSON arrays of string fields.
    File {
        file: String,
        #[serde(default = "default_separator")]
        separator: char,
    },
}

impl InputSource {
    /// Creates a query input source.
    pub fn query(query: impl Into<String>) -> Self {
        InputSource::Query {
            query: query.into(),
        }
    }

    /// Creates a file input source with the default tab separator.
    pub fn file(path: impl Into<String>) -> Self {
        InputSource::File {
            file: path.into(),
            separator: default_separator(),
        }
    }
}

/// Immutable description of one extraction task.
///
/// Created once per extraction request (usually deserialized from the
/// application config) and never mutated while running.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractionTask {
    /// Unique task name, referenced by other tasks' `dependencies`.
    pub name: String,
    /// Execution style for the UDF.
    pub style: ExtractionStyle,
    /// Input record source. Required for styles that consume records.
    #[serde(default)]
    pub input: Option<InputSource>,
    /// Relation receiving the extracted records. Required for styles
    /// that produce records.
    #[serde(default)]
    pub output_relation: Option<String>,
    /// The external command, SQL statement, or function definition,
    /// depending on `style`.
    pub udf: String,
    /// Optional shell command run before extraction starts.
    #[serde(default)]
    pub before_script: Option<String>,
    /// Optional shell command run after extraction succeeds.
    #[serde(default)]
    pub after_script: Option<String>,
    /// Number of worker processes for the streaming style.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Records per dispatched input chunk.
    #[serde(default = "default_input_batch_size")]
    pub input_batch_size: usize,
    /// Records per output append (also the worker output chunk size).
    #[serde(default = "default_output_batch_size")]
    pub output_batch_size: usize,
    /// Names of tasks that must complete before this one runs.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl ExtractionTask {
    /// Creates a new streaming task with default batch sizes and
    /// parallelism.
    pub fn new(name: impl Into<String>, udf: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            style: ExtractionStyle::Streaming,
            input: None,
            output_relation: None,
            udf: udf.into(),
            before_script: None,
            after_script: None,
            parallelism: DEFAULT_PARALLELISM,
            input_batch_size: DEFAULT_INPUT_BATCH_SIZE,
            output_batch_size: DEFAULT_OUTPUT_BATCH_SIZE,
            dependencies: Vec::new(),
        }
    }

    /// Sets the execution style.
    pub fn with_style(mut self, style: ExtractionStyle) -> Self {
        self.style = style;
        self
    }

    /// Sets a query input source.
    pub fn with_input_query(mut self, query: impl Into<String>) -> Self {
        self.input = Some(InputSource::query(query));
        self
    }

    /// Sets a file input source.
    pub fn with_input_file(mut self, path: impl Into<String>, separator: char) -> Self {
        self.input = Some(InputSource::File {
            file: path.into(),
            separator,
        });
        self
    }

    /// Sets the output relation.
    pub fn with_output_relation(mut self, relation: impl Into<String>) -> Self {
        self.output_relation = Some(relation.into());
        self
    }

    /// Sets the before-script.
    pub fn with_before_script(mut self, script: impl Into<String>) -> Self {
        self.before_script = Some(script.into());
        self
    }

    /// Sets the after-script.
    pub fn with_after_script(mut self, script: impl Into<String>) -> Self {
        self.after_script = Some(script.into());
        self
    }

    /// Sets the number of worker processes.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Sets the input batch size.
    pub fn with_input_batch_size(mut self, size: usize) -> Self {
        self.input_batch_size = size;
        self
    }

    /// Sets the output batch size.
    pub fn with_output_batch_size(mut self, size: usize) -> Self {
        self.output_batch_size = size;
        self
    }

    /// Sets the dependency list.
    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Whether this task appends extracted records to an output relation.
    pub fn writes_output(&self) -> bool {
        matches!(
            self.style,
            ExtractionStyle::Streaming
                | ExtractionStyle::LineOriented
                | ExtractionStyle::CompiledFunction
        )
    }

    /// Checks internal consistency of the descriptor.
    pub fn validate(&self) -> Result<(), ExtractionError> {
        let invalid = |reason: &str| {
            Err(ExtractionError::InvalidTask {
                task: self.name.clone(),
                reason: reason.to_string(),
            })
        };

        if self.name.is_empty() {
            return Err(ExtractionError::InvalidTask {
                task: "<unnamed>".to_string(),
                reason: "task name must not be empty".to_string(),
            });
        }
        if self.udf.trim().is_empty() {
            return invalid("udf must not be empty");
        }
        if self.parallelism == 0 {
            return invalid("parallelism must be at least 1");
        }
        if self.input_batch_size == 0 {
            return invalid("input_batch_size must be at least 1");
        }
        if self.output_batch_size == 0 {
            return invalid("output_batch_size must be at least 1");
        }

        match self.style {
            ExtractionStyle::Streaming | ExtractionStyle::LineOriented => {
                if self.input.is_none() {
                    return invalid("this style requires an input source");
                }
                if self.output_relation.is_none() {
                    return invalid("this style requires an output relation");
                }
            }
            ExtractionStyle::CompiledFunction => {
                if !matches!(self.input, Some(InputSource::Query { .. })) {
                    return invalid("compiled_function requires a query input source");
                }
                if self.output_relation.is_none() {
                    return invalid("compiled_function requires an output relation");
                }
            }
            ExtractionStyle::DirectQuery | ExtractionStyle::ShellCommand => {}
        }

        Ok(())
    }
}
