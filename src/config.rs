//! Configuration for the extraction runtime.
//!
//! Two layers: [`AppConfig`] is the YAML file describing the data store and
//! the extraction tasks to run, and [`CoordinatorConfig`] holds the runtime
//! knobs (status reporting, optional timeouts) that come from environment
//! variables or builder methods rather than the plan file.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::task::ExtractionTask;

/// Runtime knobs for the task coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How often the Running state logs pool status.
    pub status_interval: Duration,
    /// Upper bound on waiting for a worker to acknowledge a batch.
    /// `None` waits indefinitely.
    pub ack_timeout: Option<Duration>,
    /// Upper bound on before/after scripts and synchronous commands.
    /// `None` lets them run to completion.
    pub script_timeout: Option<Duration>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            status_interval: Duration::from_secs(30),
            ack_timeout: None,
            script_timeout: None,
        }
    }
}

impl CoordinatorConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `FACTMILL_STATUS_INTERVAL_SECS`: status log interval (default: 30)
    /// - `FACTMILL_ACK_TIMEOUT_SECS`: worker acknowledgment timeout (default: unset)
    /// - `FACTMILL_SCRIPT_TIMEOUT_SECS`: script/command timeout (default: unset)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is set but cannot be parsed, or if
    /// the resulting configuration fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("FACTMILL_STATUS_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "FACTMILL_STATUS_INTERVAL_SECS")?;
            config.status_interval = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("FACTMILL_ACK_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "FACTMILL_ACK_TIMEOUT_SECS")?;
            config.ack_timeout = Some(Duration::from_secs(secs));
        }

        if let Ok(val) = std::env::var("FACTMILL_SCRIPT_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "FACTMILL_SCRIPT_TIMEOUT_SECS")?;
            config.script_timeout = Some(Duration::from_secs(secs));
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.status_interval.as_secs() == 0 {
            return Err(ConfigError::InvalidValue {
                field: "status_interval".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }

        if let Some(timeout) = self.ack_timeout {
            if timeout.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field: "ack_timeout".to_string(),
                    reason: "must be greater than 0 when set".to_string(),
                });
            }
        }

        if let Some(timeout) = self.script_timeout {
            if timeout.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field: "script_timeout".to_string(),
                    reason: "must be greater than 0 when set".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Builder method to set the status log interval.
    pub fn with_status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }

    /// Builder method to set the worker acknowledgment timeout.
    pub fn with_ack_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Builder method to set the script timeout.
    pub fn with_script_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.script_timeout = timeout;
        self
    }
}

/// Which data store backend a plan runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Postgres,
    Memory,
}

impl Default for StoreKind {
    fn default() -> Self {
        Self::Postgres
    }
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

/// Data store section of the plan file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreSettings {
    /// Backend to use (default: postgres).
    #[serde(default)]
    pub kind: StoreKind,
    /// Connection URL. Required for postgres, ignored for memory.
    #[serde(default)]
    pub url: String,
}

/// Application configuration loaded from a YAML plan file.
///
/// # Example
///
/// ```yaml
/// store:
///   kind: postgres
///   url: postgres://localhost/deep
/// tasks:
///   - name: ext_people
///     style: streaming
///     input:
///       query: SELECT * FROM sentences
///     output_relation: people_mentions
///     udf: udf/ext_people.py
///     parallelism: 4
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Data store the tasks read from and write to.
    #[serde(default)]
    pub store: StoreSettings,
    /// Extraction tasks, in declaration order.
    #[serde(default)]
    pub tasks: Vec<ExtractionTask>,
}

impl AppConfig {
    /// Parses a configuration from YAML text without validating it.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Loads, overrides, and validates a configuration from a YAML file.
    ///
    /// `DATABASE_URL` in the environment takes precedence over the `store.url`
    /// value in the file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        let mut config = Self::from_yaml(&text)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Applies environment variable overrides to the parsed file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.store.url = url;
        }
    }

    /// Validates the store settings and every declared task.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.kind == StoreKind::Postgres && self.store.url.is_empty() {
            return Err(ConfigError::MissingField("store.url".to_string()));
        }

        for task in &self.tasks {
            task.validate().map_err(|e| ConfigError::InvalidValue {
                field: format!("tasks.{}", task.name),
                reason: e.to_string(),
            })?;
        }

        Ok(())
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        field: key.to_string(),
        reason: format!("could not parse '{}'", value),
    })
}
