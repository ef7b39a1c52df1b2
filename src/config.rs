//! JSON configuration shared by the processor binary and clients.
//!
//! Durations are written as numeric seconds, fractions allowed:
//!
//! ```json
//! {
//!   "database": { "path": "data/central.db" },
//!   "shared_folder": { "requests": "/mnt/sync/requests", "responses": "/mnt/sync/responses" },
//!   "processor": { "poll_interval": 0.1, "max_concurrent_requests": 10, "request_timeout": 30 },
//!   "client": { "poll_interval": 0.2, "retry_attempts": 3 },
//!   "logging": { "level": "INFO" }
//! }
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub database: DatabaseConfig,
    pub shared_folder: SharedFolderConfig,
    pub processor: ProcessorConfig,
    pub client: ClientConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/central.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedFolderConfig {
    pub requests: PathBuf,
    pub responses: PathBuf,
    /// Keep acknowledged entries under `.archive/` until the retention sweep.
    pub archive: bool,
    /// I/O tries per mailbox operation, including the first.
    pub retry_attempts: u32,
    #[serde(with = "secs")]
    pub retry_backoff: Duration,
}

impl Default for SharedFolderConfig {
    fn default() -> Self {
        Self {
            requests: PathBuf::from("shared/requests"),
            responses: PathBuf::from("shared/responses"),
            archive: false,
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

impl SharedFolderConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts,
            backoff: self.retry_backoff,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    #[serde(with = "secs")]
    pub poll_interval: Duration,
    /// Requests executing at once.
    pub max_concurrent_requests: usize,
    /// Claimed requests allowed to wait for an execution slot.
    pub max_queued_requests: usize,
    #[serde(with = "secs")]
    pub request_timeout: Duration,
    #[serde(with = "secs")]
    pub cleanup_interval: Duration,
    /// Age after which unconsumed and archived artifacts are removed.
    #[serde(with = "secs")]
    pub retention: Duration,
    /// Consecutive failed polls that stop the processor.
    pub max_channel_failures: u32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_concurrent_requests: 10,
            max_queued_requests: 32,
            request_timeout: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(300),
            retention: Duration::from_secs(3600),
            max_channel_failures: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    #[serde(with = "secs")]
    pub poll_interval: Duration,
    #[serde(with = "secs")]
    pub request_timeout: Duration,
    /// Resubmissions after the first attempt times out.
    pub retry_attempts: u32,
    #[serde(with = "secs")]
    pub retry_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            request_timeout: Duration::from_secs(30),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `DEBUG`, `INFO`, `WARNING` or `ERROR`.
    pub level: String,
    /// Append log lines here instead of stderr.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            file: None,
        }
    }
}

impl LoggingConfig {
    /// Equivalent `tracing` filter directive.
    pub fn filter_directive(&self) -> &'static str {
        match self.level.to_ascii_uppercase().as_str() {
            "TRACE" => "trace",
            "DEBUG" => "debug",
            "WARN" | "WARNING" => "warn",
            "ERROR" | "CRITICAL" => "error",
            _ => "info",
        }
    }
}

impl SyncConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.processor.validate()?;
        self.client.validate()?;
        first_failure(&[(
            self.shared_folder.requests == self.shared_folder.responses,
            "request and response mailboxes must differ",
        )])
    }
}

impl ProcessorConfig {
    /// Rejects settings the processor cannot run with, such as zero intervals.
    pub fn validate(&self) -> Result<(), ConfigError> {
        first_failure(&[
            (self.max_concurrent_requests == 0, "processor.max_concurrent_requests must be at least 1"),
            (self.poll_interval.is_zero(), "processor.poll_interval must be positive"),
            (self.request_timeout.is_zero(), "processor.request_timeout must be positive"),
            (self.cleanup_interval.is_zero(), "processor.cleanup_interval must be positive"),
            (self.max_channel_failures == 0, "processor.max_channel_failures must be at least 1"),
        ])
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        first_failure(&[
            (self.poll_interval.is_zero(), "client.poll_interval must be positive"),
            (self.request_timeout.is_zero(), "client.request_timeout must be positive"),
        ])
    }
}

fn first_failure(checks: &[(bool, &str)]) -> Result<(), ConfigError> {
    match checks.iter().find(|(failed, _)| *failed) {
        Some((_, message)) => Err(ConfigError::Invalid((*message).to_string())),
        None => Ok(()),
    }
}

/// `Duration` as fractional seconds.
pub mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(raw).map_err(|_| D::Error::custom(format!("invalid duration {raw}")))
    }
}
