// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for foreman.
//!
//! Each subsystem gets a strongly-typed error built with `thiserror`; the
//! binary and the top-level loops propagate with `anyhow`.

use thiserror::Error;

/// Errors raised by the durable queue store.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode queue state: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("queue item not found: {0}")]
    NotFound(String),

    #[error("queue is busy: could not lock {0}")]
    Busy(String),
}

impl QueueError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Errors raised while acquiring or releasing a PID lock.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("already running with pid {pid} (since {started_at})")]
    Held {
        pid: u32,
        started_at: chrono::DateTime<chrono::Utc>,
    },

    #[error("lock io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("lock at {0} was taken by another instance during acquisition")]
    Contended(String),
}

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("IO error reading config: {0}")]
    IoError(String),

    #[error("YAML parsing error: {0}")]
    YamlError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(String),

    #[error("Could not determine home directory")]
    NoHomeDir,
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::YamlError(err.to_string())
    }
}

/// Errors from the issue tracker collaborator.
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("tracker command is not configured")]
    NotConfigured,

    #[error("tracker command failed: {0}")]
    CommandFailed(String),

    #[error("tracker query timed out after {0}ms")]
    Timeout(u64),

    #[error("tracker output could not be parsed: {0}")]
    Parse(String),
}

impl TrackerError {
    /// Transient errors are worth retrying on a later cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::CommandFailed(_) | Self::Timeout(_))
    }
}

/// Result type alias using anyhow for flexible error handling.
pub type Result<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::NotFound("0001".to_string());
        assert_eq!(err.to_string(), "queue item not found: 0001");
    }

    #[test]
    fn test_queue_error_io_keeps_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = QueueError::io(std::path::Path::new("/tmp/queue.json"), io_err);
        let display = err.to_string();
        assert!(display.contains("/tmp/queue.json"));
        assert!(display.contains("denied"));
    }

    #[test]
    fn test_config_error_from_json() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("invalid json");
        let config_err: ConfigError = result.unwrap_err().into();
        assert!(matches!(config_err, ConfigError::JsonError(_)));
    }

    #[test]
    fn test_config_error_from_io_not_found() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let config_err: ConfigError = io_err.into();
        assert!(matches!(config_err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_tracker_error_transient() {
        assert!(TrackerError::Timeout(500).is_transient());
        assert!(TrackerError::CommandFailed("exit 1".to_string()).is_transient());
        assert!(!TrackerError::NotConfigured.is_transient());
        assert!(!TrackerError::Parse("bad".to_string()).is_transient());
    }

    #[test]
    fn test_lock_error_display() {
        let err = LockError::Held {
            pid: 42,
            started_at: chrono::Utc::now(),
        };
        assert!(err.to_string().contains("pid 42"));
    }
}
