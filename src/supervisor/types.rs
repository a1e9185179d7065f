// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Supervisor data model and errors.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ResolvedConfig;
use crate::error::LockError;
use crate::ipc::{codes, IpcError, RpcError};

/// Current [`ServiceSession`] schema version.
pub const SESSION_VERSION: u32 = 1;

/// What to launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Names double as log file stems, so keep them path-safe.
    pub fn validate(&self) -> Result<(), SupervisorError> {
        let name_ok = !self.name.is_empty()
            && self.name.len() <= 64
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !self.name.starts_with('.');
        if !name_ok {
            return Err(SupervisorError::InvalidSpec(format!(
                "invalid process name '{}': use letters, digits, '-', '_' or '.'",
                self.name
            )));
        }
        if self.command.trim().is_empty() {
            return Err(SupervisorError::InvalidSpec("command must not be empty".to_string()));
        }
        Ok(())
    }
}

/// A process the supervisor started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub name: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    pub out_log_path: PathBuf,
    pub err_log_path: PathBuf,
}

/// Everything the supervisor persists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSession {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub processes: Vec<ProcessRecord>,
}

impl ServiceSession {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            version: SESSION_VERSION,
            created_at: now,
            updated_at: now,
            base_url: None,
            processes: Vec::new(),
        }
    }

    pub fn find(&self, name: &str) -> Option<&ProcessRecord> {
        self.processes.iter().find(|p| p.name == name)
    }

    /// Remove and return the record called `name`.
    pub fn take(&mut self, name: &str) -> Option<ProcessRecord> {
        let index = self.processes.iter().position(|p| p.name == name)?;
        Some(self.processes.remove(index))
    }
}

impl Default for ServiceSession {
    fn default() -> Self {
        Self::new()
    }
}

/// One row of `process.status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatus {
    pub name: String,
    pub pid: u32,
    pub running: bool,
}

/// `ping` answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingReply {
    pub pid: u32,
}

/// `process.stop` parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopParams {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// `process.stop` answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReply {
    pub stopped: bool,
}

/// Timeouts and retry policy for talking to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub connect_retries: u32,
    pub connect_backoff: Duration,
    pub request_timeout: Duration,
    /// Grace between SIGTERM and SIGKILL when a stop names no timeout.
    pub stop_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from(&ResolvedConfig::default())
    }
}

impl From<&ResolvedConfig> for SupervisorSettings {
    fn from(config: &ResolvedConfig) -> Self {
        let s = &config.supervisor;
        Self {
            connect_retries: s.connect_retries,
            connect_backoff: Duration::from_millis(s.connect_backoff_ms),
            request_timeout: Duration::from_millis(s.request_timeout_ms),
            stop_timeout: Duration::from_millis(s.stop_timeout_ms),
        }
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("supervisor already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("process '{name}' is already running (pid {pid})")]
    ProcessAlreadyRunning { name: String, pid: u32 },

    #[error("no process named '{0}'")]
    NotFound(String),

    #[error("invalid process spec: {0}")]
    InvalidSpec(String),

    #[error("failed to spawn '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("session I/O failed for {path}: {source}")]
    Session {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("supervisor did not come up after {attempts} attempts: {last_error}")]
    StartTimeout { attempts: u32, last_error: String },

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

impl SupervisorError {
    /// Wire code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            SupervisorError::ProcessAlreadyRunning { .. } => codes::ALREADY_RUNNING,
            SupervisorError::NotFound(_) => codes::NOT_FOUND,
            SupervisorError::InvalidSpec(_) => codes::INVALID_PARAMS,
            _ => codes::INTERNAL,
        }
    }

    /// True for a start that was refused because the name is alive, whether
    /// raised locally or reported by a remote supervisor.
    pub fn is_already_running(&self) -> bool {
        match self {
            SupervisorError::ProcessAlreadyRunning { .. } => true,
            SupervisorError::Ipc(e) => e.remote_code() == Some(codes::ALREADY_RUNNING),
            _ => false,
        }
    }
}

impl From<SupervisorError> for RpcError {
    fn from(err: SupervisorError) -> Self {
        RpcError::new(err.code(), err.to_string())
    }
}
