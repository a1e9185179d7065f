// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! IPC error types.

use std::io;
use thiserror::Error;

use super::protocol::RpcError;

/// Errors that can occur in the IPC subsystem.
#[derive(Debug, Error)]
pub enum IpcError {
    /// Failed to bind to the socket.
    #[error("Failed to bind IPC endpoint {path}: {source}")]
    BindFailed {
        path: String,
        #[source]
        source: io::Error,
    },

    /// No endpoint answered after every retry.
    #[error("Failed to connect to IPC endpoint: {0}")]
    ConnectFailed(String),

    /// General transport error.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Connection closed before a response arrived.
    #[error("IPC connection closed unexpectedly")]
    ConnectionClosed,

    /// No response within the request timeout.
    #[error("IPC request '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    /// The peer answered with an error object.
    #[error("{method} failed ({}): {}", .error.code, .error.message)]
    Remote { method: String, error: RpcError },
}

impl IpcError {
    /// Create an IPC error from an IO error with context.
    pub fn from_io_error(context: &str, err: io::Error) -> Self {
        IpcError::Transport(format!("{}: {}", context, err))
    }

    /// Error code returned by the peer, if this is a remote error.
    pub fn remote_code(&self) -> Option<&str> {
        match self {
            IpcError::Remote { error, .. } => Some(error.code.as_str()),
            _ => None,
        }
    }
}

/// Result type for IPC operations.
pub type IpcResult<T> = Result<T, IpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err = IpcError::from_io_error("opening socket", io_err);
        assert!(err.to_string().contains("opening socket"));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_remote_error_display() {
        let err = IpcError::Remote {
            method: "process.start".to_string(),
            error: RpcError::new("already_running", "web is already running"),
        };
        assert_eq!(err.remote_code(), Some("already_running"));
        assert_eq!(
            err.to_string(),
            "process.start failed (already_running): web is already running"
        );
    }
}
