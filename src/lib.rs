// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Foreman - a single-node work queue that turns prompts into container jobs.
//!
//! # Architecture
//!
//! - [`queue`] - Durable, crash-recoverable job queue with atomic claim
//! - [`router`] - Free text to a typed [`router::Intent`]
//! - [`worker`] - Singleton background worker: claim, route, dispatch, record
//! - [`orchestrate`] - Container runtime seam, warm capacity, batch fan-out
//! - [`supervisor`] - Named background processes served over [`ipc`]
//! - [`ipc`] - NDJSON request/response over a Unix socket
//! - [`lock`] - PID lock files with OS liveness checks
//! - [`config`] - Layered configuration loading and merging
//! - [`telemetry`] - Tracing subscriber setup
//! - [`paths`], [`fsutil`], [`process`] - State layout, atomic files, child processes
//!
//! ```text
//! enqueue ──► queue.json ──► worker ──► router ──► orchestrator ──► containers
//!                              │                       ▲
//!                              └── tracker + probe ────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use foreman::config::{load_config, CliOptions};
//! use foreman::queue::QueueStore;
//!
//! let config = load_config(".".as_ref(), CliOptions::default())?;
//! let store = QueueStore::new(config.state_paths());
//! store.enqueue("work on PROJ-12")?;
//! ```

pub mod config;
pub mod error;
pub mod fsutil;
pub mod ipc;
pub mod lock;
pub mod orchestrate;
pub mod paths;
pub mod process;
pub mod queue;
pub mod router;
pub mod supervisor;
pub mod telemetry;
pub mod worker;

#[cfg(any(test, feature = "testing"))]
#[doc(hidden)]
pub mod testing;

pub use error::{ConfigError, LockError, QueueError, Result, TrackerError};
pub use paths::StatePaths;
pub use queue::{QueueItem, QueueStatus, QueueStore};
pub use router::{route, Intent, QueryKind};

/// Foreman version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_public_exports() {
        assert_eq!(route("PROJ-1").name(), "explicit_issue_keys");
        assert!(QueueStatus::Done.is_terminal());
    }
}
