// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Well-known state directory layout.
//!
//! ```text
//! ~/.foreman/
//! ├── queue/
//! │   ├── queue.json        # QueueItem[]
//! │   ├── run_state.json    # RunState
//! │   ├── queue.lock        # advisory lock around read-modify-write
//! │   ├── worker.pid        # WorkerLock
//! │   └── audit.log         # append-only worker audit trail
//! └── supervisor/
//!     ├── supervisor.lock
//!     ├── supervisor.sock
//!     ├── session.json
//!     ├── supervisor.out.log
//!     ├── supervisor.err.log
//!     └── logs/<name>.{out,err}.log
//! ```

use std::path::{Path, PathBuf};

/// Default state directory name under the home directory.
pub const DEFAULT_STATE_DIR: &str = ".foreman";

/// Resolved locations of every file foreman reads or writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `~/.foreman`, if a home directory can be found.
    pub fn default_root() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(DEFAULT_STATE_DIR))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.root.join("queue")
    }

    pub fn queue_file(&self) -> PathBuf {
        self.queue_dir().join("queue.json")
    }

    pub fn run_state_file(&self) -> PathBuf {
        self.queue_dir().join("run_state.json")
    }

    pub fn queue_lock_file(&self) -> PathBuf {
        self.queue_dir().join("queue.lock")
    }

    pub fn worker_lock_file(&self) -> PathBuf {
        self.queue_dir().join("worker.pid")
    }

    pub fn audit_log(&self) -> PathBuf {
        self.queue_dir().join("audit.log")
    }

    pub fn supervisor_dir(&self) -> PathBuf {
        self.root.join("supervisor")
    }

    pub fn supervisor_lock_file(&self) -> PathBuf {
        self.supervisor_dir().join("supervisor.lock")
    }

    /// Held while an instance decides whether to become the supervisor.
    pub fn supervisor_start_lock(&self) -> PathBuf {
        self.supervisor_dir().join("supervisor.start.lock")
    }

    pub fn supervisor_socket(&self) -> PathBuf {
        self.supervisor_dir().join("supervisor.sock")
    }

    pub fn session_file(&self) -> PathBuf {
        self.supervisor_dir().join("session.json")
    }

    pub fn supervisor_out_log(&self) -> PathBuf {
        self.supervisor_dir().join("supervisor.out.log")
    }

    pub fn supervisor_err_log(&self) -> PathBuf {
        self.supervisor_dir().join("supervisor.err.log")
    }

    pub fn process_logs_dir(&self) -> PathBuf {
        self.supervisor_dir().join("logs")
    }

    /// Stdout/stderr log pair for a supervised process.
    pub fn process_logs(&self, name: &str) -> (PathBuf, PathBuf) {
        let dir = self.process_logs_dir();
        (
            dir.join(format!("{name}.out.log")),
            dir.join(format!("{name}.err.log")),
        )
    }

    pub fn required_directories(&self) -> Vec<PathBuf> {
        vec![
            self.queue_dir(),
            self.supervisor_dir(),
            self.process_logs_dir(),
        ]
    }

    /// Create every directory foreman needs.
    pub fn bootstrap(&self) -> std::io::Result<()> {
        for dir in self.required_directories() {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}
