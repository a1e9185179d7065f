// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Liveness-checked PID locks.
//!
//! A lock file records `{pid, startedAt}` of the instance that claims to be
//! alive. The claim is never trusted on its own: acquisition asks a
//! [`LivenessProbe`] whether that pid still exists, and a lock whose holder is
//! gone is overwritten. Restart after a crash therefore needs no cleanup.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::LockError;
use crate::fsutil::atomic_write_json;
use crate::process::is_process_alive;

/// Contents of a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            started_at: Utc::now(),
        }
    }
}

/// Decides whether a pid belongs to a running process.
pub trait LivenessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probe backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsLiveness;

impl LivenessProbe for OsLiveness {
    fn is_alive(&self, pid: u32) -> bool {
        is_process_alive(pid)
    }
}

impl<F> LivenessProbe for F
where
    F: Fn(u32) -> bool + Send + Sync,
{
    fn is_alive(&self, pid: u32) -> bool {
        self(pid)
    }
}

/// What the lock file currently says.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    /// No lock file, or an unreadable one.
    Free,
    /// Holder is alive.
    Held(LockRecord),
    /// Holder is gone.
    Stale(LockRecord),
}

/// Proof of ownership returned by [`LockManager::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub record: LockRecord,
    /// Record of a dead holder that was taken over, if any.
    pub replaced: Option<LockRecord>,
}

/// Reads, acquires and releases a single PID lock file.
pub struct LockManager<P: LivenessProbe = OsLiveness> {
    path: PathBuf,
    probe: P,
}

impl LockManager<OsLiveness> {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self::with_probe(path, OsLiveness)
    }
}

impl<P: LivenessProbe> LockManager<P> {
    pub fn with_probe(path: impl AsRef<Path>, probe: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            probe,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the lock file without trusting it.
    pub fn read(&self) -> Option<LockRecord> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        let raw = raw.trim();
        if let Ok(record) = serde_json::from_str::<LockRecord>(raw) {
            return Some(record);
        }
        // Older lock files held a bare pid.
        raw.parse::<u32>().ok().map(|pid| LockRecord {
            pid,
            started_at: DateTime::<Utc>::default(),
        })
    }

    /// Classify the current lock file.
    pub fn inspect(&self) -> LockState {
        match self.read() {
            None => LockState::Free,
            Some(record) if record.pid == std::process::id() => LockState::Held(record),
            Some(record) if self.probe.is_alive(record.pid) => LockState::Held(record),
            Some(record) => LockState::Stale(record),
        }
    }

    /// Take the lock for this process unless a live holder exists.
    pub fn acquire(&self) -> Result<LockHandle, LockError> {
        let replaced = match self.inspect() {
            LockState::Held(record) if record.pid != std::process::id() => {
                return Err(LockError::Held {
                    pid: record.pid,
                    started_at: record.started_at,
                });
            }
            LockState::Held(_) | LockState::Free => None,
            LockState::Stale(record) => {
                warn!(
                    path = %self.path.display(),
                    stale_pid = record.pid,
                    "Taking over stale lock"
                );
                Some(record)
            }
        };

        self.force_acquire(replaced)
    }

    /// Write our record unconditionally. Callers must already have decided
    /// the previous holder is not a live owner.
    pub fn force_acquire(&self, replaced: Option<LockRecord>) -> Result<LockHandle, LockError> {
        let record = LockRecord::current();
        atomic_write_json(&self.path, &record).map_err(|source| LockError::Io {
            path: self.path.display().to_string(),
            source,
        })?;

        // Two instances that both saw a stale lock race on the rename; only
        // the one whose record survived owns it.
        match self.read() {
            Some(current) if current.pid == record.pid => {
                info!(path = %self.path.display(), pid = record.pid, "Lock acquired");
                Ok(LockHandle { record, replaced })
            }
            _ => Err(LockError::Contended(self.path.display().to_string())),
        }
    }

    /// Remove the lock file if this process owns it.
    pub fn release(&self) -> Result<bool, LockError> {
        match self.read() {
            Some(record) if record.pid == std::process::id() => {
                std::fs::remove_file(&self.path).map_err(|source| LockError::Io {
                    path: self.path.display().to_string(),
                    source,
                })?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Remove the lock file regardless of owner.
    pub fn clear(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_record(path: &Path, pid: u32) {
        let record = LockRecord {
            pid,
            started_at: Utc::now(),
        };
        std::fs::write(path, serde_json::to_string(&record).unwrap()).unwrap();
    }

    #[test]
    fn test_acquire_free_lock() {
        let temp = TempDir::new().unwrap();
        let manager = LockManager::with_probe(temp.path().join("w.pid"), |_pid: u32| false);

        let handle = manager.acquire().unwrap();
        assert_eq!(handle.record.pid, std::process::id());
        assert!(handle.replaced.is_none());
        assert_eq!(manager.read().unwrap().pid, std::process::id());
    }

    #[test]
    fn test_live_holder_refuses() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("w.pid");
        write_record(&path, 4242);
        let manager = LockManager::with_probe(&path, |pid: u32| pid == 4242);

        let err = manager.acquire().unwrap_err();
        assert!(matches!(err, LockError::Held { pid: 4242, .. }));
        assert_eq!(manager.read().unwrap().pid, 4242);
    }

    #[test]
    fn test_stale_lock_is_taken_over() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("w.pid");
        write_record(&path, 999_999);
        let manager = LockManager::with_probe(&path, |_pid: u32| false);

        assert!(matches!(manager.inspect(), LockState::Stale(_)));
        let handle = manager.acquire().unwrap();
        assert_eq!(handle.replaced.unwrap().pid, 999_999);
        assert_eq!(manager.read().unwrap().pid, std::process::id());
    }

    #[test]
    fn test_bare_pid_lock_is_understood() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("w.pid");
        std::fs::write(&path, "12345\n").unwrap();
        let manager = LockManager::with_probe(&path, |_pid: u32| true);

        assert!(matches!(manager.inspect(), LockState::Held(LockRecord { pid: 12345, .. })));
    }

    #[test]
    fn test_garbage_lock_is_free() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("w.pid");
        std::fs::write(&path, "not a lock").unwrap();
        let manager = LockManager::with_probe(&path, |_pid: u32| true);

        assert_eq!(manager.inspect(), LockState::Free);
        manager.acquire().unwrap();
    }

    #[test]
    fn test_release_only_removes_own_lock() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("w.pid");
        write_record(&path, 4242);
        let manager = LockManager::with_probe(&path, |_pid: u32| true);
        assert!(!manager.release().unwrap());
        assert!(path.exists());

        manager.clear();
        manager.acquire().unwrap();
        assert!(manager.release().unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_os_liveness_sees_self() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("w.pid");
        write_record(&path, std::process::id());
        let manager = LockManager::new(&path);
        assert!(matches!(manager.inspect(), LockState::Held(_)));
    }
}
