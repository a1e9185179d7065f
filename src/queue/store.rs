// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! File-backed queue store.
//!
//! The queue is a single JSON array plus a separate run-state pointer. Every
//! mutation takes the queue lock, loads the whole file, mutates in memory and
//! atomically replaces both documents, so CLI writers and the worker never
//! interleave a read-modify-write.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::types::{QueueItem, QueueStatus, RunState};
use crate::error::QueueError;
use crate::fsutil::{atomic_write_json, read_json_or_default, FileLock};
use crate::paths::StatePaths;

/// How long a mutation waits for the queue lock.
pub const QUEUE_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Error text recorded on items abandoned by a crashed worker.
pub const INTERRUPTED_ERROR: &str = "interrupted: worker exited while processing";

/// Durable single-consumer queue.
#[derive(Debug, Clone)]
pub struct QueueStore {
    paths: StatePaths,
    history_limit: Option<usize>,
    lock_timeout: Duration,
}

/// In-memory view loaded under the lock.
struct Snapshot {
    items: Vec<QueueItem>,
    run_state: RunState,
}

impl QueueStore {
    pub fn new(paths: StatePaths) -> Self {
        Self {
            paths,
            history_limit: None,
            lock_timeout: QUEUE_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Cap the number of retained items; applied on every enqueue.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = Some(limit);
        self
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    /// Append a new queued item.
    pub fn enqueue(&self, prompt: &str) -> Result<QueueItem, QueueError> {
        let item = QueueItem::new(prompt);
        let limit = self.history_limit;
        let inserted = item.clone();
        self.transact(move |snap| {
            snap.items.push(item);
            if let Some(max) = limit {
                evict(&mut snap.items, max);
            }
            Ok(())
        })?;
        info!(id = %inserted.id, "Enqueued prompt");
        Ok(inserted)
    }

    /// Claim the oldest queued item, unless one is already processing.
    pub fn claim_next(&self) -> Result<Option<QueueItem>, QueueError> {
        self.transact(|snap| {
            if let Some(active) = snap
                .items
                .iter()
                .find(|item| item.status == QueueStatus::Processing)
            {
                debug!(id = %active.id, "Claim skipped, item already processing");
                return Ok(None);
            }

            let Some(item) = snap
                .items
                .iter_mut()
                .find(|item| item.status == QueueStatus::Queued)
            else {
                return Ok(None);
            };

            let now = Utc::now();
            item.status = QueueStatus::Processing;
            item.claimed_at = Some(now);
            snap.run_state = RunState {
                running_id: Some(item.id.clone()),
                since: Some(now),
            };
            Ok(Some(item.clone()))
        })
    }

    /// Mark an item done with a free-form result.
    pub fn mark_done(&self, id: &str, result: serde_json::Value) -> Result<QueueItem, QueueError> {
        let item = self.finish(id, QueueStatus::Done, Some(result), None)?;
        info!(id, "Item done");
        Ok(item)
    }

    /// Mark an item failed with an error message.
    pub fn fail_prompt(&self, id: &str, error: &str) -> Result<QueueItem, QueueError> {
        let item = self.finish(id, QueueStatus::Failed, None, Some(error.to_string()))?;
        warn!(id, error, "Item failed");
        Ok(item)
    }

    /// Evict items until at most `max_entries` remain. Returns the number
    /// removed.
    pub fn prune_history(&self, max_entries: usize) -> Result<usize, QueueError> {
        let removed = self.transact(|snap| Ok(evict(&mut snap.items, max_entries)))?;
        if removed > 0 {
            debug!(removed, max_entries, "Pruned queue history");
        }
        Ok(removed)
    }

    /// Fail any item left processing by a worker that is no longer running.
    pub fn recover_interrupted(&self) -> Result<Vec<QueueItem>, QueueError> {
        let recovered = self.transact(|snap| {
            let now = Utc::now();
            let mut recovered = Vec::new();
            for item in snap
                .items
                .iter_mut()
                .filter(|item| item.status == QueueStatus::Processing)
            {
                item.status = QueueStatus::Failed;
                item.completed_at = Some(now);
                item.error = Some(INTERRUPTED_ERROR.to_string());
                recovered.push(item.clone());
            }
            if !snap.run_state.is_idle() {
                snap.run_state = RunState::default();
            }
            Ok(recovered)
        })?;

        for item in &recovered {
            warn!(id = %item.id, "Recovered interrupted item as failed");
        }
        Ok(recovered)
    }

    /// All items in insertion order.
    pub fn list(&self) -> Vec<QueueItem> {
        read_json_or_default(&self.paths.queue_file())
    }

    pub fn get(&self, id: &str) -> Option<QueueItem> {
        self.list().into_iter().find(|item| item.id == id)
    }

    pub fn run_state(&self) -> RunState {
        read_json_or_default(&self.paths.run_state_file())
    }

    fn finish(
        &self,
        id: &str,
        status: QueueStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<QueueItem, QueueError> {
        self.transact(|snap| {
            let item = snap
                .items
                .iter_mut()
                .find(|item| item.id == id)
                .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

            item.status = status;
            item.completed_at = Some(Utc::now());
            item.result = result;
            item.error = error;
            let finished = item.clone();

            if snap.run_state.running_id.as_deref() == Some(id) {
                snap.run_state = RunState::default();
            }
            Ok(finished)
        })
    }

    /// Run `mutate` under the queue lock and persist the result.
    fn transact<T>(
        &self,
        mutate: impl FnOnce(&mut Snapshot) -> Result<T, QueueError>,
    ) -> Result<T, QueueError> {
        let lock_path = self.paths.queue_lock_file();
        let _guard = FileLock::acquire(&lock_path, self.lock_timeout).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                QueueError::Busy(lock_path.display().to_string())
            } else {
                QueueError::io(&lock_path, e)
            }
        })?;

        let queue_file = self.paths.queue_file();
        let run_state_file = self.paths.run_state_file();
        let mut snap = Snapshot {
            items: read_json_or_default(&queue_file),
            run_state: read_json_or_default(&run_state_file),
        };
        let before_state = snap.run_state.clone();

        let out = mutate(&mut snap)?;

        atomic_write_json(&queue_file, &snap.items).map_err(|e| QueueError::io(&queue_file, e))?;
        if snap.run_state != before_state || !run_state_file.exists() {
            atomic_write_json(&run_state_file, &snap.run_state)
                .map_err(|e| QueueError::io(&run_state_file, e))?;
        }
        Ok(out)
    }
}

/// Drop oldest finished items, then oldest queued ones, never the processing
/// item, until `items.len() <= max`.
fn evict(items: &mut Vec<QueueItem>, max: usize) -> usize {
    let mut removed = 0;
    while items.len() > max {
        let victim = items
            .iter()
            .position(|item| item.status.is_terminal())
            .or_else(|| {
                items
                    .iter()
                    .position(|item| item.status == QueueStatus::Queued)
            });
        match victim {
            Some(index) => {
                items.remove(index);
                removed += 1;
            }
            None => break,
        }
    }
    removed
}
