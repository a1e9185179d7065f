// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Append-only worker audit trail, one JSON object per line.
//!
//! Appends are best-effort: a full disk or a permissions problem must never
//! stop the worker, so failures are dropped after a debug log.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{json, Value};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `{timestamp, event, itemId?, ...fields}`.
    pub fn record(&self, event: &str, item_id: Option<&str>, fields: Value) {
        let mut payload = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": event,
        });
        if let Some(id) = item_id {
            payload["itemId"] = Value::String(id.to_string());
        }
        if let (Some(target), Value::Object(extra)) = (payload.as_object_mut(), fields) {
            for (key, value) in extra {
                target.entry(key).or_insert(value);
            }
        }

        let Ok(line) = serde_json::to_string(&payload) else {
            return;
        };
        if let Err(e) = self.append(&line) {
            debug!(path = %self.path.display(), error = %e, "Audit append failed");
        }
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")
    }

    /// Parsed entries, skipping lines that are not valid JSON.
    pub fn read_all(&self) -> Vec<Value> {
        fs::read_to_string(&self.path)
            .map(|content| {
                content
                    .lines()
                    .filter_map(|line| serde_json::from_str(line).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}
