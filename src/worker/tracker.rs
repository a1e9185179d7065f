// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Issue tracker collaborator.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::TrackerError;
use crate::process::run_command;
use crate::router::QueryKind;

/// One row returned by a tracker query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl WorkItem {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            summary: None,
            status: None,
        }
    }
}

/// Resolves implicit queries to work items.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn query(&self, kind: QueryKind) -> Result<Vec<WorkItem>, TrackerError>;
}

/// Runs a configured command and parses its JSON stdout.
///
/// Every `{query}` in the argv is replaced with the query name. Output is a
/// JSON array of `{key, summary?, status?}` objects or of bare key strings.
#[derive(Debug, Clone)]
pub struct CommandTracker {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandTracker {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
        Self { argv, timeout }
    }

    pub fn argv_for(&self, kind: QueryKind) -> Vec<String> {
        self.argv
            .iter()
            .map(|arg| arg.replace("{query}", kind.as_str()))
            .collect()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Row {
    Key(String),
    Item(WorkItem),
}

/// Parse tracker output.
pub fn parse_work_items(stdout: &str) -> Result<Vec<WorkItem>, TrackerError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let rows: Vec<Row> = serde_json::from_str(trimmed).map_err(|e| TrackerError::Parse(e.to_string()))?;
    Ok(rows
        .into_iter()
        .map(|row| match row {
            Row::Key(key) => WorkItem::new(key),
            Row::Item(item) => item,
        })
        .filter(|item| !item.key.trim().is_empty())
        .collect())
}

#[async_trait]
impl IssueTracker for CommandTracker {
    async fn query(&self, kind: QueryKind) -> Result<Vec<WorkItem>, TrackerError> {
        let argv = self.argv_for(kind);
        let Some((program, args)) = argv.split_first() else {
            return Err(TrackerError::NotConfigured);
        };

        debug!(program = %program, query = %kind, "Querying tracker");
        let output = run_command(program, args, None, self.timeout)
            .await
            .map_err(|e| TrackerError::CommandFailed(e.to_string()))?;

        if output.timed_out {
            return Err(TrackerError::Timeout(self.timeout.as_millis() as u64));
        }
        if !output.success() {
            return Err(TrackerError::CommandFailed(output.failure_text()));
        }
        parse_work_items(&output.stdout)
    }
}
