// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Queue item and run-state records.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Processing,
    Done,
    Failed,
}

impl QueueStatus {
    /// Whether the item has reached a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of pending or handled work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,
    pub prompt: String,
    pub status: QueueStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueueItem {
    pub fn new(prompt: impl Into<String>) -> Self {
        let created_at = Utc::now();
        Self {
            id: generate_item_id(created_at),
            prompt: prompt.into(),
            status: QueueStatus::Queued,
            created_at,
            claimed_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }
}

static ID_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// `<epoch millis>-<sequence>-<random>`; sorts by creation time.
pub fn generate_item_id(at: DateTime<Utc>) -> String {
    let seq = ID_SEQUENCE.fetch_add(1, Ordering::Relaxed) % 10_000;
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{:013}-{:04}-{}", at.timestamp_millis().max(0), seq, &random[..8])
}

/// Pointer to the item currently being processed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub running_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

impl RunState {
    pub fn running(id: impl Into<String>) -> Self {
        Self {
            running_id: Some(id.into()),
            since: Some(Utc::now()),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.running_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_item_is_queued() {
        let item = QueueItem::new("fix TICKET-42");
        assert_eq!(item.status, QueueStatus::Queued);
        assert!(item.claimed_at.is_none());
        assert!(item.result.is_none());
    }

    #[test]
    fn test_ids_sort_by_creation() {
        let earlier = generate_item_id(DateTime::from_timestamp_millis(1_000).unwrap());
        let later = generate_item_id(DateTime::from_timestamp_millis(2_000).unwrap());
        assert!(earlier < later);
        assert_ne!(QueueItem::new("a").id, QueueItem::new("a").id);
    }

    #[test]
    fn test_item_json_shape() {
        let item = QueueItem::new("hello");
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["status"], "queued");
        assert!(json.get("createdAt").is_some());
        assert!(json.get("claimedAt").is_none());
    }

    #[test]
    fn test_run_state_default_is_idle() {
        assert!(RunState::default().is_idle());
        assert!(!RunState::running("x").is_idle());
        let json = serde_json::to_string(&RunState::default()).unwrap();
        assert_eq!(json, r#"{"runningId":null,"since":null}"#);
    }

    #[test]
    fn test_status_terminal() {
        assert!(QueueStatus::Done.is_terminal());
        assert!(QueueStatus::Failed.is_terminal());
        assert!(!QueueStatus::Queued.is_terminal());
        assert!(!QueueStatus::Processing.is_terminal());
    }
}
