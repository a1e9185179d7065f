// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Intent routing: free-text prompt to a typed action.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Work-item key such as `PROJ-123`.
static ISSUE_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[A-Z][A-Z0-9]{1,9}-[0-9]+\b").unwrap());

/// "my open tickets without a PR", "my issues with no active merge request".
static WITHOUT_CHANGE_REQUEST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\bmy\b.*\b(items?|tickets?|issues?|tasks?|stories|story|bugs?)\b.*\b(without|with\s+no|missing|lacking)\b.*\b(change\s+requests?|pull\s+requests?|merge\s+requests?|prs?|mrs?|crs?)\b",
    )
    .unwrap()
});

/// "my open items", "assigned to me", "my tickets".
static ASSIGNED_TO_ME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(assigned\s+to\s+me|my\s+(open\s+)?(items?|tickets?|issues?|tasks?|stories|bugs?))\b",
    )
    .unwrap()
});

/// Tracker query a prompt resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    /// Open items assigned to the user that have no active change request.
    OpenWithoutChangeRequest,
    /// Open items assigned to the user.
    AssignedToMe,
}

impl QueryKind {
    /// Name substituted into the tracker command.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenWithoutChangeRequest => "open_without_change_request",
            Self::AssignedToMe => "assigned_to_me",
        }
    }
}

impl std::fmt::Display for QueryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Intent {
    ExplicitIssueKeys { keys: Vec<String> },
    ImplicitQuery { kind: QueryKind },
    Unrecognized,
}

impl Intent {
    pub fn name(&self) -> &'static str {
        match self {
            Intent::ExplicitIssueKeys { .. } => "explicit_issue_keys",
            Intent::ImplicitQuery { .. } => "implicit_query",
            Intent::Unrecognized => "unrecognized",
        }
    }
}

/// Classify `text`. Explicit keys win over implicit phrasing.
pub fn route(text: &str) -> Intent {
    let keys = extract_issue_keys(text);
    if !keys.is_empty() {
        return Intent::ExplicitIssueKeys { keys };
    }

    if WITHOUT_CHANGE_REQUEST.is_match(text) {
        return Intent::ImplicitQuery {
            kind: QueryKind::OpenWithoutChangeRequest,
        };
    }
    if ASSIGNED_TO_ME.is_match(text) {
        return Intent::ImplicitQuery {
            kind: QueryKind::AssignedToMe,
        };
    }

    Intent::Unrecognized
}

/// All distinct work-item keys in first-seen order.
pub fn extract_issue_keys(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    ISSUE_KEY
        .find_iter(text)
        .map(|m| m.as_str())
        .filter(|key| seen.insert(*key))
        .map(str::to_string)
        .collect()
}
