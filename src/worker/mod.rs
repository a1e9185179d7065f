// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Background worker: queue consumer, tracker client and audit trail.
//!
//! The worker is a singleton per state directory. Each cycle claims at most
//! one item and carries it to a terminal state; an item left `processing` by
//! a crashed or interrupted worker is failed on the next start.

pub mod audit;
pub mod daemon;
pub mod tracker;

pub use audit::AuditLog;
pub use daemon::{BackgroundWorker, CycleOutcome, ProbeVerdict, WorkerSettings, UNRECOGNIZED_ERROR};
pub use tracker::{parse_work_items, CommandTracker, IssueTracker, WorkItem};
