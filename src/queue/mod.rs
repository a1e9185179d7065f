// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable single-consumer job queue.
//!
//! Items move `queued -> processing -> done | failed`. At most one item is
//! processing at any time; the [`RunState`] record names it.

pub mod store;
pub mod types;

pub use store::{QueueStore, INTERRUPTED_ERROR, QUEUE_LOCK_TIMEOUT};
pub use types::{generate_item_id, QueueItem, QueueStatus, RunState};
