// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Logging setup.
//!
//! Everything logs through `tracing` with structured fields. Hot async
//! paths carry `#[instrument]` spans behind the `telemetry` feature:
//!
//! ```rust,ignore
//! #[cfg(feature = "telemetry")]
//! use tracing::instrument;
//!
//! #[cfg_attr(feature = "telemetry", instrument(skip(self)))]
//! pub async fn run_cycle(&self) -> anyhow::Result<CycleOutcome> { ... }
//! ```
//!
//! Logs go to stderr so `--json` output on stdout stays machine-readable.
//! The worker's audit trail is separate; see [`crate::worker::AuditLog`].

mod init;

pub use init::{init_telemetry, TelemetryConfig, TelemetryGuard};
