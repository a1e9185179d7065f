// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Isolated environment orchestration.
//!
//! Work runs in containers: one long-lived "warm" environment that is reused
//! between cycles (and probed for job state), plus one auto-removed
//! environment per job.
//!
//! # Architecture
//!
//! - **ContainerRuntime**: async seam over the runtime. [`DockerCli`] shells
//!   out to `docker` (or any CLI-compatible binary); tests use
//!   [`crate::testing::FakeRuntime`].
//!
//! - **Orchestrator**: idempotent network and base-image setup, warm
//!   capacity, one-shot jobs with CPU/memory ceilings and least-privilege
//!   mounts, and bounded batch fan-out. A batch run under a deadline stops
//!   and removes whatever is still running when the deadline passes.
//!
//! ```text
//! ensure_warm_capacity()
//! ├── running  → nothing to do      (false)
//! ├── stopped  → start              (false)
//! └── absent   → network + image + create (true)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use foreman::orchestrate::{DockerCli, Orchestrator, OrchestratorSettings};
//!
//! let orchestrator = Orchestrator::new(Arc::new(DockerCli::default()), OrchestratorSettings::default());
//! orchestrator.ensure_warm_capacity().await?;
//! let report = orchestrator.run_batch(&["PROJ-1".to_string()]).await;
//! assert!(report.all_succeeded());
//! ```

pub mod docker;
pub mod orchestrator;
pub mod runtime;
pub mod types;

pub use docker::{DockerCli, RunMode};
pub use orchestrator::Orchestrator;
pub use runtime::ContainerRuntime;
pub use types::{
    job_environment_name, shell_quote, BatchOutcome, BatchReport, BatchSummary, ContainerInfo, EnvironmentDescriptor,
    EnvironmentKind, ExecOutcome, JobResult, Mount, OrchestratorError, OrchestratorSettings, ResourceLimits,
};
