// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Process supervisor.
//!
//! A singleton daemon per state directory owns a table of named background
//! processes and serves it over [`crate::ipc`]:
//!
//! | method                | params                      | result            |
//! |-----------------------|-----------------------------|-------------------|
//! | `ping`                |                             | `{pid}`           |
//! | `process.start`       | `ProcessSpec`               | `ProcessRecord`   |
//! | `process.stop`        | `{name, timeoutMs?}`        | `{stopped}`       |
//! | `process.status`      |                             | `[{name, pid, running}]` |
//! | `process.readSession` |                             | `ServiceSession`  |
//!
//! Every table change rewrites the session file, so a restarted supervisor
//! picks up the processes its predecessor left running.

pub mod client;
pub mod server;
pub mod session;
pub mod table;
pub mod types;

pub use client::{ExecutableLauncher, SupervisorClient, SupervisorLauncher};
pub use server::{ping_socket, run_supervisor, SupervisorRun, SupervisorService};
pub use session::SessionStore;
pub use table::ProcessTable;
pub use types::{
    PingReply, ProcessRecord, ProcessSpec, ProcessStatus, ServiceSession, StopParams, StopReply,
    SupervisorError, SupervisorSettings, SESSION_VERSION,
};
