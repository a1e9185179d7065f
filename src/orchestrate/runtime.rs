// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Container runtime abstraction.

use std::time::Duration;

use async_trait::async_trait;

use super::types::{ContainerInfo, EnvironmentDescriptor, OrchestratorError};
use crate::process::CommandOutput;

/// Operations the orchestrator needs from a container runtime.
///
/// Implementations must bound every call with a timeout. A command that ran
/// to completion returns `Ok` with its exit status, even when non-zero; `Err`
/// means the runtime itself could not answer.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn network_exists(&self, name: &str) -> Result<bool, OrchestratorError>;

    async fn create_network(&self, name: &str) -> Result<(), OrchestratorError>;

    async fn image_exists(&self, image: &str) -> Result<bool, OrchestratorError>;

    /// Build `image` from `definition`.
    async fn build_image(&self, image: &str, definition: &str) -> Result<(), OrchestratorError>;

    /// Containers whose name matches `name` exactly, in any state.
    async fn find_container(&self, name: &str) -> Result<Option<ContainerInfo>, OrchestratorError>;

    /// Create and start a long-lived container.
    async fn run_detached(
        &self,
        env: &EnvironmentDescriptor,
        command: &[String],
    ) -> Result<(), OrchestratorError>;

    /// Run a one-shot, auto-removed container to completion.
    async fn run_once(
        &self,
        env: &EnvironmentDescriptor,
        command: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, OrchestratorError>;

    /// Run `command` inside an existing container.
    async fn exec(
        &self,
        name: &str,
        command: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, OrchestratorError>;

    async fn start(&self, name: &str) -> Result<(), OrchestratorError>;

    /// Stop a container, killing it if it is still up after `grace`. A
    /// missing container is not an error.
    async fn stop(&self, name: &str, grace: Duration) -> Result<(), OrchestratorError>;

    async fn remove(&self, name: &str) -> Result<(), OrchestratorError>;
}
