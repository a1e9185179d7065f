// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration type definitions.
//!
//! Defines the structure of workspace and resolved configuration,
//! supporting JSON and YAML formats.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Workspace configuration for foreman.
/// Can be defined in .foreman.json or .foreman/config.json in the project root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceConfig {
    /// State directory (default: ~/.foreman)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    /// Queue polling and retention
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueConfig>,

    /// Background worker settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerConfig>,

    /// Container runtime settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub containers: Option<ContainersConfig>,

    /// Issue tracker command
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracker: Option<TrackerConfig>,

    /// Process supervisor client settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supervisor: Option<SupervisorConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
    /// Maximum retained queue entries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_timeout_ms: Option<u64>,
    /// Command run in each job environment; `{job_id}` is substituted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_command: Option<String>,
    /// Command run in the warm environment to check whether a job exists
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_command: Option<String>,
    /// Concurrent jobs per batch (0 = unbounded)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainersConfig {
    /// Runtime binary (docker, podman)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,
    /// Image definition (Dockerfile text) used to build the base image
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_image_definition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warm_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_limit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_mounts: Option<Vec<PathBuf>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_dir: Option<PathBuf>,
    /// Shell steps run before every job command
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerConfig {
    /// argv; `{query}` is replaced with the query kind
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_backoff_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_timeout_ms: Option<u64>,
}

/// Resolved configuration with all defaults applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConfig {
    pub state_dir: PathBuf,
    pub queue: ResolvedQueueConfig,
    pub worker: ResolvedWorkerConfig,
    pub containers: ResolvedContainersConfig,
    pub tracker: ResolvedTrackerConfig,
    pub supervisor: ResolvedSupervisorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedQueueConfig {
    pub poll_interval_ms: u64,
    pub history_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedWorkerConfig {
    pub dispatch_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    pub job_command: String,
    pub probe_command: String,
    pub batch_concurrency: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedContainersConfig {
    pub runtime: String,
    pub network: String,
    pub base_image: String,
    pub base_image_definition: String,
    pub warm_name: String,
    pub cpu_limit: String,
    pub mem_limit: String,
    pub cache_dir: Option<PathBuf>,
    pub credential_mounts: Vec<PathBuf>,
    pub code_dir: Option<PathBuf>,
    pub bootstrap: Vec<String>,
    pub command_timeout_ms: u64,
    pub build_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedTrackerConfig {
    pub command: Vec<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedSupervisorConfig {
    pub connect_retries: u32,
    pub connect_backoff_ms: u64,
    pub request_timeout_ms: u64,
    pub stop_timeout_ms: u64,
}

impl Default for ResolvedQueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            history_limit: 500,
        }
    }
}

impl Default for ResolvedWorkerConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout_ms: 30 * 60 * 1000,
            probe_timeout_ms: 15_000,
            job_command: "foreman-agent run {job_id}".to_string(),
            probe_command: "test -e /cache/jobs/{job_id}".to_string(),
            batch_concurrency: 4,
        }
    }
}

impl Default for ResolvedContainersConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            network: "foreman".to_string(),
            base_image: "foreman-base:latest".to_string(),
            base_image_definition: crate::orchestrate::types::DEFAULT_BASE_IMAGE_DEFINITION.to_string(),
            warm_name: "foreman-warm".to_string(),
            cpu_limit: "2".to_string(),
            mem_limit: "4g".to_string(),
            cache_dir: None,
            credential_mounts: Vec::new(),
            code_dir: None,
            bootstrap: Vec::new(),
            command_timeout_ms: 60_000,
            build_timeout_ms: 15 * 60 * 1000,
        }
    }
}

impl Default for ResolvedTrackerConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_ms: 30_000,
        }
    }
}

impl Default for ResolvedSupervisorConfig {
    fn default() -> Self {
        Self {
            connect_retries: 20,
            connect_backoff_ms: 100,
            request_timeout_ms: 10_000,
            stop_timeout_ms: 5_000,
        }
    }
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            state_dir: crate::paths::StatePaths::default_root()
                .unwrap_or_else(|| PathBuf::from(crate::paths::DEFAULT_STATE_DIR)),
            queue: ResolvedQueueConfig::default(),
            worker: ResolvedWorkerConfig::default(),
            containers: ResolvedContainersConfig::default(),
            tracker: ResolvedTrackerConfig::default(),
            supervisor: ResolvedSupervisorConfig::default(),
        }
    }
}

impl ResolvedConfig {
    pub fn state_paths(&self) -> crate::paths::StatePaths {
        crate::paths::StatePaths::new(&self.state_dir)
    }
}
