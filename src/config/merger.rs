// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration merging.
//!
//! Handles merging configurations from different sources with proper precedence.

use crate::error::ConfigError;

use super::types::{ResolvedConfig, WorkspaceConfig};

/// CLI options that can override configuration.
#[derive(Debug, Clone, Default)]
pub struct CliOptions {
    pub state_dir: Option<std::path::PathBuf>,
    pub runtime: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub batch_concurrency: Option<usize>,
}

/// Default configuration values.
pub fn default_config() -> ResolvedConfig {
    ResolvedConfig::default()
}

/// Merge multiple configurations with precedence.
///
/// Precedence (highest to lowest):
/// 1. CLI options
/// 2. Local config (.foreman.local.json)
/// 3. Workspace config (.foreman.json)
/// 4. Global config (~/.foreman/config.json)
/// 5. Default values
pub fn merge_config(
    global: Option<WorkspaceConfig>,
    workspace: Option<WorkspaceConfig>,
    local: Option<WorkspaceConfig>,
    cli: CliOptions,
) -> ResolvedConfig {
    let mut result = default_config();

    for config in [global, workspace, local].into_iter().flatten() {
        apply_workspace_config(&mut result, &config);
    }

    // Apply CLI options (highest precedence)
    apply_cli_options(&mut result, &cli);

    result
}

fn apply_workspace_config(result: &mut ResolvedConfig, config: &WorkspaceConfig) {
    if let Some(ref state_dir) = config.state_dir {
        result.state_dir = state_dir.clone();
    }

    if let Some(ref queue) = config.queue {
        if let Some(v) = queue.poll_interval_ms {
            result.queue.poll_interval_ms = v;
        }
        if let Some(v) = queue.history_limit {
            result.queue.history_limit = v;
        }
    }

    if let Some(ref worker) = config.worker {
        let target = &mut result.worker;
        if let Some(v) = worker.dispatch_timeout_ms {
            target.dispatch_timeout_ms = v;
        }
        if let Some(v) = worker.probe_timeout_ms {
            target.probe_timeout_ms = v;
        }
        if let Some(ref v) = worker.job_command {
            target.job_command = v.clone();
        }
        if let Some(ref v) = worker.probe_command {
            target.probe_command = v.clone();
        }
        if let Some(v) = worker.batch_concurrency {
            target.batch_concurrency = v;
        }
    }

    if let Some(ref containers) = config.containers {
        let target = &mut result.containers;
        if let Some(ref v) = containers.runtime {
            target.runtime = v.clone();
        }
        if let Some(ref v) = containers.network {
            target.network = v.clone();
        }
        if let Some(ref v) = containers.base_image {
            target.base_image = v.clone();
        }
        if let Some(ref v) = containers.base_image_definition {
            target.base_image_definition = v.clone();
        }
        if let Some(ref v) = containers.warm_name {
            target.warm_name = v.clone();
        }
        if let Some(ref v) = containers.cpu_limit {
            target.cpu_limit = v.clone();
        }
        if let Some(ref v) = containers.mem_limit {
            target.mem_limit = v.clone();
        }
        if containers.cache_dir.is_some() {
            target.cache_dir = containers.cache_dir.clone();
        }
        if let Some(ref mounts) = containers.credential_mounts {
            // Merge mount lists
            for mount in mounts {
                if !target.credential_mounts.contains(mount) {
                    target.credential_mounts.push(mount.clone());
                }
            }
        }
        if containers.code_dir.is_some() {
            target.code_dir = containers.code_dir.clone();
        }
        if let Some(ref v) = containers.bootstrap {
            target.bootstrap = v.clone();
        }
        if let Some(v) = containers.command_timeout_ms {
            target.command_timeout_ms = v;
        }
        if let Some(v) = containers.build_timeout_ms {
            target.build_timeout_ms = v;
        }
    }

    if let Some(ref tracker) = config.tracker {
        if let Some(ref v) = tracker.command {
            result.tracker.command = v.clone();
        }
        if let Some(v) = tracker.timeout_ms {
            result.tracker.timeout_ms = v;
        }
    }

    if let Some(ref supervisor) = config.supervisor {
        let target = &mut result.supervisor;
        if let Some(v) = supervisor.connect_retries {
            target.connect_retries = v;
        }
        if let Some(v) = supervisor.connect_backoff_ms {
            target.connect_backoff_ms = v;
        }
        if let Some(v) = supervisor.request_timeout_ms {
            target.request_timeout_ms = v;
        }
        if let Some(v) = supervisor.stop_timeout_ms {
            target.stop_timeout_ms = v;
        }
    }
}

fn apply_cli_options(result: &mut ResolvedConfig, cli: &CliOptions) {
    if let Some(ref state_dir) = cli.state_dir {
        result.state_dir = state_dir.clone();
    }

    if let Some(ref runtime) = cli.runtime {
        result.containers.runtime = runtime.clone();
    }

    if let Some(v) = cli.poll_interval_ms {
        result.queue.poll_interval_ms = v;
    }

    if let Some(v) = cli.batch_concurrency {
        result.worker.batch_concurrency = v;
    }
}

/// Reject values that would make the worker spin or hang.
pub fn validate_config(config: &ResolvedConfig) -> Result<(), ConfigError> {
    let invalid = |field: &str, message: &str| ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    };

    if config.queue.poll_interval_ms == 0 {
        return Err(invalid("queue.pollIntervalMs", "must be greater than 0"));
    }
    if config.queue.history_limit == 0 {
        return Err(invalid("queue.historyLimit", "must be greater than 0"));
    }
    if config.worker.dispatch_timeout_ms == 0 {
        return Err(invalid("worker.dispatchTimeoutMs", "must be greater than 0"));
    }
    if config.worker.probe_timeout_ms == 0 {
        return Err(invalid("worker.probeTimeoutMs", "must be greater than 0"));
    }
    if config.worker.job_command.trim().is_empty() {
        return Err(invalid("worker.jobCommand", "must not be empty"));
    }
    if config.containers.runtime.trim().is_empty() {
        return Err(invalid("containers.runtime", "must not be empty"));
    }
    if !config.tracker.command.is_empty()
        && !config.tracker.command.iter().any(|arg| arg.contains("{query}"))
    {
        return Err(invalid("tracker.command", "must contain a {query} placeholder"));
    }
    Ok(())
}
