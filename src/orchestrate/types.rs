// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Types shared by the container runtime and the orchestrator.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::ResolvedConfig;

/// Error type for environment orchestration.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("failed to invoke container runtime: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("container runtime {op} failed: {message}")]
    Runtime { op: String, message: String },

    #[error("container runtime {op} timed out after {timeout_ms}ms")]
    Timeout { op: String, timeout_ms: u64 },

    #[error("unexpected runtime output from {op}: {line}")]
    Malformed { op: String, line: String },

    #[error("environment {0} already exists")]
    NameCollision(String),
}

impl OrchestratorError {
    pub(crate) fn runtime(op: &str, message: impl Into<String>) -> Self {
        Self::Runtime {
            op: op.to_string(),
            message: message.into(),
        }
    }

    /// Transient errors are retried on a later cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Spawn(_) | Self::Runtime { .. } | Self::Timeout { .. } | Self::Malformed { .. }
        )
    }
}

/// Role of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvironmentKind {
    /// Long-lived, reused between cycles.
    WarmWorker,
    /// One-shot, removed on exit.
    Job,
    Service,
}

impl EnvironmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WarmWorker => "warm-worker",
            Self::Job => "job",
            Self::Service => "service",
        }
    }
}

/// CPU and memory ceilings in runtime notation (`"2"`, `"4g"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub cpus: String,
    pub memory: String,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpus: "2".to_string(),
            memory: "4g".to_string(),
        }
    }
}

/// Bind mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub host: PathBuf,
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    pub fn read_only(host: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            target: target.into(),
            read_only: true,
        }
    }

    pub fn read_write(host: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            target: target.into(),
            read_only: false,
        }
    }

    /// `host:target[:ro]` volume argument.
    pub fn to_volume_arg(&self) -> String {
        let mut arg = format!("{}:{}", self.host.display(), self.target);
        if self.read_only {
            arg.push_str(":ro");
        }
        arg
    }
}

/// Everything needed to create one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentDescriptor {
    pub name: String,
    pub kind: EnvironmentKind,
    pub image: String,
    pub network: String,
    pub limits: ResourceLimits,
    pub mounts: Vec<Mount>,
    pub labels: BTreeMap<String, String>,
    pub workdir: Option<String>,
}

/// State reported by the runtime for one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub name: String,
    pub state: String,
    pub status: String,
}

impl ContainerInfo {
    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("running")
    }
}

/// Outcome of one job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub job_id: String,
    pub environment: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// Set when the job could not be run at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobResult {
    pub(crate) fn errored(job_id: &str, environment: &str, error: impl ToString) -> Self {
        Self {
            job_id: job_id.to_string(),
            environment: environment.to_string(),
            error: Some(error.to_string()),
            ..Default::default()
        }
    }

    /// Failed for a reason other than a timeout.
    pub fn is_hard_failure(&self) -> bool {
        !self.success && !self.timed_out
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// How a deadline-bounded batch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Finished(BatchReport),
    /// The deadline passed. Running jobs were stopped and their environments
    /// removed; queued jobs never started.
    TimedOut {
        timeout_ms: u64,
        finished: Vec<JobResult>,
        cancelled: Vec<String>,
        not_started: Vec<String>,
    },
}

/// Results of a batch, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub results: Vec<JobResult>,
    pub summary: BatchSummary,
}

impl BatchReport {
    pub fn from_results(results: Vec<JobResult>) -> Self {
        let succeeded = results.iter().filter(|r| r.success).count();
        let summary = BatchSummary {
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
        };
        Self { results, summary }
    }

    pub fn all_succeeded(&self) -> bool {
        self.summary.failed == 0
    }

    /// One line per failed job, for error messages.
    pub fn failure_text(&self) -> String {
        self.results
            .iter()
            .filter(|r| !r.success)
            .map(|r| {
                let reason = match (&r.error, r.timed_out, r.exit_code) {
                    (Some(error), _, _) => error.clone(),
                    (None, true, _) => "timed out".to_string(),
                    (None, false, Some(code)) => format!("exit {code}: {}", r.stderr.trim()),
                    (None, false, None) => "terminated".to_string(),
                };
                format!("{}: {}", r.job_id, reason)
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Result of running a command inside the warm environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutcome {
    /// Exit status 0 within the timeout.
    pub ok: bool,
    /// No answer within the timeout; neither success nor failure.
    pub timed_out: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Orchestrator configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub network: String,
    pub base_image: String,
    /// Image definition piped to the runtime's build on stdin.
    pub base_image_definition: String,
    pub warm_name: String,
    pub limits: ResourceLimits,
    /// Shared cache, mounted read-write.
    pub cache_dir: Option<PathBuf>,
    /// Credential and config files, mounted read-only.
    pub credential_mounts: Vec<PathBuf>,
    /// Source tree, mounted read-only.
    pub code_dir: Option<PathBuf>,
    /// Shell steps run before every job command.
    pub bootstrap: Vec<String>,
    /// Job command template; `{job_id}` is replaced with the quoted id.
    pub job_command: String,
    pub job_timeout: Duration,
    /// Concurrent jobs per batch; 0 means unbounded.
    pub batch_concurrency: usize,
}

pub const DEFAULT_BASE_IMAGE_DEFINITION: &str = "\
FROM debian:bookworm-slim
RUN apt-get update \\
 && apt-get install -y --no-install-recommends ca-certificates git curl \\
 && rm -rf /var/lib/apt/lists/*
WORKDIR /workspace
";

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            network: "foreman".to_string(),
            base_image: "foreman-base:latest".to_string(),
            base_image_definition: DEFAULT_BASE_IMAGE_DEFINITION.to_string(),
            warm_name: "foreman-warm".to_string(),
            limits: ResourceLimits::default(),
            cache_dir: None,
            credential_mounts: Vec::new(),
            code_dir: None,
            bootstrap: Vec::new(),
            job_command: "foreman-agent run {job_id}".to_string(),
            job_timeout: Duration::from_secs(30 * 60),
            batch_concurrency: 4,
        }
    }
}

impl From<&ResolvedConfig> for OrchestratorSettings {
    fn from(config: &ResolvedConfig) -> Self {
        let containers = &config.containers;
        Self {
            network: containers.network.clone(),
            base_image: containers.base_image.clone(),
            base_image_definition: containers.base_image_definition.clone(),
            warm_name: containers.warm_name.clone(),
            limits: ResourceLimits {
                cpus: containers.cpu_limit.clone(),
                memory: containers.mem_limit.clone(),
            },
            cache_dir: containers.cache_dir.clone(),
            credential_mounts: containers.credential_mounts.clone(),
            code_dir: containers.code_dir.clone(),
            bootstrap: containers.bootstrap.clone(),
            job_command: config.worker.job_command.clone(),
            job_timeout: Duration::from_millis(config.worker.dispatch_timeout_ms),
            batch_concurrency: config.worker.batch_concurrency,
        }
    }
}

/// Deterministic environment name for a job id: sanitized id plus a short
/// digest, so distinct ids never collide after sanitizing.
pub fn job_environment_name(job_id: &str) -> String {
    let mut sanitized: String = job_id
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' | '.' | '-' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '-',
        })
        .take(40)
        .collect();
    sanitized = sanitized.trim_matches(|c| c == '-' || c == '.').to_string();
    if sanitized.is_empty() {
        sanitized.push_str("job");
    }

    let digest = Sha256::digest(job_id.as_bytes());
    let short: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
    format!("foreman-job-{sanitized}-{short}")
}

/// Quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':'))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}
