// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory collaborators for tests: a container runtime and an issue
//! tracker.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TrackerError;
use crate::orchestrate::{ContainerInfo, ContainerRuntime, EnvironmentDescriptor, OrchestratorError};
use crate::process::CommandOutput;
use crate::router::QueryKind;
use crate::worker::{IssueTracker, WorkItem};

/// How a fake `exec` answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecBehavior {
    Exit(i32),
    Timeout,
    Error,
}

/// Records every call and simulates container state in memory.
#[derive(Debug)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, String>>,
    networks: Mutex<HashSet<String>>,
    images: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
    scripts: Mutex<Vec<String>>,
    failing_jobs: Mutex<HashSet<String>>,
    timed_out_jobs: Mutex<HashSet<String>>,
    exec_default: Mutex<ExecBehavior>,
    exec_rules: Mutex<Vec<(String, ExecBehavior)>>,
    job_delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            networks: Mutex::new(HashSet::new()),
            images: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            scripts: Mutex::new(Vec::new()),
            failing_jobs: Mutex::new(HashSet::new()),
            timed_out_jobs: Mutex::new(HashSet::new()),
            exec_default: Mutex::new(ExecBehavior::Exit(1)),
            exec_rules: Mutex::new(Vec::new()),
            job_delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl FakeRuntime {
    pub fn with_job_delay(mut self, delay: Duration) -> Self {
        self.job_delay = delay;
        self
    }

    pub fn add_container(&self, name: &str, state: &str) {
        lock(&self.containers).insert(name.to_string(), state.to_string());
    }

    pub fn container_state(&self, name: &str) -> Option<String> {
        lock(&self.containers).get(name).cloned()
    }

    /// Make the job with this id exit non-zero.
    pub fn fail_job(&self, job_id: &str) {
        lock(&self.failing_jobs).insert(job_id.to_string());
    }

    /// Make the job with this id time out.
    pub fn time_out_job(&self, job_id: &str) {
        lock(&self.timed_out_jobs).insert(job_id.to_string());
    }

    /// Answer every `exec` not matched by a rule with `behavior`.
    pub fn set_exec_behavior(&self, behavior: ExecBehavior) {
        *lock(&self.exec_default) = behavior;
    }

    /// Answer an `exec` whose command line contains `needle` with `behavior`.
    pub fn on_exec_containing(&self, needle: &str, behavior: ExecBehavior) {
        lock(&self.exec_rules).push((needle.to_string(), behavior));
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// `sh -c` scripts passed to one-shot runs, in call order.
    pub fn scripts(&self) -> Vec<String> {
        lock(&self.scripts).clone()
    }

    /// Job ids dispatched through one-shot runs, in call order.
    pub fn dispatched_jobs(&self) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter_map(|call| call.strip_prefix("run_once "))
            .map(str::to_string)
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, call: String) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn network_exists(&self, name: &str) -> Result<bool, OrchestratorError> {
        Ok(lock(&self.networks).contains(name))
    }

    async fn create_network(&self, name: &str) -> Result<(), OrchestratorError> {
        self.record(format!("create_network {name}"));
        lock(&self.networks).insert(name.to_string());
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, OrchestratorError> {
        Ok(lock(&self.images).contains(image))
    }

    async fn build_image(&self, image: &str, _definition: &str) -> Result<(), OrchestratorError> {
        self.record(format!("build_image {image}"));
        lock(&self.images).insert(image.to_string());
        Ok(())
    }

    async fn find_container(&self, name: &str) -> Result<Option<ContainerInfo>, OrchestratorError> {
        Ok(lock(&self.containers).get(name).map(|state| ContainerInfo {
            name: name.to_string(),
            state: state.clone(),
            status: String::new(),
        }))
    }

    async fn run_detached(
        &self,
        env: &EnvironmentDescriptor,
        _command: &[String],
    ) -> Result<(), OrchestratorError> {
        self.record(format!("run_detached {}", env.name));
        lock(&self.containers).insert(env.name.clone(), "running".to_string());
        Ok(())
    }

    async fn run_once(
        &self,
        env: &EnvironmentDescriptor,
        command: &[String],
        _timeout: Duration,
    ) -> Result<CommandOutput, OrchestratorError> {
        let job_id = env.labels.get("foreman.job").cloned().unwrap_or_default();
        self.record(format!("run_once {job_id}"));
        if let Some(script) = command.last() {
            lock(&self.scripts).push(script.clone());
        }

        // Auto-removed once the run returns; a cancelled run leaves it behind.
        lock(&self.containers).insert(env.name.clone(), "running".to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.job_delay.is_zero() {
            tokio::time::sleep(self.job_delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        lock(&self.containers).remove(&env.name);

        if lock(&self.timed_out_jobs).contains(&job_id) {
            return Ok(CommandOutput {
                timed_out: true,
                ..Default::default()
            });
        }
        let failed = lock(&self.failing_jobs).contains(&job_id);
        Ok(CommandOutput {
            exit_code: Some(if failed { 1 } else { 0 }),
            stdout: format!("ran {job_id}\n"),
            stderr: if failed { "job failed\n".to_string() } else { String::new() },
            ..Default::default()
        })
    }

    async fn exec(
        &self,
        name: &str,
        command: &[String],
        _timeout: Duration,
    ) -> Result<CommandOutput, OrchestratorError> {
        let line = command.join(" ");
        self.record(format!("exec {name} {line}"));

        let behavior = lock(&self.exec_rules)
            .iter()
            .find(|(needle, _)| line.contains(needle.as_str()))
            .map(|(_, behavior)| *behavior)
            .unwrap_or(*lock(&self.exec_default));

        match behavior {
            ExecBehavior::Exit(code) => Ok(CommandOutput {
                exit_code: Some(code),
                ..Default::default()
            }),
            ExecBehavior::Timeout => Ok(CommandOutput {
                timed_out: true,
                ..Default::default()
            }),
            ExecBehavior::Error => Err(OrchestratorError::runtime("exec", "daemon unavailable")),
        }
    }

    async fn start(&self, name: &str) -> Result<(), OrchestratorError> {
        self.record(format!("start {name}"));
        lock(&self.containers).insert(name.to_string(), "running".to_string());
        Ok(())
    }

    async fn stop(&self, name: &str, _grace: Duration) -> Result<(), OrchestratorError> {
        self.record(format!("stop {name}"));
        if let Some(state) = lock(&self.containers).get_mut(name) {
            *state = "exited".to_string();
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), OrchestratorError> {
        self.record(format!("remove {name}"));
        lock(&self.containers).remove(name);
        Ok(())
    }
}

/// Tracker that answers every query with a fixed list, or fails.
#[derive(Debug, Default)]
pub struct StaticTracker {
    items: Vec<WorkItem>,
    fail: bool,
    queries: Mutex<Vec<QueryKind>>,
}

impl StaticTracker {
    pub fn with_keys(keys: &[&str]) -> Self {
        Self {
            items: keys.iter().map(|key| WorkItem::new(*key)).collect(),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn queries(&self) -> Vec<QueryKind> {
        lock(&self.queries).clone()
    }
}

#[async_trait]
impl IssueTracker for StaticTracker {
    async fn query(&self, kind: QueryKind) -> Result<Vec<WorkItem>, TrackerError> {
        lock(&self.queries).push(kind);
        if self.fail {
            return Err(TrackerError::CommandFailed("tracker unavailable".to_string()));
        }
        Ok(self.items.clone())
    }
}
