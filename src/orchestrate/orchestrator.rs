// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Environment orchestrator: warm capacity, one-shot jobs and batch fan-out.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[cfg(feature = "telemetry")]
use tracing::instrument;

use super::runtime::ContainerRuntime;
use super::types::{
    job_environment_name, shell_quote, BatchOutcome, BatchReport, EnvironmentDescriptor, EnvironmentKind, ExecOutcome,
    JobResult, Mount, OrchestratorError, OrchestratorSettings,
};
use crate::process::DEFAULT_KILL_GRACE;

/// Where the shared cache is mounted inside environments.
pub const CACHE_TARGET: &str = "/cache";
/// Where the source tree is mounted inside environments.
pub const CODE_TARGET: &str = "/workspace";
/// Where credential files are mounted inside environments.
pub const CREDENTIALS_TARGET: &str = "/credentials";

/// Job tasks of one batch. Dropping it aborts whatever has not finished.
struct BatchRun {
    tasks: JoinSet<()>,
    results: Arc<StdMutex<Vec<Option<JobResult>>>>,
    /// Indexes holding a slot and not yet finished.
    running: Arc<StdMutex<BTreeSet<usize>>>,
}

impl BatchRun {
    /// Cancel-safe: results land in `results` as each task completes.
    async fn join_all(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Job task did not complete");
            }
        }
    }

    fn take_results(&self) -> Vec<Option<JobResult>> {
        std::mem::take(&mut *lock(&self.results))
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drives a [`ContainerRuntime`]. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    settings: Arc<OrchestratorSettings>,
}

impl Orchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: OrchestratorSettings) -> Self {
        Self {
            runtime,
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Create the shared network if missing.
    pub async fn ensure_network(&self) -> Result<(), OrchestratorError> {
        let network = &self.settings.network;
        if self.runtime.network_exists(network).await? {
            return Ok(());
        }
        info!(network = %network, "Creating network");
        self.runtime.create_network(network).await
    }

    /// Build the base image if missing.
    pub async fn ensure_base_image(&self) -> Result<(), OrchestratorError> {
        let image = &self.settings.base_image;
        if self.runtime.image_exists(image).await? {
            return Ok(());
        }
        info!(image = %image, "Building base image");
        self.runtime
            .build_image(image, &self.settings.base_image_definition)
            .await
    }

    /// Make sure the warm environment is running. Returns `true` only when it
    /// had to be created.
    #[cfg_attr(feature = "telemetry", instrument(skip(self)))]
    pub async fn ensure_warm_capacity(&self) -> Result<bool, OrchestratorError> {
        let warm = self.warm_descriptor();
        match self.runtime.find_container(&warm.name).await? {
            Some(info) if info.is_running() => {
                debug!(env = %warm.name, "Warm environment running");
                Ok(false)
            }
            Some(info) => {
                info!(env = %warm.name, state = %info.state, "Starting stopped warm environment");
                self.runtime.start(&warm.name).await?;
                Ok(false)
            }
            None => {
                self.ensure_network().await?;
                self.ensure_base_image().await?;
                info!(env = %warm.name, "Creating warm environment");
                let keep_alive = vec!["sleep".to_string(), "infinity".to_string()];
                self.runtime.run_detached(&warm, &keep_alive).await?;
                Ok(true)
            }
        }
    }

    /// Run one job in a fresh auto-removed environment.
    ///
    /// Fails fast if an environment with the job's name already exists, so a
    /// job still running from an earlier dispatch is never started twice.
    #[cfg_attr(feature = "telemetry", instrument(skip(self, command)))]
    pub async fn run_job(&self, job_id: &str, command: &str) -> Result<JobResult, OrchestratorError> {
        let env = self.descriptor_for_job(job_id);
        if self.runtime.find_container(&env.name).await?.is_some() {
            return Err(OrchestratorError::NameCollision(env.name));
        }

        let script = self.job_script(command);
        let argv = vec!["sh".to_string(), "-c".to_string(), script];
        info!(job_id, env = %env.name, "Running job");
        let output = self
            .runtime
            .run_once(&env, &argv, self.settings.job_timeout)
            .await?;

        if output.timed_out {
            warn!(job_id, "Job timed out");
        }
        Ok(JobResult {
            job_id: job_id.to_string(),
            environment: env.name,
            success: output.success(),
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            timed_out: output.timed_out,
            error: None,
        })
    }

    /// Run the configured job command for each id, at most
    /// `batch_concurrency` at a time. A failing job never aborts its
    /// siblings; results come back in input order.
    pub async fn run_batch(&self, job_ids: &[String]) -> BatchReport {
        if job_ids.is_empty() {
            return BatchReport::default();
        }
        let mut run = self.spawn_batch(job_ids);
        run.join_all().await;
        self.report(job_ids, run.take_results())
    }

    /// [`run_batch`](Self::run_batch) with a deadline. When it passes, jobs
    /// waiting for a slot are abandoned and running ones are stopped (SIGTERM
    /// to the runtime client's group, then a graceful container stop) and
    /// their environments removed.
    #[cfg_attr(feature = "telemetry", instrument(skip(self, job_ids), fields(jobs = job_ids.len())))]
    pub async fn run_batch_within(&self, job_ids: &[String], limit: Duration) -> BatchOutcome {
        if job_ids.is_empty() {
            return BatchOutcome::Finished(BatchReport::default());
        }

        let mut run = self.spawn_batch(job_ids);
        if tokio::time::timeout(limit, run.join_all()).await.is_ok() {
            return BatchOutcome::Finished(self.report(job_ids, run.take_results()));
        }

        run.tasks.shutdown().await;
        let running = lock(&run.running).clone();
        let mut finished = Vec::new();
        let mut cancelled = Vec::new();
        let mut not_started = Vec::new();
        for (index, (slot, job_id)) in run.take_results().into_iter().zip(job_ids).enumerate() {
            match slot {
                Some(result) => finished.push(result),
                None if running.contains(&index) => {
                    self.cancel_job(job_id).await;
                    cancelled.push(job_id.clone());
                }
                None => not_started.push(job_id.clone()),
            }
        }

        warn!(
            timeout_ms = limit.as_millis() as u64,
            finished = finished.len(),
            cancelled = cancelled.len(),
            not_started = not_started.len(),
            "Batch deadline passed"
        );
        BatchOutcome::TimedOut {
            timeout_ms: limit.as_millis() as u64,
            finished,
            cancelled,
            not_started,
        }
    }

    fn spawn_batch(&self, job_ids: &[String]) -> BatchRun {
        let permits = match self.settings.batch_concurrency {
            0 => job_ids.len(),
            n => n,
        };
        let semaphore = Arc::new(Semaphore::new(permits));
        let results = Arc::new(StdMutex::new(vec![None; job_ids.len()]));
        let running = Arc::new(StdMutex::new(BTreeSet::new()));

        let mut tasks = JoinSet::new();
        for (index, job_id) in job_ids.iter().enumerate() {
            let orchestrator = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let results = Arc::clone(&results);
            let running = Arc::clone(&running);
            let job_id = job_id.clone();
            tasks.spawn(async move {
                let result = match semaphore.acquire().await {
                    Ok(_permit) => {
                        lock(&running).insert(index);
                        let command = orchestrator.job_command(&job_id);
                        let result = match orchestrator.run_job(&job_id, &command).await {
                            Ok(result) => result,
                            Err(e) => {
                                warn!(job_id = %job_id, error = %e, "Job could not run");
                                JobResult::errored(&job_id, &job_environment_name(&job_id), e)
                            }
                        };
                        lock(&running).remove(&index);
                        result
                    }
                    Err(e) => JobResult::errored(&job_id, "", e),
                };
                lock(&results)[index] = Some(result);
            });
        }

        BatchRun {
            tasks,
            results,
            running,
        }
    }

    fn report(&self, job_ids: &[String], slots: Vec<Option<JobResult>>) -> BatchReport {
        let results = slots
            .into_iter()
            .zip(job_ids)
            .map(|(slot, job_id)| {
                slot.unwrap_or_else(|| JobResult::errored(job_id, &job_environment_name(job_id), "job task panicked"))
            })
            .collect();
        let report = BatchReport::from_results(results);
        info!(
            total = report.summary.total,
            succeeded = report.summary.succeeded,
            failed = report.summary.failed,
            "Batch finished"
        );
        report
    }

    /// Stop and remove a job environment left behind by a cancelled run.
    async fn cancel_job(&self, job_id: &str) {
        let name = job_environment_name(job_id);
        if let Err(e) = self.runtime.stop(&name, DEFAULT_KILL_GRACE).await {
            warn!(env = %name, error = %e, "Failed to stop cancelled job");
        }
        if let Err(e) = self.runtime.remove(&name).await {
            warn!(env = %name, error = %e, "Failed to remove cancelled job");
        }
    }

    /// Run `command` inside the named warm environment. A timeout is reported
    /// as `timed_out`, not as failure.
    pub async fn exec_in_warm(
        &self,
        name: &str,
        command: &[String],
        timeout: Duration,
    ) -> Result<ExecOutcome, OrchestratorError> {
        let output = self.runtime.exec(name, command, timeout).await?;
        Ok(ExecOutcome {
            ok: output.success(),
            timed_out: output.timed_out,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// Configured job command with `{job_id}` substituted.
    pub fn job_command(&self, job_id: &str) -> String {
        self.settings
            .job_command
            .replace("{job_id}", &shell_quote(job_id))
    }

    fn job_script(&self, command: &str) -> String {
        let mut steps: Vec<&str> = self
            .settings
            .bootstrap
            .iter()
            .map(String::as_str)
            .filter(|step| !step.trim().is_empty())
            .collect();
        steps.push(command);
        steps.join(" && ")
    }

    pub fn warm_descriptor(&self) -> EnvironmentDescriptor {
        self.descriptor(self.settings.warm_name.clone(), EnvironmentKind::WarmWorker, BTreeMap::new())
    }

    pub fn descriptor_for_job(&self, job_id: &str) -> EnvironmentDescriptor {
        let mut labels = BTreeMap::new();
        labels.insert("foreman.job".to_string(), job_id.to_string());
        self.descriptor(job_environment_name(job_id), EnvironmentKind::Job, labels)
    }

    fn descriptor(
        &self,
        name: String,
        kind: EnvironmentKind,
        labels: BTreeMap<String, String>,
    ) -> EnvironmentDescriptor {
        let settings = &self.settings;
        let mut mounts = Vec::new();
        if let Some(cache) = &settings.cache_dir {
            mounts.push(Mount::read_write(cache, CACHE_TARGET));
        }
        for credential in &settings.credential_mounts {
            let file_name = credential
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "credential".to_string());
            mounts.push(Mount::read_only(credential, format!("{CREDENTIALS_TARGET}/{file_name}")));
        }
        if let Some(code) = &settings.code_dir {
            mounts.push(Mount::read_only(code, CODE_TARGET));
        }

        EnvironmentDescriptor {
            name,
            kind,
            image: settings.base_image.clone(),
            network: settings.network.clone(),
            limits: settings.limits.clone(),
            mounts,
            labels,
            workdir: Some(CODE_TARGET.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ExecBehavior, FakeRuntime};

    fn orchestrator(runtime: Arc<FakeRuntime>) -> Orchestrator {
        let settings = OrchestratorSettings {
            bootstrap: vec!["git fetch".to_string(), " ".to_string()],
            job_command: "agent {job_id}".to_string(),
            cache_dir: Some("/var/cache/foreman".into()),
            credential_mounts: vec!["/home/me/.netrc".into()],
            code_dir: Some("/src/app".into()),
            ..Default::default()
        };
        Orchestrator::new(runtime, settings)
    }

    #[tokio::test]
    async fn test_warm_capacity_creates_when_absent() {
        let runtime = Arc::new(FakeRuntime::default());
        let orch = orchestrator(runtime.clone());

        assert!(orch.ensure_warm_capacity().await.unwrap());
        let calls = runtime.calls();
        assert!(calls.contains(&"create_network foreman".to_string()));
        assert!(calls.contains(&"build_image foreman-base:latest".to_string()));
        assert!(calls.contains(&"run_detached foreman-warm".to_string()));

        // Second call finds it running.
        assert!(!orch.ensure_warm_capacity().await.unwrap());
        assert_eq!(
            runtime.calls().iter().filter(|c| c.starts_with("run_detached")).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_warm_capacity_starts_stopped() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.add_container("foreman-warm", "exited");
        let orch = orchestrator(runtime.clone());

        assert!(!orch.ensure_warm_capacity().await.unwrap());
        assert!(runtime.calls().contains(&"start foreman-warm".to_string()));
        assert!(!runtime.calls().iter().any(|c| c.starts_with("run_detached")));
    }

    #[tokio::test]
    async fn test_ensure_network_and_image_idempotent() {
        let runtime = Arc::new(FakeRuntime::default());
        let orch = orchestrator(runtime.clone());
        orch.ensure_network().await.unwrap();
        orch.ensure_network().await.unwrap();
        orch.ensure_base_image().await.unwrap();
        orch.ensure_base_image().await.unwrap();

        let calls = runtime.calls();
        assert_eq!(calls.iter().filter(|c| c.starts_with("create_network")).count(), 1);
        assert_eq!(calls.iter().filter(|c| c.starts_with("build_image")).count(), 1);
    }

    #[tokio::test]
    async fn test_run_job_fails_fast_on_collision() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.add_container(&job_environment_name("PROJ-1"), "running");
        let orch = orchestrator(runtime.clone());

        let err = orch.run_job("PROJ-1", "true").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NameCollision(_)));
        assert!(!runtime.calls().iter().any(|c| c.starts_with("run_once")));
    }

    #[tokio::test]
    async fn test_run_job_wraps_bootstrap() {
        let runtime = Arc::new(FakeRuntime::default());
        let orch = orchestrator(runtime.clone());

        let result = orch.run_job("PROJ-1", "agent PROJ-1").await.unwrap();
        assert!(result.success);
        let scripts = runtime.scripts();
        assert_eq!(scripts, vec!["git fetch && agent PROJ-1".to_string()]);
    }

    #[tokio::test]
    async fn test_run_batch_isolates_failures_and_keeps_order() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.fail_job("B-2");
        let orch = orchestrator(runtime.clone());

        let ids = vec!["A-1".to_string(), "B-2".to_string(), "C-3".to_string()];
        let report = orch.run_batch(&ids).await;

        let order: Vec<_> = report.results.iter().map(|r| r.job_id.as_str()).collect();
        assert_eq!(order, vec!["A-1", "B-2", "C-3"]);
        assert_eq!(report.summary.total, 3);
        assert_eq!(report.summary.succeeded, 2);
        assert_eq!(report.summary.failed, 1);
        assert!(!report.results[1].success);
    }

    #[tokio::test]
    async fn test_run_batch_respects_concurrency() {
        let runtime = Arc::new(FakeRuntime::default().with_job_delay(Duration::from_millis(30)));
        let settings = OrchestratorSettings {
            batch_concurrency: 2,
            ..Default::default()
        };
        let orch = Orchestrator::new(runtime.clone(), settings);

        let ids: Vec<String> = (0..6).map(|i| format!("J-{i}")).collect();
        let report = orch.run_batch(&ids).await;
        assert!(report.all_succeeded());
        assert!(runtime.max_in_flight() <= 2);
        assert!(runtime.max_in_flight() >= 1);
    }

    #[tokio::test]
    async fn test_run_batch_empty() {
        let orch = orchestrator(Arc::new(FakeRuntime::default()));
        let report = orch.run_batch(&[]).await;
        assert_eq!(report.summary.total, 0);
        assert!(report.all_succeeded());
    }

    #[tokio::test]
    async fn test_exec_in_warm_reports_timeout() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.set_exec_behavior(ExecBehavior::Timeout);
        let orch = orchestrator(runtime);

        let outcome = orch
            .exec_in_warm("foreman-warm", &["true".to_string()], Duration::from_millis(10))
            .await
            .unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.ok);
    }

    #[test]
    fn test_job_command_quotes_id() {
        let orch = orchestrator(Arc::new(FakeRuntime::default()));
        assert_eq!(orch.job_command("PROJ-1"), "agent PROJ-1");
        assert_eq!(orch.job_command("x; rm -rf /"), "agent 'x; rm -rf /'");
    }

    #[test]
    fn test_descriptor_mounts() {
        let orch = orchestrator(Arc::new(FakeRuntime::default()));
        let env = orch.descriptor_for_job("PROJ-1");
        assert_eq!(env.kind, EnvironmentKind::Job);
        assert_eq!(env.labels.get("foreman.job").map(String::as_str), Some("PROJ-1"));

        let volumes: Vec<_> = env.mounts.iter().map(Mount::to_volume_arg).collect();
        assert_eq!(
            volumes,
            vec![
                "/var/cache/foreman:/cache".to_string(),
                "/home/me/.netrc:/credentials/.netrc:ro".to_string(),
                "/src/app:/workspace:ro".to_string(),
            ]
        );

        let warm = orch.warm_descriptor();
        assert_eq!(warm.name, "foreman-warm");
        assert_eq!(warm.kind, EnvironmentKind::WarmWorker);
    }

    #[tokio::test]
    async fn test_run_batch_within_finishes_in_time() {
        let runtime = Arc::new(FakeRuntime::default());
        let orch = orchestrator(runtime.clone());

        let ids = vec!["A-1".to_string(), "B-2".to_string()];
        let outcome = orch.run_batch_within(&ids, Duration::from_secs(5)).await;
        let BatchOutcome::Finished(report) = outcome else {
            panic!("expected the batch to finish, got {outcome:?}");
        };
        assert!(report.all_succeeded());
        assert!(!runtime.calls().iter().any(|c| c.starts_with("stop ")));
    }

    #[tokio::test]
    async fn test_batch_deadline_cancels_running_and_queued_jobs() {
        let runtime = Arc::new(FakeRuntime::default().with_job_delay(Duration::from_millis(200)));
        let settings = OrchestratorSettings {
            batch_concurrency: 1,
            ..Default::default()
        };
        let orch = Orchestrator::new(runtime.clone(), settings);

        let ids = vec!["J1-1".to_string(), "J2-2".to_string(), "J3-3".to_string()];
        let outcome = orch.run_batch_within(&ids, Duration::from_millis(50)).await;

        let BatchOutcome::TimedOut {
            timeout_ms,
            finished,
            cancelled,
            not_started,
        } = outcome
        else {
            panic!("expected a timeout, got {outcome:?}");
        };
        assert_eq!(timeout_ms, 50);
        assert!(finished.is_empty());
        assert_eq!(cancelled, vec!["J1-1".to_string()]);
        assert_eq!(not_started, vec!["J2-2".to_string(), "J3-3".to_string()]);

        let env = job_environment_name("J1-1");
        let calls = runtime.calls();
        let stop = calls.iter().position(|c| *c == format!("stop {env}")).unwrap();
        let remove = calls.iter().position(|c| *c == format!("remove {env}")).unwrap();
        assert!(stop < remove);
        assert_eq!(runtime.container_state(&env), None);

        // Nothing queued behind the deadline starts later.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(runtime.dispatched_jobs(), vec!["J1-1".to_string()]);
    }
}
