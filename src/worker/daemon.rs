// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Singleton background worker.
//!
//! One cycle: prune history, claim the next item, route it, make sure warm
//! capacity exists, resolve job ids, dispatch them as one batch and write the
//! outcome back. Only one worker runs per state directory; the PID lock is
//! re-checked against the OS so a crashed worker never blocks a restart.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

#[cfg(feature = "telemetry")]
use tracing::instrument;

use super::audit::AuditLog;
use super::tracker::{CommandTracker, IssueTracker};
use crate::config::ResolvedConfig;
use crate::error::QueueError;
use crate::lock::LockManager;
use crate::orchestrate::{shell_quote, BatchOutcome, BatchReport, DockerCli, Orchestrator, OrchestratorSettings};
use crate::queue::{QueueItem, QueueStore};
use crate::router::{route, Intent};

/// Error text for prompts the router cannot classify.
pub const UNRECOGNIZED_ERROR: &str = "unrecognized request: no work-item keys or known query phrasing";

/// Worker timing and probe configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub history_limit: usize,
    pub dispatch_timeout: Duration,
    pub probe_timeout: Duration,
    /// Run with `sh -c` in the warm environment; `{job_id}` is substituted.
    /// Exit 0 means the job already exists.
    pub probe_command: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from(&ResolvedConfig::default())
    }
}

impl From<&ResolvedConfig> for WorkerSettings {
    fn from(config: &ResolvedConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.queue.poll_interval_ms),
            history_limit: config.queue.history_limit,
            dispatch_timeout: Duration::from_millis(config.worker.dispatch_timeout_ms),
            probe_timeout: Duration::from_millis(config.worker.probe_timeout_ms),
            probe_command: config.worker.probe_command.clone(),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Nothing claimable.
    Idle,
    /// Item marked done.
    Done { id: String, result: Value },
    /// Item marked failed.
    Failed { id: String, error: String },
}

impl CycleOutcome {
    /// Done, but the dispatch outcome is unknown.
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, Self::Done { result, .. } if result["status"] == "indeterminate")
    }
}

/// Why a candidate was left out of a dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeVerdict {
    /// Probe exited 0.
    Exists,
    /// Probe exited non-zero.
    Absent,
    /// Probe did not answer in time; treated as existing.
    TimedOut,
    /// Probe could not run; treated as existing.
    Error(String),
}

impl ProbeVerdict {
    /// Only a definite "absent" lets a job through.
    pub fn should_dispatch(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

#[derive(Debug, Clone)]
enum Disposition {
    Done(Value),
    Failed(String),
}

/// An outcome decided for a claimed item but not yet written to the queue.
#[derive(Debug, Clone)]
struct PendingFinish {
    id: String,
    disposition: Disposition,
}

/// Polls the queue and dispatches work.
pub struct BackgroundWorker {
    store: QueueStore,
    orchestrator: Orchestrator,
    tracker: Arc<dyn IssueTracker>,
    audit: AuditLog,
    settings: WorkerSettings,
    pending: Mutex<Option<PendingFinish>>,
}

impl BackgroundWorker {
    pub fn new(
        store: QueueStore,
        orchestrator: Orchestrator,
        tracker: Arc<dyn IssueTracker>,
        settings: WorkerSettings,
    ) -> Self {
        let audit = AuditLog::new(store.paths().audit_log());
        Self {
            store,
            orchestrator,
            tracker,
            audit,
            settings,
            pending: Mutex::new(None),
        }
    }

    /// Wire the production collaborators: docker CLI runtime and command
    /// tracker, all configured from `config`.
    pub fn from_config(config: &ResolvedConfig) -> Self {
        let store = QueueStore::new(config.state_paths()).with_history_limit(config.queue.history_limit);
        let runtime = Arc::new(DockerCli::from(config));
        let orchestrator = Orchestrator::new(runtime, OrchestratorSettings::from(config));
        let tracker = Arc::new(CommandTracker::new(
            config.tracker.command.clone(),
            Duration::from_millis(config.tracker.timeout_ms),
        ));
        Self::new(store, orchestrator, tracker, WorkerSettings::from(config))
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Acquire the worker lock, recover, then cycle until `shutdown`
    /// resolves. The lock is released on the way out.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        let paths = self.store.paths().clone();
        let lock = LockManager::new(paths.worker_lock_file());
        let handle = lock.acquire().context("another worker is already running")?;
        if let Some(previous) = &handle.replaced {
            info!(stale_pid = previous.pid, "Replaced stale worker lock");
        }

        let result = self.serve(shutdown).await;

        if let Err(e) = lock.release() {
            warn!(error = %e, "Failed to release worker lock");
        }
        self.audit.record("worker_stopped", None, Value::Null);
        result
    }

    /// Take the lock, run exactly one cycle, release.
    pub async fn run_once(&self) -> anyhow::Result<CycleOutcome> {
        let paths = self.store.paths();
        let lock = LockManager::new(paths.worker_lock_file());
        lock.acquire().context("another worker is already running")?;

        let result: anyhow::Result<CycleOutcome> = async {
            paths.bootstrap().with_context(|| {
                format!("creating state directories under {}", paths.root().display())
            })?;
            for item in self.queue_op(|store| store.recover_interrupted()).await? {
                self.audit.record("recovered", Some(&item.id), json!({"status": "failed"}));
            }
            self.run_cycle().await
        }
        .await;

        if let Err(e) = lock.release() {
            warn!(error = %e, "Failed to release worker lock");
        }
        result
    }

    async fn serve(&self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        let paths = self.store.paths();
        paths
            .bootstrap()
            .with_context(|| format!("creating state directories under {}", paths.root().display()))?;

        let recovered = self.queue_op(|store| store.recover_interrupted()).await?;
        for item in &recovered {
            self.audit.record("recovered", Some(&item.id), json!({"status": "failed"}));
        }
        self.audit
            .record("worker_started", None, json!({"pid": std::process::id()}));
        info!(
            poll_ms = self.settings.poll_interval.as_millis() as u64,
            recovered = recovered.len(),
            "Worker started"
        );

        tokio::pin!(shutdown);
        loop {
            let outcome = tokio::select! {
                _ = &mut shutdown => {
                    warn!("Shutdown requested; any in-flight item is failed on next start");
                    return Ok(());
                }
                outcome = self.run_cycle() => outcome,
            };

            let idle = match outcome {
                Ok(CycleOutcome::Idle) => true,
                Ok(_) => false,
                Err(e) => {
                    error!(error = %e, "Worker cycle failed");
                    self.audit
                        .record("cycle_error", None, json!({"error": e.to_string()}));
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = &mut shutdown => return Ok(()),
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                }
            }
        }
    }

    /// Run a single cycle.
    ///
    /// `Err` means the queue itself could not be read or written; per-item
    /// problems are recorded on the item and returned as `Failed`. An outcome
    /// that could not be written is kept and written by the next cycle before
    /// anything new is claimed.
    #[cfg_attr(feature = "telemetry", instrument(skip(self)))]
    pub async fn run_cycle(&self) -> anyhow::Result<CycleOutcome> {
        if let Some(pending) = self.take_pending() {
            debug!(id = %pending.id, "Retrying unrecorded outcome");
            return self.finish(pending).await;
        }

        let limit = self.settings.history_limit;
        self.queue_op(move |store| store.prune_history(limit)).await?;

        let Some(item) = self.queue_op(|store| store.claim_next()).await? else {
            return Ok(CycleOutcome::Idle);
        };
        self.audit
            .record("claimed", Some(&item.id), json!({"prompt": item.prompt}));
        info!(id = %item.id, "Claimed item");

        let disposition = self.process(&item).await;
        self.finish(PendingFinish {
            id: item.id,
            disposition,
        })
        .await
    }

    /// Write a decided outcome. On a queue error the outcome is parked for
    /// the next cycle, unless the item no longer exists.
    async fn finish(&self, pending: PendingFinish) -> anyhow::Result<CycleOutcome> {
        let id = pending.id.clone();
        let written = match pending.disposition.clone() {
            Disposition::Done(result) => {
                let item_id = id.clone();
                self.queue_op(move |store| store.mark_done(&item_id, result)).await
            }
            Disposition::Failed(error) => {
                let item_id = id.clone();
                self.queue_op(move |store| store.fail_prompt(&item_id, &error)).await
            }
        };

        if let Err(e) = written {
            if matches!(e.downcast_ref::<QueueError>(), Some(QueueError::NotFound(_))) {
                warn!(id = %id, "Item vanished before its outcome was recorded");
            } else {
                warn!(id = %id, error = %e, "Could not record outcome; retrying next cycle");
                *self.pending_slot() = Some(pending);
            }
            return Err(e);
        }

        match pending.disposition {
            Disposition::Done(result) => {
                self.audit.record("done", Some(&id), json!({"result": result}));
                Ok(CycleOutcome::Done { id, result })
            }
            Disposition::Failed(error) => {
                self.audit.record("failed", Some(&id), json!({"error": error}));
                Ok(CycleOutcome::Failed { id, error })
            }
        }
    }

    fn take_pending(&self) -> Option<PendingFinish> {
        self.pending_slot().take()
    }

    fn pending_slot(&self) -> MutexGuard<'_, Option<PendingFinish>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a blocking queue operation off the async workers.
    async fn queue_op<T, F>(&self, op: F) -> anyhow::Result<T>
    where
        F: FnOnce(&QueueStore) -> Result<T, QueueError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        let out = tokio::task::spawn_blocking(move || op(&store))
            .await
            .context("queue task panicked")??;
        Ok(out)
    }

    async fn process(&self, item: &QueueItem) -> Disposition {
        let intent = route(&item.prompt);
        self.audit
            .record("routed", Some(&item.id), json!({"intent": intent}));

        if intent == Intent::Unrecognized {
            return Disposition::Failed(UNRECOGNIZED_ERROR.to_string());
        }

        match self.orchestrator.ensure_warm_capacity().await {
            Ok(created) => self
                .audit
                .record("capacity_ensured", Some(&item.id), json!({"created": created})),
            Err(e) => return Disposition::Failed(format!("warm capacity unavailable: {e}")),
        }

        let (job_ids, skipped) = match &intent {
            Intent::ExplicitIssueKeys { keys } => (keys.clone(), Vec::new()),
            Intent::ImplicitQuery { kind } => {
                let candidates = match self.tracker.query(*kind).await {
                    Ok(items) => items,
                    Err(e) => return Disposition::Failed(format!("tracker query failed: {e}")),
                };
                self.audit.record(
                    "tracker_queried",
                    Some(&item.id),
                    json!({"query": kind.as_str(), "candidates": candidates.len()}),
                );
                self.filter_candidates(&item.id, candidates.into_iter().map(|c| c.key))
                    .await
            }
            Intent::Unrecognized => return Disposition::Failed(UNRECOGNIZED_ERROR.to_string()),
        };

        if job_ids.is_empty() {
            return Disposition::Done(json!({
                "status": "succeeded",
                "intent": intent,
                "dispatched": [],
                "skipped": skipped,
                "batch": BatchReport::default(),
            }));
        }

        self.audit
            .record("dispatching", Some(&item.id), json!({"jobs": job_ids}));
        let report = match self
            .orchestrator
            .run_batch_within(&job_ids, self.settings.dispatch_timeout)
            .await
        {
            BatchOutcome::Finished(report) => report,
            BatchOutcome::TimedOut {
                timeout_ms,
                finished,
                cancelled,
                not_started,
            } => {
                warn!(id = %item.id, timeout_ms, "Dispatch timed out; outcome indeterminate");
                return Disposition::Done(json!({
                    "status": "indeterminate",
                    "reason": "dispatch timed out",
                    "intent": intent,
                    "dispatched": job_ids,
                    "skipped": skipped,
                    "finished": finished,
                    "cancelled": cancelled,
                    "notStarted": not_started,
                }));
            }
        };

        if report.results.iter().any(|r| r.is_hard_failure()) {
            return Disposition::Failed(format!("dispatch failed: {}", report.failure_text()));
        }

        let status = if report.all_succeeded() {
            "succeeded"
        } else {
            "indeterminate"
        };
        Disposition::Done(json!({
            "status": status,
            "intent": intent,
            "dispatched": job_ids,
            "skipped": skipped,
            "batch": report,
        }))
    }

    /// Keep only candidates the warm environment says do not exist yet.
    async fn filter_candidates(
        &self,
        item_id: &str,
        candidates: impl Iterator<Item = String>,
    ) -> (Vec<String>, Vec<Value>) {
        let mut include = Vec::new();
        let mut skipped = Vec::new();
        for job_id in candidates {
            if include.contains(&job_id) {
                continue;
            }
            let verdict = self.probe(&job_id).await;
            debug!(job_id = %job_id, verdict = ?verdict, "Probed candidate");
            if verdict.should_dispatch() {
                include.push(job_id);
            } else {
                skipped.push(json!({"jobId": job_id, "verdict": verdict}));
            }
        }
        self.audit.record(
            "candidates_filtered",
            Some(item_id),
            json!({"included": include, "skipped": skipped}),
        );
        (include, skipped)
    }

    /// Ask the warm environment whether `job_id` already exists.
    pub async fn probe(&self, job_id: &str) -> ProbeVerdict {
        let script = self
            .settings
            .probe_command
            .replace("{job_id}", &shell_quote(job_id));
        let argv = vec!["sh".to_string(), "-c".to_string(), script];
        let warm = &self.orchestrator.settings().warm_name;

        match self
            .orchestrator
            .exec_in_warm(warm, &argv, self.settings.probe_timeout)
            .await
        {
            Ok(outcome) if outcome.timed_out => ProbeVerdict::TimedOut,
            Ok(outcome) if outcome.ok => ProbeVerdict::Exists,
            Ok(_) => ProbeVerdict::Absent,
            Err(e) => ProbeVerdict::Error(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::StatePaths;
    use crate::queue::QueueStatus;
    use crate::router::QueryKind;
    use crate::testing::{ExecBehavior, FakeRuntime, StaticTracker};
    use tempfile::TempDir;

    struct Harness {
        _temp: TempDir,
        runtime: Arc<FakeRuntime>,
        tracker: Arc<StaticTracker>,
        worker: BackgroundWorker,
    }

    fn harness(runtime: FakeRuntime, tracker: StaticTracker) -> Harness {
        let temp = TempDir::new().unwrap();
        let store = QueueStore::new(StatePaths::new(temp.path()));
        let runtime = Arc::new(runtime);
        let tracker = Arc::new(tracker);
        let orchestrator = Orchestrator::new(runtime.clone(), OrchestratorSettings::default());
        let settings = WorkerSettings {
            poll_interval: Duration::from_millis(10),
            history_limit: 100,
            dispatch_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_millis(50),
            probe_command: "test -e /cache/jobs/{job_id}".to_string(),
        };
        let worker = BackgroundWorker::new(store, orchestrator, tracker.clone(), settings);
        Harness {
            _temp: temp,
            runtime,
            tracker,
            worker,
        }
    }

    #[tokio::test]
    async fn test_idle_when_queue_empty() {
        let h = harness(FakeRuntime::default(), StaticTracker::default());
        assert_eq!(h.worker.run_cycle().await.unwrap(), CycleOutcome::Idle);
        assert!(h.runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_explicit_keys_dispatched() {
        let h = harness(FakeRuntime::default(), StaticTracker::default());
        let item = h.worker.store().enqueue("please do PROJ-1 and PROJ-2").unwrap();

        let outcome = h.worker.run_cycle().await.unwrap();
        let CycleOutcome::Done { id, result } = outcome else {
            panic!("expected done, got {outcome:?}");
        };
        assert_eq!(id, item.id);
        assert_eq!(result["status"], "succeeded");
        assert_eq!(result["batch"]["summary"]["total"], 2);
        assert_eq!(h.runtime.dispatched_jobs(), vec!["PROJ-1", "PROJ-2"]);
        assert!(h.tracker.queries().is_empty());

        let stored = h.worker.store().get(&item.id).unwrap();
        assert_eq!(stored.status, QueueStatus::Done);
        assert!(h.worker.store().run_state().is_idle());
    }

    #[tokio::test]
    async fn test_unrecognized_fails_item() {
        let h = harness(FakeRuntime::default(), StaticTracker::default());
        let item = h.worker.store().enqueue("make me a sandwich").unwrap();

        let outcome = h.worker.run_cycle().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Failed {
                id: item.id.clone(),
                error: UNRECOGNIZED_ERROR.to_string()
            }
        );
        assert!(h.runtime.dispatched_jobs().is_empty());
        assert_eq!(h.worker.store().get(&item.id).unwrap().status, QueueStatus::Failed);
    }

    #[tokio::test]
    async fn test_failed_job_fails_item() {
        let runtime = FakeRuntime::default();
        runtime.fail_job("PROJ-2");
        let h = harness(runtime, StaticTracker::default());
        h.worker.store().enqueue("PROJ-1 PROJ-2").unwrap();

        match h.worker.run_cycle().await.unwrap() {
            CycleOutcome::Failed { error, .. } => assert!(error.contains("PROJ-2"), "{error}"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_job_timeout_is_indeterminate() {
        let runtime = FakeRuntime::default();
        runtime.time_out_job("PROJ-1");
        let h = harness(runtime, StaticTracker::default());
        h.worker.store().enqueue("PROJ-1").unwrap();

        let outcome = h.worker.run_cycle().await.unwrap();
        assert!(outcome.is_indeterminate(), "{outcome:?}");
    }

    #[tokio::test]
    async fn test_probe_verdicts() {
        let runtime = FakeRuntime::default();
        runtime.on_exec_containing("A-1", ExecBehavior::Exit(0));
        runtime.on_exec_containing("A-2", ExecBehavior::Exit(1));
        runtime.on_exec_containing("A-3", ExecBehavior::Timeout);
        runtime.on_exec_containing("A-4", ExecBehavior::Error);
        let h = harness(runtime, StaticTracker::default());

        assert_eq!(h.worker.probe("A-1").await, ProbeVerdict::Exists);
        assert_eq!(h.worker.probe("A-2").await, ProbeVerdict::Absent);
        assert_eq!(h.worker.probe("A-3").await, ProbeVerdict::TimedOut);
        assert!(matches!(h.worker.probe("A-4").await, ProbeVerdict::Error(_)));
    }

    #[tokio::test]
    async fn test_implicit_query_filters_existing_jobs() {
        let runtime = FakeRuntime::default();
        runtime.on_exec_containing("A-1", ExecBehavior::Exit(0));
        runtime.on_exec_containing("A-3", ExecBehavior::Timeout);
        let h = harness(runtime, StaticTracker::with_keys(&["A-1", "A-2", "A-3", "A-2"]));
        h.worker.store().enqueue("work on my open tickets without a PR").unwrap();

        let outcome = h.worker.run_cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Done { .. }), "{outcome:?}");
        assert_eq!(h.tracker.queries(), vec![QueryKind::OpenWithoutChangeRequest]);
        assert_eq!(h.runtime.dispatched_jobs(), vec!["A-2"]);
    }

    #[tokio::test]
    async fn test_empty_resolution_completes_without_dispatch() {
        let h = harness(FakeRuntime::default(), StaticTracker::with_keys(&[]));
        h.worker.store().enqueue("my tickets").unwrap();

        let CycleOutcome::Done { result, .. } = h.worker.run_cycle().await.unwrap() else {
            panic!("expected done");
        };
        assert_eq!(result["dispatched"], json!([]));
        assert!(h.runtime.dispatched_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_tracker_failure_fails_item() {
        let h = harness(FakeRuntime::default(), StaticTracker::failing());
        h.worker.store().enqueue("assigned to me").unwrap();

        match h.worker.run_cycle().await.unwrap() {
            CycleOutcome::Failed { error, .. } => assert!(error.starts_with("tracker query failed")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_audit_trail_written() {
        let h = harness(FakeRuntime::default(), StaticTracker::default());
        h.worker.store().enqueue("PROJ-9").unwrap();
        h.worker.run_cycle().await.unwrap();

        let events: Vec<String> = h
            .worker
            .audit()
            .read_all()
            .iter()
            .filter_map(|e| e["event"].as_str().map(str::to_string))
            .collect();
        assert_eq!(
            events,
            vec!["claimed", "routed", "capacity_ensured", "dispatching", "done"]
        );
    }

    #[tokio::test]
    async fn test_run_once_recovers_then_cycles() {
        let h = harness(FakeRuntime::default(), StaticTracker::default());
        let stuck = h.worker.store().enqueue("PROJ-1").unwrap();
        h.worker.store().claim_next().unwrap();
        let next = h.worker.store().enqueue("PROJ-2").unwrap();

        let outcome = h.worker.run_once().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Done { ref id, .. } if *id == next.id));
        assert_eq!(h.worker.store().get(&stuck.id).unwrap().status, QueueStatus::Failed);
        assert_eq!(h.runtime.dispatched_jobs(), vec!["PROJ-2"]);
        assert!(!h.worker.store().paths().worker_lock_file().exists());
    }

    #[tokio::test]
    async fn test_live_lock_refuses_second_worker() {
        let h = harness(FakeRuntime::default(), StaticTracker::default());
        let lock = LockManager::with_probe(h.worker.store().paths().worker_lock_file(), |_pid: u32| true);
        std::fs::create_dir_all(h.worker.store().paths().queue_dir()).unwrap();
        std::fs::write(
            lock.path(),
            r#"{"pid": 999999, "startedAt": "2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        // The real probe sees pid 999999 as dead; the injected one says alive.
        assert!(matches!(lock.acquire(), Err(crate::error::LockError::Held { pid: 999999, .. })));
        // The worker uses the OS probe and takes the stale lock over.
        h.worker.run_once().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_and_releases_lock() {
        let h = harness(FakeRuntime::default(), StaticTracker::default());
        let lock_path = h.worker.store().paths().worker_lock_file();

        h.worker
            .run(tokio::time::sleep(Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(!lock_path.exists());
    }
}
