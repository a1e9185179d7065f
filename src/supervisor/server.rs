// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Supervisor daemon: singleton acquisition and the IPC method table.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[cfg(feature = "telemetry")]
use tracing::instrument;

use super::table::ProcessTable;
use super::types::{PingReply, ProcessSpec, StopParams, StopReply, SupervisorError, SupervisorSettings};
use crate::ipc::{transport, ConnectOptions, IpcClient, IpcServer, RequestHandler, RpcError};
use crate::error::LockError;
use crate::fsutil::FileLock;
use crate::lock::{LockManager, LockState};
use crate::paths::StatePaths;

const REAP_INTERVAL: Duration = Duration::from_secs(1);
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const START_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// How a `run` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorRun {
    /// Served until shutdown.
    Served,
    /// Another live supervisor answered ping; nothing was started.
    AlreadyRunning { pid: u32 },
}

/// IPC methods over a shared process table.
pub struct SupervisorService {
    table: Arc<Mutex<ProcessTable>>,
    settings: SupervisorSettings,
}

impl SupervisorService {
    pub fn new(table: ProcessTable, settings: SupervisorSettings) -> Self {
        Self {
            table: Arc::new(Mutex::new(table)),
            settings,
        }
    }

    pub fn table(&self) -> Arc<Mutex<ProcessTable>> {
        Arc::clone(&self.table)
    }

    async fn dispatch(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "ping" => to_value(PingReply {
                pid: std::process::id(),
            }),
            "process.start" => {
                let spec: ProcessSpec = parse(params)?;
                let record = self.table.lock().await.start(&spec)?;
                to_value(record)
            }
            "process.stop" => {
                let StopParams { name, timeout_ms } = parse(params)?;
                let grace = timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(self.settings.stop_timeout);
                let stopped = self.table.lock().await.stop(&name, grace).await?;
                to_value(StopReply { stopped })
            }
            "process.status" => {
                let status = self.table.lock().await.status();
                to_value(status)
            }
            "process.readSession" => {
                let session = self.table.lock().await.session().clone();
                to_value(session)
            }
            other => Err(RpcError::method_not_found(other)),
        }
    }
}

#[async_trait]
impl RequestHandler for SupervisorService {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.dispatch(method, params).await
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(RpcError::invalid_params)
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(RpcError::internal)
}

/// Is a supervisor answering on `paths`' socket?
pub async fn ping_socket(paths: &StatePaths, timeout: Duration) -> Result<PingReply, SupervisorError> {
    let options = ConnectOptions {
        attempts: 1,
        backoff: Duration::ZERO,
        request_timeout: timeout,
    };
    let client = IpcClient::connect(paths.supervisor_socket(), options).await?;
    Ok(client.call_as("ping", json!({})).await?)
}

/// Become the supervisor for `paths` and serve until `shutdown` resolves.
///
/// Yields with [`SupervisorRun::AlreadyRunning`] only when the lock holder is
/// alive and its socket answers `ping`; any other lock or socket is stale and
/// is taken over. Concurrent starts are serialized on a start lock held until
/// the winner's socket is bound. Supervised processes are left running on
/// shutdown.
#[cfg_attr(feature = "telemetry", instrument(skip_all, fields(root = %paths.root().display())))]
pub async fn run_supervisor(
    paths: &StatePaths,
    settings: SupervisorSettings,
    shutdown: impl Future<Output = ()>,
) -> Result<SupervisorRun, SupervisorError> {
    std::fs::create_dir_all(paths.supervisor_dir()).map_err(|source| SupervisorError::Session {
        path: paths.supervisor_dir().display().to_string(),
        source,
    })?;

    // Held from the liveness check until the socket is bound, so a second
    // instance never judges a half-started one stale.
    let start_lock = paths.supervisor_start_lock();
    let starting = FileLock::acquire_async(&start_lock, START_LOCK_TIMEOUT)
        .await
        .map_err(|source| match source.kind() {
            std::io::ErrorKind::WouldBlock => LockError::Contended(start_lock.display().to_string()),
            _ => LockError::Io {
                path: start_lock.display().to_string(),
                source,
            },
        })?;

    let lock = LockManager::new(paths.supervisor_lock_file());
    let replaced = match lock.inspect() {
        LockState::Held(record) => match ping_socket(paths, PROBE_TIMEOUT).await {
            Ok(reply) => {
                info!(pid = reply.pid, "Supervisor already running");
                return Ok(SupervisorRun::AlreadyRunning { pid: reply.pid });
            }
            Err(e) => {
                warn!(pid = record.pid, error = %e, "Lock holder is alive but not answering; taking over");
                Some(record)
            }
        },
        LockState::Stale(record) => Some(record),
        LockState::Free => None,
    };

    lock.clear();
    let _ = transport::cleanup(&paths.supervisor_socket());
    let handle = lock.force_acquire(replaced)?;
    info!(pid = handle.record.pid, "Supervisor starting");

    let mut server = IpcServer::new(paths.supervisor_socket());
    if let Err(e) = server.start().await {
        let _ = lock.release();
        return Err(e.into());
    }
    drop(starting);

    let service = Arc::new(SupervisorService::new(ProcessTable::load(paths.clone()), settings));
    let table = service.table();
    let reaper = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REAP_INTERVAL);
        loop {
            ticker.tick().await;
            table.lock().await.reap();
        }
    });

    let served = server.serve(service, shutdown).await;

    reaper.abort();
    if let Err(e) = lock.release() {
        warn!(error = %e, "Failed to release supervisor lock");
    }
    served?;
    debug!("Supervisor stopped");
    Ok(SupervisorRun::Served)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::ipc::codes;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    async fn spawn_supervisor(paths: &StatePaths) -> (oneshot::Sender<()>, tokio::task::JoinHandle<SupervisorRun>) {
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task_paths = paths.clone();
        let task = tokio::spawn(async move {
            run_supervisor(&task_paths, SupervisorSettings::default(), async {
                let _ = stop_rx.await;
            })
            .await
            .unwrap()
        });
        for _ in 0..200 {
            if ping_socket(paths, PROBE_TIMEOUT).await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        (stop_tx, task)
    }

    #[tokio::test]
    async fn test_unknown_method_and_bad_params() {
        let temp = TempDir::new().unwrap();
        let service = SupervisorService::new(
            ProcessTable::load(StatePaths::new(temp.path())),
            SupervisorSettings::default(),
        );

        let err = service.handle("process.explode", Value::Null).await.unwrap_err();
        assert_eq!(err.code, codes::METHOD_NOT_FOUND);

        let err = service.handle("process.start", json!({"name": 1})).await.unwrap_err();
        assert_eq!(err.code, codes::INVALID_PARAMS);

        let err = service
            .handle("process.stop", json!({"name": "ghost"}))
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_second_supervisor_yields() {
        let temp = TempDir::new().unwrap();
        let paths = StatePaths::new(temp.path());
        let (stop, task) = spawn_supervisor(&paths).await;

        let second = run_supervisor(&paths, SupervisorSettings::default(), std::future::pending())
            .await
            .unwrap();
        assert_eq!(
            second,
            SupervisorRun::AlreadyRunning {
                pid: std::process::id()
            }
        );

        stop.send(()).unwrap();
        assert_eq!(task.await.unwrap(), SupervisorRun::Served);
        assert!(!paths.supervisor_lock_file().exists());
        assert!(!paths.supervisor_socket().exists());
    }

    #[tokio::test]
    async fn test_stale_lock_and_socket_taken_over() {
        let temp = TempDir::new().unwrap();
        let paths = StatePaths::new(temp.path());
        std::fs::create_dir_all(paths.supervisor_dir()).unwrap();
        // Our own pid is alive, but nothing answers on the socket.
        std::fs::write(
            paths.supervisor_lock_file(),
            format!("{{\"pid\": {}, \"startedAt\": \"2026-01-01T00:00:00Z\"}}", std::process::id()),
        )
        .unwrap();
        std::fs::write(paths.supervisor_socket(), "").unwrap();

        let (stop, task) = spawn_supervisor(&paths).await;
        assert!(ping_socket(&paths, PROBE_TIMEOUT).await.is_ok());
        stop.send(()).unwrap();
        assert_eq!(task.await.unwrap(), SupervisorRun::Served);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_starts_leave_one_supervisor() {
        let temp = TempDir::new().unwrap();
        let paths = StatePaths::new(temp.path());

        let mut stops = Vec::new();
        let mut tasks = Vec::new();
        for _ in 0..2 {
            let (stop_tx, stop_rx) = oneshot::channel::<()>();
            let task_paths = paths.clone();
            stops.push(stop_tx);
            tasks.push(tokio::spawn(async move {
                run_supervisor(&task_paths, SupervisorSettings::default(), async {
                    let _ = stop_rx.await;
                })
                .await
                .unwrap()
            }));
        }

        // The loser yields on its own; the winner keeps serving.
        let mut waited = Duration::ZERO;
        while !tasks.iter().any(|task| task.is_finished()) && waited < Duration::from_secs(10) {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waited += Duration::from_millis(20);
        }
        let loser = tasks.iter().position(|task| task.is_finished()).unwrap();
        assert!(ping_socket(&paths, PROBE_TIMEOUT).await.is_ok());

        for stop in stops {
            let _ = stop.send(());
        }
        let mut outcomes = Vec::new();
        for task in tasks {
            outcomes.push(task.await.unwrap());
        }
        assert!(matches!(outcomes[loser], SupervisorRun::AlreadyRunning { .. }));
        assert_eq!(outcomes[1 - loser], SupervisorRun::Served);
        assert!(!paths.supervisor_start_lock().exists());
    }
}
