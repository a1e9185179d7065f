// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Typed supervisor client with on-demand startup.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde_json::json;
use tokio::process::Command;
use tracing::{debug, info};

use super::server::ping_socket;
use super::types::{
    PingReply, ProcessRecord, ProcessSpec, ProcessStatus, ServiceSession, StopParams, StopReply,
    SupervisorError, SupervisorSettings,
};
use crate::ipc::{ConnectOptions, IpcClient};
use crate::paths::StatePaths;
use crate::process::detach_group;

/// Starts a supervisor process in the background.
pub trait SupervisorLauncher: Send + Sync {
    /// Returns the launched pid, when there is one.
    fn launch(&self, paths: &StatePaths) -> Result<Option<u32>, SupervisorError>;
}

/// Re-executes a binary as `<program> --state-dir <root> supervisor run` in
/// its own process group, with output going to the supervisor log files.
#[derive(Debug, Clone)]
pub struct ExecutableLauncher {
    program: PathBuf,
}

impl ExecutableLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Launch the running executable.
    pub fn current() -> Result<Self, SupervisorError> {
        let program = std::env::current_exe().map_err(|source| SupervisorError::Spawn {
            name: "supervisor".to_string(),
            source,
        })?;
        Ok(Self::new(program))
    }
}

impl SupervisorLauncher for ExecutableLauncher {
    fn launch(&self, paths: &StatePaths) -> Result<Option<u32>, SupervisorError> {
        let spawn_err = |source| SupervisorError::Spawn {
            name: "supervisor".to_string(),
            source,
        };
        std::fs::create_dir_all(paths.supervisor_dir()).map_err(spawn_err)?;
        let open = |path: PathBuf| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(spawn_err)
        };
        let stdout = open(paths.supervisor_out_log())?;
        let stderr = open(paths.supervisor_err_log())?;

        let mut cmd = Command::new(&self.program);
        cmd.arg("--state-dir")
            .arg(paths.root())
            .args(["supervisor", "run"])
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        detach_group(&mut cmd);

        let child = cmd.spawn().map_err(spawn_err)?;
        let pid = child.id();
        info!(pid = ?pid, program = %self.program.display(), "Launched supervisor");
        Ok(pid)
    }
}

/// Connected supervisor client.
pub struct SupervisorClient {
    client: IpcClient,
}

impl SupervisorClient {
    /// Connect to a supervisor that is already running.
    pub async fn connect(paths: &StatePaths, settings: &SupervisorSettings) -> Result<Self, SupervisorError> {
        let options = ConnectOptions {
            attempts: 1,
            backoff: settings.connect_backoff,
            request_timeout: settings.request_timeout,
        };
        let client = IpcClient::connect(paths.supervisor_socket(), options).await?;
        Ok(Self { client })
    }

    /// Connect, launching a supervisor first if none answers `ping`. Safe to
    /// call concurrently: extra launches yield to the first one.
    pub async fn ensure_running(
        paths: &StatePaths,
        settings: &SupervisorSettings,
        launcher: &dyn SupervisorLauncher,
    ) -> Result<Self, SupervisorError> {
        if ping_socket(paths, settings.request_timeout).await.is_ok() {
            return Self::connect(paths, settings).await;
        }

        debug!("No supervisor answering, launching one");
        launcher.launch(paths)?;

        let attempts = settings.connect_retries.max(1);
        let mut last_error = String::from("no response");
        for attempt in 0..attempts {
            match ping_socket(paths, settings.request_timeout).await {
                Ok(reply) => {
                    debug!(pid = reply.pid, attempt, "Supervisor is up");
                    return Self::connect(paths, settings).await;
                }
                Err(e) => last_error = e.to_string(),
            }
            tokio::time::sleep(settings.connect_backoff).await;
        }

        Err(SupervisorError::StartTimeout { attempts, last_error })
    }

    pub async fn ping(&self) -> Result<PingReply, SupervisorError> {
        Ok(self.client.call_as("ping", json!({})).await?)
    }

    pub async fn start(&self, spec: &ProcessSpec) -> Result<ProcessRecord, SupervisorError> {
        let params = serde_json::to_value(spec).map_err(crate::ipc::IpcError::from)?;
        Ok(self.client.call_as("process.start", params).await?)
    }

    /// Stop `name`; `timeout` overrides the supervisor's default grace.
    pub async fn stop(&self, name: &str, timeout: Option<Duration>) -> Result<bool, SupervisorError> {
        let params = StopParams {
            name: name.to_string(),
            timeout_ms: timeout.map(|t| t.as_millis() as u64),
        };
        let params = serde_json::to_value(params).map_err(crate::ipc::IpcError::from)?;
        let reply: StopReply = self.client.call_as("process.stop", params).await?;
        Ok(reply.stopped)
    }

    pub async fn status(&self) -> Result<Vec<ProcessStatus>, SupervisorError> {
        Ok(self.client.call_as("process.status", json!({})).await?)
    }

    pub async fn read_session(&self) -> Result<ServiceSession, SupervisorError> {
        Ok(self.client.call_as("process.readSession", json!({})).await?)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::supervisor::server::{run_supervisor, SupervisorRun};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    /// Runs the supervisor in-process instead of exec'ing a binary.
    #[derive(Default)]
    struct InProcessLauncher {
        launches: AtomicUsize,
        running: Mutex<Vec<(oneshot::Sender<()>, JoinHandle<SupervisorRun>)>>,
    }

    impl SupervisorLauncher for InProcessLauncher {
        fn launch(&self, paths: &StatePaths) -> Result<Option<u32>, SupervisorError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = oneshot::channel::<()>();
            let paths = paths.clone();
            let task = tokio::spawn(async move {
                run_supervisor(&paths, SupervisorSettings::default(), async {
                    let _ = rx.await;
                })
                .await
                .unwrap()
            });
            self.running.lock().unwrap().push((tx, task));
            Ok(None)
        }
    }

    impl InProcessLauncher {
        async fn shutdown(&self) {
            let running: Vec<_> = self.running.lock().unwrap().drain(..).collect();
            for (tx, task) in running {
                let _ = tx.send(());
                let _ = task.await;
            }
        }
    }

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            connect_retries: 100,
            connect_backoff: Duration::from_millis(20),
            request_timeout: Duration::from_secs(2),
            stop_timeout: Duration::from_secs(2),
        }
    }

    struct NeverLauncher;

    impl SupervisorLauncher for NeverLauncher {
        fn launch(&self, _paths: &StatePaths) -> Result<Option<u32>, SupervisorError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_ensure_running_launches_once() {
        let temp = TempDir::new().unwrap();
        let paths = StatePaths::new(temp.path());
        let launcher = InProcessLauncher::default();

        let client = SupervisorClient::ensure_running(&paths, &settings(), &launcher)
            .await
            .unwrap();
        assert_eq!(client.ping().await.unwrap().pid, std::process::id());

        // Already up: no second launch.
        let _again = SupervisorClient::ensure_running(&paths, &settings(), &launcher)
            .await
            .unwrap();
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);

        launcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_ensure_running_gives_up() {
        let temp = TempDir::new().unwrap();
        let paths = StatePaths::new(temp.path());
        let settings = SupervisorSettings {
            connect_retries: 3,
            connect_backoff: Duration::from_millis(5),
            ..settings()
        };
        let err = SupervisorClient::ensure_running(&paths, &settings, &NeverLauncher)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SupervisorError::StartTimeout { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_process_lifecycle_over_ipc() {
        let temp = TempDir::new().unwrap();
        let paths = StatePaths::new(temp.path());
        let launcher = InProcessLauncher::default();
        let client = SupervisorClient::ensure_running(&paths, &settings(), &launcher)
            .await
            .unwrap();

        let spec = ProcessSpec::new("sleeper", "sleep").args(["30"]);
        let record = client.start(&spec).await.unwrap();
        assert_eq!(record.name, "sleeper");

        let err = client.start(&spec).await.unwrap_err();
        assert!(err.is_already_running(), "{err}");

        let status = client.status().await.unwrap();
        assert_eq!(status.len(), 1);
        assert!(status[0].running);

        let session = client.read_session().await.unwrap();
        assert_eq!(session.find("sleeper").map(|p| p.pid), Some(record.pid));

        assert!(client.stop("sleeper", Some(Duration::from_secs(2))).await.unwrap());
        assert!(client.status().await.unwrap().is_empty());

        launcher.shutdown().await;
    }
}
