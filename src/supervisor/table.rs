// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Named process table.
//!
//! Processes are spawned as leaders of their own process group with output
//! appended to per-name log files. Records survive supervisor restarts via
//! the session file; a restarted supervisor adopts them by pid.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::session::SessionStore;
use super::types::{ProcessRecord, ProcessSpec, ProcessStatus, ServiceSession, SupervisorError};
use crate::paths::StatePaths;
use crate::process::{detach_group, is_process_alive, terminate_child, terminate_pid};

pub struct ProcessTable {
    paths: StatePaths,
    store: SessionStore,
    session: ServiceSession,
    /// Children spawned by this instance, reaped with `try_wait`.
    children: HashMap<String, Child>,
}

impl ProcessTable {
    /// Load the persisted session for `paths`.
    pub fn load(paths: StatePaths) -> Self {
        let store = SessionStore::new(paths.session_file());
        let session = store.load();
        Self {
            paths,
            store,
            session,
            children: HashMap::new(),
        }
    }

    pub fn session(&self) -> &ServiceSession {
        &self.session
    }

    /// Launch `spec`. A live process of the same name is an error; a dead
    /// record of that name is replaced.
    pub fn start(&mut self, spec: &ProcessSpec) -> Result<ProcessRecord, SupervisorError> {
        spec.validate()?;

        if let Some(existing) = self.session.find(&spec.name).cloned() {
            if self.is_running(&existing) {
                return Err(SupervisorError::ProcessAlreadyRunning {
                    name: existing.name,
                    pid: existing.pid,
                });
            }
            debug!(name = %spec.name, pid = existing.pid, "Replacing dead process record");
            self.session.take(&spec.name);
            self.children.remove(&spec.name);
        }

        let (out_log_path, err_log_path) = self.paths.process_logs(&spec.name);
        let spawn_err = |source| SupervisorError::Spawn {
            name: spec.name.clone(),
            source,
        };
        let stdout = open_log(&out_log_path).map_err(spawn_err)?;
        let stderr = open_log(&err_log_path).map_err(spawn_err)?;

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        detach_group(&mut cmd);

        let child = cmd.spawn().map_err(spawn_err)?;
        let pid = child
            .id()
            .ok_or_else(|| spawn_err(std::io::Error::other("process exited before reporting a pid")))?;

        let record = ProcessRecord {
            name: spec.name.clone(),
            pid,
            started_at: Utc::now(),
            command: spec.command.clone(),
            args: spec.args.clone(),
            cwd: spec.cwd.clone(),
            out_log_path,
            err_log_path,
        };
        self.children.insert(spec.name.clone(), child);
        self.session.processes.push(record.clone());
        self.store.save(&mut self.session)?;

        info!(name = %record.name, pid, command = %record.command, "Process started");
        Ok(record)
    }

    /// Stop `name`: SIGTERM to its group, SIGKILL after `grace`. The record
    /// is removed either way. Returns whether a live process was stopped.
    pub async fn stop(&mut self, name: &str, grace: Duration) -> Result<bool, SupervisorError> {
        let record = self
            .session
            .find(name)
            .cloned()
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;

        let was_running = self.is_running(&record);
        if was_running {
            let killed = match self.children.get_mut(name) {
                Some(child) => terminate_child(child, grace).await,
                None => terminate_pid(record.pid, grace).await,
            };
            info!(name, pid = record.pid, forced = killed, "Process stopped");
        }

        self.children.remove(name);
        self.session.take(name);
        self.store.save(&mut self.session)?;
        Ok(was_running)
    }

    /// Liveness of every known process.
    pub fn status(&mut self) -> Vec<ProcessStatus> {
        let records = self.session.processes.clone();
        records
            .into_iter()
            .map(|record| ProcessStatus {
                running: self.is_running(&record),
                name: record.name,
                pid: record.pid,
            })
            .collect()
    }

    /// Collect exit statuses of our own children so they do not linger as
    /// zombies.
    pub fn reap(&mut self) {
        self.children.retain(|name, child| match child.try_wait() {
            Ok(Some(status)) => {
                debug!(name = %name, %status, "Process exited");
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(name = %name, error = %e, "try_wait failed");
                false
            }
        });
    }

    fn is_running(&mut self, record: &ProcessRecord) -> bool {
        if let Some(child) = self.children.get_mut(&record.name) {
            return match child.try_wait() {
                Ok(None) => true,
                Ok(Some(_)) | Err(_) => {
                    self.children.remove(&record.name);
                    false
                }
            };
        }
        is_process_alive(record.pid)
    }
}

fn open_log(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}
