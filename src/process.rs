// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! OS process helpers: liveness checks, process-group signalling and bounded
//! command execution.
//!
//! Commands are spawned as the leader of their own process group so that a
//! timeout can take down the whole tree (`docker run` plus anything it forked)
//! instead of orphaning grandchildren.

use std::io;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Grace window between SIGTERM and SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

const ALIVE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Signals foreman sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    fn as_str(self) -> &'static str {
        match self {
            Signal::Term => "TERM",
            Signal::Kill => "KILL",
        }
    }
}

/// Check whether a process with `pid` exists.
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }

    #[cfg(unix)]
    {
        std::process::Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    {
        false
    }
}

/// Send `signal` to `pid`, or to the process group led by `pid` when `group`
/// is set. Returns whether the signal was delivered.
pub fn send_signal(pid: u32, signal: Signal, group: bool) -> bool {
    if pid == 0 {
        return false;
    }

    #[cfg(unix)]
    {
        let target = if group {
            format!("-{pid}")
        } else {
            pid.to_string()
        };
        std::process::Command::new("kill")
            .arg("-s")
            .arg(signal.as_str())
            .arg("--")
            .arg(target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    {
        let _ = (pid, signal, group);
        false
    }
}

/// Terminate a process group that is not our child: SIGTERM, poll for exit,
/// SIGKILL after `grace`. Returns `true` when SIGKILL was needed.
pub async fn terminate_pid(pid: u32, grace: Duration) -> bool {
    if !send_signal(pid, Signal::Term, true) {
        send_signal(pid, Signal::Term, false);
    }

    let start = Instant::now();
    while is_process_alive(pid) && start.elapsed() < grace {
        tokio::time::sleep(ALIVE_POLL_INTERVAL).await;
    }

    if !is_process_alive(pid) {
        return false;
    }

    warn!(pid, "Process ignored SIGTERM, sending SIGKILL");
    if !send_signal(pid, Signal::Kill, true) {
        send_signal(pid, Signal::Kill, false);
    }
    let start = Instant::now();
    while is_process_alive(pid) && start.elapsed() < Duration::from_secs(2) {
        tokio::time::sleep(ALIVE_POLL_INTERVAL).await;
    }
    true
}

/// Terminate a child we spawned (and its process group), reaping it.
/// Returns `true` when SIGKILL was needed.
pub async fn terminate_child(child: &mut Child, grace: Duration) -> bool {
    let Some(pid) = child.id() else {
        // Already reaped.
        return false;
    };

    send_signal(pid, Signal::Term, true);
    if timeout(grace, child.wait()).await.is_ok() {
        return false;
    }

    warn!(pid, "Child ignored SIGTERM, sending SIGKILL");
    send_signal(pid, Signal::Kill, true);
    let _ = child.start_kill();
    let _ = timeout(Duration::from_secs(2), child.wait()).await;
    true
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

/// Put a command in its own process group.
pub fn detach_group(cmd: &mut Command) -> &mut Command {
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

/// Captured result of a bounded command run.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal or timed out.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Trimmed stderr, falling back to stdout, for error messages.
    pub fn failure_text(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        match self.exit_code {
            Some(code) => format!("exited with status {code}"),
            None if self.timed_out => "timed out".to_string(),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Run `program args...` to completion with a hard timeout.
///
/// On timeout the process group receives SIGTERM, then SIGKILL after
/// `DEFAULT_KILL_GRACE`; whatever output was produced so far is returned with
/// `timed_out` set. Spawn failures are returned as `Err`.
pub async fn run_command(
    program: &str,
    args: &[String],
    stdin: Option<&[u8]>,
    limit: Duration,
) -> io::Result<CommandOutput> {
    run_command_with_grace(program, args, stdin, limit, DEFAULT_KILL_GRACE).await
}

pub async fn run_command_with_grace(
    program: &str,
    args: &[String],
    stdin: Option<&[u8]>,
    limit: Duration,
    grace: Duration,
) -> io::Result<CommandOutput> {
    let start = Instant::now();

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    detach_group(&mut cmd);

    let mut child = cmd.spawn()?;
    debug!(program, pid = child.id(), "Spawned command");
    let stdin_pipe = child.stdin.take();
    let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
    let stderr_task = tokio::spawn(read_stream(child.stderr.take()));
    let mut guard = ChildGuard::new(child, grace);

    if let (Some(input), Some(mut pipe)) = (stdin, stdin_pipe) {
        pipe.write_all(input).await?;
        pipe.shutdown().await?;
        drop(pipe);
    }

    let (exit_code, timed_out) = match timeout(limit, guard.wait()).await {
        Ok(status) => (status?.code(), false),
        Err(_) => {
            warn!(program, timeout_ms = limit.as_millis() as u64, "Command timed out");
            guard.terminate().await;
            (None, true)
        }
    };

    let stdout = collect(stdout_task).await;
    let stderr = collect(stderr_task).await;

    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
        timed_out,
        duration: start.elapsed(),
    })
}

/// Owns a spawned child until it has been reaped.
///
/// If the owning future is dropped first, the child is handed to a background
/// task that terminates its process group (SIGTERM, then SIGKILL after the
/// grace window).
struct ChildGuard {
    child: Option<Child>,
    grace: Duration,
}

impl ChildGuard {
    fn new(child: Child, grace: Duration) -> Self {
        Self {
            child: Some(child),
            grace,
        }
    }

    async fn wait(&mut self) -> io::Result<std::process::ExitStatus> {
        match self.child.as_mut() {
            Some(child) => child.wait().await,
            None => Err(io::Error::other("child already released")),
        }
    }

    async fn terminate(&mut self) {
        if let Some(child) = self.child.as_mut() {
            terminate_child(child, self.grace).await;
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        let grace = self.grace;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(pid = child.id(), "Command abandoned, terminating its group");
                handle.spawn(async move {
                    terminate_child(&mut child, grace).await;
                });
            }
            Err(_) => {
                let _ = child.start_kill();
            }
        }
    }
}

async fn read_stream<R: AsyncRead + Unpin>(stream: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        let _ = stream.read_to_end(&mut buf).await;
    }
    buf
}

async fn collect(task: tokio::task::JoinHandle<Vec<u8>>) -> String {
    // Grandchildren can keep a pipe open after the leader exits.
    match timeout(Duration::from_secs(2), task).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        _ => String::new(),
    }
}
