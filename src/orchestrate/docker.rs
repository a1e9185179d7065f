// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! [`ContainerRuntime`] backed by the `docker` CLI (or a compatible binary
//! such as `podman`).

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

#[cfg(feature = "telemetry")]
use tracing::instrument;

use super::runtime::ContainerRuntime;
use super::types::{ContainerInfo, EnvironmentDescriptor, OrchestratorError};
use crate::config::ResolvedConfig;
use crate::process::{run_command, CommandOutput};

/// Whether a container outlives the command that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Detached,
    OneShot,
}

/// Shells out to a docker-compatible CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
    command_timeout: Duration,
    build_timeout: Duration,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker", Duration::from_secs(60), Duration::from_secs(15 * 60))
    }
}

impl From<&ResolvedConfig> for DockerCli {
    fn from(config: &ResolvedConfig) -> Self {
        let containers = &config.containers;
        Self::new(
            containers.runtime.clone(),
            Duration::from_millis(containers.command_timeout_ms),
            Duration::from_millis(containers.build_timeout_ms),
        )
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>, command_timeout: Duration, build_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            command_timeout,
            build_timeout,
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    async fn invoke(
        &self,
        op: &str,
        args: Vec<String>,
        stdin: Option<&[u8]>,
        limit: Duration,
    ) -> Result<CommandOutput, OrchestratorError> {
        debug!(binary = %self.binary, op, "Invoking container runtime");
        Ok(run_command(&self.binary, &args, stdin, limit).await?)
    }

    /// Invoke and require a zero exit within the timeout.
    async fn checked(
        &self,
        op: &str,
        args: Vec<String>,
        stdin: Option<&[u8]>,
        limit: Duration,
    ) -> Result<CommandOutput, OrchestratorError> {
        let output = self.invoke(op, args, stdin, limit).await?;
        if output.timed_out {
            return Err(OrchestratorError::Timeout {
                op: op.to_string(),
                timeout_ms: limit.as_millis() as u64,
            });
        }
        if !output.success() {
            return Err(OrchestratorError::runtime(op, output.failure_text()));
        }
        Ok(output)
    }
}

/// Arguments for `docker run`.
pub fn run_args(env: &EnvironmentDescriptor, mode: RunMode, command: &[String]) -> Vec<String> {
    let mut args = vec!["run".to_string()];
    match mode {
        RunMode::Detached => args.push("-d".to_string()),
        RunMode::OneShot => args.push("--rm".to_string()),
    }
    args.extend([
        "--name".to_string(),
        env.name.clone(),
        "--network".to_string(),
        env.network.clone(),
        "--cpus".to_string(),
        env.limits.cpus.clone(),
        "--memory".to_string(),
        env.limits.memory.clone(),
        "--label".to_string(),
        format!("foreman.kind={}", env.kind.as_str()),
    ]);
    for (key, value) in &env.labels {
        args.push("--label".to_string());
        args.push(format!("{key}={value}"));
    }
    for mount in &env.mounts {
        args.push("-v".to_string());
        args.push(mount.to_volume_arg());
    }
    if let Some(workdir) = &env.workdir {
        args.push("-w".to_string());
        args.push(workdir.clone());
    }
    args.push(env.image.clone());
    args.extend(command.iter().cloned());
    args
}

/// Parse `name\tstate\tstatus` lines.
pub fn parse_container_lines(op: &str, stdout: &str) -> Result<Vec<ContainerInfo>, OrchestratorError> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let mut fields = line.splitn(3, '\t');
            match (fields.next(), fields.next(), fields.next()) {
                (Some(name), Some(state), Some(status)) if !name.is_empty() => Ok(ContainerInfo {
                    name: name.trim().to_string(),
                    state: state.trim().to_string(),
                    status: status.trim().to_string(),
                }),
                _ => Err(OrchestratorError::Malformed {
                    op: op.to_string(),
                    line: line.to_string(),
                }),
            }
        })
        .collect()
}

/// Whether an exec failure came from the runtime rather than the command.
fn daemon_error(output: &CommandOutput) -> Option<String> {
    let stderr = output.stderr.trim();
    let from_runtime = output.exit_code == Some(125)
        || stderr.starts_with("Error response from daemon")
        || stderr.contains("No such container")
        || stderr.contains("Cannot connect to the Docker daemon")
        || stderr.contains("is not running");
    from_runtime.then(|| output.failure_text())
}

fn strings<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn network_exists(&self, name: &str) -> Result<bool, OrchestratorError> {
        let filter = format!("name=^{name}$");
        let output = self
            .checked(
                "network ls",
                strings(["network", "ls", "--filter", filter.as_str(), "--format", "{{.Name}}"]),
                None,
                self.command_timeout,
            )
            .await?;
        Ok(output.stdout.lines().any(|line| line.trim() == name))
    }

    async fn create_network(&self, name: &str) -> Result<(), OrchestratorError> {
        match self
            .checked(
                "network create",
                strings(["network", "create", name]),
                None,
                self.command_timeout,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(OrchestratorError::Runtime { message, .. }) if message.contains("already exists") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool, OrchestratorError> {
        let output = self
            .checked("images", strings(["images", "-q", image]), None, self.command_timeout)
            .await?;
        Ok(!output.stdout.trim().is_empty())
    }

    #[cfg_attr(feature = "telemetry", instrument(skip(self, definition)))]
    async fn build_image(&self, image: &str, definition: &str) -> Result<(), OrchestratorError> {
        self.checked(
            "build",
            strings(["build", "-t", image, "-"]),
            Some(definition.as_bytes()),
            self.build_timeout,
        )
        .await?;
        Ok(())
    }

    async fn find_container(&self, name: &str) -> Result<Option<ContainerInfo>, OrchestratorError> {
        let filter = format!("name=^{name}$");
        let output = self
            .checked(
                "ps",
                strings([
                    "ps",
                    "-a",
                    "--filter",
                    filter.as_str(),
                    "--format",
                    "{{.Names}}\t{{.State}}\t{{.Status}}",
                ]),
                None,
                self.command_timeout,
            )
            .await?;
        let containers = parse_container_lines("ps", &output.stdout)?;
        Ok(containers.into_iter().find(|c| c.name == name))
    }

    async fn run_detached(
        &self,
        env: &EnvironmentDescriptor,
        command: &[String],
    ) -> Result<(), OrchestratorError> {
        self.checked(
            "run",
            run_args(env, RunMode::Detached, command),
            None,
            self.command_timeout,
        )
        .await?;
        Ok(())
    }

    #[cfg_attr(feature = "telemetry", instrument(skip(self, env, command), fields(env = %env.name)))]
    async fn run_once(
        &self,
        env: &EnvironmentDescriptor,
        command: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, OrchestratorError> {
        let output = self
            .invoke("run", run_args(env, RunMode::OneShot, command), None, timeout)
            .await?;
        if output.timed_out {
            // Killing the CLI does not stop the container.
            if let Err(e) = self.remove(&env.name).await {
                warn!(env = %env.name, error = %e, "Failed to remove timed-out job container");
            }
        } else if output.exit_code == Some(125) {
            return Err(OrchestratorError::runtime("run", output.failure_text()));
        }
        Ok(output)
    }

    async fn exec(
        &self,
        name: &str,
        command: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, OrchestratorError> {
        let mut args = strings(["exec", name]);
        args.extend(command.iter().cloned());
        let output = self.invoke("exec", args, None, timeout).await?;
        if !output.timed_out && !output.success() {
            if let Some(message) = daemon_error(&output) {
                return Err(OrchestratorError::runtime("exec", message));
            }
        }
        Ok(output)
    }

    async fn start(&self, name: &str) -> Result<(), OrchestratorError> {
        self.checked("start", strings(["start", name]), None, self.command_timeout)
            .await?;
        Ok(())
    }

    async fn stop(&self, name: &str, grace: Duration) -> Result<(), OrchestratorError> {
        let seconds = grace.as_secs().max(1).to_string();
        let args = strings(["stop", "--time", seconds.as_str(), name]);
        match self.checked("stop", args, None, self.command_timeout + grace).await {
            Ok(_) => Ok(()),
            Err(OrchestratorError::Runtime { message, .. }) if message.contains("No such container") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn remove(&self, name: &str) -> Result<(), OrchestratorError> {
        match self
            .checked("rm", strings(["rm", "-f", name]), None, self.command_timeout)
            .await
        {
            Ok(_) => Ok(()),
            Err(OrchestratorError::Runtime { message, .. }) if message.contains("No such container") => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrate::types::{EnvironmentKind, Mount, ResourceLimits};
    use std::collections::BTreeMap;

    fn descriptor() -> EnvironmentDescriptor {
        let mut labels = BTreeMap::new();
        labels.insert("foreman.job".to_string(), "PROJ-1".to_string());
        EnvironmentDescriptor {
            name: "foreman-job-proj-1-abcd1234".to_string(),
            kind: EnvironmentKind::Job,
            image: "foreman-base:latest".to_string(),
            network: "foreman".to_string(),
            limits: ResourceLimits::default(),
            mounts: vec![
                Mount::read_write("/var/cache/foreman", "/cache"),
                Mount::read_only("/home/me/.gitconfig", "/root/.gitconfig"),
            ],
            labels,
            workdir: Some("/workspace".to_string()),
        }
    }

    #[test]
    fn test_run_args_one_shot() {
        let command = vec!["sh".to_string(), "-c".to_string(), "true".to_string()];
        let args = run_args(&descriptor(), RunMode::OneShot, &command);

        assert_eq!(args[0], "run");
        assert_eq!(args[1], "--rm");
        let joined = args.join(" ");
        assert!(joined.contains("--name foreman-job-proj-1-abcd1234"));
        assert!(joined.contains("--cpus 2 --memory 4g"));
        assert!(joined.contains("--label foreman.kind=job"));
        assert!(joined.contains("--label foreman.job=PROJ-1"));
        assert!(joined.contains("-v /var/cache/foreman:/cache "));
        assert!(joined.contains("-v /home/me/.gitconfig:/root/.gitconfig:ro"));
        assert!(joined.ends_with("-w /workspace foreman-base:latest sh -c true"));
    }

    #[test]
    fn test_run_args_detached() {
        let args = run_args(&descriptor(), RunMode::Detached, &[]);
        assert_eq!(args[1], "-d");
        assert!(!args.contains(&"--rm".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("foreman-base:latest"));
    }

    #[test]
    fn test_parse_container_lines() {
        let parsed = parse_container_lines(
            "ps",
            "foreman-warm\trunning\tUp 3 hours\nold\texited\tExited (0) 2 days ago\n\n",
        )
        .unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parsed[0].is_running());
        assert_eq!(parsed[1].state, "exited");
        assert!(!parsed[1].is_running());
    }

    #[test]
    fn test_parse_container_lines_malformed() {
        let err = parse_container_lines("ps", "just-a-name\n").unwrap_err();
        assert!(matches!(err, OrchestratorError::Malformed { .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn test_daemon_error_detection() {
        let missing = CommandOutput {
            exit_code: Some(1),
            stderr: "Error response from daemon: No such container: foreman-warm".to_string(),
            ..Default::default()
        };
        assert!(daemon_error(&missing).is_some());

        let absent = CommandOutput {
            exit_code: Some(1),
            ..Default::default()
        };
        assert!(daemon_error(&absent).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let cli = DockerCli::new(
            "foreman-no-such-runtime",
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let err = cli.network_exists("foreman").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Spawn(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_returns_command_status() {
        // `true` stands in for the runtime and ignores its arguments.
        let cli = DockerCli::new("true", Duration::from_secs(5), Duration::from_secs(5));
        let output = cli
            .exec("foreman-warm", &strings(["test", "-e", "/x"]), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(output.success());
    }
}
