//! Container daemon access.
//!
//! [`DaemonApi`] is the seam to the container daemon's control API;
//! [`DockerDaemon`] implements it with bollard plus a hijacked connection for
//! exec stdio. [`DaemonService`] layers sandbox semantics on top: spawning the
//! idle session container, running one command through the I/O pump, archive
//! transfer and best-effort teardown.

mod attach;
mod docker;
mod io_loop;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use attach::{AttachStream, AttachedExec, DaemonEndpoint, open_exec_stream};
pub use docker::DockerDaemon;
pub use io_loop::{Completion, ExecProbe, POLL_INTERVAL, PumpOutcome, pump};

use crate::config::{EffectiveLimits, Profile};
use crate::error::Result;

/// Identifies a container created for a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
}

/// A `setrlimit` applied inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ulimit {
    pub name: &'static str,
    pub soft: i64,
    pub hard: i64,
}

/// Everything needed to create a sandbox container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub user: String,
    pub workdir: String,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
    pub network_disabled: bool,
    pub read_only: bool,
    pub limits: EffectiveLimits,
    pub auto_remove: bool,
}

impl ContainerSpec {
    /// Spec for an idle session container that sleeps for `ttl`.
    pub fn for_profile(name: &str, profile: &Profile, workdir: &str, ttl: Duration) -> Self {
        Self {
            name: name.to_string(),
            image: profile.image.clone(),
            command: vec!["sleep".to_string(), ttl.as_secs().max(1).to_string()],
            user: profile.user.clone(),
            workdir: workdir.to_string(),
            env: env_pairs(&profile.environment),
            network_disabled: profile.network_disabled,
            read_only: profile.read_only,
            limits: profile.limits.resolve(),
            auto_remove: true,
        }
    }

    pub fn ulimits(&self) -> Vec<Ulimit> {
        let mut ulimits = Vec::new();
        if let Some(cpu) = self.limits.cpu_time_secs {
            let cpu = i64::try_from(cpu).unwrap_or(i64::MAX);
            ulimits.push(Ulimit {
                name: "cpu",
                soft: cpu,
                hard: cpu,
            });
        }
        if let Some(fsize) = self.limits.file_size_bytes {
            let fsize = i64::try_from(fsize).unwrap_or(i64::MAX);
            ulimits.push(Ulimit {
                name: "fsize",
                soft: fsize,
                hard: fsize,
            });
        }
        ulimits
    }
}

/// Command to run in an existing container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecStatus {
    pub running: bool,
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerStatus {
    pub running: bool,
    pub exit_code: Option<i64>,
    pub oom_killed: bool,
}

/// Control-API operations consumed by the sandbox.
#[async_trait]
pub trait DaemonApi: Send + Sync {
    /// Check that the daemon answers.
    async fn ping(&self) -> Result<()>;

    /// Whether an image with this tag exists locally.
    async fn image_exists(&self, tag: &str) -> Result<bool>;

    /// Build an image from a tar build context holding a `Dockerfile`.
    async fn build_image(&self, tag: &str, context: Vec<u8>) -> Result<()>;

    /// Create a container and return its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerStatus>;

    async fn kill_container(&self, id: &str) -> Result<()>;

    /// Force-remove a container. Removing a missing container succeeds.
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Create an exec instance attached to stdin, stdout and stderr.
    async fn create_exec(&self, container_id: &str, spec: &ExecSpec) -> Result<String>;

    /// Start an exec instance and return its raw multiplexed stream.
    async fn start_exec(&self, exec_id: &str) -> Result<AttachedExec>;

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecStatus>;

    /// Extract a tar archive into `path` inside the container.
    async fn put_archive(&self, container_id: &str, path: &str, archive: Vec<u8>) -> Result<()>;

    /// Fetch `path` from the container as a tar archive.
    async fn get_archive(&self, container_id: &str, path: &str) -> Result<Vec<u8>>;
}

/// Outcome of one command run inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Process exit code; `-1` when unknown or timed out.
    pub exit_code: i64,
    pub timed_out: bool,
    pub oom_killed: bool,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Exited normally with status 0.
    pub fn success(&self) -> bool {
        !self.timed_out && !self.oom_killed && self.exit_code == 0
    }
}

/// Exit status polls after the stream closes, for daemons that report the exec
/// as running for a moment after its output ends.
const EXIT_STATUS_POLLS: u32 = 20;
const EXIT_STATUS_POLL_DELAY: Duration = Duration::from_millis(25);

struct ExecLiveness<'a> {
    api: &'a dyn DaemonApi,
    exec_id: &'a str,
}

#[async_trait]
impl ExecProbe for ExecLiveness<'_> {
    async fn is_running(&self) -> Result<bool> {
        Ok(self.api.inspect_exec(self.exec_id).await?.running)
    }
}

/// Sandbox-level operations over a shared [`DaemonApi`].
pub struct DaemonService {
    api: Arc<dyn DaemonApi>,
    session_ttl: Duration,
}

impl DaemonService {
    pub fn new(api: Arc<dyn DaemonApi>, session_ttl: Duration) -> Self {
        Self { api, session_ttl }
    }

    pub async fn ping(&self) -> Result<()> {
        self.api.ping().await
    }

    /// Create and start an idle container for a sandbox session.
    pub async fn spawn_container(
        &self,
        name: &str,
        profile: &Profile,
        workdir: &str,
    ) -> Result<ContainerHandle> {
        let spec = ContainerSpec::for_profile(name, profile, workdir, self.session_ttl);
        info!(
            container = %name,
            image = %spec.image,
            user = %spec.user,
            memory_bytes = spec.limits.memory_bytes,
            pids_limit = spec.limits.pids_limit,
            network_disabled = spec.network_disabled,
            read_only = spec.read_only,
            "Creating sandbox container"
        );

        let id = self.api.create_container(&spec).await?;
        let handle = ContainerHandle {
            id,
            name: name.to_string(),
        };

        if let Err(e) = self.api.start_container(&handle.id).await {
            self.remove_container(&handle).await;
            return Err(e);
        }

        debug!(container = %name, id = %handle.id, "Sandbox container started");
        Ok(handle)
    }

    /// Run a command in the container, streaming stdin and collecting output
    /// until it finishes or `timeout` elapses.
    ///
    /// On timeout the container is killed and removed, and the output read so
    /// far is returned with `timed_out` set.
    pub async fn exec_command(
        &self,
        handle: &ContainerHandle,
        cmd: Vec<String>,
        stdin: Option<&[u8]>,
        timeout: Duration,
        env: &BTreeMap<String, String>,
    ) -> Result<ExecutionResult> {
        let spec = ExecSpec {
            cmd,
            env: env_pairs(env),
        };
        let exec_id = self.api.create_exec(&handle.id, &spec).await?;
        let AttachedExec { mut stream, prefix } = self.api.start_exec(&exec_id).await?;

        let stdin = stdin.unwrap_or_default();
        debug!(
            container = %handle.name,
            exec = %exec_id,
            stdin_bytes = stdin.len(),
            timeout_ms = timeout.as_millis() as u64,
            "Attached to exec instance"
        );

        let started = Instant::now();
        let probe = ExecLiveness {
            api: self.api.as_ref(),
            exec_id: &exec_id,
        };
        let outcome = pump(&mut stream, &prefix, stdin, started + timeout, &probe).await;
        drop(stream);
        let duration = started.elapsed();

        let completion = outcome.completion;
        let (stdout, stderr) = outcome.parser.into_output();

        if completion == Completion::TimedOut {
            warn!(container = %handle.name, ?timeout, "Timeout reached, killing container");
            self.kill_container(handle).await;
            return Ok(ExecutionResult {
                stdout,
                stderr,
                exit_code: -1,
                timed_out: true,
                oom_killed: false,
                duration,
            });
        }

        let exit_code = self.final_exit_code(&exec_id).await;
        let oom_killed = match self.api.inspect_container(&handle.id).await {
            Ok(status) => status.oom_killed,
            Err(e) => {
                debug!(container = %handle.name, error = %e, "Could not inspect container state");
                false
            }
        };

        info!(
            container = %handle.name,
            exit_code,
            oom_killed,
            ?completion,
            duration_ms = duration.as_millis() as u64,
            "Command finished"
        );

        Ok(ExecutionResult {
            stdout,
            stderr,
            exit_code,
            timed_out: false,
            oom_killed,
            duration,
        })
    }

    async fn final_exit_code(&self, exec_id: &str) -> i64 {
        for _ in 0..EXIT_STATUS_POLLS {
            match self.api.inspect_exec(exec_id).await {
                Ok(ExecStatus {
                    running: false,
                    exit_code,
                }) => return exit_code.unwrap_or(-1),
                Ok(_) => tokio::time::sleep(EXIT_STATUS_POLL_DELAY).await,
                Err(e) => {
                    debug!(exec = %exec_id, error = %e, "Could not inspect exec instance");
                    return -1;
                }
            }
        }
        -1
    }

    /// Extract a tar archive into `path` inside the container.
    pub async fn copy_to(
        &self,
        handle: &ContainerHandle,
        path: &str,
        archive: Vec<u8>,
    ) -> Result<()> {
        debug!(
            container = %handle.name,
            path = %path,
            bytes = archive.len(),
            "Copying archive into container"
        );
        self.api.put_archive(&handle.id, path, archive).await
    }

    /// Fetch `path` from the container as a tar archive.
    pub async fn copy_from(&self, handle: &ContainerHandle, path: &str) -> Result<Vec<u8>> {
        debug!(container = %handle.name, path = %path, "Copying archive out of container");
        self.api.get_archive(&handle.id, path).await
    }

    /// Kill then remove, ignoring failures of either step.
    async fn kill_container(&self, handle: &ContainerHandle) {
        if let Err(e) = self.api.kill_container(&handle.id).await {
            debug!(container = %handle.name, error = %e, "Kill failed");
        }
        self.remove_container(handle).await;
    }

    /// Force-remove the container. Failures are logged, never returned.
    pub async fn remove_container(&self, handle: &ContainerHandle) {
        match self.api.remove_container(&handle.id).await {
            Ok(()) => debug!(container = %handle.name, "Sandbox container removed"),
            Err(e) => {
                warn!(container = %handle.name, error = %e, "Failed to remove sandbox container")
            }
        }
    }
}

fn env_pairs(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::ResourceLimits;

    fn profile() -> Profile {
        Profile::new("ds", "sandbox/ds:latest", "python:3.12-slim")
            .with_user("analyst")
            .with_read_only(true)
            .with_env("MPLBACKEND", "Agg")
            .with_env("LANG", "C.UTF-8")
            .with_limits(ResourceLimits {
                memory_mb: Some(256),
                cpu_time_secs: Some(3),
                file_size_bytes: Some(1 << 20),
                ..Default::default()
            })
    }

    #[test]
    fn test_container_spec_from_profile() {
        let spec = ContainerSpec::for_profile(
            "agentic-sandbox-1",
            &profile(),
            "/sandbox",
            Duration::from_secs(900),
        );
        assert_eq!(spec.image, "sandbox/ds:latest");
        assert_eq!(spec.command, vec!["sleep", "900"]);
        assert_eq!(spec.user, "analyst");
        assert_eq!(spec.workdir, "/sandbox");
        assert_eq!(spec.env, vec!["LANG=C.UTF-8", "MPLBACKEND=Agg"]);
        assert!(spec.network_disabled);
        assert!(spec.read_only);
        assert!(spec.auto_remove);
        assert_eq!(spec.limits.memory_bytes, 256 * 1024 * 1024);
        assert_eq!(spec.limits.memory_swap_bytes, spec.limits.memory_bytes);
    }

    #[test]
    fn test_ulimits_only_when_declared() {
        let spec = ContainerSpec::for_profile("n", &profile(), "/sandbox", Duration::from_secs(60));
        assert_eq!(
            spec.ulimits(),
            vec![
                Ulimit {
                    name: "cpu",
                    soft: 3,
                    hard: 3
                },
                Ulimit {
                    name: "fsize",
                    soft: 1 << 20,
                    hard: 1 << 20
                },
            ]
        );

        let bare = Profile::new("b", "b:1", "debian:bookworm-slim");
        let spec = ContainerSpec::for_profile("n", &bare, "/sandbox", Duration::from_secs(60));
        assert!(spec.ulimits().is_empty());
    }

    #[test]
    fn test_execution_result_text_and_success() {
        let result = ExecutionResult {
            stdout: b"ok \xf0\x9f\x93\x8a\n".to_vec(),
            stderr: vec![0xff],
            exit_code: 0,
            timed_out: false,
            oom_killed: false,
            duration: Duration::from_millis(5),
        };
        assert_eq!(result.stdout_text(), "ok 📊\n");
        assert_eq!(result.stderr_text(), "\u{fffd}");
        assert!(result.success());

        let oom = ExecutionResult {
            exit_code: 137,
            oom_killed: true,
            ..result
        };
        assert!(!oom.success());
    }
}
