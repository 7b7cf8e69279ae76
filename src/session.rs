//! Per-instance sandbox lifecycle.
//!
//! ```text
//! NotStarted --start()--> Running --stop()--> Stopped
//!      |                                         ^
//!      +------------------stop()-----------------+
//! ```
//!
//! A sandbox is never reused once stopped. A command that times out destroys
//! the container, which also moves the sandbox to `Stopped`.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Component, Path};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::archive::{SandboxFile, create_archive, extract_file};
use crate::config::{Profile, SandboxConfig};
use crate::daemon::{ContainerHandle, DaemonService, ExecutionResult};
use crate::error::{Result, SandboxError};

/// Lifecycle state of a [`Sandbox`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    NotStarted,
    Running,
    Stopped,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not started"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Per-call options for [`Sandbox::exec`].
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub stdin: Option<Vec<u8>>,
    /// Overrides the profile's wall-clock limit and the configured default.
    pub timeout: Option<Duration>,
    pub env: BTreeMap<String, String>,
}

impl ExecOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// One isolated container bound to a profile.
pub struct Sandbox {
    id: Uuid,
    name: String,
    profile: Arc<Profile>,
    daemon: Arc<DaemonService>,
    workdir: String,
    default_timeout: Duration,
    state: SandboxState,
    container: Option<ContainerHandle>,
}

impl Sandbox {
    /// Create a sandbox that has not been started yet.
    pub fn new(profile: Arc<Profile>, daemon: Arc<DaemonService>, config: &SandboxConfig) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            name: format!("{}{}", config.name_prefix, id),
            profile,
            daemon,
            workdir: config.workdir.clone(),
            default_timeout: config.default_timeout,
            state: SandboxState::NotStarted,
            container: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Container name, unique per sandbox.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    pub fn workdir(&self) -> &str {
        &self.workdir
    }

    /// Handle of the live container, if running.
    pub fn container(&self) -> Option<&ContainerHandle> {
        self.container.as_ref()
    }

    /// Create and start the sandbox container.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != SandboxState::NotStarted {
            return Err(SandboxError::AlreadyStarted { state: self.state });
        }
        let handle = self
            .daemon
            .spawn_container(&self.name, &self.profile, &self.workdir)
            .await?;
        info!(sandbox = %self.name, profile = %self.profile.name, "Sandbox started");
        self.container = Some(handle);
        self.state = SandboxState::Running;
        Ok(())
    }

    fn running_handle(&self) -> Result<&ContainerHandle> {
        match (&self.state, &self.container) {
            (SandboxState::Running, Some(handle)) => Ok(handle),
            _ => Err(SandboxError::NotRunning { state: self.state }),
        }
    }

    /// Write files into the working directory in one archive transfer.
    pub async fn write_files(&self, files: &[SandboxFile]) -> Result<()> {
        let handle = self.running_handle()?;
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        let archive = create_archive(files)?;
        self.daemon.copy_to(handle, &self.workdir, archive).await?;
        debug!(sandbox = %self.name, files = ?names, "Wrote files to working directory");
        Ok(())
    }

    /// Run `command` through `/bin/sh -c`.
    ///
    /// The timeout is taken from `options`, then the profile's wall-clock
    /// limit, then the configured default.
    pub async fn exec(&mut self, command: &str, options: ExecOptions) -> Result<ExecutionResult> {
        let handle = self.running_handle()?.clone();
        let timeout = options
            .timeout
            .or(self.profile.limits.resolve().wall_clock)
            .unwrap_or(self.default_timeout);
        let cmd = vec!["/bin/sh".to_string(), "-c".to_string(), command.to_string()];

        let result = self
            .daemon
            .exec_command(&handle, cmd, options.stdin.as_deref(), timeout, &options.env)
            .await?;

        if result.timed_out {
            // The container was destroyed with the timed-out process.
            self.container = None;
            self.state = SandboxState::Stopped;
        }
        Ok(result)
    }

    /// Read one file, relative to the working directory.
    pub async fn read_file(&self, relative_path: &str) -> Result<Vec<u8>> {
        let handle = self.running_handle()?;
        let root = Path::new(&self.workdir)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let Some(entry) = archive_entry_name(&root, relative_path) else {
            return Err(SandboxError::FileNotFoundInArchive {
                path: relative_path.to_string(),
            });
        };

        let archive = self.daemon.copy_from(handle, &self.workdir).await?;
        extract_file(&archive, &entry).map_err(|e| match e {
            SandboxError::FileNotFoundInArchive { .. } => SandboxError::FileNotFoundInArchive {
                path: relative_path.to_string(),
            },
            other => other,
        })
    }

    /// Remove the container. Idempotent and infallible.
    pub async fn stop(&mut self) {
        if self.state == SandboxState::Stopped {
            return;
        }
        if let Some(handle) = self.container.take() {
            self.daemon.remove_container(&handle).await;
            info!(sandbox = %self.name, "Sandbox stopped");
        }
        self.state = SandboxState::Stopped;
    }

    /// Start the sandbox, run `body`, then stop it on every exit path,
    /// including errors and panics inside `body`.
    pub async fn scoped<T, F>(&mut self, body: F) -> Result<T>
    where
        F: AsyncFnOnce(&mut Sandbox) -> Result<T>,
    {
        self.start().await?;
        let outcome = AssertUnwindSafe(body(&mut *self)).catch_unwind().await;
        self.stop().await;
        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("name", &self.name)
            .field("profile", &self.profile.name)
            .field("state", &self.state)
            .field("container", &self.container)
            .finish()
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let Some(handle) = self.container.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(sandbox = %self.name, "Sandbox dropped while running, removing container");
                let daemon = Arc::clone(&self.daemon);
                runtime.spawn(async move {
                    daemon.remove_container(&handle).await;
                });
            }
            Err(_) => {
                warn!(
                    sandbox = %self.name,
                    container = %handle.id,
                    "Sandbox dropped outside a runtime, container left behind"
                );
            }
        }
    }
}

/// Archive entry for `relative_path` inside a directory archive rooted at
/// `root`. `None` unless the path names something below the working directory.
fn archive_entry_name(root: &str, relative_path: &str) -> Option<String> {
    let mut parts = Vec::new();
    for component in Path::new(relative_path).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    // The archive of a directory is rooted at the directory's own name.
    if !root.is_empty() {
        parts.insert(0, root.to_string());
    }
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::daemon::{
        AttachedExec, ContainerSpec, ContainerStatus, DaemonApi, ExecSpec, ExecStatus,
    };

    /// Daemon whose every call fails; state checks must reject calls first.
    struct Offline;

    fn offline<T>(operation: &'static str) -> Result<T> {
        Err(SandboxError::daemon(operation, "daemon offline"))
    }

    #[async_trait]
    impl DaemonApi for Offline {
        async fn ping(&self) -> Result<()> {
            offline("ping")
        }
        async fn image_exists(&self, _tag: &str) -> Result<bool> {
            offline("inspect_image")
        }
        async fn build_image(&self, _tag: &str, _context: Vec<u8>) -> Result<()> {
            offline("build_image")
        }
        async fn create_container(&self, _spec: &ContainerSpec) -> Result<String> {
            offline("create_container")
        }
        async fn start_container(&self, _id: &str) -> Result<()> {
            offline("start_container")
        }
        async fn inspect_container(&self, _id: &str) -> Result<ContainerStatus> {
            offline("inspect_container")
        }
        async fn kill_container(&self, _id: &str) -> Result<()> {
            offline("kill_container")
        }
        async fn remove_container(&self, _id: &str) -> Result<()> {
            offline("remove_container")
        }
        async fn create_exec(&self, _container_id: &str, _spec: &ExecSpec) -> Result<String> {
            offline("create_exec")
        }
        async fn start_exec(&self, _exec_id: &str) -> Result<AttachedExec> {
            offline("start_exec")
        }
        async fn inspect_exec(&self, _exec_id: &str) -> Result<ExecStatus> {
            offline("inspect_exec")
        }
        async fn put_archive(&self, _id: &str, _path: &str, _archive: Vec<u8>) -> Result<()> {
            offline("put_archive")
        }
        async fn get_archive(&self, _id: &str, _path: &str) -> Result<Vec<u8>> {
            offline("get_archive")
        }
    }

    fn sandbox() -> Sandbox {
        let daemon = Arc::new(DaemonService::new(Arc::new(Offline), Duration::from_secs(60)));
        let profile = Arc::new(Profile::new("py", "sandbox/py:latest", "python:3.12-slim"));
        Sandbox::new(profile, daemon, &SandboxConfig::default())
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SandboxState::NotStarted.to_string(), "not started");
        assert_eq!(SandboxState::Running.to_string(), "running");
        assert_eq!(SandboxState::Stopped.to_string(), "stopped");
    }

    #[test]
    fn test_names_are_prefixed_and_unique() {
        let a = sandbox();
        let b = sandbox();
        assert!(a.name().starts_with("agentic-sandbox-"));
        assert!(a.name().ends_with(&a.id().to_string()));
        assert_ne!(a.name(), b.name());
        assert_eq!(a.state(), SandboxState::NotStarted);
        assert_eq!(a.workdir(), "/sandbox");
    }

    #[test]
    fn test_exec_options_builder() {
        let options = ExecOptions::new()
            .stdin("1 2 3")
            .timeout(Duration::from_secs(2))
            .env("LANG", "C.UTF-8");
        assert_eq!(options.stdin.as_deref(), Some(&b"1 2 3"[..]));
        assert_eq!(options.timeout, Some(Duration::from_secs(2)));
        assert_eq!(options.env.get("LANG").map(String::as_str), Some("C.UTF-8"));
    }

    #[test]
    fn test_archive_entry_name_normalizes_separators() {
        assert_eq!(archive_entry_name("sandbox", "a.txt").as_deref(), Some("sandbox/a.txt"));
        assert_eq!(archive_entry_name("sandbox", "a//b").as_deref(), Some("sandbox/a/b"));
        assert_eq!(archive_entry_name("sandbox", "./a/./b").as_deref(), Some("sandbox/a/b"));
        assert_eq!(archive_entry_name("", "a/b/").as_deref(), Some("a/b"));
    }

    #[test]
    fn test_archive_entry_name_rejects_paths_outside_workdir() {
        assert_eq!(archive_entry_name("sandbox", ""), None);
        assert_eq!(archive_entry_name("sandbox", "."), None);
        assert_eq!(archive_entry_name("sandbox", "../etc/passwd"), None);
        assert_eq!(archive_entry_name("sandbox", "/etc/passwd"), None);
        assert_eq!(archive_entry_name("sandbox", "a/../b"), None);
    }

    #[tokio::test]
    async fn test_operations_require_running() {
        let mut sandbox = sandbox();
        let err = sandbox.exec("true", ExecOptions::new()).await.unwrap_err();
        assert!(matches!(err, SandboxError::NotRunning { state: SandboxState::NotStarted }));

        let err = sandbox.write_files(&[SandboxFile::new("a.txt", "a")]).await.unwrap_err();
        assert!(matches!(err, SandboxError::NotRunning { .. }));

        let err = sandbox.read_file("a.txt").await.unwrap_err();
        assert!(matches!(err, SandboxError::NotRunning { .. }));
    }

    #[tokio::test]
    async fn test_ping_reports_unreachable_daemon() {
        let daemon = DaemonService::new(Arc::new(Offline), Duration::from_secs(60));
        let err = daemon.ping().await.unwrap_err();
        assert!(matches!(err, SandboxError::DaemonOperation { operation: "ping", .. }));
    }

    #[tokio::test]
    async fn test_failed_start_leaves_sandbox_startable() {
        let mut sandbox = sandbox();
        let err = sandbox.start().await.unwrap_err();
        assert!(matches!(err, SandboxError::DaemonOperation { operation: "create_container", .. }));
        assert_eq!(sandbox.state(), SandboxState::NotStarted);
        assert!(sandbox.container().is_none());
    }

    #[tokio::test]
    async fn test_stop_before_start_is_terminal() {
        let mut sandbox = sandbox();
        sandbox.stop().await;
        assert_eq!(sandbox.state(), SandboxState::Stopped);
        sandbox.stop().await;
        assert_eq!(sandbox.state(), SandboxState::Stopped);

        let err = sandbox.start().await.unwrap_err();
        assert!(matches!(err, SandboxError::AlreadyStarted { state: SandboxState::Stopped }));
    }

    #[tokio::test]
    async fn test_scoped_propagates_start_failure() {
        let mut sandbox = sandbox();
        let mut ran = false;
        let result = sandbox
            .scoped(async |_sb: &mut Sandbox| {
                ran = true;
                Ok(())
            })
            .await;
        assert!(result.is_err());
        assert!(!ran);
    }
}
