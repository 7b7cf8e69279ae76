//! Short-lived, resource-bounded container sandboxes for running generated code.
//!
//! Profiles describe an image and the resource envelope of containers built
//! from it. A [`SandboxManager`] builds profile images on demand and creates
//! [`Sandbox`] instances; each sandbox owns one container, accepts files,
//! runs shell commands with stdin and a wall-clock deadline, and hands files
//! back.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     SandboxManager                       │
//! │  profiles (SandboxConfig)   ImageManager (per-tag lock)  │
//! └──────────────┬──────────────────────────┬────────────────┘
//!                │ create()                 │ ensure()
//!                ▼                          ▼
//! ┌─────────────────────────┐   ┌─────────────────────────────┐
//! │ Sandbox                 │   │ DaemonApi (Arc<dyn ..>)     │
//! │ NotStarted → Running    │──▶│  DockerDaemon: bollard +    │
//! │          → Stopped      │   │  hijacked exec stream       │
//! └─────────────────────────┘   └─────────────────────────────┘
//!                │ exec()
//!                ▼
//!   DaemonService::exec_command ─▶ io pump ─▶ StreamParser
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use agentic_sandbox::{ExecOptions, SandboxConfig, SandboxFile, SandboxManager};
//!
//! # async fn example() -> agentic_sandbox::Result<()> {
//! let mut manager = SandboxManager::connect(SandboxConfig::from_env()?)?;
//! manager.register_default_profiles();
//!
//! let result = manager
//!     .run_ephemeral(
//!         "data-science",
//!         "python3 main.py",
//!         &[SandboxFile::new("main.py", "print(sum(range(10)))")],
//!         ExecOptions::new(),
//!     )
//!     .await?;
//! println!("{}", result.stdout_text());
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod image;
pub mod manager;
pub mod retry;
pub mod session;
pub mod stream;

pub use archive::{
    SandboxFile, archive_local_files, create_archive, extract_file, read_local_files,
};
pub use config::{EffectiveLimits, Profile, ResourceLimits, SandboxConfig};
pub use daemon::{DaemonApi, DaemonService, DockerDaemon, ExecutionResult};
pub use error::{Result, SandboxError};
pub use image::{ImageManager, generate_dockerfile};
pub use manager::{DATA_SCIENCE_PROFILE, SandboxManager, default_profiles};
pub use retry::RetryPolicy;
pub use session::{ExecOptions, Sandbox, SandboxState};
pub use stream::StreamParser;
