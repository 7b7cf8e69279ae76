//! Entry point for callers: profile registry, image assurance and sandbox
//! creation over one shared daemon client.

use std::sync::Arc;

use tracing::{debug, info};

use crate::archive::SandboxFile;
use crate::config::{Profile, ResourceLimits, SandboxConfig};
use crate::daemon::{DaemonApi, DaemonService, DockerDaemon, ExecutionResult};
use crate::error::Result;
use crate::image::ImageManager;
use crate::session::{ExecOptions, Sandbox};

/// Name of the profile seeded by [`SandboxManager::register_default_profiles`].
pub const DATA_SCIENCE_PROFILE: &str = "data-science";

/// Profiles every manager can offer without a profiles file.
pub fn default_profiles() -> Vec<Profile> {
    vec![
        Profile::new(
            DATA_SCIENCE_PROFILE,
            "agentic-sandbox/data-science:latest",
            "python:3.12-slim",
        )
        .with_python_packages([
            "numpy",
            "pandas",
            "scipy",
            "matplotlib",
            "seaborn",
            "scikit-learn",
        ])
        .with_user("sandbox")
        .with_network_disabled(true)
        .with_env("MPLBACKEND", "Agg")
        .with_limits(ResourceLimits {
            memory_mb: Some(512),
            cpu_time_secs: Some(30),
            ..Default::default()
        }),
    ]
}

/// Creates sandboxes from registered profiles.
///
/// Holds the one daemon client of the process; every sandbox it creates
/// shares it.
pub struct SandboxManager {
    config: SandboxConfig,
    daemon: Arc<DaemonService>,
    images: ImageManager,
}

impl SandboxManager {
    pub fn new(config: SandboxConfig, api: Arc<dyn DaemonApi>) -> Self {
        let images = ImageManager::new(Arc::clone(&api), config.workdir.clone());
        let daemon = Arc::new(DaemonService::new(api, config.session_ttl));
        Self {
            config,
            daemon,
            images,
        }
    }

    /// Connect to the Docker daemon named in `config`.
    pub fn connect(config: SandboxConfig) -> Result<Self> {
        let docker = DockerDaemon::connect(&config)?;
        Ok(Self::new(config, Arc::new(docker)))
    }

    /// Register [`default_profiles`], keeping any profile already registered
    /// under the same name.
    pub fn register_default_profiles(&mut self) {
        for profile in default_profiles() {
            if self.config.get_profile(&profile.name).is_err() {
                debug!(profile = %profile.name, "Registering default profile");
                self.config.add_profile(profile);
            }
        }
    }

    pub fn add_profile(&mut self, profile: Profile) {
        self.config.add_profile(profile);
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Check that the daemon is reachable.
    pub async fn ping(&self) -> Result<()> {
        self.daemon.ping().await
    }

    /// Build the image for a profile, or reuse it unless `force` is set.
    pub async fn build(&self, profile_name: &str, force: bool) -> Result<String> {
        let profile = self.config.get_profile(profile_name)?;
        self.images.ensure(&profile, force).await
    }

    /// Ensure the profile's image and return a sandbox that is not started yet.
    pub async fn create(&self, profile_name: &str) -> Result<Sandbox> {
        let profile = self.config.get_profile(profile_name)?;
        self.images.ensure(&profile, false).await?;
        Ok(Sandbox::new(profile, Arc::clone(&self.daemon), &self.config))
    }

    /// Run one command in a throwaway sandbox: start, write `files`, exec,
    /// then stop whatever happened.
    pub async fn run_ephemeral(
        &self,
        profile_name: &str,
        command: &str,
        files: &[SandboxFile],
        options: ExecOptions,
    ) -> Result<ExecutionResult> {
        let mut sandbox = self.create(profile_name).await?;
        info!(sandbox = %sandbox.name(), profile = %profile_name, "Running ephemeral command");

        sandbox
            .scoped(async |sb: &mut Sandbox| {
                if !files.is_empty() {
                    sb.write_files(files).await?;
                }
                sb.exec(command, options).await
            })
            .await
    }
}
