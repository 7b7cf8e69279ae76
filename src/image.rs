//! Image assurance: build-or-reuse the image tagged for a profile.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::archive::{SandboxFile, create_archive};
use crate::config::Profile;
use crate::daemon::DaemonApi;
use crate::error::{Result, SandboxError};

/// Render the Dockerfile for a profile.
///
/// Steps always appear in the same order so identical profiles produce
/// identical recipes.
pub fn generate_dockerfile(profile: &Profile, workdir: &str) -> String {
    let user = &profile.user;
    let mut lines = vec![format!("FROM {}", profile.base_image)];

    if profile.is_non_root() {
        lines.push(format!("RUN groupadd -r {user} && useradd -r -g {user} {user}"));
    }

    if !profile.system_packages.is_empty() {
        lines.push(format!(
            "RUN apt-get update && apt-get install -y --no-install-recommends {} \
             && rm -rf /var/lib/apt/lists/*",
            profile.system_packages.join(" ")
        ));
    }

    if !profile.python_packages.is_empty() {
        lines.push(format!(
            "RUN pip install --no-cache-dir {}",
            profile.python_packages.join(" ")
        ));
    }

    lines.push(format!("WORKDIR {}", workdir));

    if profile.is_non_root() {
        lines.push(format!("RUN chown -R {user}:{user} {workdir}"));
        lines.push(format!("USER {user}"));
    }

    lines.push(r#"CMD ["python3"]"#.to_string());
    lines.join("\n")
}

/// Ensures profile images exist, building them on first use.
///
/// Builds of the same tag are serialized: a caller that waited for another
/// caller's build re-checks the daemon and reuses the result.
pub struct ImageManager {
    api: Arc<dyn DaemonApi>,
    workdir: String,
    build_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ImageManager {
    pub fn new(api: Arc<dyn DaemonApi>, workdir: impl Into<String>) -> Self {
        Self {
            api,
            workdir: workdir.into(),
            build_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Return the profile's image tag, building the image if it is missing or
    /// `force_rebuild` is set.
    pub async fn ensure(&self, profile: &Profile, force_rebuild: bool) -> Result<String> {
        let tag = profile.image.as_str();

        if !force_rebuild && self.api.image_exists(tag).await? {
            debug!(tag = %tag, profile = %profile.name, "Image already exists");
            return Ok(tag.to_string());
        }

        let lock = self.build_lock(tag);
        let _guard = lock.lock().await;

        if !force_rebuild && self.api.image_exists(tag).await? {
            debug!(tag = %tag, profile = %profile.name, "Image built by a concurrent caller");
            return Ok(tag.to_string());
        }

        info!(tag = %tag, profile = %profile.name, "Building image");
        let dockerfile = generate_dockerfile(profile, &self.workdir);
        debug!(tag = %tag, dockerfile = %dockerfile, "Generated Dockerfile");

        let context = create_archive(&[SandboxFile::new("Dockerfile", dockerfile)])?;
        self.api
            .build_image(tag, context)
            .await
            .map_err(|e| match e {
                SandboxError::ImageBuild { .. } => e,
                other => SandboxError::ImageBuild {
                    tag: tag.to_string(),
                    reason: other.to_string(),
                },
            })?;

        info!(tag = %tag, "Build successful");
        Ok(tag.to_string())
    }

    fn build_lock(&self, tag: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .build_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(tag.to_string()).or_default())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_dockerfile_for_non_root_profile() {
        let profile = Profile::new("ds", "sandbox/ds:latest", "python:3.12-slim")
            .with_user("analyst")
            .with_system_packages(["libgomp1", "fonts-dejavu"])
            .with_python_packages(["numpy", "pandas"]);

        let expected = "\
FROM python:3.12-slim
RUN groupadd -r analyst && useradd -r -g analyst analyst
RUN apt-get update && apt-get install -y --no-install-recommends libgomp1 fonts-dejavu && rm -rf /var/lib/apt/lists/*
RUN pip install --no-cache-dir numpy pandas
WORKDIR /sandbox
RUN chown -R analyst:analyst /sandbox
USER analyst
CMD [\"python3\"]";
        assert_eq!(generate_dockerfile(&profile, "/sandbox"), expected);
    }

    #[test]
    fn test_dockerfile_for_root_profile_without_packages() {
        let profile = Profile::new("bare", "sandbox/bare:latest", "python:3.12-alpine");
        let expected = "FROM python:3.12-alpine\nWORKDIR /work\nCMD [\"python3\"]";
        assert_eq!(generate_dockerfile(&profile, "/work"), expected);
    }

    #[test]
    fn test_dockerfile_is_deterministic() {
        let profile = Profile::new("ds", "t", "python:3.12-slim")
            .with_python_packages(["scipy"])
            .with_user("u");
        assert_eq!(
            generate_dockerfile(&profile, "/sandbox"),
            generate_dockerfile(&profile.clone(), "/sandbox")
        );
    }
}
