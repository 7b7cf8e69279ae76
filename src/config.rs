//! Sandbox configuration: profiles, resource envelopes and daemon settings.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Result, SandboxError};
use crate::retry::RetryPolicy;

/// User that needs no account setup in generated images.
pub const ROOT_USER: &str = "root";

/// Default memory limit when a profile declares none.
pub const DEFAULT_MEMORY_MB: u64 = 64;
/// Default CFS scheduler period in microseconds.
pub const DEFAULT_CPU_PERIOD: i64 = 100_000;
/// Default CFS quota in microseconds per period (one full CPU).
pub const DEFAULT_CPU_QUOTA: i64 = 100_000;
/// Default maximum number of processes inside a container.
pub const DEFAULT_PIDS_LIMIT: i64 = 100;
/// Wall-clock allowance per second of CPU time when only CPU time is declared.
pub const CPU_TO_REAL_TIME_FACTOR: u64 = 5;

const DEFAULT_DAEMON_URL: &str = "unix:///var/run/docker.sock";

/// Resource envelope declared by a profile.
///
/// Every field is optional; [`ResourceLimits::resolve`] fills the gaps with
/// the documented defaults so a container never runs without limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Memory limit in MiB. Swap is capped to the same value.
    pub memory_mb: Option<u64>,
    /// CFS period in microseconds.
    pub cpu_period: Option<i64>,
    /// CFS quota in microseconds per period.
    pub cpu_quota: Option<i64>,
    /// Maximum number of processes.
    pub pids_limit: Option<i64>,
    /// `RLIMIT_CPU` in seconds.
    pub cpu_time_secs: Option<u64>,
    /// `RLIMIT_FSIZE` in bytes.
    pub file_size_bytes: Option<u64>,
    /// Default wall-clock limit for commands run under this profile.
    pub wall_clock_secs: Option<u64>,
}

/// Limits after merging with defaults; what actually gets applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveLimits {
    pub memory_bytes: i64,
    pub memory_swap_bytes: i64,
    pub cpu_period: i64,
    pub cpu_quota: i64,
    pub pids_limit: i64,
    pub cpu_time_secs: Option<u64>,
    pub file_size_bytes: Option<u64>,
    pub wall_clock: Option<Duration>,
}

impl ResourceLimits {
    /// Merge declared values with defaults.
    pub fn resolve(&self) -> EffectiveLimits {
        let memory_mb = self.memory_mb.unwrap_or(DEFAULT_MEMORY_MB);
        let memory_bytes = i64::try_from(memory_mb.saturating_mul(1024 * 1024)).unwrap_or(i64::MAX);

        let wall_clock = self
            .wall_clock_secs
            .or_else(|| {
                self.cpu_time_secs
                    .map(|cpu| cpu.saturating_mul(CPU_TO_REAL_TIME_FACTOR))
            })
            .map(Duration::from_secs);

        EffectiveLimits {
            memory_bytes,
            memory_swap_bytes: memory_bytes,
            cpu_period: self.cpu_period.unwrap_or(DEFAULT_CPU_PERIOD),
            cpu_quota: self.cpu_quota.unwrap_or(DEFAULT_CPU_QUOTA),
            pids_limit: self.pids_limit.unwrap_or(DEFAULT_PIDS_LIMIT),
            cpu_time_secs: self.cpu_time_secs,
            file_size_bytes: self.file_size_bytes,
            wall_clock,
        }
    }
}

/// An image template plus the resource envelope of containers built from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    /// Tag of the image built for this profile.
    pub image: String,
    pub base_image: String,
    #[serde(default)]
    pub system_packages: Vec<String>,
    #[serde(default)]
    pub python_packages: Vec<String>,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default = "default_network_disabled")]
    pub network_disabled: bool,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

fn default_user() -> String {
    ROOT_USER.to_string()
}

fn default_network_disabled() -> bool {
    true
}

impl Profile {
    /// Create a profile running as root with networking disabled and default limits.
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        base_image: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            base_image: base_image.into(),
            system_packages: Vec::new(),
            python_packages: Vec::new(),
            user: default_user(),
            read_only: false,
            network_disabled: default_network_disabled(),
            limits: ResourceLimits::default(),
            environment: BTreeMap::new(),
        }
    }

    pub fn with_system_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.system_packages = packages.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_python_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.python_packages = packages.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_network_disabled(mut self, disabled: bool) -> Self {
        self.network_disabled = disabled;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Whether containers for this profile run as an unprivileged user.
    pub fn is_non_root(&self) -> bool {
        self.user != ROOT_USER
    }
}

/// Global registry of profiles plus daemon connection settings.
///
/// Deserializes from the same keys as the struct fields. Durations are given
/// in seconds and `profiles` is a list in the profiles-file format.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Daemon endpoint, e.g. `unix:///var/run/docker.sock` or `tcp://host:2375`.
    pub daemon_url: String,
    /// Per-request timeout for control-API calls.
    #[serde(with = "duration_secs")]
    pub daemon_timeout: Duration,
    /// Wall-clock limit for commands when neither caller nor profile sets one.
    #[serde(with = "duration_secs")]
    pub default_timeout: Duration,
    /// Working directory inside every sandbox container.
    pub workdir: String,
    /// Prefix of generated container names.
    pub name_prefix: String,
    /// How long an idle sandbox container stays alive.
    #[serde(with = "duration_secs")]
    pub session_ttl: Duration,
    pub retry: RetryPolicy,
    #[serde(deserialize_with = "profile_list")]
    profiles: HashMap<String, Arc<Profile>>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            daemon_url: DEFAULT_DAEMON_URL.to_string(),
            daemon_timeout: Duration::from_secs(30),
            default_timeout: Duration::from_secs(10),
            workdir: "/sandbox".to_string(),
            name_prefix: "agentic-sandbox-".to_string(),
            session_ttl: Duration::from_secs(3600),
            retry: RetryPolicy::default(),
            profiles: HashMap::new(),
        }
    }
}

impl SandboxConfig {
    /// Build a configuration from the environment, loading `.env` first.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let daemon_url = lookup("SANDBOX_DAEMON_URL")
            .or_else(|| lookup("DOCKER_HOST"))
            .unwrap_or(defaults.daemon_url);

        let mut config = Self {
            daemon_url,
            daemon_timeout: secs_var(
                &lookup,
                "SANDBOX_DAEMON_TIMEOUT_SECS",
                defaults.daemon_timeout,
            )?,
            default_timeout: secs_var(
                &lookup,
                "SANDBOX_EXEC_TIMEOUT_SECS",
                defaults.default_timeout,
            )?,
            workdir: lookup("SANDBOX_WORKDIR").unwrap_or(defaults.workdir),
            name_prefix: lookup("SANDBOX_NAME_PREFIX").unwrap_or(defaults.name_prefix),
            session_ttl: secs_var(&lookup, "SANDBOX_SESSION_TTL_SECS", defaults.session_ttl)?,
            retry: defaults.retry,
            profiles: HashMap::new(),
        };

        if !config.workdir.starts_with('/') {
            return Err(SandboxError::config(
                "SANDBOX_WORKDIR",
                format!("'{}' must be an absolute path", config.workdir),
            ));
        }

        if let Some(path) = lookup("SANDBOX_PROFILES_FILE") {
            config.load_profiles_file(Path::new(&path))?;
        }

        Ok(config)
    }

    /// Register every profile listed in a YAML file.
    pub fn load_profiles_file(&mut self, path: &Path) -> Result<usize> {
        let content = std::fs::read_to_string(path)?;
        let profiles: Vec<Profile> = serde_yaml::from_str(&content).map_err(|e| {
            SandboxError::config(path.display().to_string(), e.to_string())
        })?;
        let count = profiles.len();
        for profile in profiles {
            self.add_profile(profile);
        }
        tracing::debug!(path = %path.display(), count, "Loaded sandbox profiles");
        Ok(count)
    }

    /// Register a profile, replacing any profile with the same name.
    pub fn add_profile(&mut self, profile: Profile) {
        self.profiles.insert(profile.name.clone(), Arc::new(profile));
    }

    /// Look up a profile by name.
    pub fn get_profile(&self, name: &str) -> Result<Arc<Profile>> {
        self.profiles
            .get(name)
            .cloned()
            .ok_or_else(|| SandboxError::ProfileNotFound(name.to_string()))
    }

    /// Registered profile names, sorted.
    pub fn profile_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

fn secs_var<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => u64::from_str(raw.trim())
            .map(Duration::from_secs)
            .map_err(|e| SandboxError::config(key, format!("'{}': {}", raw, e))),
    }
}

fn profile_list<'de, D>(
    deserializer: D,
) -> std::result::Result<HashMap<String, Arc<Profile>>, D::Error>
where
    D: Deserializer<'de>,
{
    let profiles = Vec::<Profile>::deserialize(deserializer)?;
    Ok(profiles
        .into_iter()
        .map(|p| (p.name.clone(), Arc::new(p)))
        .collect())
}

/// Serde adapter for a [`Duration`] written as (possibly fractional) seconds.
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}
