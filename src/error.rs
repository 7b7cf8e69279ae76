//! Error types for the container sandbox.

use crate::session::SandboxState;

/// Errors that can occur in the sandbox system.
///
/// Timeouts and OOM kills are not errors: they are reported on
/// [`ExecutionResult`](crate::ExecutionResult).
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// A control-API call to the container daemon failed.
    #[error("Daemon operation '{operation}' failed: {reason}")]
    DaemonOperation {
        operation: &'static str,
        reason: String,
    },

    /// Building the image for a profile failed.
    #[error("Image build failed for {tag}: {reason}")]
    ImageBuild { tag: String, reason: String },

    /// No profile is registered under the requested name.
    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    /// The sandbox is not running, so the operation cannot proceed.
    #[error("Sandbox is not running (state: {state})")]
    NotRunning { state: SandboxState },

    /// `start()` was called on a sandbox that has already been started.
    #[error("Sandbox already started (state: {state})")]
    AlreadyStarted { state: SandboxState },

    /// The requested entry is missing from the archive or is not a regular file.
    #[error("File not found in archive: {path}")]
    FileNotFoundInArchive { path: String },

    /// Configuration error.
    #[error("Invalid configuration value for {key}: {message}")]
    Config { key: String, message: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub(crate) fn daemon(operation: &'static str, reason: impl ToString) -> Self {
        Self::DaemonOperation {
            operation,
            reason: reason.to_string(),
        }
    }

    pub(crate) fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Result type for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_operation_display() {
        let err = SandboxError::daemon("create_container", "no such image");
        let msg = err.to_string();
        assert!(msg.contains("create_container"));
        assert!(msg.contains("no such image"));
    }

    #[test]
    fn test_image_build_display() {
        let err = SandboxError::ImageBuild {
            tag: "sandbox/ds:latest".to_string(),
            reason: "apt-get failed".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("sandbox/ds:latest"));
        assert!(msg.contains("apt-get failed"));
    }

    #[test]
    fn test_profile_not_found_display() {
        let err = SandboxError::ProfileNotFound("gpu".to_string());
        assert!(err.to_string().contains("gpu"));
    }

    #[test]
    fn test_lifecycle_errors_name_the_state() {
        let err = SandboxError::NotRunning {
            state: SandboxState::Stopped,
        };
        assert!(err.to_string().contains("stopped"));

        let err = SandboxError::AlreadyStarted {
            state: SandboxState::Running,
        };
        assert!(err.to_string().contains("running"));
    }

    #[test]
    fn test_file_not_found_display() {
        let err = SandboxError::FileNotFoundInArchive {
            path: "out/report.csv".to_string(),
        };
        assert!(err.to_string().contains("out/report.csv"));
    }

    #[test]
    fn test_config_error_display() {
        let err = SandboxError::config("SANDBOX_EXEC_TIMEOUT_SECS", "not a number");
        let msg = err.to_string();
        assert!(msg.contains("SANDBOX_EXEC_TIMEOUT_SECS"));
        assert!(msg.contains("not a number"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err = SandboxError::from(io_err);
        assert!(err.to_string().contains("access denied"));
    }
}
