//! [`DaemonApi`] backed by the Docker Engine API.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
    KillContainerOptions, RemoveContainerOptions, StartContainerOptions,
    UploadToContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::CreateExecOptions;
use bollard::image::BuildImageOptions;
use bollard::models::{HostConfig, HostConfigLogConfig, ResourcesUlimits};
use bollard::{API_DEFAULT_VERSION, Docker};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use tracing::debug;

use super::attach::{AttachedExec, DaemonEndpoint, open_exec_stream};
use super::{ContainerSpec, ContainerStatus, DaemonApi, ExecSpec, ExecStatus};
use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};
use crate::retry::{FailureKind, RetryPolicy};

/// Docker daemon client shared by every sandbox.
///
/// Construct once per process and share behind an `Arc`; the underlying
/// bollard client pools connections and is safe for concurrent use.
pub struct DockerDaemon {
    docker: Docker,
    endpoint: DaemonEndpoint,
    retry: RetryPolicy,
    /// Policy for POSTs, which create or change daemon state.
    post_retry: RetryPolicy,
    timeout: Duration,
}

impl DockerDaemon {
    /// Connect using the daemon URL, timeout and retry policy from `config`.
    pub fn connect(config: &SandboxConfig) -> Result<Self> {
        let endpoint = DaemonEndpoint::parse(&config.daemon_url)?;
        let timeout_secs = config.daemon_timeout.as_secs().max(1);

        let docker = match &endpoint {
            DaemonEndpoint::Unix(path) => Docker::connect_with_unix(
                &path.to_string_lossy(),
                timeout_secs,
                API_DEFAULT_VERSION,
            ),
            DaemonEndpoint::Tcp { host, port } => Docker::connect_with_http(
                &format!("http://{}:{}", host, port),
                timeout_secs,
                API_DEFAULT_VERSION,
            ),
        }
        .map_err(|e| SandboxError::daemon("connect", e))?;

        debug!(url = %config.daemon_url, "Docker client configured");

        Ok(Self {
            docker,
            endpoint,
            retry: config.retry.clone(),
            post_retry: config.retry.connect_only(),
            timeout: config.daemon_timeout,
        })
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, DockerError>>,
    {
        self.retry
            .run(operation, classify, attempt)
            .await
            .map_err(|e| SandboxError::daemon(operation, e))
    }

    /// Like `call`, for requests that must not be sent twice.
    async fn post<T, F, Fut>(&self, operation: &'static str, attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, DockerError>>,
    {
        self.post_retry
            .run(operation, classify, attempt)
            .await
            .map_err(|e| SandboxError::daemon(operation, e))
    }
}

fn classify(err: &DockerError) -> FailureKind {
    match err {
        DockerError::DockerResponseServerError { status_code, .. } => {
            FailureKind::Status(*status_code)
        }
        DockerError::RequestTimeoutError => FailureKind::Read,
        DockerError::IOError { err } => match err.kind() {
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::NotFound
            | std::io::ErrorKind::AddrNotAvailable => FailureKind::Connect,
            _ => FailureKind::Read,
        },
        DockerError::HyperResponseError { .. } => FailureKind::Read,
        DockerError::HyperLegacyError { .. } => FailureKind::Connect,
        _ => FailureKind::Fatal,
    }
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl DaemonApi for DockerDaemon {
    async fn ping(&self) -> Result<()> {
        self.call("ping", || self.docker.ping()).await.map(|_| ())
    }

    async fn image_exists(&self, tag: &str) -> Result<bool> {
        match self.retry.run("inspect_image", classify, || self.docker.inspect_image(tag)).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(SandboxError::daemon("inspect_image", e)),
        }
    }

    async fn build_image(&self, tag: &str, context: Vec<u8>) -> Result<()> {
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };
        let build_failed = |reason: String| SandboxError::ImageBuild {
            tag: tag.to_string(),
            reason,
        };

        let mut progress = std::pin::pin!(self.docker.build_image(
            options,
            None,
            Some(Bytes::from(context))
        ));
        while let Some(item) = progress.next().await {
            let info = item.map_err(|e| build_failed(e.to_string()))?;
            if let Some(error) = info.error {
                return Err(build_failed(error));
            }
            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!(tag = %tag, "{}", line);
                }
            }
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let ulimits: Vec<ResourcesUlimits> = spec
            .ulimits()
            .into_iter()
            .map(|u| ResourcesUlimits {
                name: Some(u.name.to_string()),
                soft: Some(u.soft),
                hard: Some(u.hard),
            })
            .collect();

        let host_config = HostConfig {
            memory: Some(spec.limits.memory_bytes),
            memory_swap: Some(spec.limits.memory_swap_bytes),
            cpu_period: Some(spec.limits.cpu_period),
            cpu_quota: Some(spec.limits.cpu_quota),
            pids_limit: Some(spec.limits.pids_limit),
            readonly_rootfs: Some(spec.read_only),
            auto_remove: Some(spec.auto_remove),
            ulimits: (!ulimits.is_empty()).then_some(ulimits),
            log_config: Some(HostConfigLogConfig {
                typ: Some("none".to_string()),
                config: None,
            }),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            user: Some(spec.user.clone()),
            working_dir: Some(spec.workdir.clone()),
            env: Some(spec.env.clone()),
            network_disabled: Some(spec.network_disabled),
            open_stdin: Some(true),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .post("create_container", || {
                self.docker
                    .create_container(Some(options.clone()), config.clone())
            })
            .await?;
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.post("start_container", || {
            self.docker
                .start_container(id, None::<StartContainerOptions<String>>)
        })
        .await
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerStatus> {
        let response = self
            .call("inspect_container", || {
                self.docker
                    .inspect_container(id, None::<InspectContainerOptions>)
            })
            .await?;
        let state = response.state.unwrap_or_default();
        Ok(ContainerStatus {
            running: state.running.unwrap_or(false),
            exit_code: state.exit_code,
            oom_killed: state.oom_killed.unwrap_or(false),
        })
    }

    async fn kill_container(&self, id: &str) -> Result<()> {
        self.post("kill_container", || {
            self.docker
                .kill_container(id, None::<KillContainerOptions<String>>)
        })
        .await
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let removed = self
            .retry
            .run("remove_container", classify, || {
                self.docker.remove_container(
                    id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
            })
            .await;
        match removed {
            Ok(()) => Ok(()),
            // Already gone, or auto-removal is in progress.
            Err(DockerError::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => Ok(()),
            Err(e) => Err(SandboxError::daemon("remove_container", e)),
        }
    }

    async fn create_exec(&self, container_id: &str, spec: &ExecSpec) -> Result<String> {
        let options = CreateExecOptions {
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            cmd: Some(spec.cmd.clone()),
            env: Some(spec.env.clone()),
            ..Default::default()
        };
        let created = self
            .post("create_exec", || {
                self.docker.create_exec(container_id, options.clone())
            })
            .await?;
        Ok(created.id)
    }

    async fn start_exec(&self, exec_id: &str) -> Result<AttachedExec> {
        open_exec_stream(&self.endpoint, exec_id, self.timeout).await
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecStatus> {
        let response = self
            .call("inspect_exec", || self.docker.inspect_exec(exec_id))
            .await?;
        Ok(ExecStatus {
            running: response.running.unwrap_or(false),
            exit_code: response.exit_code,
        })
    }

    async fn put_archive(&self, container_id: &str, path: &str, archive: Vec<u8>) -> Result<()> {
        let body = Bytes::from(archive);
        self.call("put_archive", || {
            self.docker.upload_to_container(
                container_id,
                Some(UploadToContainerOptions {
                    path: path.to_string(),
                    ..Default::default()
                }),
                body.clone(),
            )
        })
        .await
    }

    async fn get_archive(&self, container_id: &str, path: &str) -> Result<Vec<u8>> {
        self.call("get_archive", || {
            self.docker
                .download_from_container(
                    container_id,
                    Some(DownloadFromContainerOptions {
                        path: path.to_string(),
                    }),
                )
                .try_fold(Vec::new(), |mut archive, chunk| async move {
                    archive.extend_from_slice(&chunk);
                    Ok::<_, DockerError>(archive)
                })
        })
        .await
    }
}
