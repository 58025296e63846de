// src/sandbox/docker_api.rs
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    BuildImageOptionsBuilder, CreateContainerOptions as BollardCreateContainerOptionsQuery,
    LogsOptions as BollardLogsOptionsQuery, PruneContainersOptions, PruneImagesOptions,
    RemoveContainerOptions as BollardRemoveContainerOptionsQuery,
    StartContainerOptions as BollardStartContainerOptionsQuery,
    WaitContainerOptions as BollardWaitContainerOptionsQuery,
};
use bollard::Docker;
use bytes::Bytes;
use futures_util::stream::StreamExt;
use std::path::Path;

use super::{ContainerLogs, ContainerSpec, PruneReport, SandboxBackend};
use crate::errors::SandboxError;

/// Sandbox backend speaking the Docker Engine API over the local socket
pub struct DockerApiBackend {
    docker: Docker,
}

impl DockerApiBackend {
    pub fn connect() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    fn is_status(err: &BollardError, status: u16) -> bool {
        matches!(
            err,
            BollardError::DockerResponseServerError { status_code, .. } if *status_code == status
        )
    }

    fn tar_context(context_dir: &Path) -> Result<Vec<u8>, SandboxError> {
        let mut archive = tar::Builder::new(Vec::new());
        archive.append_dir_all(".", context_dir)?;
        Ok(archive.into_inner()?)
    }
}

#[async_trait]
impl SandboxBackend for DockerApiBackend {
    fn name(&self) -> &'static str {
        "docker-api"
    }

    async fn ping(&self) -> Result<(), SandboxError> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn image_exists(&self, tag: &str) -> Result<bool, SandboxError> {
        match self.docker.inspect_image(tag).await {
            Ok(_) => Ok(true),
            Err(e) if Self::is_status(&e, 404) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn build_image(&self, tag: &str, context_dir: &Path) -> Result<(), SandboxError> {
        let context = Self::tar_context(context_dir)?;
        let options = BuildImageOptionsBuilder::default()
            .dockerfile("Dockerfile")
            .t(tag)
            .rm(true)
            .forcerm(true)
            .build();

        let mut build_stream =
            self.docker
                .build_image(options, None, Some(bollard::body_full(Bytes::from(context))));

        while let Some(item) = build_stream.next().await {
            match item {
                Ok(info) => {
                    if let Some(detail) = info.error_detail {
                        return Err(SandboxError::BuildFailed {
                            tag: tag.to_string(),
                            reason: detail.message.unwrap_or_else(|| "unknown build error".to_string()),
                        });
                    }
                    if let Some(line) = info.stream {
                        let line = line.trim_end();
                        if !line.is_empty() {
                            log::debug!("[build {}] {}", tag, line);
                        }
                    }
                }
                Err(BollardError::DockerStreamError { error }) => {
                    return Err(SandboxError::BuildFailed {
                        tag: tag.to_string(),
                        reason: error,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, SandboxError> {
        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(spec.name.clone()),
            ..Default::default()
        });

        let host_config = HostConfig {
            binds: Some(vec![spec.bind()]),
            memory: spec.memory_limit_bytes(),
            nano_cpus: spec.cpu_limit.map(|cpus| (cpus * 1_000_000_000.0) as i64),
            network_mode: spec.network_disabled.then(|| "none".to_string()),
            ..Default::default()
        };

        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            working_dir: Some(spec.work_dir.clone()),
            host_config: Some(host_config),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: spec.network_disabled.then_some(true),
            ..Default::default()
        };

        let container = self.docker.create_container(options, config).await?;
        Ok(container.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), SandboxError> {
        self.docker
            .start_container(id, None::<BollardStartContainerOptionsQuery>)
            .await?;
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, SandboxError> {
        let mut wait_stream = self
            .docker
            .wait_container(id, None::<BollardWaitContainerOptionsQuery>);

        match wait_stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Non-zero exits surface as an error carrying the code
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(SandboxError::ContainerWait {
                id: id.to_string(),
                reason: "wait stream ended unexpectedly".to_string(),
            }),
        }
    }

    async fn container_logs(&self, id: &str) -> Result<ContainerLogs, SandboxError> {
        let mut output_stream = self.docker.logs(
            id,
            Some(BollardLogsOptionsQuery {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        let mut logs = ContainerLogs::default();
        while let Some(log_result) = output_stream.next().await {
            match log_result? {
                LogOutput::StdOut { message } => {
                    logs.stdout.push_str(&String::from_utf8_lossy(&message))
                }
                LogOutput::StdErr { message } => {
                    logs.stderr.push_str(&String::from_utf8_lossy(&message))
                }
                _ => {}
            }
        }
        Ok(logs)
    }

    async fn remove_container(&self, id: &str) -> Result<(), SandboxError> {
        let options = Some(BollardRemoveContainerOptionsQuery {
            force: true,
            v: true,
            ..Default::default()
        });

        match self.docker.remove_container(id, options).await {
            Ok(()) => Ok(()),
            Err(e) if Self::is_status(&e, 404) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn prune(&self) -> Result<PruneReport, SandboxError> {
        let containers = self
            .docker
            .prune_containers(None::<PruneContainersOptions>)
            .await
            .map_err(|e| {
                if Self::is_status(&e, 409) {
                    SandboxError::PruneConflict
                } else {
                    e.into()
                }
            })?;

        let images = self
            .docker
            .prune_images(None::<PruneImagesOptions>)
            .await
            .map_err(|e| {
                if Self::is_status(&e, 409) {
                    SandboxError::PruneConflict
                } else {
                    e.into()
                }
            })?;

        let reclaimed = containers.space_reclaimed.unwrap_or(0) + images.space_reclaimed.unwrap_or(0);

        Ok(PruneReport {
            containers_deleted: containers.containers_deleted.map(|c| c.len()).unwrap_or(0),
            images_deleted: images.images_deleted.map(|i| i.len()).unwrap_or(0),
            space_reclaimed: reclaimed.max(0) as u64,
        })
    }
}
