//! Docker runtime driver.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{EndpointSettings, HostConfig};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use futures::StreamExt;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use gantry_core::{Container, Error, Pipeline, Pull, Result};

use crate::{ContainerState, LogTail, Runtime};

/// Driver backed by the local Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn new() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::RuntimeUnavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        debug!(image = %image, "pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut pull = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = pull.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "pull progress");
                    }
                }
                Err(e) => return Err(classify(e, image)),
            }
        }
        Ok(())
    }

    async fn image_present(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(classify(e, image)),
        }
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    fn driver(&self) -> &'static str {
        "docker"
    }

    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| Error::RuntimeUnavailable(e.to_string()))
    }

    async fn setup_build(&self, pipeline: &Pipeline) -> Result<()> {
        self.create_network(pipeline).await?;
        self.create_volume(pipeline).await
    }

    async fn assemble_build(&self, _pipeline: &Pipeline) -> Result<()> {
        // Containers join the build network at creation; nothing left to
        // finalize for the daemon.
        Ok(())
    }

    async fn remove_build(&self, pipeline: &Pipeline) -> Result<()> {
        self.remove_network(pipeline).await?;
        self.remove_volume(pipeline).await
    }

    async fn create_volume(&self, pipeline: &Pipeline) -> Result<()> {
        let options = CreateVolumeOptions {
            name: pipeline.volume.name.clone(),
            driver: "local".to_string(),
            ..Default::default()
        };
        match self.docker.create_volume(options).await {
            Ok(_) => Ok(()),
            // Re-creating an existing volume keeps setup idempotent.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(classify(e, &pipeline.volume.name)),
        }
    }

    async fn inspect_volume(&self, pipeline: &Pipeline) -> Result<String> {
        let volume = self
            .docker
            .inspect_volume(&pipeline.volume.name)
            .await
            .map_err(|e| classify(e, &pipeline.volume.name))?;
        Ok(volume.name)
    }

    async fn remove_volume(&self, pipeline: &Pipeline) -> Result<()> {
        match self
            .docker
            .remove_volume(&pipeline.volume.name, Some(RemoveVolumeOptions { force: true }))
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(classify(e, &pipeline.volume.name)),
        }
    }

    async fn create_network(&self, pipeline: &Pipeline) -> Result<()> {
        let options = CreateNetworkOptions {
            name: pipeline.network.name.clone(),
            driver: pipeline.network.driver.clone(),
            check_duplicate: true,
            ..Default::default()
        };
        match self.docker.create_network(options).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(classify(e, &pipeline.network.name)),
        }
    }

    async fn inspect_network(&self, pipeline: &Pipeline) -> Result<String> {
        let network = self
            .docker
            .inspect_network(
                &pipeline.network.name,
                None::<InspectNetworkOptions<String>>,
            )
            .await
            .map_err(|e| classify(e, &pipeline.network.name))?;
        Ok(network.name.unwrap_or_default())
    }

    async fn remove_network(&self, pipeline: &Pipeline) -> Result<()> {
        match self.docker.remove_network(&pipeline.network.name).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(classify(e, &pipeline.network.name)),
        }
    }

    async fn setup_container(&self, container: &Container) -> Result<()> {
        match container.pull {
            Pull::Always => self.pull_image(&container.image).await,
            Pull::NotPresent => {
                if self.image_present(&container.image).await? {
                    Ok(())
                } else {
                    self.pull_image(&container.image).await
                }
            }
            Pull::Never => {
                if self.image_present(&container.image).await? {
                    Ok(())
                } else {
                    Err(Error::PreconditionFailed(format!(
                        "image {} not present and pull policy forbids pulling",
                        container.image
                    )))
                }
            }
        }
    }

    async fn run_container(&self, pipeline: &Pipeline, container: &Container) -> Result<()> {
        let env: Vec<String> = container
            .environment
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let binds = vec![format!(
            "{}:{}:{}",
            pipeline.volume.name, pipeline.volume.destination, pipeline.volume.access_mode
        )];

        // Attach to the build network under the container's short name so
        // steps reach services by hostname.
        let endpoints = HashMap::from([(
            pipeline.network.name.clone(),
            EndpointSettings {
                aliases: Some(vec![container.name.clone()]),
                ..Default::default()
            },
        )]);

        let config = Config {
            image: Some(container.image.clone()),
            entrypoint: (!container.entrypoint.is_empty()).then(|| container.entrypoint.clone()),
            cmd: (!container.commands.is_empty()).then(|| container.commands.clone()),
            env: Some(env),
            working_dir: Some(pipeline.volume.destination.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(HostConfig {
                binds: Some(binds),
                ..Default::default()
            }),
            networking_config: Some(bollard::container::NetworkingConfig {
                endpoints_config: endpoints,
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: container.id.clone(),
            platform: None,
        };

        debug!(container = %container.id, image = %container.image, "creating container");
        self.docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| classify(e, &container.id))?;

        self.docker
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| classify(e, &container.id))
    }

    async fn tail_container(
        &self,
        container: &Container,
        token: CancellationToken,
    ) -> Result<LogTail> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let stream = self
            .docker
            .logs(&container.id, Some(options))
            .filter_map(|entry| async move {
                match entry {
                    Ok(LogOutput::StdOut { message })
                    | Ok(LogOutput::StdErr { message })
                    | Ok(LogOutput::Console { message }) => Some(Ok(message)),
                    Ok(LogOutput::StdIn { .. }) => None,
                    Err(e) => {
                        warn!(error = %e, "log stream error");
                        Some(Err(std::io::Error::other(e)))
                    }
                }
            })
            .take_until(token.cancelled_owned());

        Ok(Box::pin(stream))
    }

    async fn wait_container(&self, container: &Container) -> Result<()> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut wait = self.docker.wait_container(&container.id, Some(options));
        match wait.next().await {
            // A non-zero exit surfaces as a server error on this stream;
            // the exit code itself comes from inspect.
            Some(Ok(_)) | None => Ok(()),
            Some(Err(bollard::errors::Error::DockerContainerWaitError { .. })) => Ok(()),
            Some(Err(e)) => Err(classify(e, &container.id)),
        }
    }

    async fn inspect_container(&self, container: &Container) -> Result<ContainerState> {
        let inspect = self
            .docker
            .inspect_container(&container.id, None)
            .await
            .map_err(|e| classify(e, &container.id))?;

        let state = inspect
            .state
            .ok_or_else(|| Error::Internal(format!("container {} has no state", container.id)))?;

        Ok(ContainerState {
            exit_code: state.exit_code.unwrap_or(0) as i32,
            running: state.running.unwrap_or(false),
        })
    }

    async fn remove_container(&self, container: &Container) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self
            .docker
            .remove_container(&container.id, Some(options))
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => Ok(()),
            Err(e) => Err(classify(e, &container.id)),
        }
    }
}

/// Map a daemon error to the worker's error taxonomy.
fn classify(err: bollard::errors::Error, subject: &str) -> Error {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            404 => Error::NotFound(format!("{subject}: {message}")),
            403 => Error::PermissionDenied(format!("{subject}: {message}")),
            409 => Error::PreconditionFailed(format!("{subject}: {message}")),
            429 | 500..=504 => Error::RuntimeTransient(format!("{subject}: {message}")),
            _ => Error::Internal(format!("{subject}: {message}")),
        },
        // Transport-level failures are worth retrying.
        other => Error::RuntimeTransient(format!("{subject}: {other}")),
    }
}
