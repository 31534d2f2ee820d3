//! Container runtime drivers for the Gantry build worker.
//!
//! The executor consumes the [`Runtime`] capability set through
//! `Arc<dyn Runtime>`; concrete drivers implement it:
//! - Docker via the local daemon (`bollard`)
//! - Kubernetes, one pod per container (`kube`)
//! - A scripted mock for tests

pub mod docker;
pub mod kubernetes;
pub mod mock;

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use gantry_core::{Container, Error, Pipeline, Result};

pub use docker::DockerRuntime;
pub use kubernetes::KubernetesRuntime;
pub use mock::MockRuntime;

/// Byte stream of a container's combined stdout and stderr. Closes when
/// the container terminates or the cancellation token fires.
pub type LogTail = BoxStream<'static, std::io::Result<Bytes>>;

/// Terminal state observed by [`Runtime::inspect_container`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContainerState {
    pub exit_code: i32,
    pub running: bool,
}

/// Capability set over container backends.
///
/// Every operation fails with one of the error kinds in
/// [`gantry_core::Error`]; classification is the driver's responsibility
/// and only transient errors are worth retrying at this boundary.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Driver name, reported into container environments.
    fn driver(&self) -> &'static str;

    /// Reachability probe used at worker startup.
    async fn ping(&self) -> Result<()>;

    /// Prepare build-scoped resources (network, volume). Idempotent.
    async fn setup_build(&self, pipeline: &Pipeline) -> Result<()>;

    /// Finalize build-scoped resources after containers are created.
    /// Idempotent.
    async fn assemble_build(&self, pipeline: &Pipeline) -> Result<()>;

    /// Release all build-scoped resources. Must succeed even if setup
    /// partially failed.
    async fn remove_build(&self, pipeline: &Pipeline) -> Result<()>;

    async fn create_volume(&self, pipeline: &Pipeline) -> Result<()>;
    async fn inspect_volume(&self, pipeline: &Pipeline) -> Result<String>;
    async fn remove_volume(&self, pipeline: &Pipeline) -> Result<()>;

    async fn create_network(&self, pipeline: &Pipeline) -> Result<()>;
    async fn inspect_network(&self, pipeline: &Pipeline) -> Result<String>;
    async fn remove_network(&self, pipeline: &Pipeline) -> Result<()>;

    /// Image pull and any pre-start preparation. No execution.
    async fn setup_container(&self, container: &Container) -> Result<()>;

    /// Start the container. Returns after start, not completion.
    async fn run_container(&self, pipeline: &Pipeline, container: &Container) -> Result<()>;

    /// Open the container's combined output stream.
    async fn tail_container(
        &self,
        container: &Container,
        token: CancellationToken,
    ) -> Result<LogTail>;

    /// Block until the container reaches a terminal state.
    async fn wait_container(&self, container: &Container) -> Result<()>;

    /// Observe the container's exit code and terminal status.
    async fn inspect_container(&self, container: &Container) -> Result<ContainerState>;

    /// Destroy the container. A no-op when the container does not exist.
    async fn remove_container(&self, container: &Container) -> Result<()>;
}

/// Runtime driver selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Driver {
    Docker,
    Kubernetes,
}

impl FromStr for Driver {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "docker" => Ok(Driver::Docker),
            "kubernetes" | "k8s" => Ok(Driver::Kubernetes),
            other => Err(Error::InvalidConfiguration(format!(
                "unknown runtime driver: {other}"
            ))),
        }
    }
}

/// Construct the runtime selected by configuration.
pub async fn new(driver: Driver, namespace: Option<String>) -> Result<Arc<dyn Runtime>> {
    match driver {
        Driver::Docker => Ok(Arc::new(DockerRuntime::new()?)),
        Driver::Kubernetes => {
            let namespace = namespace.unwrap_or_else(|| "default".to_string());
            Ok(Arc::new(KubernetesRuntime::new(namespace).await?))
        }
    }
}
