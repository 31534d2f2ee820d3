//! Kubernetes runtime driver.
//!
//! Each pipeline container becomes its own pod in the configured
//! namespace. Volume and network capability calls are no-ops: the pod spec
//! mounts an ephemeral build volume and pods within one namespace resolve
//! each other, so the backend provides equivalent semantics implicitly.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container as PodContainer, EnvVar, Pod, PodSpec, Volume as PodVolume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, LogParams, PostParams};
use kube::runtime::wait::await_condition;
use kube::Client;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use futures::StreamExt;
use gantry_core::{Container, Error, Pipeline, Pull, Result};

use crate::{ContainerState, LogTail, Runtime};

const BUILD_VOLUME: &str = "build";

/// Driver that schedules pipeline containers as pods.
pub struct KubernetesRuntime {
    client: Client,
    namespace: String,
    /// Container specs staged by setup, consumed by run.
    staged: Mutex<HashMap<String, PodContainer>>,
}

impl KubernetesRuntime {
    pub async fn new(namespace: impl Into<String>) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::RuntimeUnavailable(e.to_string()))?;
        Ok(Self::with_client(client, namespace))
    }

    pub fn with_client(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            staged: Mutex::new(HashMap::new()),
        }
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

/// Pod names must be DNS-1123 labels; pipeline container ids are not.
fn pod_name(container: &Container) -> String {
    let name: String = container
        .id
        .chars()
        .map(|c| match c {
            'A'..='Z' => c.to_ascii_lowercase(),
            'a'..='z' | '0'..='9' | '-' => c,
            _ => '-',
        })
        .collect();
    name.trim_matches('-').chars().take(63).collect()
}

fn pull_policy(pull: Pull) -> &'static str {
    match pull {
        Pull::Always => "Always",
        Pull::NotPresent => "IfNotPresent",
        Pull::Never => "Never",
    }
}

fn pod_terminated(obj: Option<&Pod>) -> bool {
    obj.and_then(|pod| pod.status.as_ref())
        .and_then(|status| status.phase.as_deref())
        .is_some_and(|phase| phase == "Succeeded" || phase == "Failed")
}

#[async_trait]
impl Runtime for KubernetesRuntime {
    fn driver(&self) -> &'static str {
        "kubernetes"
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .apiserver_version()
            .await
            .map(|_| ())
            .map_err(|e| Error::RuntimeUnavailable(e.to_string()))
    }

    async fn setup_build(&self, pipeline: &Pipeline) -> Result<()> {
        self.create_network(pipeline).await?;
        self.create_volume(pipeline).await
    }

    async fn assemble_build(&self, _pipeline: &Pipeline) -> Result<()> {
        Ok(())
    }

    async fn remove_build(&self, pipeline: &Pipeline) -> Result<()> {
        self.remove_network(pipeline).await?;
        self.remove_volume(pipeline).await
    }

    async fn create_volume(&self, _pipeline: &Pipeline) -> Result<()> {
        Ok(())
    }

    async fn inspect_volume(&self, pipeline: &Pipeline) -> Result<String> {
        Ok(pipeline.volume.name.clone())
    }

    async fn remove_volume(&self, _pipeline: &Pipeline) -> Result<()> {
        Ok(())
    }

    async fn create_network(&self, _pipeline: &Pipeline) -> Result<()> {
        Ok(())
    }

    async fn inspect_network(&self, pipeline: &Pipeline) -> Result<String> {
        Ok(pipeline.network.name.clone())
    }

    async fn remove_network(&self, _pipeline: &Pipeline) -> Result<()> {
        Ok(())
    }

    async fn setup_container(&self, container: &Container) -> Result<()> {
        let env: Vec<EnvVar> = container
            .environment
            .iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                value_from: None,
            })
            .collect();

        let spec = PodContainer {
            name: pod_name(container),
            image: Some(container.image.clone()),
            image_pull_policy: Some(pull_policy(container.pull).to_string()),
            command: (!container.entrypoint.is_empty()).then(|| container.entrypoint.clone()),
            args: (!container.commands.is_empty()).then(|| container.commands.clone()),
            env: Some(env),
            ..Default::default()
        };

        self.staged
            .lock()
            .expect("staged pod lock poisoned")
            .insert(container.id.clone(), spec);
        Ok(())
    }

    async fn run_container(&self, pipeline: &Pipeline, container: &Container) -> Result<()> {
        let mut spec = self
            .staged
            .lock()
            .expect("staged pod lock poisoned")
            .remove(&container.id)
            .ok_or_else(|| {
                Error::PreconditionFailed(format!("container {} was never set up", container.id))
            })?;

        spec.working_dir = Some(pipeline.volume.destination.clone());
        spec.volume_mounts = Some(vec![VolumeMount {
            name: BUILD_VOLUME.to_string(),
            mount_path: pipeline.volume.destination.clone(),
            ..Default::default()
        }]);

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(pod_name(container)),
                labels: Some(BTreeMap::from([(
                    "gantry/pipeline".to_string(),
                    pipeline.id.clone(),
                )])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![spec],
                restart_policy: Some("Never".to_string()),
                volumes: Some(vec![PodVolume {
                    name: BUILD_VOLUME.to_string(),
                    empty_dir: Some(Default::default()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        debug!(pod = %pod_name(container), "creating pod");
        self.pods()
            .create(&PostParams::default(), &pod)
            .await
            .map(|_| ())
            .map_err(|e| classify(e, &container.id))
    }

    async fn tail_container(
        &self,
        container: &Container,
        token: CancellationToken,
    ) -> Result<LogTail> {
        let params = LogParams {
            follow: true,
            ..Default::default()
        };

        let reader = self
            .pods()
            .log_stream(&pod_name(container), &params)
            .await
            .map_err(|e| classify(e, &container.id))?;

        let stream = ReaderStream::new(reader.compat()).take_until(token.cancelled_owned());
        Ok(Box::pin(stream))
    }

    async fn wait_container(&self, container: &Container) -> Result<()> {
        await_condition(self.pods(), &pod_name(container), pod_terminated)
            .await
            .map(|_| ())
            .map_err(|e| Error::RuntimeTransient(format!("{}: {e}", container.id)))
    }

    async fn inspect_container(&self, container: &Container) -> Result<ContainerState> {
        let pod = self
            .pods()
            .get(&pod_name(container))
            .await
            .map_err(|e| classify(e, &container.id))?;

        let status = pod
            .status
            .ok_or_else(|| Error::Internal(format!("pod {} has no status", container.id)))?;

        let running = status.phase.as_deref() == Some("Running");
        let exit_code = status
            .container_statuses
            .as_ref()
            .and_then(|statuses| statuses.first())
            .and_then(|cs| cs.state.as_ref())
            .and_then(|state| state.terminated.as_ref())
            .map(|terminated| terminated.exit_code)
            .unwrap_or(0);

        Ok(ContainerState { exit_code, running })
    }

    async fn remove_container(&self, container: &Container) -> Result<()> {
        match self
            .pods()
            .delete(&pod_name(container), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(e) => Err(classify(e, &container.id)),
        }
    }
}

/// Map an API server error to the worker's error taxonomy.
fn classify(err: kube::Error, subject: &str) -> Error {
    match err {
        kube::Error::Api(response) => match response.code {
            404 => Error::NotFound(format!("{subject}: {}", response.message)),
            403 => Error::PermissionDenied(format!("{subject}: {}", response.message)),
            409 => Error::PreconditionFailed(format!("{subject}: {}", response.message)),
            429 | 500..=504 => Error::RuntimeTransient(format!("{subject}: {}", response.message)),
            _ => Error::Internal(format!("{subject}: {}", response.message)),
        },
        other => Error::RuntimeTransient(format!("{subject}: {other}")),
    }
}
