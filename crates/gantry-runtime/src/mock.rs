//! Scripted in-memory runtime for tests.
//!
//! Tests script per-container outcomes (exit codes, tail payloads,
//! injected transient faults, containers that never terminate) and assert
//! against the recorded call history afterwards.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use gantry_core::{Container, Error, Pipeline, Result};

use crate::{ContainerState, LogTail, Runtime};

#[derive(Default)]
struct MockState {
    setups: Vec<Container>,
    runs: Vec<String>,
    removes: Vec<String>,
    networks_created: u32,
    networks_removed: u32,
    volumes_created: u32,
    volumes_removed: u32,
    exit_codes: HashMap<String, i32>,
    tails: HashMap<String, Vec<Vec<u8>>>,
    setup_faults: HashMap<String, u32>,
    held: HashSet<String>,
}

/// Scripted runtime driver.
#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock runtime lock poisoned")
    }

    /// Script the exit code inspect reports for a container.
    pub fn script_exit(&self, container_id: &str, exit_code: i32) {
        self.lock()
            .exit_codes
            .insert(container_id.to_string(), exit_code);
    }

    /// Script the chunks a container's tail yields before closing.
    pub fn script_tail(&self, container_id: &str, chunks: &[Vec<u8>]) {
        self.lock()
            .tails
            .insert(container_id.to_string(), chunks.to_vec());
    }

    /// Make the next `times` setup calls for a container fail transiently.
    pub fn fail_setup(&self, container_id: &str, times: u32) {
        self.lock()
            .setup_faults
            .insert(container_id.to_string(), times);
    }

    /// Make the container run until the build is cancelled: wait never
    /// returns and its tail only closes on cancellation.
    pub fn hold_container(&self, container_id: &str) {
        self.lock().held.insert(container_id.to_string());
    }

    /// Container ids that entered setup, in call order.
    pub fn setups(&self) -> Vec<String> {
        self.lock().setups.iter().map(|c| c.id.clone()).collect()
    }

    /// Full containers as they entered setup, injected environment
    /// included.
    pub fn setup_containers(&self) -> Vec<Container> {
        self.lock().setups.clone()
    }

    /// Container ids that were started, in call order.
    pub fn runs(&self) -> Vec<String> {
        self.lock().runs.clone()
    }

    /// Container ids that were removed, in call order.
    pub fn removes(&self) -> Vec<String> {
        self.lock().removes.clone()
    }

    pub fn networks(&self) -> (u32, u32) {
        let state = self.lock();
        (state.networks_created, state.networks_removed)
    }

    pub fn volumes(&self) -> (u32, u32) {
        let state = self.lock();
        (state.volumes_created, state.volumes_removed)
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    fn driver(&self) -> &'static str {
        "mock"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
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
        self.lock().volumes_created += 1;
        Ok(())
    }

    async fn inspect_volume(&self, pipeline: &Pipeline) -> Result<String> {
        Ok(pipeline.volume.name.clone())
    }

    async fn remove_volume(&self, _pipeline: &Pipeline) -> Result<()> {
        self.lock().volumes_removed += 1;
        Ok(())
    }

    async fn create_network(&self, _pipeline: &Pipeline) -> Result<()> {
        self.lock().networks_created += 1;
        Ok(())
    }

    async fn inspect_network(&self, pipeline: &Pipeline) -> Result<String> {
        Ok(pipeline.network.name.clone())
    }

    async fn remove_network(&self, _pipeline: &Pipeline) -> Result<()> {
        self.lock().networks_removed += 1;
        Ok(())
    }

    async fn setup_container(&self, container: &Container) -> Result<()> {
        let mut state = self.lock();
        if let Some(remaining) = state.setup_faults.get_mut(&container.id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::RuntimeTransient(format!(
                    "scripted fault for {}",
                    container.id
                )));
            }
        }
        state.setups.push(container.clone());
        Ok(())
    }

    async fn run_container(&self, _pipeline: &Pipeline, container: &Container) -> Result<()> {
        self.lock().runs.push(container.id.clone());
        Ok(())
    }

    async fn tail_container(
        &self,
        container: &Container,
        token: CancellationToken,
    ) -> Result<LogTail> {
        let (chunks, held) = {
            let state = self.lock();
            (
                state.tails.get(&container.id).cloned().unwrap_or_default(),
                state.held.contains(&container.id),
            )
        };

        let scripted = futures::stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c))));
        if held {
            // Stays open after the scripted chunks until cancellation,
            // like a long-lived service's tail.
            let stream = scripted
                .chain(futures::stream::pending())
                .take_until(token.cancelled_owned());
            Ok(Box::pin(stream))
        } else {
            Ok(Box::pin(scripted.take_until(token.cancelled_owned())))
        }
    }

    async fn wait_container(&self, container: &Container) -> Result<()> {
        let held = self.lock().held.contains(&container.id);
        if held {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn inspect_container(&self, container: &Container) -> Result<ContainerState> {
        let state = self.lock();
        Ok(ContainerState {
            exit_code: state.exit_codes.get(&container.id).copied().unwrap_or(0),
            running: state.held.contains(&container.id),
        })
    }

    async fn remove_container(&self, container: &Container) -> Result<()> {
        self.lock().removes.push(container.id.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn container(id: &str) -> Container {
        Container {
            id: id.to_string(),
            name: id.to_string(),
            number: 1,
            image: "alpine:latest".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn records_lifecycle_calls() {
        let mock = MockRuntime::new();
        let c = container("step_1_build");

        mock.setup_container(&c).await.unwrap();
        mock.run_container(&Pipeline::default(), &c).await.unwrap();
        mock.remove_container(&c).await.unwrap();

        assert_eq!(mock.setups(), vec!["step_1_build"]);
        assert_eq!(mock.runs(), vec!["step_1_build"]);
        assert_eq!(mock.removes(), vec!["step_1_build"]);
    }

    #[tokio::test]
    async fn scripted_faults_then_success() {
        let mock = MockRuntime::new();
        let c = container("step_1_build");
        mock.fail_setup(&c.id, 2);

        assert!(mock.setup_container(&c).await.unwrap_err().is_transient());
        assert!(mock.setup_container(&c).await.unwrap_err().is_transient());
        assert!(mock.setup_container(&c).await.is_ok());
        assert_eq!(mock.setups().len(), 1);
    }

    #[tokio::test]
    async fn tail_yields_scripted_chunks() {
        let mock = MockRuntime::new();
        let c = container("step_1_build");
        mock.script_tail(&c.id, &[b"hello\n".to_vec(), b"world\n".to_vec()]);

        let token = CancellationToken::new();
        let tail = mock.tail_container(&c, token).await.unwrap();
        let chunks: Vec<_> = tail.map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks, vec![Bytes::from("hello\n"), Bytes::from("world\n")]);
    }

    #[tokio::test]
    async fn held_tail_closes_on_cancellation() {
        let mock = MockRuntime::new();
        let c = container("service_1_db");
        mock.script_tail(&c.id, &[b"ready\n".to_vec()]);
        mock.hold_container(&c.id);

        let token = CancellationToken::new();
        let mut tail = mock.tail_container(&c, token.clone()).await.unwrap();

        assert_eq!(tail.next().await.unwrap().unwrap(), Bytes::from("ready\n"));
        token.cancel();
        assert!(tail.next().await.is_none());
    }
}
