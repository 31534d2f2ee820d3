//! Recording control-plane client for tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use gantry_core::{BuildRecord, Error, LogRecord, Result, Secret, ServiceRecord, StepRecord};

use crate::ControlPlane;

#[derive(Default)]
struct ClientState {
    builds: Vec<BuildRecord>,
    steps: Vec<StepRecord>,
    services: Vec<ServiceRecord>,
    step_logs: HashMap<i64, Vec<Vec<u8>>>,
    service_logs: HashMap<i64, Vec<Vec<u8>>>,
    secrets: HashMap<String, Secret>,
    fail_build_updates: bool,
    fail_log_updates: u32,
}

/// In-memory client that records every call in order.
#[derive(Default)]
pub struct MockClient {
    state: Mutex<ClientState>,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClientState> {
        self.state.lock().expect("mock client lock poisoned")
    }

    /// Seed a secret under `engine/key`.
    pub fn seed_secret(&self, engine: &str, key: &str, secret: Secret) {
        self.lock().secrets.insert(format!("{engine}/{key}"), secret);
    }

    /// Reject every subsequent build update.
    pub fn fail_build_updates(&self) {
        self.lock().fail_build_updates = true;
    }

    /// Reject the next `times` log uploads (step or service).
    pub fn fail_log_updates(&self, times: u32) {
        self.lock().fail_log_updates = times;
    }

    /// Every build record uploaded, in order.
    pub fn build_updates(&self) -> Vec<BuildRecord> {
        self.lock().builds.clone()
    }

    /// Every step record uploaded, in order.
    pub fn step_updates(&self) -> Vec<StepRecord> {
        self.lock().steps.clone()
    }

    /// Every service record uploaded, in order.
    pub fn service_updates(&self) -> Vec<ServiceRecord> {
        self.lock().services.clone()
    }

    /// Payload snapshots uploaded for one step's log, in order.
    pub fn step_log_uploads(&self, step: i64) -> Vec<Vec<u8>> {
        self.lock().step_logs.get(&step).cloned().unwrap_or_default()
    }

    /// Payload snapshots uploaded for one service's log, in order.
    pub fn service_log_uploads(&self, service: i64) -> Vec<Vec<u8>> {
        self.lock()
            .service_logs
            .get(&service)
            .cloned()
            .unwrap_or_default()
    }

    /// The most recent record uploaded for a given step number.
    pub fn last_step(&self, number: i64) -> Option<StepRecord> {
        self.lock()
            .steps
            .iter()
            .rev()
            .find(|s| s.number == number)
            .cloned()
    }

    /// The most recent record uploaded for a given service number.
    pub fn last_service(&self, number: i64) -> Option<ServiceRecord> {
        self.lock()
            .services
            .iter()
            .rev()
            .find(|s| s.number == number)
            .cloned()
    }

    /// The most recent build record uploaded.
    pub fn last_build(&self) -> Option<BuildRecord> {
        self.lock().builds.last().cloned()
    }
}

#[async_trait]
impl ControlPlane for MockClient {
    async fn update_build(&self, build: &BuildRecord) -> Result<BuildRecord> {
        let mut state = self.lock();
        if state.fail_build_updates {
            return Err(Error::Api("scripted build update failure".to_string()));
        }
        state.builds.push(build.clone());
        Ok(build.clone())
    }

    async fn update_step(&self, step: &StepRecord) -> Result<StepRecord> {
        self.lock().steps.push(step.clone());
        Ok(step.clone())
    }

    async fn update_service(&self, service: &ServiceRecord) -> Result<ServiceRecord> {
        self.lock().services.push(service.clone());
        Ok(service.clone())
    }

    async fn get_step_log(&self, step: i64) -> Result<LogRecord> {
        Ok(LogRecord {
            number: step,
            data: Vec::new(),
        })
    }

    async fn update_step_log(&self, step: i64, data: &[u8]) -> Result<()> {
        let mut state = self.lock();
        if state.fail_log_updates > 0 {
            state.fail_log_updates -= 1;
            return Err(Error::Api("scripted log update failure".to_string()));
        }
        state.step_logs.entry(step).or_default().push(data.to_vec());
        Ok(())
    }

    async fn get_service_log(&self, service: i64) -> Result<LogRecord> {
        Ok(LogRecord {
            number: service,
            data: Vec::new(),
        })
    }

    async fn update_service_log(&self, service: i64, data: &[u8]) -> Result<()> {
        let mut state = self.lock();
        if state.fail_log_updates > 0 {
            state.fail_log_updates -= 1;
            return Err(Error::Api("scripted log update failure".to_string()));
        }
        state
            .service_logs
            .entry(service)
            .or_default()
            .push(data.to_vec());
        Ok(())
    }

    async fn get_secret(&self, engine: &str, key: &str) -> Result<Secret> {
        self.lock()
            .secrets
            .get(&format!("{engine}/{key}"))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("secret {engine}/{key}")))
    }
}
