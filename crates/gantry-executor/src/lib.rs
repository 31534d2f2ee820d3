//! Pipeline execution engine for the Gantry build worker.
//!
//! The [`Engine`] owns one build from claim to teardown and drives it
//! through a strict create → plan → assemble → exec → destroy lifecycle on
//! top of an abstract [`gantry_runtime::Runtime`]. Per-container log
//! streamers and control-plane state uploads run concurrently with
//! execution; teardown is guaranteed on every exit path.

mod build;
mod env;
mod logs;
mod secrets;
mod service;
mod stage;
mod step;

pub use logs::FLUSH_THRESHOLD;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::error;

use gantry_client::ControlPlane;
use gantry_core::{
    BuildPackage, BuildRecord, Container, Error, LogRecord, Result, Secret, ServiceRecord, Status,
    StepRecord,
};
use gantry_runtime::Runtime;

/// Worker-level settings the engine needs for one build.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Hostname reported as `BUILD_HOST`.
    pub hostname: String,
    /// Control-plane address reported as `VELA_HOST`.
    pub server: String,
    /// Worker version reported as `VELA_VERSION`.
    pub version: String,
    /// Host platform reported as `VELA_DISTRIBUTION`.
    pub distribution: String,
    /// Upper bound on concurrently executing stages.
    pub threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            server: String::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            distribution: std::env::consts::OS.to_string(),
            threads: 1,
        }
    }
}

/// Per-build mutable state. All of it is scoped to one [`Engine`]; the
/// worker carries no process-wide mutable state.
#[derive(Default)]
struct BuildState {
    build: BuildRecord,
    /// Step records keyed by container id.
    steps: HashMap<String, StepRecord>,
    /// Service records keyed by container id.
    services: HashMap<String, ServiceRecord>,
    /// Server-side log handles keyed by container id, taken by streamers.
    logs: HashMap<String, LogRecord>,
    /// Containers after env injection, secret injection, and
    /// substitution, keyed by container id.
    prepared: HashMap<String, Container>,
    /// Containers that entered runtime setup, in order. Teardown removes
    /// exactly these.
    setup: Vec<Container>,
    /// Resolved secrets by name. Populated at build start, read-only
    /// afterwards.
    secrets: HashMap<String, Secret>,
}

/// Drives one claimed build to completion.
pub struct Engine {
    config: EngineConfig,
    runtime: Arc<dyn Runtime>,
    client: Arc<dyn ControlPlane>,
    package: BuildPackage,
    token: CancellationToken,
    state: Mutex<BuildState>,
    streamers: Mutex<JoinSet<(String, Result<()>)>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        runtime: Arc<dyn Runtime>,
        client: Arc<dyn ControlPlane>,
        package: BuildPackage,
    ) -> Self {
        Self {
            config,
            runtime,
            client,
            package,
            token: CancellationToken::new(),
            state: Mutex::new(BuildState::default()),
            streamers: Mutex::new(JoinSet::new()),
        }
    }

    /// Build-scope cancellation token. Cancelling it kills in-flight steps
    /// and ends log tails; teardown still runs under its own scope.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Execute the full lifecycle. Teardown runs on every exit path,
    /// including cancellation and fatal errors; its own failures are
    /// collected and logged, never propagated.
    pub async fn run(&self) -> Result<()> {
        let result = self.execute().await;

        if let Err(err) = &result {
            let status = match err {
                Error::Cancelled => Status::Killed,
                Error::Api(_) => Status::Error,
                _ => Status::Failure,
            };
            let mut state = self.lock_state();
            state.build.status = state.build.status.worst(status);
            state.build.message = err.to_string();
            error!(build = state.build.number, error = %err, "build aborted");
        }

        self.destroy_build().await;
        result
    }

    async fn execute(&self) -> Result<()> {
        self.create_build().await?;
        self.plan_build().await?;
        self.assemble_build().await?;
        self.exec_build().await
    }

    fn lock_state(&self) -> MutexGuard<'_, BuildState> {
        self.state.lock().expect("build state lock poisoned")
    }

    fn lock_streamers(&self) -> MutexGuard<'_, JoinSet<(String, Result<()>)>> {
        self.streamers.lock().expect("streamer set lock poisoned")
    }

    /// Snapshot of the build record, for tests and telemetry.
    pub fn build(&self) -> BuildRecord {
        self.lock_state().build.clone()
    }
}
