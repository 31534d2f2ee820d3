//! Control-plane API client for the Gantry build worker.
//!
//! All step, service, build, log, and secret traffic flows through the
//! [`ControlPlane`] trait so the executor can be driven against the REST
//! client in production and the recording mock in tests. Updates are
//! idempotent with respect to repeated identical payloads.

pub mod mock;
pub mod rest;

use async_trait::async_trait;

use gantry_core::{BuildRecord, LogRecord, Result, Secret, ServiceRecord, StepRecord};

pub use mock::MockClient;
pub use rest::RestClient;

/// Operations the worker invokes against the control plane, scoped to one
/// repository and build.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Upsert the build record; returns the persisted record.
    async fn update_build(&self, build: &BuildRecord) -> Result<BuildRecord>;

    /// Upsert one step record; returns the persisted record.
    async fn update_step(&self, step: &StepRecord) -> Result<StepRecord>;

    /// Upsert one service record; returns the persisted record.
    async fn update_service(&self, service: &ServiceRecord) -> Result<ServiceRecord>;

    /// Fetch the server-side log record for a step.
    async fn get_step_log(&self, step: i64) -> Result<LogRecord>;

    /// Replace a step's log data with the cumulative buffer.
    async fn update_step_log(&self, step: i64, data: &[u8]) -> Result<()>;

    /// Fetch the server-side log record for a service.
    async fn get_service_log(&self, service: i64) -> Result<LogRecord>;

    /// Replace a service's log data with the cumulative buffer.
    async fn update_service_log(&self, service: i64, data: &[u8]) -> Result<()>;

    /// Resolve a named secret from the secret store.
    async fn get_secret(&self, engine: &str, key: &str) -> Result<Secret>;
}
