//! Work queue consumer for the Gantry build worker.
//!
//! The control plane enqueues routed build envelopes; workers claim items
//! whose routing labels are a subset of the labels they offer.

pub mod memory;
pub mod postgres;

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use gantry_core::{BuildPackage, Error, Result};

pub use memory::MemoryQueue;
pub use postgres::PostgresQueue;

/// A claimed queue item.
#[derive(Debug, Clone)]
pub struct QueuedItem {
    pub id: Uuid,
    pub package: BuildPackage,
}

/// Queue backend the worker consumes from.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Claim the next item eligible for a worker offering `routes`.
    /// Returns `None` when nothing is pending.
    async fn pop(&self, worker: &str, routes: &[String]) -> Result<Option<QueuedItem>>;

    /// Mark a claimed item as finished.
    async fn ack(&self, id: Uuid) -> Result<()>;

    /// Return a claimed item with an error; it will not be re-delivered.
    async fn fail(&self, id: Uuid, message: &str) -> Result<()>;
}

/// Queue driver selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Driver {
    Postgres,
    Memory,
}

impl FromStr for Driver {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "postgres" => Ok(Driver::Postgres),
            "memory" => Ok(Driver::Memory),
            other => Err(Error::InvalidConfiguration(format!(
                "unknown queue driver: {other}"
            ))),
        }
    }
}

/// Construct the queue selected by configuration.
pub async fn new(driver: Driver, address: Option<&str>) -> Result<Arc<dyn Queue>> {
    match driver {
        Driver::Postgres => {
            let address = address.ok_or_else(|| {
                Error::InvalidConfiguration("postgres queue requires an address".to_string())
            })?;
            Ok(Arc::new(PostgresQueue::connect(address).await?))
        }
        Driver::Memory => Ok(Arc::new(MemoryQueue::new())),
    }
}
