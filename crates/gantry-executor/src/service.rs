//! Service lifecycle: create, plan, exec, destroy.
//!
//! Services are long-lived containers started before any step runs. They
//! are never waited on; their tails stream until the build-scope token
//! ends them and their containers are removed only at teardown.

use chrono::Utc;
use tracing::{debug, info};

use gantry_core::retry::{Backoff, retry};
use gantry_core::{Container, Error, Result, Status};

use crate::Engine;
use crate::logs::LogTarget;

impl Engine {
    /// Prepare the service's container and set it up on the runtime.
    pub(crate) async fn create_service(&self, container: &Container) -> Result<()> {
        debug!(service = %container.name, "creating service");

        let prepared = self.prepare_container(container)?;

        retry(
            Backoff::default(),
            || async { self.runtime.setup_container(&prepared).await },
            Error::is_transient,
        )
        .await
        .map_err(Error::exhausted)?;

        let mut state = self.lock_state();
        state.setup.push(prepared.clone());
        state.prepared.insert(container.id.clone(), prepared);
        Ok(())
    }

    /// Transition the service to running and upload the record.
    pub(crate) async fn plan_service(&self, container: &Container) -> Result<()> {
        let record = {
            let mut state = self.lock_state();
            let record = state.services.get_mut(&container.id).ok_or_else(|| {
                Error::Internal(format!("service {} was never planned", container.id))
            })?;
            record.transition(Status::Running);
            record.started = Utc::now().timestamp();
            record.clone()
        };

        info!(service = %record.name, number = record.number, "starting service");
        let persisted = self.client.update_service(&record).await?;
        self.lock_state()
            .services
            .insert(container.id.clone(), persisted);
        Ok(())
    }

    /// Start the service and its log streamer. Never waits.
    pub(crate) async fn exec_service(&self, container: &Container) -> Result<()> {
        let prepared = self
            .lock_state()
            .prepared
            .get(&container.id)
            .cloned()
            .ok_or_else(|| {
                Error::PreconditionFailed(format!("service {} was never created", container.id))
            })?;

        self.plan_service(container).await?;

        retry(
            Backoff::default(),
            || async {
                self.runtime
                    .run_container(&self.package.pipeline, &prepared)
                    .await
            },
            Error::is_transient,
        )
        .await
        .map_err(Error::exhausted)?;

        self.spawn_streamer(&prepared, LogTarget::Service(prepared.number))
            .await
    }

    /// Remove the service's container. Idempotent; only teardown calls
    /// this.
    pub(crate) async fn destroy_service(&self, container: &Container) -> Result<()> {
        self.runtime.remove_container(container).await
    }
}
