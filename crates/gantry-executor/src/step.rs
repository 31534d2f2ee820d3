//! Step lifecycle: create, plan, exec, destroy.

use chrono::Utc;
use tracing::{debug, info, warn};

use gantry_core::retry::{Backoff, retry};
use gantry_core::{Container, Error, Result, Status};

use crate::logs::LogTarget;
use crate::{Engine, env, secrets};

impl Engine {
    /// Well-known environment injected into every container before
    /// user-declared variables are substituted.
    pub(crate) fn well_known_env(&self) -> Vec<(String, String)> {
        vec![
            ("BUILD_HOST".to_string(), self.config.hostname.clone()),
            ("VELA_HOST".to_string(), self.config.server.clone()),
            ("VELA_VERSION".to_string(), self.config.version.clone()),
            ("VELA_RUNTIME".to_string(), self.runtime.driver().to_string()),
            (
                "VELA_DISTRIBUTION".to_string(),
                self.config.distribution.clone(),
            ),
        ]
    }

    /// Inject well-known env and secrets, substitute the serialized
    /// configuration against the container's own environment, and
    /// re-materialize.
    pub(crate) fn prepare_container(&self, container: &Container) -> Result<Container> {
        let mut prepared = container.clone();
        for (name, value) in self.well_known_env() {
            prepared.environment.entry(name).or_insert(value);
        }

        {
            let state = self.lock_state();
            secrets::inject(&mut prepared, &state.secrets)?;
        }

        env::substitute_container(&prepared)
    }

    /// Prepare the step's container and set it up on the runtime. The
    /// synthetic `init` step is a marker and gets no container.
    pub(crate) async fn create_step(&self, container: &Container) -> Result<()> {
        if container.is_init() {
            return Ok(());
        }
        debug!(step = %container.name, "creating step");

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

    /// Transition the step to running and upload the record; the persisted
    /// record replaces the local one.
    pub(crate) async fn plan_step(&self, container: &Container) -> Result<()> {
        let record = {
            let mut state = self.lock_state();
            let record = state.steps.get_mut(&container.id).ok_or_else(|| {
                Error::Internal(format!("step {} was never planned", container.id))
            })?;
            record.transition(Status::Running);
            record.started = Utc::now().timestamp();
            record.clone()
        };

        info!(step = %record.name, number = record.number, "starting step");
        let persisted = self.client.update_step(&record).await?;
        self.lock_state()
            .steps
            .insert(container.id.clone(), persisted);
        Ok(())
    }

    /// Run the step's container, streaming logs concurrently. Detached
    /// steps return immediately after start; everything else waits for
    /// termination and records the exit code. A non-zero exit is a step
    /// outcome, not an error.
    pub(crate) async fn exec_step(&self, container: &Container) -> Result<()> {
        if container.is_init() {
            return Ok(());
        }
        match self.exec_step_inner(container).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let status = if matches!(err, Error::Cancelled) {
                    Status::Killed
                } else {
                    Status::Failure
                };
                if let Err(upload) = self.finish_step(container, status, None).await {
                    warn!(step = %container.name, error = %upload, "failed to report step status");
                }
                Err(err)
            }
        }
    }

    async fn exec_step_inner(&self, container: &Container) -> Result<()> {
        let prepared = self
            .lock_state()
            .prepared
            .get(&container.id)
            .cloned()
            .ok_or_else(|| {
                Error::PreconditionFailed(format!("step {} was never created", container.id))
            })?;

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

        self.spawn_streamer(&prepared, LogTarget::Step(prepared.number))
            .await?;

        if prepared.detach {
            debug!(step = %prepared.name, "detached step started");
            return Ok(());
        }

        tokio::select! {
            _ = self.token.cancelled() => return Err(Error::Cancelled),
            waited = self.runtime.wait_container(&prepared) => waited?,
        }

        let observed = self.runtime.inspect_container(&prepared).await?;
        let status = if observed.exit_code == 0 {
            Status::Success
        } else {
            Status::Failure
        };
        self.finish_step(container, status, Some(observed.exit_code))
            .await?;

        if status == Status::Failure && !container.ruleset.continue_on_error {
            self.escalate_build_failure().await;
        }
        Ok(())
    }

    /// Record a terminal step status and upload it. Step uploads for the
    /// same record are issued serially, so they are totally ordered.
    pub(crate) async fn finish_step(
        &self,
        container: &Container,
        status: Status,
        exit_code: Option<i32>,
    ) -> Result<()> {
        let record = {
            let mut state = self.lock_state();
            let record = state.steps.get_mut(&container.id).ok_or_else(|| {
                Error::Internal(format!("step {} was never planned", container.id))
            })?;
            record.transition(status);
            if let Some(code) = exit_code {
                record.exit_code = code;
            }
            record.clone()
        };

        info!(
            step = %record.name,
            status = %record.status,
            exit_code = record.exit_code,
            "step finished"
        );
        self.client.update_step(&record).await?;
        Ok(())
    }

    /// Skip a step whose ruleset evaluated false.
    pub(crate) async fn skip_step(&self, container: &Container) -> Result<()> {
        let record = {
            let mut state = self.lock_state();
            let record = state.steps.get_mut(&container.id).ok_or_else(|| {
                Error::Internal(format!("step {} was never planned", container.id))
            })?;
            record.transition(Status::Skipped);
            record.clone()
        };

        debug!(step = %record.name, "skipping step");
        self.client.update_step(&record).await?;
        Ok(())
    }

    /// A failing required step poisons the rest of the build: subsequent
    /// run-on-success steps will skip.
    async fn escalate_build_failure(&self) {
        let record = {
            let mut state = self.lock_state();
            state.build.status = state.build.status.worst(Status::Failure);
            state.build.clone()
        };
        if let Err(err) = self.client.update_build(&record).await {
            warn!(error = %err, "failed to report build failure");
        }
    }

    /// Remove the step's container. Idempotent; a missing container is
    /// success.
    pub(crate) async fn destroy_step(&self, container: &Container) -> Result<()> {
        if container.is_init() {
            return Ok(());
        }
        self.runtime.remove_container(container).await
    }
}
