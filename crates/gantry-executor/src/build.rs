//! Build lifecycle: create, plan, assemble, exec, destroy.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tracing::{debug, error, info, warn};

use gantry_core::retry::{Backoff, retry};
use gantry_core::{
    Container, Error, Result, RuleData, ServiceRecord, Stage, Status, StepRecord,
};

use crate::{Engine, secrets, stage};

/// Teardown runs under its own scope with a finite deadline so cleanup
/// finishes even when the build token is cancelled.
const TEARDOWN_DEADLINE: Duration = Duration::from_secs(60);

impl Engine {
    /// Initialize executor state and upload the running build record.
    /// Fails iff the control plane rejects the initial update or a
    /// declared secret cannot be resolved.
    pub async fn create_build(&self) -> Result<()> {
        let record = {
            let mut state = self.lock_state();
            state.build = self.package.build.clone();
            state.build.status = Status::Running;
            state.build.started = Utc::now().timestamp();
            state.build.host = self.config.hostname.clone();
            state.build.runtime = self.runtime.driver().to_string();
            state.build.distribution = self.config.distribution.clone();
            state.build.clone()
        };

        info!(build = record.number, repo = %self.package.repo.full_name, "creating build");
        let persisted = self.client.update_build(&record).await?;
        self.lock_state().build = persisted;

        let resolved = secrets::populate(self.client.as_ref(), &self.package.pipeline).await?;
        self.lock_state().secrets = resolved;
        Ok(())
    }

    /// Create build-scoped runtime resources and upload planned skeletons
    /// for every step and service, caching their log handles.
    pub async fn plan_build(&self) -> Result<()> {
        let pipeline = &self.package.pipeline;

        self.validate_numbers()?;
        stage::waves(&pipeline.stages)?;

        retry(
            Backoff::default(),
            || async { self.runtime.setup_build(pipeline).await },
            Error::is_transient,
        )
        .await
        .map_err(Error::exhausted)?;

        let volume = self.runtime.inspect_volume(pipeline).await?;
        let network = self.runtime.inspect_network(pipeline).await?;
        debug!(volume = %volume, network = %network, "created build resources");

        for service in &pipeline.services {
            let record = ServiceRecord {
                number: service.number,
                name: service.name.clone(),
                image: service.image.clone(),
                ..Default::default()
            };
            let persisted = self.client.update_service(&record).await?;
            let log = self.client.get_service_log(service.number).await?;
            let mut state = self.lock_state();
            state.services.insert(service.id.clone(), persisted);
            state.logs.insert(service.id.clone(), log);
        }

        for stage in &pipeline.stages {
            for step in &stage.steps {
                let record = StepRecord {
                    number: step.number,
                    name: step.name.clone(),
                    image: step.image.clone(),
                    stage: stage.name.clone(),
                    host: self.config.hostname.clone(),
                    runtime: self.runtime.driver().to_string(),
                    distribution: self.config.distribution.clone(),
                    ..Default::default()
                };
                let persisted = self.client.update_step(&record).await?;
                let log = self.client.get_step_log(step.number).await?;
                let mut state = self.lock_state();
                state.steps.insert(step.id.clone(), persisted);
                state.logs.insert(step.id.clone(), log);
            }
        }

        debug!(build = self.package.build.number, "planned build");
        Ok(())
    }

    /// Create every container (services first, then steps) and finalize
    /// build-scoped resources. Services assemble concurrently; steps
    /// assemble in declared order.
    pub async fn assemble_build(&self) -> Result<()> {
        let pipeline = &self.package.pipeline;

        let outcomes: Vec<Result<()>> = futures::stream::iter(
            pipeline.services.iter().map(|service| self.create_service(service)),
        )
        .buffer_unordered(pipeline.services.len().max(1))
        .collect()
        .await;
        for outcome in outcomes {
            outcome?;
        }

        for step in pipeline.steps() {
            self.create_step(step).await?;
        }

        self.runtime.assemble_build(pipeline).await?;
        debug!(build = self.package.build.number, "assembled build");
        Ok(())
    }

    /// Run all services, then all stages per their dependency waves.
    pub async fn exec_build(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.mark_init().await?;

        // Services start concurrently; steps only begin once every
        // service is up.
        let services = &self.package.pipeline.services;
        let outcomes: Vec<Result<()>> = futures::stream::iter(
            services.iter().map(|service| self.exec_service(service)),
        )
        .buffer_unordered(services.len().max(1))
        .collect()
        .await;
        for outcome in outcomes {
            outcome?;
        }

        let waves = stage::waves(&self.package.pipeline.stages)?;
        for wave in waves {
            if self.token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            // Stages in one wave run concurrently; a stage failure does
            // not cancel its peers, and errors surface only after the
            // wave drains.
            let outcomes: Vec<Result<()>> =
                futures::stream::iter(wave.into_iter().map(|i| {
                    self.exec_stage(&self.package.pipeline.stages[i])
                }))
                .buffer_unordered(self.config.threads.max(1))
                .collect()
                .await;
            for outcome in outcomes {
                outcome?;
            }
        }

        self.finalize_status();
        Ok(())
    }

    /// Steps of one stage, sequentially, each gated by its ruleset.
    async fn exec_stage(&self, stage: &Stage) -> Result<()> {
        debug!(stage = %stage.name, "executing stage");
        for step in &stage.steps {
            if step.is_init() {
                continue;
            }
            if self.token.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let data = {
                let state = self.lock_state();
                RuleData {
                    branch: state.build.branch.clone(),
                    event: state.build.event.clone(),
                    status: state.build.status,
                }
            };
            if !step.ruleset.matches(&data) {
                self.skip_step(step).await?;
                continue;
            }

            self.plan_step(step).await?;
            self.exec_step(step).await?;
        }
        Ok(())
    }

    /// The init step is a synthetic marker: report it terminal as soon as
    /// execution begins.
    async fn mark_init(&self) -> Result<()> {
        let Some(init) = self.package.pipeline.steps().find(|c| c.is_init()) else {
            return Ok(());
        };

        let record = {
            let mut state = self.lock_state();
            let record = state.steps.get_mut(&init.id).ok_or_else(|| {
                Error::Internal(format!("step {} was never planned", init.id))
            })?;
            record.started = Utc::now().timestamp();
            record.transition(Status::Running);
            record.transition(Status::Success);
            record.clone()
        };
        self.client.update_step(&record).await?;
        Ok(())
    }

    /// Fold step outcomes into the build status: the build is at least as
    /// severe as its most severe non-skipped step.
    fn finalize_status(&self) {
        let mut state = self.lock_state();
        let aggregate = state
            .steps
            .values()
            .filter(|step| step.status != Status::Skipped)
            .fold(Status::Success, |acc, step| acc.worst(step.status));
        state.build.status = state.build.status.worst(aggregate);
    }

    /// Tear the build down: end outliving log tails, stamp non-terminal
    /// records, remove every container that entered setup exactly once,
    /// release build-scoped resources, and upload the terminal build
    /// record. Every operation is best-effort; failures are logged and do
    /// not skip subsequent teardown work.
    pub async fn destroy_build(&self) {
        if tokio::time::timeout(TEARDOWN_DEADLINE, self.teardown())
            .await
            .is_err()
        {
            error!(build = self.package.build.number, "teardown deadline exceeded");
        }
    }

    async fn teardown(&self) {
        // The build token also ends service tails; streamers then flush
        // their remaining bytes.
        self.token.cancel();
        self.join_streamers().await;

        let killed = {
            let state = self.lock_state();
            state.build.status == Status::Killed
        };

        for record in self.stamp_steps(killed) {
            if let Err(err) = self.client.update_step(&record).await {
                warn!(step = %record.name, error = %err, "failed to report final step status");
            }
        }
        for record in self.stamp_services(killed) {
            if let Err(err) = self.client.update_service(&record).await {
                warn!(service = %record.name, error = %err, "failed to report final service status");
            }
        }

        let (step_containers, service_containers) = {
            let state = self.lock_state();
            let services: HashSet<String> = state.services.keys().cloned().collect();
            let (svc, steps): (Vec<Container>, Vec<Container>) = state
                .setup
                .iter()
                .cloned()
                .partition(|c| services.contains(&c.id));
            (steps, svc)
        };

        for container in &step_containers {
            if let Err(err) = self.destroy_step(container).await {
                warn!(container = %container.id, error = %err, "failed to remove step container");
            }
        }
        for container in &service_containers {
            if let Err(err) = self.destroy_service(container).await {
                warn!(container = %container.id, error = %err, "failed to remove service container");
            }
        }

        if let Err(err) = self.runtime.remove_build(&self.package.pipeline).await {
            warn!(error = %err, "failed to release build resources");
        }

        let record = {
            let mut state = self.lock_state();
            if !state.build.status.is_terminal() {
                state.build.status = Status::Success;
            }
            state.build.finished = Utc::now().timestamp();
            state.build.clone()
        };
        if let Err(err) = self.client.update_build(&record).await {
            warn!(error = %err, "failed to upload terminal build state");
        }

        info!(
            build = record.number,
            status = %record.status,
            "destroyed build"
        );
    }

    /// Close out step records execution never finished: pending steps were
    /// skipped, running ones ended with the build.
    fn stamp_steps(&self, killed: bool) -> Vec<StepRecord> {
        let mut state = self.lock_state();
        let mut stamped = Vec::new();
        for record in state.steps.values_mut() {
            if record.status.is_terminal() {
                continue;
            }
            let to = match record.status {
                Status::Pending => Status::Skipped,
                _ if killed => Status::Killed,
                _ => Status::Success,
            };
            record.transition(to);
            stamped.push(record.clone());
        }
        stamped
    }

    fn stamp_services(&self, killed: bool) -> Vec<ServiceRecord> {
        let mut state = self.lock_state();
        let mut stamped = Vec::new();
        for record in state.services.values_mut() {
            if record.status.is_terminal() {
                continue;
            }
            let to = match record.status {
                Status::Pending => Status::Skipped,
                _ if killed => Status::Killed,
                _ => Status::Success,
            };
            record.transition(to);
            stamped.push(record.clone());
        }
        stamped
    }

    /// Container numbers must be positive and unique within their class
    /// for one pipeline execution.
    fn validate_numbers(&self) -> Result<()> {
        let pipeline = &self.package.pipeline;

        let mut seen = HashSet::new();
        for step in pipeline.steps() {
            if step.number <= 0 {
                return Err(Error::InvalidConfiguration(format!(
                    "step {} has non-positive number {}",
                    step.name, step.number
                )));
            }
            if !seen.insert(step.number) {
                return Err(Error::InvalidConfiguration(format!(
                    "step number {} is not unique",
                    step.number
                )));
            }
        }

        let mut seen = HashSet::new();
        for service in &pipeline.services {
            if service.number <= 0 {
                return Err(Error::InvalidConfiguration(format!(
                    "service {} has non-positive number {}",
                    service.name, service.number
                )));
            }
            if !seen.insert(service.number) {
                return Err(Error::InvalidConfiguration(format!(
                    "service number {} is not unique",
                    service.number
                )));
            }
        }

        Ok(())
    }
}
