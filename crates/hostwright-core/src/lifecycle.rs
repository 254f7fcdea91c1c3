// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job lifecycle: one queue delivery in, one [`JobOutcome`] out.
//!
//! An attempt resolves the provisioner, takes the exclusion lease, moves the
//! resource into its in-progress status, runs the step sequence over one SSH
//! session and moves the resource into its success status. Errors are
//! classified with [`CoreError::is_retryable`] against the operation's
//! [`JobPolicy`](crate::provisioner::JobPolicy). When the queue gives up,
//! [`ProvisioningEngine::failed`] marks the resource failed, runs the
//! compensation and writes the terminal audit event.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, error, info, instrument, warn};

use crate::compensation::RollbackManager;
use crate::credentials::CredentialProvider;
use crate::error::{CoreError, Result};
use crate::events::EventSink;
use crate::executor::{RemoteExecutor, StepHooks, StepRecord};
use crate::persistence::{Persistence, ProvisioningJob};
use crate::provisioner::{BuildContext, Provisioner, ProvisionerRegistry};
use crate::resource::ManagedResource;
use crate::session::{CommandOutput, SessionConnector, SshTarget};
use crate::status::ResourceStatus;
use crate::step::{LocalEffect, Step};
use crate::tracker::{MilestoneTracker, TrackedRun};

/// Delay before a job blocked by a busy exclusion scope is offered again.
pub const LEASE_RETRY_DELAY: Duration = Duration::from_secs(10);

/// What the queue should do with a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Operation finished (or had already finished). Ack the job.
    Completed,
    /// Exclusion scope busy. Put the job back without counting an attempt.
    Deferred {
        /// Delay before the next delivery.
        retry_after: Duration,
    },
    /// Transient failure within budget. Put the job back, counting it.
    Retry {
        /// Failure text.
        error: String,
        /// Delay before the next delivery.
        retry_after: Duration,
    },
    /// Permanent failure or budget exhausted. Call
    /// [`ProvisioningEngine::failed`] and bury the job.
    Failed {
        /// Failure text.
        error: String,
    },
    /// The resource changed status under the attempt (cancelled). Ack.
    Superseded,
    /// The resource no longer exists. Ack.
    Discarded,
}

impl JobOutcome {
    /// Short name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Deferred { .. } => "deferred",
            Self::Retry { .. } => "retry",
            Self::Failed { .. } => "failed",
            Self::Superseded => "superseded",
            Self::Discarded => "discarded",
        }
    }
}

/// Runs provisioning jobs.
#[derive(Clone)]
pub struct ProvisioningEngine {
    store: Arc<dyn Persistence>,
    registry: Arc<ProvisionerRegistry>,
    connector: Arc<dyn SessionConnector>,
    credentials: Arc<dyn CredentialProvider>,
    tracker: MilestoneTracker,
    rollback: RollbackManager<dyn Persistence>,
    worker_id: String,
}

impl ProvisioningEngine {
    /// Engine over the given collaborators.
    ///
    /// `worker_id` prefixes lease owners, so two engines must not share one.
    pub fn new(
        store: Arc<dyn Persistence>,
        registry: Arc<ProvisionerRegistry>,
        connector: Arc<dyn SessionConnector>,
        credentials: Arc<dyn CredentialProvider>,
        sink: Arc<dyn EventSink>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            tracker: MilestoneTracker::new(Arc::clone(&store), sink),
            rollback: RollbackManager::new(Arc::clone(&store)),
            store,
            registry,
            connector,
            credentials,
            worker_id: worker_id.into(),
        }
    }

    /// Registered provisioners.
    pub fn registry(&self) -> &ProvisionerRegistry {
        &self.registry
    }

    /// Worker identity used for lease ownership.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run one delivery of `job` and settle it on the queue.
    ///
    /// Completed, superseded and discarded jobs are acked. Deferred jobs go
    /// back uncounted, retries go back counted, and failed jobs run
    /// [`Self::failed`] before they are buried.
    pub async fn process(&self, job: &ProvisioningJob) -> Result<JobOutcome> {
        let outcome = self.run_attempt(job).await;
        match &outcome {
            JobOutcome::Completed | JobOutcome::Superseded | JobOutcome::Discarded => {
                self.store.complete(job.id).await?;
            }
            JobOutcome::Deferred { retry_after } => {
                self.store.release(job.id, *retry_after, false, None).await?;
            }
            JobOutcome::Retry { error, retry_after } => {
                self.store
                    .release(job.id, *retry_after, true, Some(error))
                    .await?;
            }
            JobOutcome::Failed { error } => {
                self.failed(job, error).await?;
                self.store.bury(job.id, error).await?;
            }
        }
        Ok(outcome)
    }

    /// Run one delivery of `job`.
    #[instrument(
        skip(self, job),
        fields(
            job_id = %job.id,
            operation = %job.operation,
            resource_id = %job.resource_id,
            attempt = job.attempts
        )
    )]
    pub async fn run_attempt(&self, job: &ProvisioningJob) -> JobOutcome {
        let provisioner = match self.registry.resolve(&job.operation) {
            Ok(provisioner) => provisioner,
            Err(e) => {
                error!(error = %e, "No provisioner for operation");
                return JobOutcome::Failed {
                    error: e.to_string(),
                };
            }
        };

        let resource = match self.store.get_resource(job.resource_id).await {
            Ok(Some(resource)) => resource,
            Ok(None) => {
                info!("Resource no longer exists, discarding job");
                return JobOutcome::Discarded;
            }
            Err(e) => return self.classify(job, provisioner, e).await,
        };

        let lease_key = provisioner.exclusion.lease_key(&resource);
        let owner = format!("{}:{}", self.worker_id, job.id);
        match self
            .store
            .try_acquire_lease(&lease_key, &owner, provisioner.policy.lease_ttl())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(lease_key = %lease_key, "Exclusion scope busy, deferring");
                return JobOutcome::Deferred {
                    retry_after: LEASE_RETRY_DELAY,
                };
            }
            Err(e) => return self.classify(job, provisioner, e).await,
        }

        let result = self.attempt(job, provisioner).await;

        if let Err(e) = self.store.release_lease(&lease_key, &owner).await {
            warn!(lease_key = %lease_key, error = %e, "Failed to release lease");
        }

        match result {
            Ok(outcome) => outcome,
            Err(e) => self.classify(job, provisioner, e).await,
        }
    }

    async fn attempt(&self, job: &ProvisioningJob, provisioner: &Provisioner) -> Result<JobOutcome> {
        // Reload under the lease.
        let Some(resource) = self.store.get_resource(job.resource_id).await? else {
            info!("Resource no longer exists, discarding job");
            return Ok(JobOutcome::Discarded);
        };

        // Failure or cancellation ends every job queued before it.
        if let Some(failed_at) = resource.failed_at
            && job.created_at < failed_at
        {
            info!(%failed_at, "Job was queued before the resource last failed, dropping");
            return Ok(JobOutcome::Superseded);
        }

        if provisioner.already_applied(&resource) {
            info!(status = %resource.status, "Operation already applied, acknowledging");
            self.rollback.discard(resource.id).await?;
            return Ok(JobOutcome::Completed);
        }

        let server = self
            .store
            .get_server(resource.server_id)
            .await?
            .ok_or(CoreError::ServerNotFound {
                server_id: resource.server_id,
            })?;

        let config = effective_config(&resource.config, &job.config);
        let steps = provisioner.build_steps(&BuildContext {
            resource: &resource,
            server: &server,
            config: &config,
        })?;

        if resource.status == provisioner.in_progress {
            debug!(status = %resource.status, "Resuming redelivered operation");
        } else {
            if resource.status == ResourceStatus::Failed
                && !resource.status.can_transition_to(provisioner.in_progress)
            {
                info!("Resource failed or was cancelled, dropping job");
                return Ok(JobOutcome::Superseded);
            }
            let entered = self
                .store
                .transition_status(resource.id, resource.status, provisioner.in_progress, None)
                .await?;
            if !entered {
                info!("Resource status changed before the run started");
                return Ok(JobOutcome::Superseded);
            }
        }

        if provisioner.compensation.is_some() {
            self.rollback.capture_before_state(&resource).await?;
        }

        let credential = self
            .credentials
            .resolve(server.id, provisioner.ssh_role)
            .await?;
        let target = SshTarget {
            host: server.host.clone(),
            port: u16::try_from(server.port)
                .map_err(|_| CoreError::validation("port", "out of range"))?,
            user: provisioner.ssh_role.login(&server.ssh_user).to_string(),
        };

        let run = TrackedRun {
            server_id: server.id,
            resource_id: resource.id,
            operation: &job.operation,
            milestones: provisioner.milestones,
            attempt: job.attempts,
        };
        let hooks = AttemptHooks {
            store: self.store.as_ref(),
            tracker: &self.tracker,
            run,
            resource: &resource,
            status: provisioner.in_progress,
        };

        info!(target = %target, steps = steps.len(), "Starting remote session");
        let mut session = self.connector.connect(&target, &credential).await?;
        let report = RemoteExecutor::new(provisioner.policy.timeout)
            .run(session.as_mut(), &steps, &hooks)
            .await?;
        drop(session);

        let finished = self
            .store
            .transition_status(resource.id, provisioner.in_progress, provisioner.success, None)
            .await?;
        if !finished {
            info!("Resource status changed during the run, result dropped");
            return Ok(JobOutcome::Superseded);
        }

        if let Err(e) = self.tracker.record_complete(&run, provisioner.success).await {
            warn!(error = %e, "Failed to record completion milestone");
        }
        self.rollback.discard(resource.id).await?;

        info!(
            status = %provisioner.success,
            duration_ms = u64::try_from(report.duration().as_millis()).unwrap_or(u64::MAX),
            "Operation completed"
        );
        Ok(JobOutcome::Completed)
    }

    async fn classify(
        &self,
        job: &ProvisioningJob,
        provisioner: &Provisioner,
        err: CoreError,
    ) -> JobOutcome {
        let message = err.to_string();
        let exceptions = job.exceptions + 1;

        if err.is_retryable() && provisioner.policy.allows_retry(job.attempts, exceptions) {
            if let Err(e) = self.store.set_error_log(job.resource_id, &message).await {
                warn!(error = %e, "Failed to record error log");
            }
            let retry_after = provisioner.policy.delay_for_attempt(exceptions);
            warn!(
                error = %message,
                code = err.error_code(),
                retry_after_secs = retry_after.as_secs(),
                "Attempt failed, will retry"
            );
            return JobOutcome::Retry {
                error: message,
                retry_after,
            };
        }

        error!(error = %message, code = err.error_code(), "Attempt failed permanently");
        JobOutcome::Failed { error: message }
    }

    /// Handle a job the queue gave up on.
    ///
    /// Forces the resource into `failed`, restores the singleton default if
    /// the operation compensates, and appends the terminal audit event. A
    /// deleted or removed resource is left alone.
    #[instrument(
        skip(self, job, error),
        fields(job_id = %job.id, operation = %job.operation, resource_id = %job.resource_id)
    )]
    pub async fn failed(&self, job: &ProvisioningJob, error: &str) -> Result<()> {
        let Some(resource) = self.store.get_resource(job.resource_id).await? else {
            debug!("Resource no longer exists, nothing to fail");
            return Ok(());
        };
        if resource.status == ResourceStatus::Removed {
            debug!("Resource already removed, nothing to fail");
            return Ok(());
        }

        let error = if error.trim().is_empty() {
            "operation failed"
        } else {
            error
        };

        if resource.status == ResourceStatus::Failed {
            self.store.set_error_log(resource.id, error).await?;
        } else if !self
            .store
            .transition_status(resource.id, resource.status, ResourceStatus::Failed, Some(error))
            .await?
        {
            warn!(status = %resource.status, "Resource changed while marking it failed");
        }

        let provisioner = self.registry.resolve(&job.operation).ok();
        if provisioner.is_some_and(|p| p.compensation.is_some()) {
            self.rollback.restore(resource.id).await?;
        }

        let run = TrackedRun {
            server_id: resource.server_id,
            resource_id: resource.id,
            operation: &job.operation,
            milestones: provisioner.map(|p| p.milestones).unwrap_or(&[]),
            attempt: job.attempts,
        };
        self.tracker
            .record_terminal_failure(&run, resource.progress.step, error)
            .await?;

        error!(error = %error, "Operation failed");
        Ok(())
    }
}

/// Stored config with the job's keys laid over it.
pub fn effective_config(stored: &Value, requested: &Value) -> Value {
    let Value::Object(overlay) = requested else {
        return stored.clone();
    };
    let mut merged = match stored {
        Value::Object(base) => base.clone(),
        _ => Map::new(),
    };
    for (key, value) in overlay {
        merged.insert(key.clone(), value.clone());
    }
    Value::Object(merged)
}

struct AttemptHooks<'a> {
    store: &'a dyn Persistence,
    tracker: &'a MilestoneTracker,
    run: TrackedRun<'a>,
    resource: &'a ManagedResource,
    status: ResourceStatus,
}

#[async_trait]
impl StepHooks for AttemptHooks<'_> {
    async fn apply_local(
        &self,
        effect: &LocalEffect,
        previous: Option<&CommandOutput>,
    ) -> Result<()> {
        match effect {
            LocalEffect::MergeConfig(patch) => {
                self.store.merge_config(self.resource.id, patch).await?;
            }
            LocalEffect::CaptureOutput { config_key } => {
                let captured = previous
                    .map(|output| output.stdout.trim())
                    .filter(|value| !value.is_empty())
                    .ok_or_else(|| {
                        CoreError::validation(*config_key, "previous step produced no output")
                    })?;
                let mut patch = Map::new();
                patch.insert(
                    (*config_key).to_string(),
                    Value::String(captured.to_string()),
                );
                self.store.merge_config(self.resource.id, &patch).await?;
            }
            LocalEffect::PromoteSingleton => {
                self.store
                    .set_default(
                        self.resource.server_id,
                        self.resource.kind,
                        Some(self.resource.id),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn step_finished(&self, index: usize, _step: &Step, record: &StepRecord) -> Result<()> {
        self.tracker
            .record_step(&self.run, self.status, index, record)
            .await
    }
}
