// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request-path helpers: submit, retry, cancel, timeline.
//!
//! These run in the web tier. They only touch the store and the queue; all
//! remote work happens in the worker.

use std::sync::Arc;

use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::compensation::RollbackManager;
use crate::error::{CoreError, Result};
use crate::persistence::Persistence;
use crate::provisioner::{Action, OperationKind, ProvisionerRegistry};
use crate::resource::{ManagedResource, NewResource, Progress, ProgressEvent};
use crate::status::ResourceStatus;

/// Error text written by [`ProvisioningService::cancel`].
pub const CANCELLED_BY_USER: &str = "Cancelled by user";

/// A provisioning request.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    /// Operation string (`php.install`).
    pub operation: String,
    /// Target server.
    pub server_id: Uuid,
    /// Existing resource, required for updates and uninstalls.
    pub resource_id: Option<Uuid>,
    /// Kind-specific key, required for installs.
    pub resource_key: Option<String>,
    /// Desired configuration.
    pub config: Value,
}

/// Result of a successful submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    /// Resource the job targets.
    pub resource_id: Uuid,
    /// Queued job.
    pub job_id: Uuid,
}

/// Creates resources and queues operations.
#[derive(Clone)]
pub struct ProvisioningService {
    store: Arc<dyn Persistence>,
    registry: Arc<ProvisionerRegistry>,
}

impl ProvisioningService {
    /// Service over `store` and `registry`.
    pub fn new(store: Arc<dyn Persistence>, registry: Arc<ProvisionerRegistry>) -> Self {
        Self { store, registry }
    }

    /// Validate a request, create or load its resource, and queue the job.
    ///
    /// Installs create a `pending` resource. A key that already has a live
    /// resource of the same kind is rejected with
    /// [`CoreError::DuplicateResource`], and a second live database engine on
    /// one server with [`CoreError::SingletonConflict`].
    pub async fn submit(&self, request: ProvisionRequest) -> Result<Submission> {
        let provisioner = self.registry.resolve(&request.operation)?;
        let operation = provisioner.operation;

        if self.store.get_server(request.server_id).await?.is_none() {
            return Err(CoreError::ServerNotFound {
                server_id: request.server_id,
            });
        }

        let resource = match operation.action {
            Action::Install => self.create_resource(&request, operation).await?,
            Action::Update | Action::Uninstall => {
                let resource_id = request
                    .resource_id
                    .ok_or_else(|| CoreError::validation("resource_id", "is required"))?;
                let resource = self.load(resource_id).await?;
                if resource.server_id != request.server_id || resource.kind != operation.kind {
                    return Err(CoreError::validation(
                        "resource_id",
                        format!("is not a {} resource on this server", operation.kind),
                    ));
                }
                // Reject early what the worker would refuse anyway.
                resource.status.transition(resource.id, provisioner.in_progress)?;
                resource
            }
        };

        let job_id = self
            .store
            .enqueue(&request.operation, resource.server_id, resource.id, &request.config)
            .await?;

        info!(
            resource_id = %resource.id,
            job_id = %job_id,
            operation = %request.operation,
            "Provisioning job queued"
        );
        Ok(Submission {
            resource_id: resource.id,
            job_id,
        })
    }

    async fn create_resource(
        &self,
        request: &ProvisionRequest,
        operation: OperationKind,
    ) -> Result<ManagedResource> {
        let resource_key = request
            .resource_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| CoreError::validation("resource_key", "is required"))?;

        if operation.kind.is_singleton()
            && let Some(existing) = self
                .store
                .find_live_resource(request.server_id, operation.kind)
                .await?
        {
            return Err(CoreError::SingletonConflict {
                server_id: request.server_id,
                kind: operation.kind.as_str().to_string(),
                existing: existing.id,
            });
        }

        if let Some(existing) = self
            .store
            .find_live_resource_by_key(request.server_id, operation.kind, resource_key)
            .await?
        {
            return Err(CoreError::DuplicateResource {
                server_id: request.server_id,
                kind: operation.kind.as_str().to_string(),
                resource_key: resource_key.to_string(),
                existing: existing.id,
            });
        }

        self.store
            .insert_resource(&NewResource {
                id: request.resource_id.unwrap_or_else(Uuid::new_v4),
                server_id: request.server_id,
                kind: operation.kind,
                resource_key: resource_key.to_string(),
                config: request.config.clone(),
            })
            .await
    }

    /// Move a failed resource back to `pending` and queue the failed
    /// operation again.
    ///
    /// A failed uninstall is queued as an uninstall with its original job
    /// config. Anything else is queued as an install with the stored config,
    /// since `pending` can only move forward by installing.
    pub async fn retry(&self, resource_id: Uuid) -> Result<Submission> {
        let resource = self.load(resource_id).await?;
        let uninstall = self
            .store
            .latest_job_for_resource(resource.id)
            .await?
            .filter(|job| {
                OperationKind::parse(&job.operation)
                    .is_ok_and(|op| op.kind == resource.kind && op.action == Action::Uninstall)
            });
        let (operation, config) = match uninstall {
            Some(job) => (OperationKind::new(resource.kind, Action::Uninstall), job.config),
            None => (
                OperationKind::new(resource.kind, Action::Install),
                resource.config.clone(),
            ),
        };
        self.registry.resolve(&operation.to_string())?;

        if !self
            .store
            .transition_status(resource.id, resource.status, ResourceStatus::Pending, None)
            .await?
        {
            return Err(CoreError::InvalidTransition {
                resource_id,
                from: resource.status.as_str().to_string(),
                to: ResourceStatus::Pending.as_str().to_string(),
            });
        }
        self.store
            .update_progress(resource.id, &Progress::default())
            .await?;

        let job_id = self
            .store
            .enqueue(
                &operation.to_string(),
                resource.server_id,
                resource.id,
                &config,
            )
            .await?;

        info!(
            resource_id = %resource_id,
            job_id = %job_id,
            operation = %operation,
            "Retry queued"
        );
        Ok(Submission {
            resource_id,
            job_id,
        })
    }

    /// Force a pending or running resource into `failed`.
    ///
    /// An attempt still running loses its final status write and ends as
    /// superseded. A swapped singleton default is restored.
    pub async fn cancel(&self, resource_id: Uuid) -> Result<()> {
        let resource = self.load(resource_id).await?;
        if !(resource.status == ResourceStatus::Pending || resource.status.is_in_progress()) {
            return Err(CoreError::InvalidTransition {
                resource_id,
                from: resource.status.as_str().to_string(),
                to: ResourceStatus::Failed.as_str().to_string(),
            });
        }

        let cancelled = self
            .store
            .transition_status(
                resource.id,
                resource.status,
                ResourceStatus::Failed,
                Some(CANCELLED_BY_USER),
            )
            .await?;
        if !cancelled {
            // Lost a race with the worker; report what the row holds now.
            let current = self.load(resource_id).await?;
            return Err(CoreError::InvalidTransition {
                resource_id,
                from: current.status.as_str().to_string(),
                to: ResourceStatus::Failed.as_str().to_string(),
            });
        }

        RollbackManager::new(Arc::clone(&self.store))
            .restore(resource.id)
            .await?;

        info!(resource_id = %resource_id, "Resource cancelled");
        Ok(())
    }

    /// Progress events of a resource, oldest first.
    pub async fn timeline(&self, resource_id: Uuid) -> Result<Vec<ProgressEvent>> {
        self.store.list_events(resource_id).await
    }

    async fn load(&self, resource_id: Uuid) -> Result<ManagedResource> {
        self.store
            .get_resource(resource_id)
            .await?
            .ok_or(CoreError::ResourceNotFound { resource_id })
    }
}
