// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rollback of singleton swaps.
//!
//! Operations that move a server-wide default take a snapshot of the current
//! holder before touching anything. If the operation fails permanently the
//! snapshot's holder is reasserted as the only default of its scope. The
//! snapshot is written once per resource, so a retry after a partial swap
//! still restores the state from before the first attempt.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;
use crate::persistence::{Persistence, SnapshotRecord};
use crate::resource::ManagedResource;

/// Captures and restores pre-change singleton state.
pub struct RollbackManager<P: Persistence + ?Sized> {
    persistence: Arc<P>,
}

impl<P: Persistence + ?Sized> Clone for RollbackManager<P> {
    fn clone(&self) -> Self {
        Self {
            persistence: Arc::clone(&self.persistence),
        }
    }
}

impl<P: Persistence + ?Sized> RollbackManager<P> {
    /// Manager over `persistence`.
    pub fn new(persistence: Arc<P>) -> Self {
        Self { persistence }
    }

    /// Snapshot the default holder of `resource`'s scope unless a snapshot
    /// for this resource already exists. Returns the stored snapshot.
    pub async fn capture_before_state(&self, resource: &ManagedResource) -> Result<SnapshotRecord> {
        let previous_default = self
            .persistence
            .current_default(resource.server_id, resource.kind)
            .await?;
        let snapshot = SnapshotRecord {
            resource_id: resource.id,
            server_id: resource.server_id,
            kind: resource.kind,
            previous_default,
            created_at: Utc::now(),
        };

        if self.persistence.save_snapshot_if_absent(&snapshot).await? {
            debug!(
                resource_id = %resource.id,
                previous_default = ?previous_default,
                "Captured rollback snapshot"
            );
            return Ok(snapshot);
        }

        // An earlier attempt already captured the original state.
        Ok(self
            .persistence
            .get_snapshot(resource.id)
            .await?
            .unwrap_or(snapshot))
    }

    /// Reassert the snapshot's default holder and drop the snapshot.
    ///
    /// Returns `false` when there was nothing to restore. Safe to call more
    /// than once.
    pub async fn restore(&self, resource_id: Uuid) -> Result<bool> {
        let Some(snapshot) = self.persistence.get_snapshot(resource_id).await? else {
            return Ok(false);
        };

        self.persistence
            .set_default(snapshot.server_id, snapshot.kind, snapshot.previous_default)
            .await?;
        self.persistence.delete_snapshot(resource_id).await?;

        info!(
            resource_id = %resource_id,
            server_id = %snapshot.server_id,
            kind = %snapshot.kind,
            restored_default = ?snapshot.previous_default,
            "Restored singleton default"
        );
        Ok(true)
    }

    /// Drop the snapshot after a successful operation.
    pub async fn discard(&self, resource_id: Uuid) -> Result<()> {
        self.persistence.delete_snapshot(resource_id).await
    }
}
