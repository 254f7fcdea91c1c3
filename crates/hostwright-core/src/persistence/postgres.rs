// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL persistence for hostwright-core.
//!
//! Storage access is written as free functions over a [`PgPool`] so request
//! handlers can share the worker's queries; [`PostgresPersistence`]
//! delegates to them.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::resource::{
    ManagedResource, NewResource, NewServer, Progress, ProgressEvent, ResourceKind, ServerRecord,
};
use crate::status::ResourceStatus;

use super::{
    EventRow, JobQueue, JobRow, LeaseStore, ProvisioningJob, ResourceRow, ResourceStore,
    SnapshotRecord, SnapshotRow, TransitionStamps, check_transition, chrono_duration,
};

const RESOURCE_COLUMNS: &str = r#"
    id, server_id, kind, resource_key, status, config,
    progress_step, progress_total, progress_label, error_log, is_default,
    installed_at, uninstalled_at, failed_at, created_at, updated_at
"#;

const JOB_COLUMNS: &str = r#"
    id, operation, server_id, resource_id, config, state, attempts, exceptions,
    available_at, reserved_by, reserved_until, last_error, created_at
"#;

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    ///
    /// The pool must already be migrated.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Server and Resource Operations
// ============================================================================

/// Register a server.
pub async fn insert_server(pool: &PgPool, server: &NewServer) -> Result<ServerRecord> {
    let record = sqlx::query_as::<_, ServerRecord>(
        r#"
        INSERT INTO servers (id, name, host, port, ssh_user, created_at)
        VALUES ($1, $2, $3, $4, $5, NOW())
        RETURNING id, name, host, port, ssh_user, created_at
        "#,
    )
    .bind(server.id)
    .bind(&server.name)
    .bind(&server.host)
    .bind(i32::from(server.port))
    .bind(&server.ssh_user)
    .fetch_one(pool)
    .await?;

    Ok(record)
}

/// Load a server.
pub async fn get_server(pool: &PgPool, server_id: Uuid) -> Result<Option<ServerRecord>> {
    let record = sqlx::query_as::<_, ServerRecord>(
        "SELECT id, name, host, port, ssh_user, created_at FROM servers WHERE id = $1",
    )
    .bind(server_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Create a resource in `pending`.
///
/// A unique violation (second live database engine) becomes
/// [`CoreError::SingletonConflict`].
pub async fn insert_resource(pool: &PgPool, resource: &NewResource) -> Result<ManagedResource> {
    let inserted = sqlx::query_as::<_, ResourceRow>(&format!(
        r#"
        INSERT INTO managed_resources
            (id, server_id, kind, resource_key, status, config, created_at, updated_at)
        VALUES ($1, $2, $3, $4, 'pending', $5, NOW(), NOW())
        RETURNING {RESOURCE_COLUMNS}
        "#
    ))
    .bind(resource.id)
    .bind(resource.server_id)
    .bind(resource.kind.as_str())
    .bind(&resource.resource_key)
    .bind(Json(&resource.config))
    .fetch_one(pool)
    .await;

    match inserted {
        Ok(row) => row.try_into(),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            if let Some(existing) = find_live_resource_by_key(
                pool,
                resource.server_id,
                resource.kind,
                &resource.resource_key,
            )
            .await?
            {
                return Err(CoreError::DuplicateResource {
                    server_id: resource.server_id,
                    kind: resource.kind.as_str().to_string(),
                    resource_key: resource.resource_key.clone(),
                    existing: existing.id,
                });
            }
            let existing = find_live_resource(pool, resource.server_id, resource.kind)
                .await?
                .map(|r| r.id)
                .unwrap_or(resource.id);
            Err(CoreError::SingletonConflict {
                server_id: resource.server_id,
                kind: resource.kind.as_str().to_string(),
                existing,
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// Load a resource.
pub async fn get_resource(pool: &PgPool, resource_id: Uuid) -> Result<Option<ManagedResource>> {
    let row = sqlx::query_as::<_, ResourceRow>(&format!(
        "SELECT {RESOURCE_COLUMNS} FROM managed_resources WHERE id = $1"
    ))
    .bind(resource_id)
    .fetch_optional(pool)
    .await?;

    row.map(TryInto::try_into).transpose()
}

/// Resources of a server, optionally of one kind.
pub async fn list_resources(
    pool: &PgPool,
    server_id: Uuid,
    kind: Option<ResourceKind>,
) -> Result<Vec<ManagedResource>> {
    let rows = sqlx::query_as::<_, ResourceRow>(&format!(
        r#"
        SELECT {RESOURCE_COLUMNS} FROM managed_resources
        WHERE server_id = $1 AND ($2::text IS NULL OR kind = $2)
        ORDER BY created_at ASC
        "#
    ))
    .bind(server_id)
    .bind(kind.map(|k| k.as_str()))
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(TryInto::try_into).collect()
}

/// Oldest live resource of `kind` on the server.
pub async fn find_live_resource(
    pool: &PgPool,
    server_id: Uuid,
    kind: ResourceKind,
) -> Result<Option<ManagedResource>> {
    let row = sqlx::query_as::<_, ResourceRow>(&format!(
        r#"
        SELECT {RESOURCE_COLUMNS} FROM managed_resources
        WHERE server_id = $1 AND kind = $2 AND status NOT IN ('failed', 'removed')
        ORDER BY created_at ASC
        LIMIT 1
        "#
    ))
    .bind(server_id)
    .bind(kind.as_str())
    .fetch_optional(pool)
    .await?;

    row.map(TryInto::try_into).transpose()
}

/// Live resource of `kind` with the given key.
pub async fn find_live_resource_by_key(
    pool: &PgPool,
    server_id: Uuid,
    kind: ResourceKind,
    resource_key: &str,
) -> Result<Option<ManagedResource>> {
    let row = sqlx::query_as::<_, ResourceRow>(&format!(
        r#"
        SELECT {RESOURCE_COLUMNS} FROM managed_resources
        WHERE server_id = $1 AND kind = $2 AND resource_key = $3
          AND status NOT IN ('failed', 'removed')
        LIMIT 1
        "#
    ))
    .bind(server_id)
    .bind(kind.as_str())
    .bind(resource_key)
    .fetch_optional(pool)
    .await?;

    row.map(TryInto::try_into).transpose()
}

/// Compare-and-set the status of a resource.
pub async fn transition_status(
    pool: &PgPool,
    resource_id: Uuid,
    from: ResourceStatus,
    to: ResourceStatus,
    error_log: Option<&str>,
) -> Result<bool> {
    check_transition(resource_id, from, to, error_log)?;
    let stamps = TransitionStamps::for_status(to, Utc::now());

    let result = sqlx::query(
        r#"
        UPDATE managed_resources
        SET status = $1,
            error_log = CASE WHEN $2 THEN NULL ELSE COALESCE($3, error_log) END,
            installed_at = COALESCE($4, installed_at),
            uninstalled_at = COALESCE($5, uninstalled_at),
            failed_at = CASE WHEN $1 = 'failed' THEN NOW() ELSE failed_at END,
            updated_at = NOW()
        WHERE id = $6 AND status = $7
        "#,
    )
    .bind(to.as_str())
    .bind(stamps.clear_error)
    .bind(error_log)
    .bind(stamps.installed_at)
    .bind(stamps.uninstalled_at)
    .bind(resource_id)
    .bind(from.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Top-level JSON merge into the config.
pub async fn merge_config(
    pool: &PgPool,
    resource_id: Uuid,
    patch: &Map<String, Value>,
) -> Result<Value> {
    let merged: Option<(Json<Value>,)> = sqlx::query_as(
        r#"
        UPDATE managed_resources
        SET config = config || $2::jsonb, updated_at = NOW()
        WHERE id = $1
        RETURNING config
        "#,
    )
    .bind(resource_id)
    .bind(Json(patch))
    .fetch_optional(pool)
    .await?;

    merged
        .map(|m| m.0.0)
        .ok_or(CoreError::ResourceNotFound { resource_id })
}

/// Move the default flag of `(server_id, kind)` to `holder`.
pub async fn set_default(
    pool: &PgPool,
    server_id: Uuid,
    kind: ResourceKind,
    holder: Option<Uuid>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE managed_resources
        SET is_default = COALESCE(id = $3, FALSE), updated_at = NOW()
        WHERE server_id = $1 AND kind = $2
        "#,
    )
    .bind(server_id)
    .bind(kind.as_str())
    .bind(holder)
    .execute(pool)
    .await?;
    Ok(())
}

// ============================================================================
// Progress Events
// ============================================================================

/// Append a progress event.
pub async fn append_event(pool: &PgPool, event: &ProgressEvent) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO progress_events
            (server_id, resource_id, operation, milestone, current_step, total_steps,
             status, details, error_log, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        RETURNING id
        "#,
    )
    .bind(event.server_id)
    .bind(event.resource_id)
    .bind(&event.operation)
    .bind(&event.milestone)
    .bind(event.current_step)
    .bind(event.total_steps)
    .bind(event.status.as_str())
    .bind(event.details.as_ref().map(Json))
    .bind(event.error_log.as_deref())
    .bind(event.created_at)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

/// Events of a resource, oldest first.
pub async fn list_events(pool: &PgPool, resource_id: Uuid) -> Result<Vec<ProgressEvent>> {
    let rows = sqlx::query_as::<_, EventRow>(
        r#"
        SELECT id, server_id, resource_id, operation, milestone, current_step,
               total_steps, status, details, error_log, created_at
        FROM progress_events
        WHERE resource_id = $1
        ORDER BY id ASC
        "#,
    )
    .bind(resource_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(TryInto::try_into).collect()
}

/// Delete one batch of events older than `cutoff`.
pub async fn delete_events_before(pool: &PgPool, cutoff: DateTime<Utc>, limit: i64) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM progress_events
        WHERE id IN (
            SELECT id FROM progress_events WHERE created_at < $1 ORDER BY id LIMIT $2
        )
        "#,
    )
    .bind(cutoff)
    .bind(limit)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

// ============================================================================
// Job Queue
// ============================================================================

/// Reserve the next available job, skipping rows other workers hold.
pub async fn claim_job(
    pool: &PgPool,
    worker_id: &str,
    visibility: Duration,
) -> Result<Option<ProvisioningJob>> {
    let row = sqlx::query_as::<_, JobRow>(&format!(
        r#"
        WITH next AS (
            SELECT id AS next_id FROM provisioning_jobs
            WHERE (state = 'queued' AND available_at <= NOW())
               OR (state = 'reserved' AND reserved_until <= NOW())
            ORDER BY available_at ASC, created_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        UPDATE provisioning_jobs j
        SET state = 'reserved',
            attempts = j.attempts + 1,
            reserved_by = $1,
            reserved_until = $2,
            updated_at = NOW()
        FROM next
        WHERE j.id = next.next_id
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(worker_id)
    .bind(Utc::now() + chrono_duration(visibility))
    .fetch_optional(pool)
    .await?;

    row.map(TryInto::try_into).transpose()
}

/// Put a job back on the queue.
pub async fn release_job(
    pool: &PgPool,
    job_id: Uuid,
    delay: Duration,
    counted: bool,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE provisioning_jobs
        SET state = 'queued',
            attempts = CASE WHEN $2 THEN attempts ELSE GREATEST(attempts - 1, 0) END,
            exceptions = CASE WHEN $2 THEN exceptions + 1 ELSE exceptions END,
            available_at = $3,
            reserved_by = NULL,
            reserved_until = NULL,
            last_error = COALESCE($4, last_error),
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(counted)
    .bind(Utc::now() + chrono_duration(delay))
    .bind(error)
    .execute(pool)
    .await?;
    Ok(())
}

// ============================================================================
// Trait Implementation
// ============================================================================

#[async_trait]
impl ResourceStore for PostgresPersistence {
    async fn insert_server(&self, server: &NewServer) -> Result<ServerRecord> {
        insert_server(&self.pool, server).await
    }

    async fn get_server(&self, server_id: Uuid) -> Result<Option<ServerRecord>> {
        get_server(&self.pool, server_id).await
    }

    async fn insert_resource(&self, resource: &NewResource) -> Result<ManagedResource> {
        insert_resource(&self.pool, resource).await
    }

    async fn get_resource(&self, resource_id: Uuid) -> Result<Option<ManagedResource>> {
        get_resource(&self.pool, resource_id).await
    }

    async fn list_resources(
        &self,
        server_id: Uuid,
        kind: Option<ResourceKind>,
    ) -> Result<Vec<ManagedResource>> {
        list_resources(&self.pool, server_id, kind).await
    }

    async fn find_live_resource(
        &self,
        server_id: Uuid,
        kind: ResourceKind,
    ) -> Result<Option<ManagedResource>> {
        find_live_resource(&self.pool, server_id, kind).await
    }

    async fn find_live_resource_by_key(
        &self,
        server_id: Uuid,
        kind: ResourceKind,
        resource_key: &str,
    ) -> Result<Option<ManagedResource>> {
        find_live_resource_by_key(&self.pool, server_id, kind, resource_key).await
    }

    async fn delete_resource(&self, resource_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM managed_resources WHERE id = $1")
            .bind(resource_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn transition_status(
        &self,
        resource_id: Uuid,
        from: ResourceStatus,
        to: ResourceStatus,
        error_log: Option<&str>,
    ) -> Result<bool> {
        transition_status(&self.pool, resource_id, from, to, error_log).await
    }

    async fn set_error_log(&self, resource_id: Uuid, error_log: &str) -> Result<()> {
        sqlx::query("UPDATE managed_resources SET error_log = $2, updated_at = NOW() WHERE id = $1")
            .bind(resource_id)
            .bind(error_log)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_progress(&self, resource_id: Uuid, progress: &Progress) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE managed_resources
            SET progress_step = $2, progress_total = $3, progress_label = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(resource_id)
        .bind(progress.step)
        .bind(progress.total)
        .bind(progress.label.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn merge_config(&self, resource_id: Uuid, patch: &Map<String, Value>) -> Result<Value> {
        merge_config(&self.pool, resource_id, patch).await
    }

    async fn set_default(
        &self,
        server_id: Uuid,
        kind: ResourceKind,
        holder: Option<Uuid>,
    ) -> Result<()> {
        set_default(&self.pool, server_id, kind, holder).await
    }

    async fn current_default(&self, server_id: Uuid, kind: ResourceKind) -> Result<Option<Uuid>> {
        let holder: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM managed_resources
            WHERE server_id = $1 AND kind = $2 AND is_default
            LIMIT 1
            "#,
        )
        .bind(server_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(holder.map(|h| h.0))
    }

    async fn append_event(&self, event: &ProgressEvent) -> Result<i64> {
        append_event(&self.pool, event).await
    }

    async fn list_events(&self, resource_id: Uuid) -> Result<Vec<ProgressEvent>> {
        list_events(&self.pool, resource_id).await
    }

    async fn delete_events_before(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64> {
        delete_events_before(&self.pool, cutoff, limit).await
    }

    async fn save_snapshot_if_absent(&self, snapshot: &SnapshotRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO rollback_snapshots (resource_id, server_id, kind, previous_default, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (resource_id) DO NOTHING
            "#,
        )
        .bind(snapshot.resource_id)
        .bind(snapshot.server_id)
        .bind(snapshot.kind.as_str())
        .bind(snapshot.previous_default)
        .bind(snapshot.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_snapshot(&self, resource_id: Uuid) -> Result<Option<SnapshotRecord>> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            r#"
            SELECT resource_id, server_id, kind, previous_default, created_at
            FROM rollback_snapshots
            WHERE resource_id = $1
            "#,
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn delete_snapshot(&self, resource_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM rollback_snapshots WHERE resource_id = $1")
            .bind(resource_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for PostgresPersistence {
    async fn try_acquire_lease(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO resource_locks (lock_key, owner, acquired_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (lock_key) DO UPDATE
            SET owner = EXCLUDED.owner,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at
            WHERE resource_locks.expires_at <= $3 OR resource_locks.owner = EXCLUDED.owner
            "#,
        )
        .bind(key)
        .bind(owner)
        .bind(now)
        .bind(now + chrono_duration(ttl))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_lease(&self, key: &str, owner: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM resource_locks WHERE lock_key = $1 AND owner = $2")
            .bind(key)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired_leases(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM resource_locks WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl JobQueue for PostgresPersistence {
    async fn enqueue(
        &self,
        operation: &str,
        server_id: Uuid,
        resource_id: Uuid,
        config: &Value,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO provisioning_jobs
                (id, operation, server_id, resource_id, config, state, available_at,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 'queued', NOW(), NOW(), NOW())
            "#,
        )
        .bind(id)
        .bind(operation)
        .bind(server_id)
        .bind(resource_id)
        .bind(Json(config))
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn claim(&self, worker_id: &str, visibility: Duration) -> Result<Option<ProvisioningJob>> {
        claim_job(&self.pool, worker_id, visibility).await
    }

    async fn complete(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE provisioning_jobs
            SET state = 'done', reserved_by = NULL, reserved_until = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release(
        &self,
        job_id: Uuid,
        delay: Duration,
        counted: bool,
        error: Option<&str>,
    ) -> Result<()> {
        release_job(&self.pool, job_id, delay, counted, error).await
    }

    async fn bury(&self, job_id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE provisioning_jobs
            SET state = 'buried', reserved_by = NULL, reserved_until = NULL,
                last_error = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ProvisioningJob>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM provisioning_jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn latest_job_for_resource(&self, resource_id: Uuid) -> Result<Option<ProvisioningJob>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM provisioning_jobs
            WHERE resource_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }
}
