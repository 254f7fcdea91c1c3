// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
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

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    ///
    /// The pool must already be migrated.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the file if needed, then runs all
    /// migrations.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/hostwright.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::Database {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::Database {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        Self::migrated(pool).await
    }

    /// In-memory database, migrated. Used by tests and dry runs.
    pub async fn in_memory() -> Result<Self> {
        // A single connection keeps every query on the same in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::migrated(pool).await
    }

    async fn migrated(pool: SqlitePool) -> Result<Self> {
        crate::migrations::run_sqlite(&pool)
            .await
            .map_err(|e| CoreError::Database {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;
        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn current_status(&self, resource_id: Uuid) -> Result<Option<String>> {
        let status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM managed_resources WHERE id = ?")
                .bind(resource_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(status.map(|s| s.0))
    }
}

#[async_trait]
impl ResourceStore for SqlitePersistence {
    async fn insert_server(&self, server: &NewServer) -> Result<ServerRecord> {
        let record = sqlx::query_as::<_, ServerRecord>(
            r#"
            INSERT INTO servers (id, name, host, port, ssh_user, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id, name, host, port, ssh_user, created_at
            "#,
        )
        .bind(server.id)
        .bind(&server.name)
        .bind(&server.host)
        .bind(i32::from(server.port))
        .bind(&server.ssh_user)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_server(&self, server_id: Uuid) -> Result<Option<ServerRecord>> {
        let record = sqlx::query_as::<_, ServerRecord>(
            "SELECT id, name, host, port, ssh_user, created_at FROM servers WHERE id = ?",
        )
        .bind(server_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn insert_resource(&self, resource: &NewResource) -> Result<ManagedResource> {
        let now = Utc::now();
        let inserted = sqlx::query_as::<_, ResourceRow>(&format!(
            r#"
            INSERT INTO managed_resources
                (id, server_id, kind, resource_key, status, config, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'pending', ?, ?, ?)
            RETURNING {RESOURCE_COLUMNS}
            "#
        ))
        .bind(resource.id)
        .bind(resource.server_id)
        .bind(resource.kind.as_str())
        .bind(&resource.resource_key)
        .bind(Json(&resource.config))
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(row) => row.try_into(),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                if let Some(existing) = self
                    .find_live_resource_by_key(
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
                let existing = self
                    .find_live_resource(resource.server_id, resource.kind)
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

    async fn get_resource(&self, resource_id: Uuid) -> Result<Option<ManagedResource>> {
        let row = sqlx::query_as::<_, ResourceRow>(&format!(
            "SELECT {RESOURCE_COLUMNS} FROM managed_resources WHERE id = ?"
        ))
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn list_resources(
        &self,
        server_id: Uuid,
        kind: Option<ResourceKind>,
    ) -> Result<Vec<ManagedResource>> {
        let rows = sqlx::query_as::<_, ResourceRow>(&format!(
            r#"
            SELECT {RESOURCE_COLUMNS} FROM managed_resources
            WHERE server_id = ? AND (? IS NULL OR kind = ?)
            ORDER BY created_at ASC
            "#
        ))
        .bind(server_id)
        .bind(kind.map(|k| k.as_str()))
        .bind(kind.map(|k| k.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn find_live_resource(
        &self,
        server_id: Uuid,
        kind: ResourceKind,
    ) -> Result<Option<ManagedResource>> {
        let row = sqlx::query_as::<_, ResourceRow>(&format!(
            r#"
            SELECT {RESOURCE_COLUMNS} FROM managed_resources
            WHERE server_id = ? AND kind = ? AND status NOT IN ('failed', 'removed')
            ORDER BY created_at ASC
            LIMIT 1
            "#
        ))
        .bind(server_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn find_live_resource_by_key(
        &self,
        server_id: Uuid,
        kind: ResourceKind,
        resource_key: &str,
    ) -> Result<Option<ManagedResource>> {
        let row = sqlx::query_as::<_, ResourceRow>(&format!(
            r#"
            SELECT {RESOURCE_COLUMNS} FROM managed_resources
            WHERE server_id = ? AND kind = ? AND resource_key = ?
              AND status NOT IN ('failed', 'removed')
            LIMIT 1
            "#
        ))
        .bind(server_id)
        .bind(kind.as_str())
        .bind(resource_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn delete_resource(&self, resource_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM managed_resources WHERE id = ?")
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
        check_transition(resource_id, from, to, error_log)?;
        let now = Utc::now();
        let stamps = TransitionStamps::for_status(to, now);

        let result = sqlx::query(
            r#"
            UPDATE managed_resources
            SET status = ?,
                error_log = CASE WHEN ? THEN NULL ELSE COALESCE(?, error_log) END,
                installed_at = COALESCE(?, installed_at),
                uninstalled_at = COALESCE(?, uninstalled_at),
                failed_at = COALESCE(?, failed_at),
                updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(to.as_str())
        .bind(stamps.clear_error)
        .bind(error_log)
        .bind(stamps.installed_at)
        .bind(stamps.uninstalled_at)
        .bind(stamps.failed_at)
        .bind(now)
        .bind(resource_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let current = self.current_status(resource_id).await?;
            tracing::debug!(
                resource_id = %resource_id,
                from = %from,
                to = %to,
                current = ?current,
                "Status compare-and-set lost"
            );
            return Ok(false);
        }
        Ok(true)
    }

    async fn set_error_log(&self, resource_id: Uuid, error_log: &str) -> Result<()> {
        sqlx::query("UPDATE managed_resources SET error_log = ?, updated_at = ? WHERE id = ?")
            .bind(error_log)
            .bind(Utc::now())
            .bind(resource_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_progress(&self, resource_id: Uuid, progress: &Progress) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE managed_resources
            SET progress_step = ?, progress_total = ?, progress_label = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(progress.step)
        .bind(progress.total)
        .bind(progress.label.as_deref())
        .bind(Utc::now())
        .bind(resource_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn merge_config(&self, resource_id: Uuid, patch: &Map<String, Value>) -> Result<Value> {
        let merged: Option<(Json<Value>,)> = sqlx::query_as(
            r#"
            UPDATE managed_resources
            SET config = json_patch(config, ?), updated_at = ?
            WHERE id = ?
            RETURNING config
            "#,
        )
        .bind(Json(patch))
        .bind(Utc::now())
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;

        merged
            .map(|m| m.0.0)
            .ok_or(CoreError::ResourceNotFound { resource_id })
    }

    async fn set_default(
        &self,
        server_id: Uuid,
        kind: ResourceKind,
        holder: Option<Uuid>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE managed_resources
            SET is_default = CASE WHEN id = ? THEN 1 ELSE 0 END, updated_at = ?
            WHERE server_id = ? AND kind = ?
            "#,
        )
        .bind(holder)
        .bind(Utc::now())
        .bind(server_id)
        .bind(kind.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn current_default(&self, server_id: Uuid, kind: ResourceKind) -> Result<Option<Uuid>> {
        let holder: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM managed_resources
            WHERE server_id = ? AND kind = ? AND is_default = 1
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
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO progress_events
                (server_id, resource_id, operation, milestone, current_step, total_steps,
                 status, details, error_log, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
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
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn list_events(&self, resource_id: Uuid) -> Result<Vec<ProgressEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, server_id, resource_id, operation, milestone, current_step,
                   total_steps, status, details, error_log, created_at
            FROM progress_events
            WHERE resource_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn delete_events_before(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM progress_events
            WHERE id IN (
                SELECT id FROM progress_events WHERE created_at < ? ORDER BY id LIMIT ?
            )
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn save_snapshot_if_absent(&self, snapshot: &SnapshotRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO rollback_snapshots (resource_id, server_id, kind, previous_default, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(resource_id) DO NOTHING
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
            WHERE resource_id = ?
            "#,
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn delete_snapshot(&self, resource_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM rollback_snapshots WHERE resource_id = ?")
            .bind(resource_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for SqlitePersistence {
    async fn try_acquire_lease(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO resource_locks (lock_key, owner, acquired_at, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(lock_key) DO UPDATE
            SET owner = excluded.owner,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
            WHERE resource_locks.expires_at <= ? OR resource_locks.owner = excluded.owner
            "#,
        )
        .bind(key)
        .bind(owner)
        .bind(now)
        .bind(now + chrono_duration(ttl))
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_lease(&self, key: &str, owner: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM resource_locks WHERE lock_key = ? AND owner = ?")
            .bind(key)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired_leases(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM resource_locks WHERE expires_at <= ?")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl JobQueue for SqlitePersistence {
    async fn enqueue(
        &self,
        operation: &str,
        server_id: Uuid,
        resource_id: Uuid,
        config: &Value,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO provisioning_jobs
                (id, operation, server_id, resource_id, config, state, available_at,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 'queued', ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(operation)
        .bind(server_id)
        .bind(resource_id)
        .bind(Json(config))
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn claim(&self, worker_id: &str, visibility: Duration) -> Result<Option<ProvisioningJob>> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE provisioning_jobs
            SET state = 'reserved',
                attempts = attempts + 1,
                reserved_by = ?,
                reserved_until = ?,
                updated_at = ?
            WHERE id = (
                SELECT id FROM provisioning_jobs
                WHERE (state = 'queued' AND available_at <= ?)
                   OR (state = 'reserved' AND reserved_until <= ?)
                ORDER BY available_at ASC, created_at ASC
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(worker_id)
        .bind(now + chrono_duration(visibility))
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn complete(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE provisioning_jobs
            SET state = 'done', reserved_by = NULL, reserved_until = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now())
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
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE provisioning_jobs
            SET state = 'queued',
                attempts = CASE WHEN ? THEN attempts ELSE MAX(attempts - 1, 0) END,
                exceptions = CASE WHEN ? THEN exceptions + 1 ELSE exceptions END,
                available_at = ?,
                reserved_by = NULL,
                reserved_until = NULL,
                last_error = COALESCE(?, last_error),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(counted)
        .bind(counted)
        .bind(now + chrono_duration(delay))
        .bind(error)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn bury(&self, job_id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE provisioning_jobs
            SET state = 'buried', reserved_by = NULL, reserved_until = NULL,
                last_error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(error)
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ProvisioningJob>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM provisioning_jobs WHERE id = ?"
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
            WHERE resource_id = ?
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::JobState;
    use serde_json::json;

    async fn store() -> SqlitePersistence {
        SqlitePersistence::in_memory().await.unwrap()
    }

    async fn seeded(store: &SqlitePersistence, kind: ResourceKind, key: &str) -> ManagedResource {
        let server_id = Uuid::new_v4();
        store
            .insert_server(&NewServer {
                id: server_id,
                name: "web-1".to_string(),
                host: "203.0.113.10".to_string(),
                port: 22,
                ssh_user: "forge".to_string(),
            })
            .await
            .unwrap();
        store
            .insert_resource(&NewResource {
                id: Uuid::new_v4(),
                server_id,
                kind,
                resource_key: key.to_string(),
                config: json!({"version": key}),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_resource_roundtrip() {
        let store = store().await;
        let resource = seeded(&store, ResourceKind::PhpRuntime, "8.3").await;
        assert_eq!(resource.status, ResourceStatus::Pending);

        let loaded = store.get_resource(resource.id).await.unwrap().unwrap();
        assert_eq!(loaded.kind, ResourceKind::PhpRuntime);
        assert_eq!(loaded.config_str("version"), Some("8.3"));
        assert!(store.get_resource(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let store = store().await;
        let resource = seeded(&store, ResourceKind::PhpRuntime, "8.3").await;

        assert!(
            store
                .transition_status(
                    resource.id,
                    ResourceStatus::Pending,
                    ResourceStatus::Installing,
                    None
                )
                .await
                .unwrap()
        );
        // Stale `from` loses.
        assert!(
            !store
                .transition_status(
                    resource.id,
                    ResourceStatus::Pending,
                    ResourceStatus::Installing,
                    None
                )
                .await
                .unwrap()
        );
        assert!(
            store
                .transition_status(
                    resource.id,
                    ResourceStatus::Installing,
                    ResourceStatus::Failed,
                    Some("boom")
                )
                .await
                .unwrap()
        );
        let failed = store.get_resource(resource.id).await.unwrap().unwrap();
        assert_eq!(failed.error_log.as_deref(), Some("boom"));
        let failed_at = failed.failed_at.expect("failed_at stamped");

        store
            .transition_status(
                resource.id,
                ResourceStatus::Failed,
                ResourceStatus::Pending,
                None,
            )
            .await
            .unwrap();
        store
            .transition_status(
                resource.id,
                ResourceStatus::Pending,
                ResourceStatus::Installing,
                None,
            )
            .await
            .unwrap();
        store
            .transition_status(
                resource.id,
                ResourceStatus::Installing,
                ResourceStatus::Installed,
                None,
            )
            .await
            .unwrap();
        let installed = store.get_resource(resource.id).await.unwrap().unwrap();
        assert_eq!(installed.error_log, None);
        assert!(installed.installed_at.is_some());
        // The last failure stays on record.
        assert_eq!(installed.failed_at, Some(failed_at));
    }

    #[tokio::test]
    async fn test_merge_config_keeps_other_keys() {
        let store = store().await;
        let resource = seeded(&store, ResourceKind::GitRepository, "repo").await;
        let mut patch = Map::new();
        patch.insert("branch".to_string(), json!("main"));
        let merged = store.merge_config(resource.id, &patch).await.unwrap();
        assert_eq!(merged, json!({"version": "repo", "branch": "main"}));

        let err = store
            .merge_config(Uuid::new_v4(), &patch)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "RESOURCE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_second_live_database_conflicts() {
        let store = store().await;
        let first = seeded(&store, ResourceKind::Database, "mysql").await;
        let err = store
            .insert_resource(&NewResource {
                id: Uuid::new_v4(),
                server_id: first.server_id,
                kind: ResourceKind::Database,
                resource_key: "postgresql".to_string(),
                config: json!({}),
            })
            .await
            .unwrap_err();
        match err {
            CoreError::SingletonConflict { existing, .. } => assert_eq!(existing, first.id),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_second_live_key_conflicts() {
        let store = store().await;
        let first = seeded(&store, ResourceKind::PhpRuntime, "8.3").await;
        let duplicate = NewResource {
            id: Uuid::new_v4(),
            server_id: first.server_id,
            kind: ResourceKind::PhpRuntime,
            resource_key: "8.3".to_string(),
            config: json!({"version": "8.3"}),
        };
        match store.insert_resource(&duplicate).await.unwrap_err() {
            CoreError::DuplicateResource { existing, .. } => assert_eq!(existing, first.id),
            other => panic!("unexpected {other:?}"),
        }

        // Same key under another kind is a different resource.
        store
            .insert_resource(&NewResource {
                id: Uuid::new_v4(),
                kind: ResourceKind::ScheduledTask,
                ..duplicate.clone()
            })
            .await
            .unwrap();

        // A failed row frees its key.
        store
            .transition_status(first.id, ResourceStatus::Pending, ResourceStatus::Failed, None)
            .await
            .unwrap();
        let second = store.insert_resource(&duplicate).await.unwrap();
        assert_eq!(
            store
                .find_live_resource_by_key(first.server_id, ResourceKind::PhpRuntime, "8.3")
                .await
                .unwrap()
                .map(|r| r.id),
            Some(second.id)
        );
    }

    #[tokio::test]
    async fn test_latest_job_for_resource() {
        let store = store().await;
        let resource = seeded(&store, ResourceKind::PhpRuntime, "8.3").await;
        assert!(
            store
                .latest_job_for_resource(resource.id)
                .await
                .unwrap()
                .is_none()
        );

        store
            .enqueue("php.install", resource.server_id, resource.id, &json!({}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let uninstall = store
            .enqueue("php.uninstall", resource.server_id, resource.id, &json!({}))
            .await
            .unwrap();

        let latest = store
            .latest_job_for_resource(resource.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, uninstall);
        assert_eq!(latest.operation, "php.uninstall");
    }

    #[tokio::test]
    async fn test_lease_exclusion_and_expiry() {
        let store = store().await;
        let ttl = Duration::from_secs(60);
        assert!(store.try_acquire_lease("k", "a", ttl).await.unwrap());
        assert!(!store.try_acquire_lease("k", "b", ttl).await.unwrap());
        // Re-entrant for the same owner.
        assert!(store.try_acquire_lease("k", "a", ttl).await.unwrap());
        assert!(!store.release_lease("k", "b").await.unwrap());
        assert!(store.release_lease("k", "a").await.unwrap());
        assert!(store.try_acquire_lease("k", "b", Duration::ZERO).await.unwrap());
        // Zero TTL is already expired.
        assert!(store.try_acquire_lease("k", "c", ttl).await.unwrap());
        assert_eq!(store.purge_expired_leases().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_job_claim_release_bury() {
        let store = store().await;
        let id = store
            .enqueue("php.install", Uuid::new_v4(), Uuid::new_v4(), &json!({}))
            .await
            .unwrap();

        let job = store.claim("w1", Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.state, JobState::Reserved);
        assert!(store.claim("w2", Duration::from_secs(60)).await.unwrap().is_none());

        store
            .release(id, Duration::ZERO, false, None)
            .await
            .unwrap();
        let job = store.claim("w1", Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert_eq!(job.exceptions, 0);

        store
            .release(id, Duration::ZERO, true, Some("exit 1"))
            .await
            .unwrap();
        let job = store.claim("w1", Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(job.exceptions, 1);
        assert_eq!(job.last_error.as_deref(), Some("exit 1"));

        store.bury(id, "gave up").await.unwrap();
        assert_eq!(
            store.get_job(id).await.unwrap().unwrap().state,
            JobState::Buried
        );
        assert!(store.claim("w1", Duration::from_secs(60)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_reservation_is_reclaimed() {
        let store = store().await;
        store
            .enqueue("cron.install", Uuid::new_v4(), Uuid::new_v4(), &json!({}))
            .await
            .unwrap();
        let first = store.claim("w1", Duration::ZERO).await.unwrap().unwrap();
        let again = store.claim("w2", Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(again.attempts, 2);
        assert_eq!(again.reserved_by.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn test_event_retention() {
        let store = store().await;
        let resource = seeded(&store, ResourceKind::ScheduledTask, "backup").await;
        for step in 1..=3 {
            store
                .append_event(&ProgressEvent {
                    id: None,
                    server_id: resource.server_id,
                    resource_id: resource.id,
                    operation: "cron.install".to_string(),
                    milestone: "write_entry".to_string(),
                    current_step: step,
                    total_steps: 3,
                    status: ResourceStatus::Installing,
                    details: None,
                    error_log: None,
                    created_at: Utc::now() - chrono::Duration::days(40),
                })
                .await
                .unwrap();
        }
        let cutoff = Utc::now() - chrono::Duration::days(30);
        assert_eq!(store.delete_events_before(cutoff, 2).await.unwrap(), 2);
        assert_eq!(store.list_events(resource.id).await.unwrap().len(), 1);
    }
}
