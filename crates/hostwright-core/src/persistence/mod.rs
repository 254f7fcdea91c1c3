// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for hostwright-core.
//!
//! Three traits split the store by concern:
//!
//! | Trait | Tables |
//! |-------|--------|
//! | [`ResourceStore`] | `servers`, `managed_resources`, `progress_events`, `rollback_snapshots` |
//! | [`LeaseStore`] | `resource_locks` |
//! | [`JobQueue`] | `provisioning_jobs` |
//!
//! [`Persistence`] bundles all three; both backends implement it.
//! Timestamps are always bound from Rust so SQLite text comparisons stay
//! consistent.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::types::Json;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::resource::{
    ManagedResource, NewResource, NewServer, Progress, ProgressEvent, ResourceKind, ServerRecord,
};
use crate::status::ResourceStatus;

// ============================================================================
// Records
// ============================================================================

/// Managed resource row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ResourceRow {
    /// Resource identifier.
    pub id: Uuid,
    /// Owning server.
    pub server_id: Uuid,
    /// Kind name.
    pub kind: String,
    /// Kind-specific key.
    pub resource_key: String,
    /// Status name.
    pub status: String,
    /// Config document.
    pub config: Json<Value>,
    /// Progress step.
    pub progress_step: i32,
    /// Progress total.
    pub progress_total: i32,
    /// Progress label.
    pub progress_label: Option<String>,
    /// Last failure text.
    pub error_log: Option<String>,
    /// Default flag.
    pub is_default: bool,
    /// Install timestamp.
    pub installed_at: Option<DateTime<Utc>>,
    /// Removal timestamp.
    pub uninstalled_at: Option<DateTime<Utc>>,
    /// Last entry into `failed`.
    pub failed_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last write timestamp.
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ResourceRow> for ManagedResource {
    type Error = CoreError;

    fn try_from(row: ResourceRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            server_id: row.server_id,
            kind: parse_kind(&row.kind)?,
            resource_key: row.resource_key,
            status: parse_status(&row.status)?,
            config: row.config.0,
            progress: Progress {
                step: row.progress_step,
                total: row.progress_total,
                label: row.progress_label,
            },
            error_log: row.error_log,
            is_default: row.is_default,
            installed_at: row.installed_at,
            uninstalled_at: row.uninstalled_at,
            failed_at: row.failed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Progress event row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRow {
    /// Database primary key.
    pub id: i64,
    /// Owning server.
    pub server_id: Uuid,
    /// Resource the event belongs to.
    pub resource_id: Uuid,
    /// Operation string.
    pub operation: String,
    /// Milestone key.
    pub milestone: String,
    /// Step reached.
    pub current_step: i32,
    /// Milestone count.
    pub total_steps: i32,
    /// Status name.
    pub status: String,
    /// Structured details.
    pub details: Option<Json<Value>>,
    /// Failure text.
    pub error_log: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for ProgressEvent {
    type Error = CoreError;

    fn try_from(row: EventRow) -> Result<Self> {
        Ok(Self {
            id: Some(row.id),
            server_id: row.server_id,
            resource_id: row.resource_id,
            operation: row.operation,
            milestone: row.milestone,
            current_step: row.current_step,
            total_steps: row.total_steps,
            status: parse_status(&row.status)?,
            details: row.details.map(|d| d.0),
            error_log: row.error_log,
            created_at: row.created_at,
        })
    }
}

/// Pre-change state of a singleton scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    /// Resource whose operation took the snapshot.
    pub resource_id: Uuid,
    /// Server of the scope.
    pub server_id: Uuid,
    /// Kind of the scope.
    pub kind: ResourceKind,
    /// Default holder before the operation, if any.
    pub previous_default: Option<Uuid>,
    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,
}

/// Snapshot row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SnapshotRow {
    /// Resource whose operation took the snapshot.
    pub resource_id: Uuid,
    /// Server of the scope.
    pub server_id: Uuid,
    /// Kind name.
    pub kind: String,
    /// Previous default holder.
    pub previous_default: Option<Uuid>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl TryFrom<SnapshotRow> for SnapshotRecord {
    type Error = CoreError;

    fn try_from(row: SnapshotRow) -> Result<Self> {
        Ok(Self {
            resource_id: row.resource_id,
            server_id: row.server_id,
            kind: parse_kind(&row.kind)?,
            previous_default: row.previous_default,
            created_at: row.created_at,
        })
    }
}

/// Queue state of a provisioning job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Waiting for `available_at`.
    Queued,
    /// Claimed by a worker until `reserved_until`.
    Reserved,
    /// Finished successfully.
    Done,
    /// Given up on.
    Buried,
}

impl JobState {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Reserved => "reserved",
            Self::Done => "done",
            Self::Buried => "buried",
        }
    }

    /// Parse the database representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "reserved" => Some(Self::Reserved),
            "done" => Some(Self::Done),
            "buried" => Some(Self::Buried),
            _ => None,
        }
    }
}

/// A provisioning request as delivered by the queue.
#[derive(Debug, Clone)]
pub struct ProvisioningJob {
    /// Job identifier.
    pub id: Uuid,
    /// Operation string (`php.install`).
    pub operation: String,
    /// Target server.
    pub server_id: Uuid,
    /// Target resource.
    pub resource_id: Uuid,
    /// Desired config carried by the request.
    pub config: Value,
    /// Queue state.
    pub state: JobState,
    /// Deliveries so far, including the current one.
    pub attempts: u32,
    /// Failed attempts so far, excluding the current one.
    pub exceptions: u32,
    /// Earliest time the job may be claimed.
    pub available_at: DateTime<Utc>,
    /// Worker holding the reservation.
    pub reserved_by: Option<String>,
    /// Reservation expiry.
    pub reserved_until: Option<DateTime<Utc>>,
    /// Last recorded failure.
    pub last_error: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Job row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    /// Job identifier.
    pub id: Uuid,
    /// Operation string.
    pub operation: String,
    /// Target server.
    pub server_id: Uuid,
    /// Target resource.
    pub resource_id: Uuid,
    /// Desired config.
    pub config: Json<Value>,
    /// State name.
    pub state: String,
    /// Delivery count.
    pub attempts: i32,
    /// Failure count.
    pub exceptions: i32,
    /// Earliest claim time.
    pub available_at: DateTime<Utc>,
    /// Reservation holder.
    pub reserved_by: Option<String>,
    /// Reservation expiry.
    pub reserved_until: Option<DateTime<Utc>>,
    /// Last failure.
    pub last_error: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for ProvisioningJob {
    type Error = CoreError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            operation: row.operation,
            server_id: row.server_id,
            resource_id: row.resource_id,
            config: row.config.0,
            state: JobState::parse(&row.state).ok_or_else(|| decode_error("state", &row.state))?,
            attempts: row.attempts.max(0) as u32,
            exceptions: row.exceptions.max(0) as u32,
            available_at: row.available_at,
            reserved_by: row.reserved_by,
            reserved_until: row.reserved_until,
            last_error: row.last_error,
            created_at: row.created_at,
        })
    }
}

fn decode_error(field: &str, value: &str) -> CoreError {
    CoreError::Database {
        operation: "decode".to_string(),
        details: format!("unknown {field} '{value}'"),
    }
}

fn parse_kind(value: &str) -> Result<ResourceKind> {
    ResourceKind::parse(value).ok_or_else(|| decode_error("kind", value))
}

fn parse_status(value: &str) -> Result<ResourceStatus> {
    ResourceStatus::parse(value).ok_or_else(|| decode_error("status", value))
}

/// Validate a status write before it reaches SQL.
///
/// The table must allow `from -> to`, and entering `failed` needs a
/// non-empty error text.
pub fn check_transition(
    resource_id: Uuid,
    from: ResourceStatus,
    to: ResourceStatus,
    error_log: Option<&str>,
) -> Result<()> {
    from.transition(resource_id, to)?;
    if to == ResourceStatus::Failed && error_log.is_none_or(|e| e.trim().is_empty()) {
        return Err(CoreError::validation(
            "error_log",
            "entering failed requires a diagnostic",
        ));
    }
    Ok(())
}

/// Timestamp columns a transition stamps.
pub(crate) struct TransitionStamps {
    pub clear_error: bool,
    pub installed_at: Option<DateTime<Utc>>,
    pub uninstalled_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl TransitionStamps {
    pub(crate) fn for_status(to: ResourceStatus, now: DateTime<Utc>) -> Self {
        Self {
            clear_error: to.clears_error_log(),
            installed_at: matches!(to, ResourceStatus::Installed | ResourceStatus::Active)
                .then_some(now),
            uninstalled_at: (to == ResourceStatus::Removed).then_some(now),
            failed_at: (to == ResourceStatus::Failed).then_some(now),
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Servers, resources, progress events and rollback snapshots.
///
/// Lookups return `Ok(None)` for rows that do not exist, so failure paths
/// can run after a resource was deleted.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Register a server.
    async fn insert_server(&self, server: &NewServer) -> Result<ServerRecord>;

    /// Load a server.
    async fn get_server(&self, server_id: Uuid) -> Result<Option<ServerRecord>>;

    /// Create a resource in `pending`.
    async fn insert_resource(&self, resource: &NewResource) -> Result<ManagedResource>;

    /// Load a resource.
    async fn get_resource(&self, resource_id: Uuid) -> Result<Option<ManagedResource>>;

    /// Resources of a server, optionally of one kind, oldest first.
    async fn list_resources(
        &self,
        server_id: Uuid,
        kind: Option<ResourceKind>,
    ) -> Result<Vec<ManagedResource>>;

    /// A resource of `kind` on the server that is neither failed nor removed.
    async fn find_live_resource(
        &self,
        server_id: Uuid,
        kind: ResourceKind,
    ) -> Result<Option<ManagedResource>>;

    /// The live resource of `kind` with `resource_key` on the server.
    async fn find_live_resource_by_key(
        &self,
        server_id: Uuid,
        kind: ResourceKind,
        resource_key: &str,
    ) -> Result<Option<ManagedResource>>;

    /// Delete a resource row. Returns whether a row was removed.
    async fn delete_resource(&self, resource_id: Uuid) -> Result<bool>;

    /// Compare-and-set the status.
    ///
    /// Returns `false` when the row is gone or no longer in `from`.
    async fn transition_status(
        &self,
        resource_id: Uuid,
        from: ResourceStatus,
        to: ResourceStatus,
        error_log: Option<&str>,
    ) -> Result<bool>;

    /// Record a failure without changing the status.
    async fn set_error_log(&self, resource_id: Uuid, error_log: &str) -> Result<()>;

    /// Overwrite the progress fields.
    async fn update_progress(&self, resource_id: Uuid, progress: &Progress) -> Result<()>;

    /// Merge keys into the config (top-level). Returns the merged config.
    async fn merge_config(&self, resource_id: Uuid, patch: &Map<String, Value>) -> Result<Value>;

    /// Make `holder` the only default of `(server_id, kind)`, or clear it.
    async fn set_default(
        &self,
        server_id: Uuid,
        kind: ResourceKind,
        holder: Option<Uuid>,
    ) -> Result<()>;

    /// Current default holder of `(server_id, kind)`.
    async fn current_default(&self, server_id: Uuid, kind: ResourceKind) -> Result<Option<Uuid>>;

    /// Append a progress event. Returns its id.
    async fn append_event(&self, event: &ProgressEvent) -> Result<i64>;

    /// Events of a resource, oldest first.
    async fn list_events(&self, resource_id: Uuid) -> Result<Vec<ProgressEvent>>;

    /// Delete up to `limit` events created before `cutoff`.
    async fn delete_events_before(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64>;

    /// Store a snapshot unless one exists for the resource.
    ///
    /// Returns `true` if this call stored it.
    async fn save_snapshot_if_absent(&self, snapshot: &SnapshotRecord) -> Result<bool>;

    /// Load the snapshot of a resource.
    async fn get_snapshot(&self, resource_id: Uuid) -> Result<Option<SnapshotRecord>>;

    /// Drop the snapshot of a resource.
    async fn delete_snapshot(&self, resource_id: Uuid) -> Result<()>;
}

/// Expiring mutual-exclusion leases.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Take `key` for `ttl` unless another owner holds an unexpired lease.
    async fn try_acquire_lease(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Release `key` if `owner` holds it.
    async fn release_lease(&self, key: &str, owner: &str) -> Result<bool>;

    /// Delete expired leases. Returns how many were removed.
    async fn purge_expired_leases(&self) -> Result<u64>;
}

/// At-least-once job queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Queue an operation. Returns the job id.
    async fn enqueue(
        &self,
        operation: &str,
        server_id: Uuid,
        resource_id: Uuid,
        config: &Value,
    ) -> Result<Uuid>;

    /// Reserve the next available job for `visibility`.
    ///
    /// Jobs whose reservation expired are claimable again.
    async fn claim(&self, worker_id: &str, visibility: Duration) -> Result<Option<ProvisioningJob>>;

    /// Mark a job done.
    async fn complete(&self, job_id: Uuid) -> Result<()>;

    /// Put a job back after `delay`.
    ///
    /// `counted` releases count as a failed attempt; uncounted ones give the
    /// delivery back.
    async fn release(
        &self,
        job_id: Uuid,
        delay: Duration,
        counted: bool,
        error: Option<&str>,
    ) -> Result<()>;

    /// Give up on a job.
    async fn bury(&self, job_id: Uuid, error: &str) -> Result<()>;

    /// Load a job.
    async fn get_job(&self, job_id: Uuid) -> Result<Option<ProvisioningJob>>;

    /// Most recently queued job of a resource.
    async fn latest_job_for_resource(&self, resource_id: Uuid) -> Result<Option<ProvisioningJob>>;
}

/// Everything the engine, service and worker need from storage.
pub trait Persistence: ResourceStore + LeaseStore + JobQueue {}

impl<T: ResourceStore + LeaseStore + JobQueue> Persistence for T {}

/// `Duration` as a chrono offset, saturating on overflow.
pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
