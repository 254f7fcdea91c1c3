// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Managed resources, servers, and progress records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::status::ResourceStatus;

/// Category of a provisioned capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Database engine (MySQL, MariaDB, PostgreSQL).
    Database,
    /// PHP runtime (CLI + FPM) of one version.
    PhpRuntime,
    /// One firewall rule.
    FirewallRule,
    /// A supervisord program.
    SupervisorTask,
    /// A cron entry.
    ScheduledTask,
    /// A Git checkout bound to a directory.
    GitRepository,
    /// One release of a site.
    Deployment,
    /// The reverse proxy's default-site designation.
    DefaultSite,
}

/// Every kind, in declaration order.
pub const ALL_KINDS: [ResourceKind; 8] = [
    ResourceKind::Database,
    ResourceKind::PhpRuntime,
    ResourceKind::FirewallRule,
    ResourceKind::SupervisorTask,
    ResourceKind::ScheduledTask,
    ResourceKind::GitRepository,
    ResourceKind::Deployment,
    ResourceKind::DefaultSite,
];

impl ResourceKind {
    /// Short name used in operation strings and lock keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::PhpRuntime => "php",
            Self::FirewallRule => "firewall",
            Self::SupervisorTask => "supervisor",
            Self::ScheduledTask => "cron",
            Self::GitRepository => "git",
            Self::Deployment => "deployment",
            Self::DefaultSite => "default_site",
        }
    }

    /// Parse a kind from its short name.
    pub fn parse(s: &str) -> Option<Self> {
        ALL_KINDS.iter().copied().find(|kind| kind.as_str() == s)
    }

    /// At most one live resource of this kind per server.
    pub fn is_singleton(&self) -> bool {
        matches!(self, Self::Database)
    }

    /// Resources of this kind compete for one default flag per server.
    pub fn has_default_flag(&self) -> bool {
        matches!(self, Self::DefaultSite)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress fields stored on the resource row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Steps completed so far (1-based after the first step).
    pub step: i32,
    /// Number of milestones of the running operation.
    pub total: i32,
    /// Human label of the last milestone reached.
    pub label: Option<String>,
}

impl Progress {
    /// Whether the last operation reached its `complete` milestone.
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.step == self.total
    }
}

/// One provisioned capability on one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedResource {
    /// Resource identifier.
    pub id: Uuid,
    /// Server the resource lives on.
    pub server_id: Uuid,
    /// Resource category.
    pub kind: ResourceKind,
    /// Kind-specific key: version, name, `proto/port`, domain, path.
    pub resource_key: String,
    /// Lifecycle status.
    pub status: ResourceStatus,
    /// Desired or normalized configuration.
    pub config: Value,
    /// Progress of the current or last operation.
    pub progress: Progress,
    /// Last failure diagnostic.
    pub error_log: Option<String>,
    /// Singleton flag (default site of its server).
    pub is_default: bool,
    /// When the resource last reached an installed/active state.
    pub installed_at: Option<DateTime<Utc>>,
    /// When the resource was removed.
    pub uninstalled_at: Option<DateTime<Utc>>,
    /// When the resource last entered `failed`. Jobs queued before this
    /// belong to an abandoned operation.
    pub failed_at: Option<DateTime<Utc>>,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// Last write to the row.
    pub updated_at: DateTime<Utc>,
}

impl ManagedResource {
    /// Read a string field from the stored config.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }
}

/// Fields the request path provides when creating a resource.
#[derive(Debug, Clone)]
pub struct NewResource {
    /// Resource identifier.
    pub id: Uuid,
    /// Server the resource lives on.
    pub server_id: Uuid,
    /// Resource category.
    pub kind: ResourceKind,
    /// Kind-specific key.
    pub resource_key: String,
    /// Initial configuration.
    pub config: Value,
}

/// A host reachable over SSH.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ServerRecord {
    /// Server identifier.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Hostname or IP address.
    pub host: String,
    /// SSH port.
    pub port: i32,
    /// Application (non-root) user.
    pub ssh_user: String,
    /// When the server was added.
    pub created_at: DateTime<Utc>,
}

/// Fields needed to register a server.
#[derive(Debug, Clone)]
pub struct NewServer {
    /// Server identifier.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Hostname or IP address.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Application (non-root) user.
    pub ssh_user: String,
}

/// Append-only audit record of a milestone reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Database primary key (None when inserting new events).
    pub id: Option<i64>,
    /// Server the resource lives on.
    pub server_id: Uuid,
    /// Resource the event belongs to.
    pub resource_id: Uuid,
    /// Operation string (e.g. `php.install`).
    pub operation: String,
    /// Milestone key.
    pub milestone: String,
    /// Step number reached.
    pub current_step: i32,
    /// Milestone count of the operation.
    pub total_steps: i32,
    /// Resource status when the event was written.
    pub status: ResourceStatus,
    /// Structured details (outcome, exit code, attempt).
    pub details: Option<Value>,
    /// Failure text, if any.
    pub error_log: Option<String>,
    /// When the event occurred.
    pub created_at: DateTime<Utc>,
}
