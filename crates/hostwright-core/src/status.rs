// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle status of a managed resource and its transition table.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Lifecycle status of a managed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Created by the request path, waiting for a worker.
    Pending,
    /// Install operation in flight.
    Installing,
    /// Software-style resource installed (database, PHP, repository).
    Installed,
    /// Service-style resource applied and running (rule, task, site).
    Active,
    /// Update operation in flight.
    Updating,
    /// Removal operation in flight.
    Removing,
    /// Removal finished. Terminal.
    Removed,
    /// Last operation failed permanently; `error_log` holds the reason.
    Failed,
}

/// Every status, in declaration order.
pub const ALL_STATUSES: [ResourceStatus; 8] = [
    ResourceStatus::Pending,
    ResourceStatus::Installing,
    ResourceStatus::Installed,
    ResourceStatus::Active,
    ResourceStatus::Updating,
    ResourceStatus::Removing,
    ResourceStatus::Removed,
    ResourceStatus::Failed,
];

impl ResourceStatus {
    /// Returns the string representation stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Active => "active",
            Self::Updating => "updating",
            Self::Removing => "removing",
            Self::Removed => "removed",
            Self::Failed => "failed",
        }
    }

    /// Parse a status from its database representation.
    pub fn parse(s: &str) -> Option<Self> {
        ALL_STATUSES.iter().copied().find(|status| status.as_str() == s)
    }

    /// Statuses reachable from `self`.
    pub fn successors(&self) -> &'static [ResourceStatus] {
        use ResourceStatus::*;
        match self {
            Pending => &[Installing, Failed, Removing],
            Installing => &[Installed, Active, Failed],
            Installed | Active => &[Updating, Removing, Failed],
            Updating => &[Installed, Active, Failed],
            Removing => &[Removed, Failed],
            Failed => &[Pending, Removing],
            Removed => &[],
        }
    }

    /// Whether `self -> to` is a legal transition.
    pub fn can_transition_to(&self, to: ResourceStatus) -> bool {
        self.successors().contains(&to)
    }

    /// Validate a transition for `resource_id`.
    pub fn transition(
        &self,
        resource_id: Uuid,
        to: ResourceStatus,
    ) -> Result<ResourceStatus, CoreError> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(CoreError::InvalidTransition {
                resource_id,
                from: self.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }

    /// An operation is currently running against the resource.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::Installing | Self::Updating | Self::Removing)
    }

    /// Successful end state of an operation.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Installed | Self::Active | Self::Removed)
    }

    /// Counts toward a singleton scope (anything but failed/removed).
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Failed | Self::Removed)
    }

    /// Entering this status clears `error_log`.
    pub fn clears_error_log(&self) -> bool {
        self.is_success()
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
