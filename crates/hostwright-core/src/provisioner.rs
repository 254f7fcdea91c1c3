// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provisioner values and the registry the engine resolves them from.
//!
//! A provisioner is plain data: the operation it handles, its milestone
//! list, a pure builder function and the policy the lifecycle wrapper
//! applies. One engine runs all of them.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use crate::credentials::CredentialRole;
use crate::error::{CoreError, Result};
use crate::milestone::Milestone;
use crate::provisioners;
use crate::resource::{ManagedResource, ResourceKind, ServerRecord};
use crate::status::ResourceStatus;
use crate::step::Step;
use crate::validation;

/// Grace added to the operation timeout to get the lease TTL.
pub const LEASE_GRACE: Duration = Duration::from_secs(60);

/// What an operation does to its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Action {
    /// Bring the resource into existence.
    Install,
    /// Change an installed resource.
    Update,
    /// Tear the resource down.
    Uninstall,
}

impl Action {
    /// Action name used in operation strings.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Update => "update",
            Self::Uninstall => "uninstall",
        }
    }

    /// Parse an action name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "install" => Some(Self::Install),
            "update" => Some(Self::Update),
            "uninstall" => Some(Self::Uninstall),
            _ => None,
        }
    }
}

/// `(kind, action)` pair, written `kind.action`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationKind {
    /// Resource category.
    pub kind: ResourceKind,
    /// Action applied to it.
    pub action: Action,
}

impl OperationKind {
    /// Build an operation kind.
    pub const fn new(kind: ResourceKind, action: Action) -> Self {
        Self { kind, action }
    }

    /// Parse `php.install` style strings.
    pub fn parse(s: &str) -> Result<Self> {
        let unknown = || CoreError::UnknownOperation {
            operation: s.to_string(),
        };
        let (kind, action) = s.split_once('.').ok_or_else(unknown)?;
        Ok(Self {
            kind: ResourceKind::parse(kind).ok_or_else(unknown)?,
            action: Action::parse(action).ok_or_else(unknown)?,
        })
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind.as_str(), self.action.as_str())
    }
}

/// Timeout and retry budget of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobPolicy {
    /// Budget for the whole remote session.
    pub timeout: Duration,
    /// Explicit attempt budget. 0 leaves it to `max_exceptions`.
    pub tries: u32,
    /// Hard cap on failed attempts, independent of `tries`.
    pub max_exceptions: u32,
    /// Base of the exponential retry delay.
    pub backoff: Duration,
}

impl Default for JobPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            tries: 0,
            max_exceptions: 3,
            backoff: Duration::from_secs(15),
        }
    }
}

impl JobPolicy {
    /// Whether another attempt is allowed.
    ///
    /// `attempts` and `exceptions` include the attempt that just failed.
    pub fn allows_retry(&self, attempts: u32, exceptions: u32) -> bool {
        if self.max_exceptions > 0 && exceptions >= self.max_exceptions {
            return false;
        }
        if self.tries > 0 && attempts >= self.tries {
            return false;
        }
        true
    }

    /// Delay before retry number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff.saturating_mul(multiplier)
    }

    /// TTL of the exclusion lease.
    pub fn lease_ttl(&self) -> Duration {
        self.timeout + LEASE_GRACE
    }
}

/// Scope two operations must not share while running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusionScope {
    /// `server:{id}:{kind}`
    ServerAndKind,
    /// `server:{id}:{kind}:{resource_key}`
    ServerKindAndKey,
    /// `server:{id}:resource:{resource_id}`
    ServerAndResource,
}

impl ExclusionScope {
    /// Lease key for `resource`.
    pub fn lease_key(&self, resource: &ManagedResource) -> String {
        match self {
            Self::ServerAndKind => format!("server:{}:{}", resource.server_id, resource.kind),
            Self::ServerKindAndKey => format!(
                "server:{}:{}:{}",
                resource.server_id, resource.kind, resource.resource_key
            ),
            Self::ServerAndResource => {
                format!("server:{}:resource:{}", resource.server_id, resource.id)
            }
        }
    }
}

/// Recovery an operation needs when it fails permanently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compensation {
    /// Reassert the singleton default held before the operation started.
    RestoreSingletonDefault,
}

/// Inputs to a builder.
#[derive(Debug, Clone, Copy)]
pub struct BuildContext<'a> {
    /// Resource the operation targets.
    pub resource: &'a ManagedResource,
    /// Server it lives on.
    pub server: &'a ServerRecord,
    /// Effective config (stored config overlaid with the job's config).
    pub config: &'a Value,
}

impl<'a> BuildContext<'a> {
    /// A required string field.
    pub fn required(&self, field: &str) -> Result<&'a str> {
        validation::required_str(self.config, field)
    }

    /// An optional string field.
    pub fn optional(&self, field: &str) -> Result<Option<&'a str>> {
        validation::optional_str(self.config, field)
    }

    /// A string field, falling back to the resource key.
    pub fn field_or_key(&self, field: &str) -> Result<&'a str> {
        match self.optional(field)? {
            Some(value) => Ok(value),
            None if !self.resource.resource_key.is_empty() => Ok(&self.resource.resource_key),
            None => Err(CoreError::validation(field, "is required")),
        }
    }

    /// The server's application user, validated.
    pub fn application_user(&self) -> Result<&'a str> {
        validation::validate_unix_user(&self.server.ssh_user)?;
        Ok(&self.server.ssh_user)
    }

    /// Resource id in its short, file-name friendly form.
    pub fn short_id(&self) -> String {
        short_id(self.resource.id)
    }
}

/// First eight hex digits of a UUID.
pub fn short_id(id: Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

/// Pure step builder.
pub type BuildFn = fn(&BuildContext<'_>) -> Result<Vec<Step>>;

/// Everything the engine needs to run one operation.
#[derive(Debug, Clone)]
pub struct Provisioner {
    /// Operation handled.
    pub operation: OperationKind,
    /// Milestones, ending with `complete`.
    pub milestones: &'static [Milestone],
    /// Step builder.
    pub build: BuildFn,
    /// Timeout and retry budget.
    pub policy: JobPolicy,
    /// Mutual-exclusion scope.
    pub exclusion: ExclusionScope,
    /// Account the session logs in as.
    pub ssh_role: CredentialRole,
    /// Status held while the operation runs.
    pub in_progress: ResourceStatus,
    /// Status entered on success.
    pub success: ResourceStatus,
    /// Failure compensation, if any.
    pub compensation: Option<Compensation>,
}

impl Provisioner {
    /// Provisioner with default policy and no compensation.
    ///
    /// Status flow follows the action: installs and updates end in
    /// `success`, uninstalls in `removed`.
    pub fn new(
        operation: OperationKind,
        milestones: &'static [Milestone],
        build: BuildFn,
        exclusion: ExclusionScope,
        ssh_role: CredentialRole,
        success: ResourceStatus,
    ) -> Self {
        let (in_progress, success) = match operation.action {
            Action::Install => (ResourceStatus::Installing, success),
            Action::Update => (ResourceStatus::Updating, success),
            Action::Uninstall => (ResourceStatus::Removing, ResourceStatus::Removed),
        };
        Self {
            operation,
            milestones,
            build,
            policy: JobPolicy::default(),
            exclusion,
            ssh_role,
            in_progress,
            success,
            compensation: None,
        }
    }

    /// Attach a compensation.
    pub fn with_compensation(mut self, compensation: Compensation) -> Self {
        self.compensation = Some(compensation);
        self
    }

    /// Override the job policy.
    pub fn with_policy(mut self, policy: JobPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Run the builder.
    pub fn build_steps(&self, ctx: &BuildContext<'_>) -> Result<Vec<Step>> {
        (self.build)(ctx)
    }

    /// Whether the resource already reflects a finished run of this operation.
    ///
    /// Only meaningful for installs and uninstalls; an update is always re-run.
    pub fn already_applied(&self, resource: &ManagedResource) -> bool {
        match self.operation.action {
            Action::Install => resource.status == self.success && resource.progress.is_complete(),
            Action::Uninstall => resource.status == ResourceStatus::Removed,
            Action::Update => false,
        }
    }
}

/// Lookup table of provisioners by operation.
#[derive(Debug, Clone)]
pub struct ProvisionerRegistry {
    provisioners: BTreeMap<OperationKind, Provisioner>,
}

impl ProvisionerRegistry {
    /// Registry without any provisioners.
    pub fn empty() -> Self {
        Self {
            provisioners: BTreeMap::new(),
        }
    }

    /// Add or replace a provisioner.
    pub fn register(&mut self, provisioner: Provisioner) {
        self.provisioners.insert(provisioner.operation, provisioner);
    }

    /// Provisioner for an operation kind.
    pub fn get(&self, operation: &OperationKind) -> Option<&Provisioner> {
        self.provisioners.get(operation)
    }

    /// Resolve an operation string.
    pub fn resolve(&self, operation: &str) -> Result<&Provisioner> {
        let kind = OperationKind::parse(operation)?;
        self.get(&kind).ok_or_else(|| CoreError::UnknownOperation {
            operation: operation.to_string(),
        })
    }

    /// Apply `policy` to every registered provisioner.
    pub fn with_policy(mut self, policy: JobPolicy) -> Self {
        for provisioner in self.provisioners.values_mut() {
            provisioner.policy = policy;
        }
        self
    }

    /// All provisioners, ordered by operation.
    pub fn iter(&self) -> impl Iterator<Item = &Provisioner> {
        self.provisioners.values()
    }
}

impl Default for ProvisionerRegistry {
    /// Registry holding every built-in operation.
    fn default() -> Self {
        let mut registry = Self::empty();
        for provisioner in provisioners::builtin() {
            registry.register(provisioner);
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_parse_and_display() {
        let op = OperationKind::parse("php.install").unwrap();
        assert_eq!(op, OperationKind::new(ResourceKind::PhpRuntime, Action::Install));
        assert_eq!(op.to_string(), "php.install");
        assert_eq!(
            OperationKind::parse("default_site.install").unwrap().kind,
            ResourceKind::DefaultSite
        );

        for bad in ["php", "php.reinstall", "redis.install", ""] {
            let err = OperationKind::parse(bad).unwrap_err();
            assert_eq!(err.error_code(), "UNKNOWN_OPERATION", "{bad}");
        }
    }

    #[test]
    fn test_policy_defaults() {
        let policy = JobPolicy::default();
        assert_eq!(policy.timeout, Duration::from_secs(600));
        assert_eq!(policy.tries, 0);
        assert_eq!(policy.max_exceptions, 3);
        assert_eq!(policy.lease_ttl(), Duration::from_secs(660));
    }

    #[test]
    fn test_backoff_is_exponential() {
        let policy = JobPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(15));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(60));
    }

    #[test]
    fn test_retry_budget() {
        // tries = 0: exception cap governs.
        let policy = JobPolicy::default();
        assert!(policy.allows_retry(1, 1));
        assert!(policy.allows_retry(5, 2));
        assert!(!policy.allows_retry(3, 3));

        // tries > 0: explicit attempt budget, exception cap still applies.
        let policy = JobPolicy {
            tries: 2,
            ..JobPolicy::default()
        };
        assert!(policy.allows_retry(1, 1));
        assert!(!policy.allows_retry(2, 1));

        let policy = JobPolicy {
            tries: 10,
            max_exceptions: 1,
            ..JobPolicy::default()
        };
        assert!(!policy.allows_retry(1, 1));
    }

    #[test]
    fn test_registry_resolves_builtins() {
        let registry = ProvisionerRegistry::default();
        assert_eq!(registry.iter().count(), 16);
        let php = registry.resolve("php.install").unwrap();
        assert_eq!(php.in_progress, ResourceStatus::Installing);
        assert_eq!(php.success, ResourceStatus::Installed);

        let rm = registry.resolve("php.uninstall").unwrap();
        assert_eq!(rm.in_progress, ResourceStatus::Removing);
        assert_eq!(rm.success, ResourceStatus::Removed);

        assert!(registry.resolve("deployment.uninstall").is_err());
    }

    #[test]
    fn test_only_default_site_compensates() {
        let registry = ProvisionerRegistry::default();
        let compensating: Vec<String> = registry
            .iter()
            .filter(|p| p.compensation.is_some())
            .map(|p| p.operation.to_string())
            .collect();
        assert_eq!(compensating, vec!["default_site.install".to_string()]);
    }

    #[test]
    fn test_short_id() {
        let id = Uuid::parse_str("0123abcd-0000-0000-0000-000000000000").unwrap();
        assert_eq!(short_id(id), "0123abcd");
    }
}
