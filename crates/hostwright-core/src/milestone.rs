// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Milestone definitions and the upstream label catalog.
//!
//! Every operation carries a fixed, ordered list of milestones. The last one
//! is always [`COMPLETE`]; it marks the end of the operation and has no step
//! attached. For every other index `i`, the step emitted by the builder at
//! position `i` carries the key of milestone `i`.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::provisioner::ProvisionerRegistry;

/// Key of the synthetic final milestone.
pub const COMPLETE: &str = "complete";

/// A named, human-labeled checkpoint within an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Milestone {
    /// Stable machine key (also stored on progress events).
    pub key: &'static str,
    /// Label shown to users.
    pub label: &'static str,
}

impl Milestone {
    /// Const constructor for milestone tables.
    pub const fn new(key: &'static str, label: &'static str) -> Self {
        Self { key, label }
    }
}

/// The final milestone every list ends with.
pub const COMPLETE_MILESTONE: Milestone = Milestone::new(COMPLETE, "Complete");

/// Resolve a key against a milestone list.
///
/// Unknown keys are not an error: they fall back to a humanized form.
pub fn label_for(milestones: &[Milestone], key: &str) -> String {
    milestones
        .iter()
        .find(|m| m.key == key)
        .map(|m| m.label.to_string())
        .unwrap_or_else(|| humanize(key))
}

/// `"install_packages"` → `"Install packages"`.
pub fn humanize(key: &str) -> String {
    let spaced = key.replace(['_', '-', '.'], " ");
    let trimmed = spaced.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = trimmed.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Serializable `{key, label}` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MilestoneView {
    /// Milestone key.
    pub key: String,
    /// Milestone label.
    pub label: String,
}

impl From<&Milestone> for MilestoneView {
    fn from(m: &Milestone) -> Self {
        Self {
            key: m.key.to_string(),
            label: m.label.to_string(),
        }
    }
}

/// Milestones of every registered operation, keyed by operation string.
pub fn catalog(registry: &ProvisionerRegistry) -> BTreeMap<String, Vec<MilestoneView>> {
    registry
        .iter()
        .map(|p| {
            (
                p.operation.to_string(),
                p.milestones.iter().map(MilestoneView::from).collect(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST: &[Milestone] = &[
        Milestone::new("add_repository", "Adding package repository"),
        COMPLETE_MILESTONE,
    ];

    #[test]
    fn test_label_lookup() {
        assert_eq!(label_for(LIST, "add_repository"), "Adding package repository");
        assert_eq!(label_for(LIST, "complete"), "Complete");
    }

    #[test]
    fn test_unknown_key_is_humanized() {
        assert_eq!(label_for(LIST, "install_packages"), "Install packages");
        assert_eq!(humanize("reload-proxy"), "Reload proxy");
        assert_eq!(humanize(""), "");
    }

    #[test]
    fn test_catalog_covers_every_operation() {
        let registry = ProvisionerRegistry::default();
        let catalog = catalog(&registry);
        assert_eq!(catalog.len(), registry.iter().count());
        for (operation, milestones) in &catalog {
            assert_eq!(
                milestones.last().map(|m| m.key.as_str()),
                Some(COMPLETE),
                "{operation} must end with complete"
            );
        }
        let json = serde_json::to_value(&catalog).unwrap();
        assert!(json.get("php.install").is_some());
    }
}
