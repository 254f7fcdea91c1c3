// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Firewall rules through `ufw`.

use serde_json::{Map, json};

use super::ensure_binary;
use crate::credentials::CredentialRole;
use crate::error::{CoreError, Result};
use crate::milestone::{COMPLETE_MILESTONE, Milestone};
use crate::provisioner::{Action, BuildContext, ExclusionScope, OperationKind, Provisioner};
use crate::resource::ResourceKind;
use crate::status::ResourceStatus;
use crate::step::{LocalEffect, Step};
use crate::validation::{validate_port, validate_protocol, validate_source};

const INSTALL: &[Milestone] = &[
    Milestone::new("ensure_firewall", "Ensuring firewall is installed"),
    Milestone::new("add_rule", "Adding firewall rule"),
    Milestone::new("reload_firewall", "Reloading firewall"),
    Milestone::new("store_config", "Saving configuration"),
    COMPLETE_MILESTONE,
];

const UNINSTALL: &[Milestone] = &[
    Milestone::new("delete_rule", "Deleting firewall rule"),
    Milestone::new("reload_firewall", "Reloading firewall"),
    COMPLETE_MILESTONE,
];

/// `firewall.install`
pub fn install() -> Provisioner {
    Provisioner::new(
        OperationKind::new(ResourceKind::FirewallRule, Action::Install),
        INSTALL,
        build_install,
        ExclusionScope::ServerAndKind,
        CredentialRole::Root,
        ResourceStatus::Active,
    )
}

/// `firewall.uninstall`
pub fn uninstall() -> Provisioner {
    Provisioner::new(
        OperationKind::new(ResourceKind::FirewallRule, Action::Uninstall),
        UNINSTALL,
        build_uninstall,
        ExclusionScope::ServerAndKind,
        CredentialRole::Root,
        ResourceStatus::Removed,
    )
}

struct Rule<'a> {
    port: u16,
    protocol: &'a str,
    source: &'a str,
    policy: &'a str,
}

impl Rule<'_> {
    /// Arguments shared by `ufw <policy>` and `ufw delete <policy>`.
    fn ufw_args(&self) -> String {
        format!(
            "{} from {} to any port {} proto {}",
            self.policy, self.source, self.port, self.protocol
        )
    }
}

fn rule<'a>(ctx: &BuildContext<'a>) -> Result<Rule<'a>> {
    let port = validate_port(ctx.config.get("port"))?;
    let protocol = ctx.optional("protocol")?.unwrap_or("tcp");
    validate_protocol(protocol)?;
    let source = ctx.optional("source")?.unwrap_or("any");
    validate_source(source)?;
    let policy = ctx.optional("policy")?.unwrap_or("allow");
    if !matches!(policy, "allow" | "deny") {
        return Err(CoreError::validation(
            "policy",
            format!("'{policy}' is not allow or deny"),
        ));
    }
    Ok(Rule {
        port,
        protocol,
        source,
        policy,
    })
}

fn build_install(ctx: &BuildContext<'_>) -> Result<Vec<Step>> {
    let rule = rule(ctx)?;

    let mut stored = Map::new();
    stored.insert("port".to_string(), json!(rule.port));
    stored.insert("protocol".to_string(), json!(rule.protocol));
    stored.insert("source".to_string(), json!(rule.source));
    stored.insert("policy".to_string(), json!(rule.policy));

    Ok(vec![
        Step::remote("ensure_firewall", ensure_binary("ufw", "ufw")),
        Step::remote(
            "add_rule",
            format!("ufw allow OpenSSH >/dev/null && ufw {}", rule.ufw_args()),
        ),
        Step::remote("reload_firewall", "ufw --force enable && ufw reload"),
        Step::local("store_config", LocalEffect::MergeConfig(stored)),
    ])
}

fn build_uninstall(ctx: &BuildContext<'_>) -> Result<Vec<Step>> {
    let rule = rule(ctx)?;
    Ok(vec![
        Step::remote(
            "delete_rule",
            format!("ufw delete {} || true", rule.ufw_args()),
        ),
        Step::remote("reload_firewall", "ufw reload || true"),
    ])
}
