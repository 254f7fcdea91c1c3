// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database engine install and removal (MySQL, MariaDB, PostgreSQL).

use serde_json::{Map, json};

use super::{APT, apt_install, apt_update};
use crate::credentials::CredentialRole;
use crate::error::Result;
use crate::milestone::{COMPLETE_MILESTONE, Milestone};
use crate::provisioner::{Action, BuildContext, ExclusionScope, OperationKind, Provisioner};
use crate::resource::ResourceKind;
use crate::status::ResourceStatus;
use crate::step::{LocalEffect, Step};
use crate::validation::validate_database_engine;

const INSTALL: &[Milestone] = &[
    Milestone::new("install_prerequisites", "Installing prerequisites"),
    Milestone::new("update_packages", "Updating package lists"),
    Milestone::new("install_engine", "Installing database engine"),
    Milestone::new("enable_service", "Starting database service"),
    Milestone::new("verify_service", "Verifying database service"),
    Milestone::new("store_config", "Saving configuration"),
    COMPLETE_MILESTONE,
];

const UNINSTALL: &[Milestone] = &[
    Milestone::new("stop_service", "Stopping database service"),
    Milestone::new("purge_packages", "Removing database packages"),
    Milestone::new("autoremove", "Cleaning up dependencies"),
    COMPLETE_MILESTONE,
];

const PGDG_KEYRING: &str = "/usr/share/postgresql-common/pgdg/apt.postgresql.org.asc";

/// `database.install`
pub fn install() -> Provisioner {
    Provisioner::new(
        OperationKind::new(ResourceKind::Database, Action::Install),
        INSTALL,
        build_install,
        ExclusionScope::ServerAndKind,
        CredentialRole::Root,
        ResourceStatus::Installed,
    )
}

/// `database.uninstall`
pub fn uninstall() -> Provisioner {
    Provisioner::new(
        OperationKind::new(ResourceKind::Database, Action::Uninstall),
        UNINSTALL,
        build_uninstall,
        ExclusionScope::ServerAndKind,
        CredentialRole::Root,
        ResourceStatus::Removed,
    )
}

struct Engine<'a> {
    name: &'a str,
    version: &'a str,
}

impl Engine<'_> {
    fn service(&self) -> &str {
        self.name
    }

    fn packages(&self) -> Vec<String> {
        match self.name {
            "mysql" => vec!["mysql-server".to_string(), "mysql-client".to_string()],
            "mariadb" => vec!["mariadb-server".to_string(), "mariadb-client".to_string()],
            _ => vec![
                format!("postgresql-{}", self.version),
                format!("postgresql-client-{}", self.version),
            ],
        }
    }

    fn purge_pattern(&self) -> &str {
        match self.name {
            "mysql" => "'mysql-*'",
            "mariadb" => "'mariadb-*'",
            _ => "'postgresql-*'",
        }
    }
}

fn engine<'a>(ctx: &BuildContext<'a>) -> Result<Engine<'a>> {
    let name = ctx.required("engine")?;
    let version = ctx.field_or_key("version")?;
    validate_database_engine(name, version)?;
    Ok(Engine { name, version })
}

fn build_install(ctx: &BuildContext<'_>) -> Result<Vec<Step>> {
    let engine = engine(ctx)?;

    let mut prerequisites = apt_install(&[
        "ca-certificates".to_string(),
        "curl".to_string(),
        "gnupg".to_string(),
        "lsb-release".to_string(),
    ]);
    if engine.name == "postgresql" {
        prerequisites = format!(
            "{prerequisites} && install -d /usr/share/postgresql-common/pgdg \
             && curl -fsSL -o {PGDG_KEYRING} https://www.postgresql.org/media/keys/ACCC4CF8.asc \
             && echo \"deb [signed-by={PGDG_KEYRING}] https://apt.postgresql.org/pub/repos/apt $(lsb_release -cs)-pgdg main\" \
             > /etc/apt/sources.list.d/pgdg.list"
        );
    }

    let mut stored = Map::new();
    stored.insert("engine".to_string(), json!(engine.name));
    stored.insert("version".to_string(), json!(engine.version));
    stored.insert("service".to_string(), json!(engine.service()));

    Ok(vec![
        Step::remote("install_prerequisites", prerequisites),
        Step::remote("update_packages", apt_update()),
        Step::remote("install_engine", apt_install(&engine.packages())),
        Step::remote(
            "enable_service",
            format!("systemctl enable --now {}", engine.service()),
        ),
        Step::remote(
            "verify_service",
            format!("systemctl is-active --quiet {}", engine.service()),
        ),
        Step::local("store_config", LocalEffect::MergeConfig(stored)),
    ])
}

fn build_uninstall(ctx: &BuildContext<'_>) -> Result<Vec<Step>> {
    let engine = engine(ctx)?;
    Ok(vec![
        Step::remote(
            "stop_service",
            format!("systemctl disable --now {} || true", engine.service()),
        ),
        Step::remote(
            "purge_packages",
            format!("{APT} purge -y -qq {}", engine.purge_pattern()),
        ),
        Step::remote("autoremove", format!("{APT} autoremove -y -qq")),
    ])
}
