// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PHP runtime (CLI + FPM) install, update and removal.

use serde_json::Value;

use super::{APT, apt_install, apt_update};
use crate::credentials::CredentialRole;
use crate::error::{CoreError, Result};
use crate::milestone::{COMPLETE_MILESTONE, Milestone};
use crate::provisioner::{Action, BuildContext, ExclusionScope, OperationKind, Provisioner};
use crate::resource::ResourceKind;
use crate::status::ResourceStatus;
use crate::step::Step;
use crate::validation::{validate_name, validate_php_version};

const INSTALL: &[Milestone] = &[
    Milestone::new("add_repository", "Adding PHP package repository"),
    Milestone::new("update_packages", "Updating package lists"),
    Milestone::new("install_packages", "Installing PHP packages"),
    Milestone::new("configure_fpm", "Configuring PHP-FPM"),
    Milestone::new("enable_fpm", "Starting PHP-FPM"),
    COMPLETE_MILESTONE,
];

const UPDATE: &[Milestone] = &[
    Milestone::new("update_packages", "Updating package lists"),
    Milestone::new("upgrade_packages", "Upgrading PHP packages"),
    Milestone::new("restart_fpm", "Restarting PHP-FPM"),
    COMPLETE_MILESTONE,
];

const UNINSTALL: &[Milestone] = &[
    Milestone::new("stop_fpm", "Stopping PHP-FPM"),
    Milestone::new("purge_packages", "Removing PHP packages"),
    Milestone::new("autoremove", "Cleaning up dependencies"),
    COMPLETE_MILESTONE,
];

/// Extensions installed when the config names none.
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    "mysql", "pgsql", "sqlite3", "curl", "mbstring", "xml", "zip", "bcmath", "intl", "gd",
];

/// `php.install`
pub fn install() -> Provisioner {
    Provisioner::new(
        OperationKind::new(ResourceKind::PhpRuntime, Action::Install),
        INSTALL,
        build_install,
        ExclusionScope::ServerAndKind,
        CredentialRole::Root,
        ResourceStatus::Installed,
    )
}

/// `php.update`
pub fn update() -> Provisioner {
    Provisioner::new(
        OperationKind::new(ResourceKind::PhpRuntime, Action::Update),
        UPDATE,
        build_update,
        ExclusionScope::ServerAndKind,
        CredentialRole::Root,
        ResourceStatus::Installed,
    )
}

/// `php.uninstall`
pub fn uninstall() -> Provisioner {
    Provisioner::new(
        OperationKind::new(ResourceKind::PhpRuntime, Action::Uninstall),
        UNINSTALL,
        build_uninstall,
        ExclusionScope::ServerAndKind,
        CredentialRole::Root,
        ResourceStatus::Removed,
    )
}

fn version<'a>(ctx: &BuildContext<'a>) -> Result<&'a str> {
    let version = ctx.field_or_key("version")?;
    validate_php_version(version)?;
    Ok(version)
}

fn extensions(config: &Value) -> Result<Vec<String>> {
    match config.get("extensions") {
        None | Some(Value::Null) => Ok(DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                let name = item
                    .as_str()
                    .ok_or_else(|| CoreError::validation("extensions", "must be strings"))?;
                validate_name("extensions", name)?;
                Ok(name.to_ascii_lowercase())
            })
            .collect(),
        Some(_) => Err(CoreError::validation("extensions", "must be a list")),
    }
}

fn build_install(ctx: &BuildContext<'_>) -> Result<Vec<Step>> {
    let version = version(ctx)?;
    let user = ctx.application_user()?;
    let extensions = extensions(ctx.config)?;

    let mut packages = vec![format!("php{version}-fpm"), format!("php{version}-cli")];
    packages.extend(extensions.iter().map(|ext| format!("php{version}-{ext}")));

    let pool = format!("/etc/php/{version}/fpm/pool.d/www.conf");
    let ini = format!("/etc/php/{version}/fpm/php.ini");

    Ok(vec![
        Step::remote(
            "add_repository",
            format!(
                "{} && {APT} install -y -qq software-properties-common && add-apt-repository -y ppa:ondrej/php",
                apt_update()
            ),
        ),
        Step::remote("update_packages", apt_update()),
        Step::remote("install_packages", apt_install(&packages)),
        Step::remote(
            "configure_fpm",
            format!(
                "sed -i 's/^user = .*/user = {user}/; s/^group = .*/group = {user}/' {pool} \
                 && sed -i 's/^;\\?cgi.fix_pathinfo=.*/cgi.fix_pathinfo=0/' {ini}"
            ),
        ),
        Step::remote(
            "enable_fpm",
            format!("systemctl enable --now php{version}-fpm && systemctl restart php{version}-fpm"),
        ),
    ])
}

fn build_update(ctx: &BuildContext<'_>) -> Result<Vec<Step>> {
    let version = version(ctx)?;
    Ok(vec![
        Step::remote("update_packages", apt_update()),
        Step::remote(
            "upgrade_packages",
            format!("{APT} install -y -qq --only-upgrade 'php{version}-*'"),
        ),
        Step::remote("restart_fpm", format!("systemctl restart php{version}-fpm")),
    ])
}

fn build_uninstall(ctx: &BuildContext<'_>) -> Result<Vec<Step>> {
    let version = version(ctx)?;
    Ok(vec![
        Step::remote(
            "stop_fpm",
            format!("systemctl disable --now php{version}-fpm || true"),
        ),
        Step::remote("purge_packages", format!("{APT} purge -y -qq 'php{version}-*'")),
        Step::remote("autoremove", format!("{APT} autoremove -y -qq")),
    ])
}
