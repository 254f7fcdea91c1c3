// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Built-in provisioners, one module per resource kind.
//!
//! | Operation | Exclusion | Role | Success |
//! |-----------|-----------|------|---------|
//! | `database.install` / `uninstall` | server + kind | root | installed / removed |
//! | `php.install` / `update` / `uninstall` | server + kind | root | installed / installed / removed |
//! | `firewall.install` / `uninstall` | server + kind | root | active / removed |
//! | `supervisor.install` / `update` / `uninstall` | server + kind + key | root | active / active / removed |
//! | `cron.install` / `uninstall` | server + kind + key | root | active / removed |
//! | `git.install` / `uninstall` | server + resource | application | installed / removed |
//! | `deployment.install` | server + kind + key | application | active |
//! | `default_site.install` | server + kind | root | active |
//!
//! Commands are written so a retry against a half-changed host succeeds:
//! `mkdir -p`, `ln -sfn`, `rm -f`, guarded clones and `|| true` on
//! deletes of things that may already be gone.

pub mod cron;
pub mod database;
pub mod default_site;
pub mod deployment;
pub mod firewall;
pub mod git;
pub mod php;
pub mod supervisor;

use crate::provisioner::Provisioner;

/// Non-interactive apt prefix.
pub(crate) const APT: &str = "DEBIAN_FRONTEND=noninteractive apt-get";

/// `apt-get update` with quiet, non-interactive output.
pub(crate) fn apt_update() -> String {
    format!("{APT} update -y -qq")
}

/// `apt-get install` for a list of packages.
pub(crate) fn apt_install(packages: &[String]) -> String {
    format!("{APT} install -y -qq {}", packages.join(" "))
}

/// Install `package` only when `binary` is missing.
pub(crate) fn ensure_binary(binary: &str, package: &str) -> String {
    format!(
        "command -v {binary} >/dev/null 2>&1 || ({} && {APT} install -y -qq {package})",
        apt_update()
    )
}

/// Write `contents` to `path` through `printf`, creating the parent directory.
pub(crate) fn write_file(dir: &str, path: &str, contents: &str, mode: &str) -> String {
    format!(
        "mkdir -p {dir} && printf '%s\\n' {} > {path} && chmod {mode} {path}",
        crate::step::shell_quote(contents)
    )
}

/// Every built-in provisioner.
pub fn builtin() -> Vec<Provisioner> {
    vec![
        database::install(),
        database::uninstall(),
        php::install(),
        php::update(),
        php::uninstall(),
        firewall::install(),
        firewall::uninstall(),
        supervisor::install(),
        supervisor::update(),
        supervisor::uninstall(),
        cron::install(),
        cron::uninstall(),
        git::install(),
        git::uninstall(),
        deployment::install(),
        default_site::install(),
    ]
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::Utc;
    use serde_json::Value;
    use uuid::Uuid;

    use crate::resource::{ManagedResource, Progress, ResourceKind, ServerRecord};
    use crate::status::ResourceStatus;

    pub fn server() -> ServerRecord {
        ServerRecord {
            id: Uuid::new_v4(),
            name: "web-1".to_string(),
            host: "203.0.113.10".to_string(),
            port: 22,
            ssh_user: "hostwright".to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn resource(server: &ServerRecord, kind: ResourceKind, key: &str, config: Value) -> ManagedResource {
        let now = Utc::now();
        ManagedResource {
            id: Uuid::new_v4(),
            server_id: server.id,
            kind,
            resource_key: key.to_string(),
            status: ResourceStatus::Pending,
            config,
            progress: Progress::default(),
            error_log: None,
            is_default: false,
            installed_at: None,
            uninstalled_at: None,
            failed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}
