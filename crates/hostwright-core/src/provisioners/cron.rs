// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduled tasks as `/etc/cron.d` entries.

use super::write_file;
use crate::credentials::CredentialRole;
use crate::error::{CoreError, Result};
use crate::milestone::{COMPLETE_MILESTONE, Milestone};
use crate::provisioner::{Action, BuildContext, ExclusionScope, OperationKind, Provisioner};
use crate::resource::ResourceKind;
use crate::status::ResourceStatus;
use crate::step::Step;
use crate::validation::{validate_cron_schedule, validate_name, validate_unix_user};

const INSTALL: &[Milestone] = &[
    Milestone::new("write_entry", "Writing schedule"),
    Milestone::new("reload_cron", "Reloading cron"),
    COMPLETE_MILESTONE,
];

const UNINSTALL: &[Milestone] = &[
    Milestone::new("remove_entry", "Removing schedule"),
    Milestone::new("reload_cron", "Reloading cron"),
    COMPLETE_MILESTONE,
];

const CRON_DIR: &str = "/etc/cron.d";
const RELOAD: &str = "systemctl reload cron || systemctl restart cron";

/// `cron.install`
pub fn install() -> Provisioner {
    Provisioner::new(
        OperationKind::new(ResourceKind::ScheduledTask, Action::Install),
        INSTALL,
        build_install,
        ExclusionScope::ServerKindAndKey,
        CredentialRole::Root,
        ResourceStatus::Active,
    )
}

/// `cron.uninstall`
pub fn uninstall() -> Provisioner {
    Provisioner::new(
        OperationKind::new(ResourceKind::ScheduledTask, Action::Uninstall),
        UNINSTALL,
        build_uninstall,
        ExclusionScope::ServerKindAndKey,
        CredentialRole::Root,
        ResourceStatus::Removed,
    )
}

fn entry_path(name: &str) -> String {
    format!("{CRON_DIR}/hostwright-{name}")
}

fn name<'a>(ctx: &BuildContext<'a>) -> Result<&'a str> {
    let name = ctx.field_or_key("name")?;
    validate_name("name", name)?;
    Ok(name)
}

fn build_install(ctx: &BuildContext<'_>) -> Result<Vec<Step>> {
    let name = name(ctx)?;
    let schedule = ctx.required("schedule")?;
    validate_cron_schedule(schedule)?;
    let command = ctx.required("command")?;
    if command.chars().any(char::is_control) {
        return Err(CoreError::validation("command", "must be a single line"));
    }
    let user = match ctx.optional("user")? {
        Some(user) => {
            validate_unix_user(user)?;
            user
        }
        None => ctx.application_user()?,
    };

    let schedule = schedule.split_whitespace().collect::<Vec<_>>().join(" ");
    let contents = [
        "SHELL=/bin/sh".to_string(),
        "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
        format!("{schedule} {user} {command}"),
    ]
    .join("\n");

    Ok(vec![
        Step::remote(
            "write_entry",
            write_file(CRON_DIR, &entry_path(name), &contents, "0644"),
        ),
        Step::remote("reload_cron", RELOAD),
    ])
}

fn build_uninstall(ctx: &BuildContext<'_>) -> Result<Vec<Step>> {
    let name = name(ctx)?;
    Ok(vec![
        Step::remote("remove_entry", format!("rm -f {}", entry_path(name))),
        Step::remote("reload_cron", RELOAD),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioners::test_support::{resource, server};
    use serde_json::json;

    #[test]
    fn test_entry_line() {
        let server = server();
        let config = json!({
            "name": "scheduler",
            "schedule": "*  *  * * *",
            "command": "php /home/hostwright/app/artisan schedule:run",
        });
        let resource = resource(&server, ResourceKind::ScheduledTask, "scheduler", config.clone());
        let ctx = BuildContext {
            resource: &resource,
            server: &server,
            config: &config,
        };
        let steps = build_install(&ctx).unwrap();
        let write = steps[0].command().unwrap();
        assert!(write.contains("/etc/cron.d/hostwright-scheduler"));
        assert!(write.contains("* * * * * hostwright php /home/hostwright/app/artisan schedule:run"));
    }

    #[test]
    fn test_bad_schedule() {
        let server = server();
        let config = json!({"name": "x", "schedule": "every minute", "command": "true"});
        let resource = resource(&server, ResourceKind::ScheduledTask, "x", config.clone());
        let ctx = BuildContext {
            resource: &resource,
            server: &server,
            config: &config,
        };
        let err = build_install(&ctx).unwrap_err();
        assert!(err.to_string().contains("schedule"));
    }
}
