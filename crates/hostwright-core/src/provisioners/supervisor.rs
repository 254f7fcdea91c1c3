// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! supervisord programs.

use serde_json::Value;

use super::{ensure_binary, write_file};
use crate::credentials::CredentialRole;
use crate::error::{CoreError, Result};
use crate::milestone::{COMPLETE_MILESTONE, Milestone};
use crate::provisioner::{Action, BuildContext, ExclusionScope, OperationKind, Provisioner};
use crate::resource::ResourceKind;
use crate::status::ResourceStatus;
use crate::step::Step;
use crate::validation::{validate_absolute_path, validate_name, validate_unix_user};

const INSTALL: &[Milestone] = &[
    Milestone::new("ensure_supervisor", "Ensuring supervisor is installed"),
    Milestone::new("write_config", "Writing program configuration"),
    Milestone::new("reread", "Loading configuration"),
    Milestone::new("start_program", "Starting program"),
    COMPLETE_MILESTONE,
];

const UPDATE: &[Milestone] = &[
    Milestone::new("write_config", "Writing program configuration"),
    Milestone::new("reread", "Loading configuration"),
    Milestone::new("restart_program", "Restarting program"),
    COMPLETE_MILESTONE,
];

const UNINSTALL: &[Milestone] = &[
    Milestone::new("stop_program", "Stopping program"),
    Milestone::new("remove_config", "Removing program configuration"),
    Milestone::new("reread", "Loading configuration"),
    COMPLETE_MILESTONE,
];

const CONF_DIR: &str = "/etc/supervisor/conf.d";
const MAX_PROCESSES: u64 = 32;

/// `supervisor.install`
pub fn install() -> Provisioner {
    Provisioner::new(
        OperationKind::new(ResourceKind::SupervisorTask, Action::Install),
        INSTALL,
        build_install,
        ExclusionScope::ServerKindAndKey,
        CredentialRole::Root,
        ResourceStatus::Active,
    )
}

/// `supervisor.update`
pub fn update() -> Provisioner {
    Provisioner::new(
        OperationKind::new(ResourceKind::SupervisorTask, Action::Update),
        UPDATE,
        build_update,
        ExclusionScope::ServerKindAndKey,
        CredentialRole::Root,
        ResourceStatus::Active,
    )
}

/// `supervisor.uninstall`
pub fn uninstall() -> Provisioner {
    Provisioner::new(
        OperationKind::new(ResourceKind::SupervisorTask, Action::Uninstall),
        UNINSTALL,
        build_uninstall,
        ExclusionScope::ServerKindAndKey,
        CredentialRole::Root,
        ResourceStatus::Removed,
    )
}

/// Program name as registered with supervisord.
fn program(name: &str) -> String {
    format!("hostwright-{name}")
}

fn conf_path(name: &str) -> String {
    format!("{CONF_DIR}/{}.conf", program(name))
}

fn name<'a>(ctx: &BuildContext<'a>) -> Result<&'a str> {
    let name = ctx.field_or_key("name")?;
    validate_name("name", name)?;
    Ok(name)
}

fn render_config(ctx: &BuildContext<'_>) -> Result<(String, String)> {
    let name = name(ctx)?;
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
    let directory = match ctx.optional("directory")? {
        Some(dir) => {
            validate_absolute_path("directory", dir)?;
            dir.to_string()
        }
        None => format!("/home/{user}"),
    };
    let processes = match ctx.config.get("processes") {
        None | Some(Value::Null) => 1,
        Some(value) => match value.as_u64() {
            Some(n) if (1..=MAX_PROCESSES).contains(&n) => n,
            _ => {
                return Err(CoreError::validation(
                    "processes",
                    format!("must be between 1 and {MAX_PROCESSES}"),
                ));
            }
        },
    };

    let program = program(name);
    let contents = [
        format!("[program:{program}]"),
        format!("command={command}"),
        format!("directory={directory}"),
        format!("user={user}"),
        format!("numprocs={processes}"),
        "process_name=%(program_name)s_%(process_num)02d".to_string(),
        "autostart=true".to_string(),
        "autorestart=true".to_string(),
        "stopasgroup=true".to_string(),
        "killasgroup=true".to_string(),
        "redirect_stderr=true".to_string(),
        format!("stdout_logfile=/var/log/supervisor/{program}.log"),
    ]
    .join("\n");

    Ok((name.to_string(), contents))
}

fn build_install(ctx: &BuildContext<'_>) -> Result<Vec<Step>> {
    let (name, contents) = render_config(ctx)?;
    Ok(vec![
        Step::remote("ensure_supervisor", ensure_binary("supervisorctl", "supervisor")),
        Step::remote(
            "write_config",
            write_file(CONF_DIR, &conf_path(&name), &contents, "0644"),
        ),
        Step::remote("reread", "supervisorctl reread && supervisorctl update"),
        Step::remote(
            "start_program",
            format!("supervisorctl restart '{}:*'", program(&name)),
        ),
    ])
}

fn build_update(ctx: &BuildContext<'_>) -> Result<Vec<Step>> {
    let (name, contents) = render_config(ctx)?;
    Ok(vec![
        Step::remote(
            "write_config",
            write_file(CONF_DIR, &conf_path(&name), &contents, "0644"),
        ),
        Step::remote("reread", "supervisorctl reread && supervisorctl update"),
        Step::remote(
            "restart_program",
            format!("supervisorctl restart '{}:*'", program(&name)),
        ),
    ])
}

fn build_uninstall(ctx: &BuildContext<'_>) -> Result<Vec<Step>> {
    let name = name(ctx)?;
    Ok(vec![
        Step::remote(
            "stop_program",
            format!("supervisorctl stop '{}:*' || true", program(name)),
        ),
        Step::remote("remove_config", format!("rm -f {}", conf_path(name))),
        Step::remote("reread", "supervisorctl reread && supervisorctl update"),
    ])
}
