// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Git repository checkouts with a per-resource deploy key.
//!
//! The install generates an ed25519 key under the application user's
//! `~/.ssh`, records its public half on the resource (`deploy_public_key`),
//! trusts the Git host, clones once and checks out the requested branch.

use std::path::Path;

use serde_json::{Map, json};

use crate::credentials::CredentialRole;
use crate::error::{CoreError, Result};
use crate::milestone::{COMPLETE_MILESTONE, Milestone};
use crate::provisioner::{Action, BuildContext, ExclusionScope, OperationKind, Provisioner};
use crate::resource::ResourceKind;
use crate::status::ResourceStatus;
use crate::step::{LocalEffect, Step, shell_quote};
use crate::validation::{
    normalize_repository, repository_host, validate_absolute_path, validate_branch,
};

const INSTALL: &[Milestone] = &[
    Milestone::new("generate_key", "Generating deploy key"),
    Milestone::new("record_key", "Recording deploy key"),
    Milestone::new("trust_host", "Trusting Git host"),
    Milestone::new("clone", "Cloning repository"),
    Milestone::new("checkout", "Checking out branch"),
    Milestone::new("store_config", "Saving configuration"),
    COMPLETE_MILESTONE,
];

const UNINSTALL: &[Milestone] = &[
    Milestone::new("remove_checkout", "Removing checkout"),
    Milestone::new("remove_key", "Removing deploy key"),
    COMPLETE_MILESTONE,
];

/// Config key the generated public key is stored under.
pub const DEPLOY_KEY_FIELD: &str = "deploy_public_key";

/// Branch used when the config names none.
pub const DEFAULT_BRANCH: &str = "main";

/// `git.install`
pub fn install() -> Provisioner {
    Provisioner::new(
        OperationKind::new(ResourceKind::GitRepository, Action::Install),
        INSTALL,
        build_install,
        ExclusionScope::ServerAndResource,
        CredentialRole::Application,
        ResourceStatus::Installed,
    )
}

/// `git.uninstall`
pub fn uninstall() -> Provisioner {
    Provisioner::new(
        OperationKind::new(ResourceKind::GitRepository, Action::Uninstall),
        UNINSTALL,
        build_uninstall,
        ExclusionScope::ServerAndResource,
        CredentialRole::Application,
        ResourceStatus::Removed,
    )
}

fn key_path(ctx: &BuildContext<'_>) -> String {
    format!("$HOME/.ssh/hostwright_{}", ctx.short_id())
}

fn ssh_command(key: &str) -> String {
    format!("ssh -i {key} -o IdentitiesOnly=yes")
}

/// Checkout directory; must sit at least two levels below `/`.
fn checkout_dir(ctx: &BuildContext<'_>, repository: Option<&str>) -> Result<String> {
    let key = ctx.resource.resource_key.as_str();
    let dir = match (ctx.optional("directory")?, repository) {
        (Some(dir), _) => dir.trim_end_matches('/').to_string(),
        (None, _) if key.starts_with('/') => key.trim_end_matches('/').to_string(),
        (None, Some(url)) => {
            let name = url
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .trim_end_matches(".git");
            format!("/home/{}/{}", ctx.application_user()?, name)
        }
        (None, None) => return Err(CoreError::validation("directory", "is required")),
    };
    validate_absolute_path("directory", &dir)?;
    if dir.split('/').filter(|s| !s.is_empty()).count() < 2 {
        return Err(CoreError::validation(
            "directory",
            format!("'{dir}' is too close to the filesystem root"),
        ));
    }
    Ok(dir)
}

fn build_install(ctx: &BuildContext<'_>) -> Result<Vec<Step>> {
    let repository = normalize_repository(ctx.required("repository")?)?;
    let branch = ctx.optional("branch")?.unwrap_or(DEFAULT_BRANCH);
    validate_branch(branch)?;
    let dir = checkout_dir(ctx, Some(&repository))?;
    let host = repository_host(&repository)
        .ok_or_else(|| CoreError::validation("repository", "missing host"))?;

    let key = key_path(ctx);
    let parent = Path::new(&dir)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/".to_string());
    let q_dir = shell_quote(&dir);
    let q_branch = shell_quote(branch);
    let q_host = shell_quote(host);
    let known_hosts = "$HOME/.ssh/known_hosts";

    let mut stored = Map::new();
    stored.insert("repository".to_string(), json!(repository));
    stored.insert("branch".to_string(), json!(branch));
    stored.insert("directory".to_string(), json!(dir));

    Ok(vec![
        Step::remote(
            "generate_key",
            format!(
                "mkdir -p \"$HOME/.ssh\" && chmod 700 \"$HOME/.ssh\" \
                 && ([ -f \"{key}\" ] || ssh-keygen -q -t ed25519 -N '' -C 'hostwright-deploy-{id}' -f \"{key}\") \
                 && cat \"{key}.pub\"",
                id = ctx.short_id()
            ),
        ),
        Step::local(
            "record_key",
            LocalEffect::CaptureOutput {
                config_key: DEPLOY_KEY_FIELD,
            },
        ),
        Step::remote(
            "trust_host",
            format!(
                "touch \"{known_hosts}\" && (ssh-keygen -F {q_host} -f \"{known_hosts}\" >/dev/null \
                 || ssh-keyscan -H {q_host} >> \"{known_hosts}\")"
            ),
        ),
        Step::remote(
            "clone",
            format!(
                "mkdir -p {parent} && ([ -d {q_dir}/.git ] || GIT_SSH_COMMAND=\"{ssh}\" git clone {url} {q_dir})",
                parent = shell_quote(&parent),
                ssh = ssh_command(&key),
                url = shell_quote(&repository),
            ),
        ),
        Step::remote(
            "checkout",
            format!(
                "cd {q_dir} && git config core.sshCommand \"{ssh}\" \
                 && git fetch origin {q_branch} && git checkout -B {q_branch} FETCH_HEAD",
                ssh = ssh_command(&key),
            ),
        ),
        Step::local("store_config", LocalEffect::MergeConfig(stored)),
    ])
}

fn build_uninstall(ctx: &BuildContext<'_>) -> Result<Vec<Step>> {
    let repository = match ctx.optional("repository")? {
        Some(repo) => Some(normalize_repository(repo)?),
        None => None,
    };
    let dir = checkout_dir(ctx, repository.as_deref())?;
    let key = key_path(ctx);
    Ok(vec![
        Step::remote("remove_checkout", format!("rm -rf {}", shell_quote(&dir))),
        Step::remote("remove_key", format!("rm -f \"{key}\" \"{key}.pub\"")),
    ])
}
