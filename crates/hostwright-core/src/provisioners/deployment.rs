// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Release-directory deployments from an existing checkout.
//!
//! Layout under the site directory:
//!
//! ```text
//! <directory>/
//!   releases/<release>/   exported tree of the branch
//!   shared/.env           linked into every release
//!   current -> releases/<release>
//! ```

use serde_json::{Map, Value, json};

use crate::credentials::CredentialRole;
use crate::error::{CoreError, Result};
use crate::milestone::{COMPLETE_MILESTONE, Milestone};
use crate::provisioner::{Action, BuildContext, ExclusionScope, OperationKind, Provisioner};
use crate::resource::ResourceKind;
use crate::status::ResourceStatus;
use crate::step::{LocalEffect, Step, shell_quote};
use crate::validation::{validate_absolute_path, validate_branch, validate_name};

const INSTALL: &[Milestone] = &[
    Milestone::new("create_release", "Creating release directory"),
    Milestone::new("fetch_source", "Fetching source"),
    Milestone::new("link_shared", "Linking shared files"),
    Milestone::new("activate_release", "Activating release"),
    Milestone::new("prune_releases", "Pruning old releases"),
    Milestone::new("store_config", "Saving configuration"),
    COMPLETE_MILESTONE,
];

const DEFAULT_KEEP: u64 = 5;
const MAX_KEEP: u64 = 50;

/// `deployment.install`
pub fn install() -> Provisioner {
    Provisioner::new(
        OperationKind::new(ResourceKind::Deployment, Action::Install),
        INSTALL,
        build_install,
        ExclusionScope::ServerKindAndKey,
        CredentialRole::Application,
        ResourceStatus::Active,
    )
}

fn keep_releases(config: &Value) -> Result<u64> {
    match config.get("keep_releases") {
        None | Some(Value::Null) => Ok(DEFAULT_KEEP),
        Some(value) => match value.as_u64() {
            Some(n) if (1..=MAX_KEEP).contains(&n) => Ok(n),
            _ => Err(CoreError::validation(
                "keep_releases",
                format!("must be between 1 and {MAX_KEEP}"),
            )),
        },
    }
}

fn build_install(ctx: &BuildContext<'_>) -> Result<Vec<Step>> {
    let dir = match ctx.optional("directory")? {
        Some(dir) => dir,
        None if ctx.resource.resource_key.starts_with('/') => ctx.resource.resource_key.as_str(),
        None => return Err(CoreError::validation("directory", "is required")),
    };
    let dir = dir.trim_end_matches('/');
    validate_absolute_path("directory", dir)?;

    let repository = match ctx.optional("repository_path")? {
        Some(path) => path.trim_end_matches('/').to_string(),
        None => format!("{dir}/repository"),
    };
    validate_absolute_path("repository_path", &repository)?;

    let branch = ctx.optional("branch")?.unwrap_or("main");
    validate_branch(branch)?;

    let release = match ctx.optional("release")? {
        Some(release) => release.to_string(),
        None => ctx.short_id(),
    };
    validate_name("release", &release)?;
    let keep = keep_releases(ctx.config)?;

    let release_dir = shell_quote(&format!("{dir}/releases/{release}"));
    let releases = shell_quote(&format!("{dir}/releases"));
    let shared_env = shell_quote(&format!("{dir}/shared/.env"));
    let current = shell_quote(&format!("{dir}/current"));
    let q_repo = shell_quote(&repository);

    let mut stored = Map::new();
    stored.insert("directory".to_string(), json!(dir));
    stored.insert("repository_path".to_string(), json!(repository));
    stored.insert("branch".to_string(), json!(branch));
    stored.insert("active_release".to_string(), json!(release));

    Ok(vec![
        Step::remote(
            "create_release",
            format!(
                "mkdir -p {release_dir} {}",
                shell_quote(&format!("{dir}/shared"))
            ),
        ),
        Step::remote(
            "fetch_source",
            format!(
                "git -C {q_repo} fetch origin {branch} && git -C {q_repo} archive FETCH_HEAD | tar -x -C {release_dir}",
                branch = shell_quote(branch),
            ),
        ),
        Step::remote(
            "link_shared",
            format!("touch {shared_env} && ln -sfn {shared_env} {release_dir}/.env"),
        ),
        Step::remote(
            "activate_release",
            format!("ln -sfn {release_dir} {current}"),
        ),
        Step::remote(
            "prune_releases",
            format!(
                "cd {releases} && ls -1t | tail -n +{} | xargs -r rm -rf --",
                keep + 1
            ),
        ),
        Step::local("store_config", LocalEffect::MergeConfig(stored)),
    ])
}
