// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Default-site designation for the nginx reverse proxy.
//!
//! The resource is promoted locally first, then the vhost is swapped on the
//! host. If the swap fails for good, the rollback manager hands the default
//! flag back to the previous holder.

use super::write_file;
use crate::credentials::CredentialRole;
use crate::error::Result;
use crate::milestone::{COMPLETE_MILESTONE, Milestone};
use crate::provisioner::{
    Action, BuildContext, Compensation, ExclusionScope, OperationKind, Provisioner,
};
use crate::resource::ResourceKind;
use crate::status::ResourceStatus;
use crate::step::{LocalEffect, Step};
use crate::validation::{validate_absolute_path, validate_domain, validate_php_version};

const INSTALL: &[Milestone] = &[
    Milestone::new("promote", "Marking as default site"),
    Milestone::new("write_vhost", "Writing default vhost"),
    Milestone::new("enable_vhost", "Enabling default vhost"),
    Milestone::new("verify_config", "Verifying proxy configuration"),
    Milestone::new("reload_proxy", "Reloading proxy"),
    COMPLETE_MILESTONE,
];

const AVAILABLE_DIR: &str = "/etc/nginx/sites-available";
const ENABLED_DIR: &str = "/etc/nginx/sites-enabled";
const VHOST: &str = "000-hostwright-default";

/// `default_site.install`
pub fn install() -> Provisioner {
    Provisioner::new(
        OperationKind::new(ResourceKind::DefaultSite, Action::Install),
        INSTALL,
        build_install,
        ExclusionScope::ServerAndKind,
        CredentialRole::Root,
        ResourceStatus::Active,
    )
    .with_compensation(Compensation::RestoreSingletonDefault)
}

fn render_vhost(domain: &str, root: &str, php_version: Option<&str>) -> String {
    let mut lines = vec![
        "server {".to_string(),
        "    listen 80 default_server;".to_string(),
        "    listen [::]:80 default_server;".to_string(),
        format!("    server_name {domain};"),
        format!("    root {root};"),
        "    index index.php index.html;".to_string(),
        "    location / {".to_string(),
        "        try_files $uri $uri/ /index.php?$query_string;".to_string(),
        "    }".to_string(),
    ];
    if let Some(version) = php_version {
        lines.extend([
            "    location ~ \\.php$ {".to_string(),
            "        include snippets/fastcgi-php.conf;".to_string(),
            format!("        fastcgi_pass unix:/run/php/php{version}-fpm.sock;"),
            "    }".to_string(),
        ]);
    }
    lines.push("}".to_string());
    lines.join("\n")
}

fn build_install(ctx: &BuildContext<'_>) -> Result<Vec<Step>> {
    let domain = ctx.field_or_key("domain")?;
    validate_domain(domain)?;
    let root = match ctx.optional("root")? {
        Some(root) => root.trim_end_matches('/').to_string(),
        None => format!("/home/{}/{domain}/current/public", ctx.application_user()?),
    };
    validate_absolute_path("root", &root)?;
    let php_version = ctx.optional("php_version")?;
    if let Some(version) = php_version {
        validate_php_version(version)?;
    }

    let available = format!("{AVAILABLE_DIR}/{VHOST}");
    let enabled = format!("{ENABLED_DIR}/{VHOST}");

    Ok(vec![
        Step::local("promote", LocalEffect::PromoteSingleton),
        Step::remote(
            "write_vhost",
            write_file(
                AVAILABLE_DIR,
                &available,
                &render_vhost(domain, &root, php_version),
                "0644",
            ),
        ),
        Step::remote(
            "enable_vhost",
            format!(
                "mkdir -p {ENABLED_DIR} && rm -f {ENABLED_DIR}/default && ln -sfn {available} {enabled}"
            ),
        ),
        Step::remote("verify_config", "nginx -t"),
        Step::remote("reload_proxy", "systemctl reload nginx"),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioners::test_support::{resource, server};
    use serde_json::json;

    #[test]
    fn test_promote_runs_before_remote_swap() {
        let server = server();
        let config = json!({"domain": "example.com", "php_version": "8.3"});
        let resource = resource(&server, ResourceKind::DefaultSite, "example.com", config.clone());
        let ctx = BuildContext {
            resource: &resource,
            server: &server,
            config: &config,
        };
        let steps = build_install(&ctx).unwrap();
        assert_eq!(
            steps[0],
            Step::local("promote", LocalEffect::PromoteSingleton)
        );
        let write = steps[1].command().unwrap();
        assert!(write.contains("server_name example.com;"));
        assert!(write.contains("root /home/hostwright/example.com/current/public;"));
        assert!(write.contains("php8.3-fpm.sock"));
    }

    #[test]
    fn test_static_site_has_no_fastcgi() {
        let vhost = render_vhost("example.com", "/srv/www", None);
        assert!(!vhost.contains("fastcgi_pass"));
        assert!(vhost.ends_with('}'));
    }

    #[test]
    fn test_invalid_domain() {
        let server = server();
        let config = json!({"domain": "not a domain"});
        let resource = resource(&server, ResourceKind::DefaultSite, "", config.clone());
        let ctx = BuildContext {
            resource: &resource,
            server: &server,
            config: &config,
        };
        assert!(build_install(&ctx).is_err());
    }
}
