// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Properties every registered provisioner must hold.

use chrono::Utc;
use hostwright_core::milestone::{COMPLETE, catalog};
use hostwright_core::provisioner::{Action, BuildContext};
use hostwright_core::resource::{ManagedResource, Progress, ServerRecord};
use hostwright_core::step::Step;
use hostwright_core::{ProvisionerRegistry, ResourceKind, ResourceStatus};
use serde_json::{Value, json};
use uuid::Uuid;

fn server() -> ServerRecord {
    ServerRecord {
        id: Uuid::new_v4(),
        name: "web-1".to_string(),
        host: "203.0.113.10".to_string(),
        port: 22,
        ssh_user: "forge".to_string(),
        created_at: Utc::now(),
    }
}

fn sample(kind: ResourceKind) -> (&'static str, Value) {
    match kind {
        ResourceKind::Database => ("mysql", json!({"engine": "mysql", "version": "8.0"})),
        ResourceKind::PhpRuntime => ("8.3", json!({"version": "8.3"})),
        ResourceKind::FirewallRule => ("tcp/443", json!({"port": 443})),
        ResourceKind::SupervisorTask => (
            "queue",
            json!({"command": "php artisan queue:work", "processes": 2}),
        ),
        ResourceKind::ScheduledTask => (
            "backup",
            json!({"schedule": "0 3 * * *", "command": "/usr/local/bin/backup"}),
        ),
        ResourceKind::GitRepository => ("site", json!({"repository": "owner/repo"})),
        ResourceKind::Deployment => ("/home/forge/site", json!({"release": "r1"})),
        ResourceKind::DefaultSite => ("example.com", json!({})),
    }
}

fn resource(server: &ServerRecord, kind: ResourceKind, key: &str, config: Value) -> ManagedResource {
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
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[test]
fn test_registry_covers_every_operation() {
    let registry = ProvisionerRegistry::default();
    let operations: Vec<String> = registry.iter().map(|p| p.operation.to_string()).collect();
    assert_eq!(operations.len(), 16, "{operations:?}");
    for op in [
        "database.install",
        "database.uninstall",
        "php.install",
        "php.update",
        "php.uninstall",
        "firewall.install",
        "firewall.uninstall",
        "supervisor.install",
        "supervisor.update",
        "supervisor.uninstall",
        "cron.install",
        "cron.uninstall",
        "git.install",
        "git.uninstall",
        "deployment.install",
        "default_site.install",
    ] {
        assert!(registry.resolve(op).is_ok(), "{op} not registered");
    }
}

#[test]
fn test_steps_follow_milestones() {
    let registry = ProvisionerRegistry::default();
    let server = server();

    for provisioner in registry.iter() {
        let op = provisioner.operation.to_string();
        let keys: Vec<&str> = provisioner.milestones.iter().map(|m| m.key).collect();
        assert_eq!(keys.last(), Some(&COMPLETE), "{op}");
        assert_eq!(
            keys.iter().filter(|k| **k == COMPLETE).count(),
            1,
            "{op}: complete must appear once"
        );

        let (key, config) = sample(provisioner.operation.kind);
        let resource = resource(&server, provisioner.operation.kind, key, config.clone());
        let ctx = BuildContext {
            resource: &resource,
            server: &server,
            config: &config,
        };
        let steps = provisioner
            .build_steps(&ctx)
            .unwrap_or_else(|e| panic!("{op}: {e}"));

        let step_keys: Vec<&str> = steps.iter().map(Step::milestone).collect();
        assert_eq!(step_keys, keys[..keys.len() - 1], "{op}");

        // Builders are pure.
        assert_eq!(steps, provisioner.build_steps(&ctx).unwrap(), "{op}");

        if provisioner.operation.action == Action::Uninstall {
            assert_eq!(provisioner.success, ResourceStatus::Removed, "{op}");
            assert_eq!(provisioner.in_progress, ResourceStatus::Removing, "{op}");
        }
    }
}

#[test]
fn test_remote_commands_tolerate_reruns() {
    let registry = ProvisionerRegistry::default();
    let server = server();

    for provisioner in registry.iter() {
        let (key, config) = sample(provisioner.operation.kind);
        let resource = resource(&server, provisioner.operation.kind, key, config.clone());
        let ctx = BuildContext {
            resource: &resource,
            server: &server,
            config: &config,
        };
        for command in provisioner
            .build_steps(&ctx)
            .unwrap()
            .iter()
            .filter_map(Step::command)
        {
            assert!(!command.contains("mkdir ") || command.contains("mkdir -p"), "{command}");
            assert!(!command.contains("ln -s ") , "{command}");
            assert!(!command.contains("apt-get install") || command.contains("-y"), "{command}");
        }
    }
}

#[test]
fn test_catalog_lists_labels() {
    let registry = ProvisionerRegistry::default();
    let catalog = catalog(&registry);
    let php = &catalog["php.install"];
    assert_eq!(php.first().unwrap().key, "add_repository");
    assert_eq!(php.last().unwrap().label, "Complete");
}
