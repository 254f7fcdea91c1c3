// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker tests over an in-memory store and scripted sessions.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{StaticCredentials, TestStore};
use hostwright_core::events::NullEventSink;
use hostwright_core::persistence::{JobQueue, JobState, LeaseStore, ResourceStore};
use hostwright_core::resource::ProgressEvent;
use hostwright_core::session::ScriptedConnector;
use hostwright_core::{JobOutcome, ProvisionerRegistry, ProvisioningEngine, ResourceStatus};
use hostwright_worker::event_retention::{EventRetentionConfig, EventRetentionWorker};
use hostwright_worker::lease_reaper::{LeaseReaper, LeaseReaperConfig};
use hostwright_worker::worker::{QueueWorker, QueueWorkerConfig};
use uuid::Uuid;

fn engine(t: &TestStore, connector: &ScriptedConnector) -> ProvisioningEngine {
    ProvisioningEngine::new(
        t.persistence(),
        Arc::new(ProvisionerRegistry::default()),
        Arc::new(connector.clone()),
        Arc::new(StaticCredentials),
        Arc::new(NullEventSink),
        "worker-test",
    )
}

fn fast_config(concurrency: usize) -> QueueWorkerConfig {
    QueueWorkerConfig {
        concurrency,
        poll_interval: Duration::from_millis(20),
    }
}

#[tokio::test]
async fn test_run_once_on_empty_queue() {
    let t = TestStore::new().await;
    let connector = ScriptedConnector::new();
    let worker = QueueWorker::new(engine(&t, &connector), t.persistence(), fast_config(1));

    assert!(worker.run_once().await.is_none());
    assert_eq!(connector.connections(), 0);
}

#[tokio::test]
async fn test_run_once_completes_job() {
    let t = TestStore::new().await;
    let connector = ScriptedConnector::new();
    let worker = QueueWorker::new(engine(&t, &connector), t.persistence(), fast_config(1));
    let submission = t.submit_php("8.3").await;

    assert_eq!(worker.run_once().await, Some(JobOutcome::Completed));

    let resource = t.store.get_resource(submission.resource_id).await.unwrap().unwrap();
    assert_eq!(resource.status, ResourceStatus::Installed);
    assert!(t.wait_for_job(submission.job_id, JobState::Done).await);
}

#[tokio::test]
async fn test_visibility_covers_longest_timeout() {
    let t = TestStore::new().await;
    let connector = ScriptedConnector::new();
    let engine = engine(&t, &connector);
    let longest = engine
        .registry()
        .iter()
        .map(|p| p.policy.lease_ttl())
        .max()
        .unwrap();
    let worker = QueueWorker::new(engine, t.persistence(), fast_config(1));

    assert_eq!(worker.visibility(), longest);
}

#[tokio::test]
async fn test_run_loop_processes_jobs_until_shutdown() {
    let t = TestStore::new().await;
    let connector = ScriptedConnector::new();
    let worker = Arc::new(QueueWorker::new(
        engine(&t, &connector),
        t.persistence(),
        fast_config(2),
    ));
    let shutdown = worker.shutdown_handle();

    let php = t.submit_php("8.3").await;
    let cron = t.submit_cron("backup").await;

    let handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run().await }
    });

    assert!(t.wait_for_job(php.job_id, JobState::Done).await);
    assert!(t.wait_for_job(cron.job_id, JobState::Done).await);

    // A job submitted while the loop idles is still picked up.
    let late = t.submit_php("8.2").await;
    assert!(t.wait_for_job(late.job_id, JobState::Done).await);

    shutdown.notify_one();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker did not stop")
        .unwrap();

    let cron_resource = t.store.get_resource(cron.resource_id).await.unwrap().unwrap();
    assert_eq!(cron_resource.status, ResourceStatus::Active);
}

#[tokio::test]
async fn test_shutdown_waits_for_running_operation() {
    let t = TestStore::new().await;
    let connector =
        ScriptedConnector::new().delay_on("apt-get update", Duration::from_millis(300));
    let worker = Arc::new(QueueWorker::new(
        engine(&t, &connector),
        t.persistence(),
        fast_config(1),
    ));
    let shutdown = worker.shutdown_handle();
    let php = t.submit_php("8.3").await;

    let handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run().await }
    });

    assert!(t.wait_for_job(php.job_id, JobState::Reserved).await);
    shutdown.notify_one();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker did not stop")
        .unwrap();

    // The in-flight operation finished before run() returned.
    let job = t.store.get_job(php.job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Done);
}

#[tokio::test]
async fn test_lease_reaper_purges_expired() {
    let t = TestStore::new().await;
    assert!(
        t.store
            .try_acquire_lease("server:a:php", "dead-worker", Duration::ZERO)
            .await
            .unwrap()
    );
    assert!(
        t.store
            .try_acquire_lease("server:a:database", "live-worker", Duration::from_secs(600))
            .await
            .unwrap()
    );

    let reaper = LeaseReaper::new(t.persistence(), LeaseReaperConfig::default());
    assert_eq!(reaper.reap().await, 1);
    assert_eq!(reaper.reap().await, 0);

    // The live lease is untouched.
    assert!(
        !t.store
            .try_acquire_lease("server:a:database", "other", Duration::from_secs(600))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_lease_reaper_stops_on_shutdown() {
    let t = TestStore::new().await;
    let reaper = LeaseReaper::new(
        t.persistence(),
        LeaseReaperConfig {
            poll_interval: Duration::from_millis(10),
        },
    );
    let shutdown = reaper.shutdown_handle();
    let handle = tokio::spawn(async move { reaper.run().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.notify_one();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("reaper did not stop")
        .unwrap();
}

async fn append_event(t: &TestStore, resource_id: Uuid, age: chrono::Duration) {
    t.store
        .append_event(&ProgressEvent {
            id: None,
            server_id: t.server_id,
            resource_id,
            operation: "php.install".to_string(),
            milestone: "install_packages".to_string(),
            current_step: 1,
            total_steps: 6,
            status: ResourceStatus::Installing,
            details: None,
            error_log: None,
            created_at: Utc::now() - age,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_retention_deletes_old_events_in_batches() {
    let t = TestStore::new().await;
    let submission = t.submit_php("8.3").await;
    for _ in 0..5 {
        append_event(&t, submission.resource_id, chrono::Duration::days(120)).await;
    }
    append_event(&t, submission.resource_id, chrono::Duration::hours(1)).await;

    let worker = EventRetentionWorker::new(
        t.persistence(),
        EventRetentionConfig {
            enabled: true,
            poll_interval: Duration::from_secs(3600),
            max_age: Duration::from_secs(90 * 24 * 3600),
            batch_size: 2,
        },
    );

    assert_eq!(worker.delete_old_events().await.unwrap(), 5);
    let remaining = t.store.list_events(submission.resource_id).await.unwrap();
    assert_eq!(remaining.len(), 1);

    // The resource itself is untouched.
    assert!(
        t.store
            .get_resource(submission.resource_id)
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn test_retention_disabled_returns_immediately() {
    let t = TestStore::new().await;
    let worker = EventRetentionWorker::new(t.persistence(), EventRetentionConfig::default());

    tokio::time::timeout(Duration::from_secs(1), worker.run())
        .await
        .expect("disabled worker kept running");
}
