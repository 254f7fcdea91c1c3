// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mutual exclusion between operations sharing a scope.

mod common;

use std::time::Duration;

use common::{Harness, fast_policy};
use hostwright_core::lifecycle::LEASE_RETRY_DELAY;
use hostwright_core::persistence::{JobQueue, JobState, LeaseStore};
use hostwright_core::session::ScriptedConnector;
use hostwright_core::{JobOutcome, ResourceStatus};
use serde_json::json;

#[tokio::test]
async fn test_busy_scope_defers_without_counting_attempt() {
    let h = Harness::new().await;
    let submission = h
        .submit("php.install", "8.3", json!({"version": "8.3"}))
        .await
        .unwrap();

    let key = format!("server:{}:php", h.server_id);
    assert!(
        h.store
            .try_acquire_lease(&key, "other-worker:job", Duration::from_secs(60))
            .await
            .unwrap()
    );

    let outcomes = h.drain().await;
    assert_eq!(
        outcomes,
        vec![JobOutcome::Deferred {
            retry_after: LEASE_RETRY_DELAY
        }]
    );
    assert_eq!(h.connector.connections(), 0);

    let job = h.store.get_job(submission.job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.exceptions, 0);
    assert!(job.available_at > chrono::Utc::now());
    assert_eq!(
        h.resource(submission.resource_id).await.status,
        ResourceStatus::Pending
    );
}

#[tokio::test]
async fn test_lease_is_released_after_run() {
    let h = Harness::new().await;
    h.submit("php.install", "8.3", json!({"version": "8.3"}))
        .await
        .unwrap();
    h.drain().await;

    let key = format!("server:{}:php", h.server_id);
    assert!(
        h.store
            .try_acquire_lease(&key, "other-worker:job", Duration::from_secs(60))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_concurrent_runs_in_one_scope_do_not_overlap() {
    let connector =
        ScriptedConnector::new().delay_on("install -y -qq php", Duration::from_millis(500));
    let h = Harness::with(connector, fast_policy()).await;
    h.submit("php.install", "8.2", json!({"version": "8.2"}))
        .await
        .unwrap();
    h.submit("php.install", "8.3", json!({"version": "8.3"}))
        .await
        .unwrap();

    let visibility = Duration::from_secs(60);
    let first = h.store.claim("w1", visibility).await.unwrap().unwrap();
    let second = h.store.claim("w2", visibility).await.unwrap().unwrap();

    let (a, b) = tokio::join!(h.engine.process(&first), h.engine.process(&second));
    let mut outcomes = vec![a.unwrap().as_str(), b.unwrap().as_str()];
    outcomes.sort_unstable();
    assert_eq!(outcomes, vec!["completed", "deferred"]);
}

#[tokio::test]
async fn test_independent_scopes_run_together() {
    let connector = ScriptedConnector::new().delay_on("systemctl reload cron", Duration::from_millis(200));
    let h = Harness::with(connector, fast_policy()).await;
    let config = |name: &str| json!({"name": name, "schedule": "*/5 * * * *", "command": "/usr/bin/true"});
    h.submit("cron.install", "backup", config("backup"))
        .await
        .unwrap();
    h.submit("cron.install", "report", config("report"))
        .await
        .unwrap();

    let visibility = Duration::from_secs(60);
    let first = h.store.claim("w1", visibility).await.unwrap().unwrap();
    let second = h.store.claim("w2", visibility).await.unwrap().unwrap();

    let (a, b) = tokio::join!(h.engine.process(&first), h.engine.process(&second));
    assert_eq!(a.unwrap(), JobOutcome::Completed);
    assert_eq!(b.unwrap(), JobOutcome::Completed);
}
