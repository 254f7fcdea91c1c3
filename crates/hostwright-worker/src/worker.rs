// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue consumer.
//!
//! Claims provisioning jobs and hands each one to the engine on its own task,
//! at most `concurrency` at a time. The store is the only state shared
//! between tasks and between worker processes.

use std::sync::Arc;
use std::time::Duration;

use hostwright_core::persistence::{JobQueue, Persistence};
use hostwright_core::provisioner::LEASE_GRACE;
use hostwright_core::{JobOutcome, ProvisioningEngine};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info};

use crate::config::{ConfigError, parse_var};

/// Configuration for the queue worker.
#[derive(Debug, Clone)]
pub struct QueueWorkerConfig {
    /// Operations run in parallel.
    pub concurrency: usize,
    /// Sleep between polls of an empty queue.
    pub poll_interval: Duration,
}

impl Default for QueueWorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            poll_interval: Duration::from_millis(1000),
        }
    }
}

impl QueueWorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `HOSTWRIGHT_WORKER_CONCURRENCY`: parallel operations (default: 8)
    /// - `HOSTWRIGHT_POLL_INTERVAL_MS`: idle poll interval (default: 1000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let concurrency = parse_var("HOSTWRIGHT_WORKER_CONCURRENCY", defaults.concurrency)?;
        if concurrency == 0 {
            return Err(ConfigError::Invalid(
                "HOSTWRIGHT_WORKER_CONCURRENCY",
                "must be at least 1".to_string(),
            ));
        }
        let poll_ms = parse_var("HOSTWRIGHT_POLL_INTERVAL_MS", 1000u64)?;
        Ok(Self {
            concurrency,
            poll_interval: Duration::from_millis(poll_ms),
        })
    }
}

/// Background worker that consumes the provisioning queue.
pub struct QueueWorker {
    engine: ProvisioningEngine,
    queue: Arc<dyn Persistence>,
    config: QueueWorkerConfig,
    visibility: Duration,
    permits: Arc<Semaphore>,
    shutdown: Arc<Notify>,
}

impl QueueWorker {
    /// Create a new queue worker.
    ///
    /// The reservation visibility covers the longest operation timeout in the
    /// engine's registry plus the lease grace period.
    pub fn new(
        engine: ProvisioningEngine,
        queue: Arc<dyn Persistence>,
        config: QueueWorkerConfig,
    ) -> Self {
        let visibility = engine
            .registry()
            .iter()
            .map(|p| p.policy.lease_ttl())
            .max()
            .unwrap_or(LEASE_GRACE);
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            engine,
            queue,
            config,
            visibility,
            permits,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// How long a claimed job stays reserved.
    pub fn visibility(&self) -> Duration {
        self.visibility
    }

    /// Claim one job and process it on the current task.
    ///
    /// Returns `None` when nothing was available.
    pub async fn run_once(&self) -> Option<JobOutcome> {
        let job = match self
            .queue
            .claim(self.engine.worker_id(), self.visibility)
            .await
        {
            Ok(Some(job)) => job,
            Ok(None) => return None,
            Err(e) => {
                error!(error = %e, "Failed to claim job");
                return None;
            }
        };
        process(&self.engine, job).await
    }

    /// Run the worker loop until shutdown, then wait for running jobs.
    pub async fn run(&self) {
        info!(
            worker_id = %self.engine.worker_id(),
            concurrency = self.config.concurrency,
            poll_interval_ms = u64::try_from(self.config.poll_interval.as_millis()).unwrap_or(u64::MAX),
            visibility_secs = self.visibility.as_secs(),
            "Queue worker started"
        );

        loop {
            let permit = tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Queue worker received shutdown signal");
                    break;
                }

                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let claimed = self
                .queue
                .claim(self.engine.worker_id(), self.visibility)
                .await;
            match claimed {
                Ok(Some(job)) => {
                    let engine = self.engine.clone();
                    tokio::spawn(async move {
                        process(&engine, job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    if self.idle().await {
                        break;
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(error = %e, "Failed to claim job");
                    if self.idle().await {
                        break;
                    }
                }
            }
        }

        // Wait for in-flight operations.
        let all = u32::try_from(self.config.concurrency.max(1)).unwrap_or(u32::MAX);
        let _ = self.permits.acquire_many(all).await;
        info!("Queue worker stopped");
    }

    /// Sleep for one poll interval. Returns `true` when shutdown was signalled.
    async fn idle(&self) -> bool {
        tokio::select! {
            biased;

            _ = self.shutdown.notified() => {
                info!("Queue worker received shutdown signal");
                true
            }

            _ = tokio::time::sleep(self.config.poll_interval) => false,
        }
    }
}

async fn process(
    engine: &ProvisioningEngine,
    job: hostwright_core::ProvisioningJob,
) -> Option<JobOutcome> {
    let job_id = job.id;
    match engine.process(&job).await {
        Ok(outcome) => {
            debug!(job_id = %job_id, outcome = outcome.as_str(), "Job settled");
            Some(outcome)
        }
        Err(e) => {
            // The reservation expires and the job is offered again.
            error!(job_id = %job_id, error = %e, "Failed to settle job");
            None
        }
    }
}
