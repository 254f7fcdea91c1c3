// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for deleting old progress events.
//!
//! Events older than `max_age` are removed in batches of `batch_size` so no
//! single statement holds the table for long. Resources and their progress
//! columns are never touched.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hostwright_core::persistence::{Persistence, ResourceStore};
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::config::{ConfigError, flag_var, parse_var};
use crate::error::{Error, Result};

/// Configuration for event retention.
#[derive(Debug, Clone)]
pub struct EventRetentionConfig {
    /// Whether old events are deleted at all.
    pub enabled: bool,
    /// How often to run.
    pub poll_interval: Duration,
    /// Events older than this are deleted.
    pub max_age: Duration,
    /// Maximum events deleted per statement.
    pub batch_size: i64,
}

impl Default for EventRetentionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval: Duration::from_secs(3600),
            max_age: Duration::from_secs(90 * 24 * 3600),
            batch_size: 500,
        }
    }
}

impl EventRetentionConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `HOSTWRIGHT_EVENT_RETENTION_ENABLED`: "true" or "1" to enable (default: false)
    /// - `HOSTWRIGHT_EVENT_RETENTION_POLL_INTERVAL_SECS`: seconds between runs (default: 3600)
    /// - `HOSTWRIGHT_EVENT_RETENTION_DAYS`: days events are kept (default: 90)
    /// - `HOSTWRIGHT_EVENT_RETENTION_BATCH_SIZE`: max events per batch (default: 500)
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        let enabled = flag_var("HOSTWRIGHT_EVENT_RETENTION_ENABLED");
        let poll_secs = parse_var("HOSTWRIGHT_EVENT_RETENTION_POLL_INTERVAL_SECS", 3600u64)?;
        let days = parse_var("HOSTWRIGHT_EVENT_RETENTION_DAYS", 90u64)?;
        let batch_size = parse_var("HOSTWRIGHT_EVENT_RETENTION_BATCH_SIZE", 500i64)?;
        if batch_size < 1 {
            return Err(ConfigError::Invalid(
                "HOSTWRIGHT_EVENT_RETENTION_BATCH_SIZE",
                "must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            enabled,
            poll_interval: Duration::from_secs(poll_secs),
            max_age: Duration::from_secs(days * 24 * 3600),
            batch_size,
        })
    }
}

/// Background worker that deletes old progress events.
pub struct EventRetentionWorker {
    persistence: Arc<dyn Persistence>,
    config: EventRetentionConfig,
    shutdown: Arc<Notify>,
}

impl EventRetentionWorker {
    /// Create a new retention worker.
    pub fn new(persistence: Arc<dyn Persistence>, config: EventRetentionConfig) -> Self {
        Self {
            persistence,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the retention loop. Returns at once when disabled.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Event retention worker disabled");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_age_days = self.config.max_age.as_secs() / 86400,
            batch_size = self.config.batch_size,
            "Event retention worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Event retention worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.delete_old_events().await {
                        error!(error = %e, "Failed to delete old events");
                    }
                }
            }
        }

        info!("Event retention worker stopped");
    }

    /// Delete every event older than `max_age`, one batch at a time.
    pub async fn delete_old_events(&self) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.max_age)
                .map_err(|e| Error::Other(format!("Invalid duration: {}", e)))?;

        let mut total_deleted = 0u64;
        loop {
            let deleted = self
                .persistence
                .delete_events_before(cutoff, self.config.batch_size)
                .await?;
            total_deleted += deleted;

            debug!(deleted, total_deleted, "Deleted batch of events");

            // A short batch means nothing older is left.
            if deleted < self.config.batch_size as u64 {
                break;
            }
        }

        if total_deleted > 0 {
            info!(total_deleted, cutoff = %cutoff, "Deleted old progress events");
        }
        Ok(total_deleted)
    }
}
