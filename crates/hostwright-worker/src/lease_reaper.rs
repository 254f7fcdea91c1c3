// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that purges expired exclusion leases.
//!
//! Expired leases never block a new holder, so purging only keeps the table
//! small after a worker dies mid-operation.

use std::sync::Arc;
use std::time::Duration;

use hostwright_core::persistence::{LeaseStore, Persistence};
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::config::{ConfigError, parse_var};

/// Configuration for the lease reaper.
#[derive(Debug, Clone)]
pub struct LeaseReaperConfig {
    /// How often to purge.
    pub poll_interval: Duration,
}

impl Default for LeaseReaperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
        }
    }
}

impl LeaseReaperConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `HOSTWRIGHT_LEASE_REAPER_INTERVAL_SECS`: seconds between purges (default: 60)
    pub fn from_env() -> Result<Self, ConfigError> {
        let secs = parse_var("HOSTWRIGHT_LEASE_REAPER_INTERVAL_SECS", 60u64)?;
        Ok(Self {
            poll_interval: Duration::from_secs(secs),
        })
    }
}

/// Periodically deletes expired leases.
pub struct LeaseReaper {
    persistence: Arc<dyn Persistence>,
    config: LeaseReaperConfig,
    shutdown: Arc<Notify>,
}

impl LeaseReaper {
    /// Create a new lease reaper.
    pub fn new(persistence: Arc<dyn Persistence>, config: LeaseReaperConfig) -> Self {
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

    /// Run the reaper loop until shutdown.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Lease reaper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Lease reaper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.reap().await;
                }
            }
        }

        info!("Lease reaper stopped");
    }

    /// Purge once. Returns the number of leases removed.
    pub async fn reap(&self) -> u64 {
        match self.persistence.purge_expired_leases().await {
            Ok(0) => 0,
            Ok(purged) => {
                debug!(purged, "Purged expired leases");
                purged
            }
            Err(e) => {
                error!(error = %e, "Failed to purge expired leases");
                0
            }
        }
    }
}
