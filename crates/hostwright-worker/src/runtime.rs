// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for hostwright-worker.
//!
//! [`WorkerRuntime`] runs the queue worker, the lease reaper and the event
//! retention worker inside an existing tokio application.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use hostwright_core::SqlitePersistence;
//! use hostwright_worker::credentials::FileCredentialProvider;
//! use hostwright_worker::runtime::WorkerRuntime;
//! use hostwright_worker::ssh::Ssh2Connector;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::from_path(".data/hostwright.db").await?);
//!
//!     let runtime = WorkerRuntime::builder()
//!         .persistence(persistence)
//!         .connector(Arc::new(Ssh2Connector::default()))
//!         .credentials(Arc::new(FileCredentialProvider::new(".data/keys")))
//!         .worker_id("worker-a")
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use hostwright_core::credentials::CredentialProvider;
use hostwright_core::events::{EventSink, TracingEventSink};
use hostwright_core::persistence::Persistence;
use hostwright_core::session::SessionConnector;
use hostwright_core::{ProvisionerRegistry, ProvisioningEngine};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::event_retention::{EventRetentionConfig, EventRetentionWorker};
use crate::lease_reaper::{LeaseReaper, LeaseReaperConfig};
use crate::worker::{QueueWorker, QueueWorkerConfig};

/// Builder for creating a [`WorkerRuntime`].
#[derive(Default)]
pub struct WorkerRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    registry: Option<Arc<ProvisionerRegistry>>,
    connector: Option<Arc<dyn SessionConnector>>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    sink: Option<Arc<dyn EventSink>>,
    worker_id: Option<String>,
    worker_config: QueueWorkerConfig,
    lease_reaper_config: LeaseReaperConfig,
    retention_config: EventRetentionConfig,
}

impl WorkerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the store (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the operation registry.
    ///
    /// Default: every built-in operation.
    pub fn registry(mut self, registry: Arc<ProvisionerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the SSH connector (required).
    pub fn connector(mut self, connector: Arc<dyn SessionConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Set the credential provider (required).
    pub fn credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Set the progress sink.
    ///
    /// Default: [`TracingEventSink`]
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Set the worker identity (required).
    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// Set the queue worker configuration.
    pub fn worker_config(mut self, config: QueueWorkerConfig) -> Self {
        self.worker_config = config;
        self
    }

    /// Set the lease reaper configuration.
    pub fn lease_reaper_config(mut self, config: LeaseReaperConfig) -> Self {
        self.lease_reaper_config = config;
        self
    }

    /// Set the event retention configuration.
    pub fn retention_config(mut self, config: EventRetentionConfig) -> Self {
        self.retention_config = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<WorkerRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let connector = self
            .connector
            .ok_or_else(|| anyhow::anyhow!("connector is required"))?;
        let credentials = self
            .credentials
            .ok_or_else(|| anyhow::anyhow!("credentials is required"))?;
        let worker_id = self
            .worker_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("worker_id is required"))?;

        Ok(WorkerRuntimeConfig {
            persistence,
            registry: self
                .registry
                .unwrap_or_else(|| Arc::new(ProvisionerRegistry::default())),
            connector,
            credentials,
            sink: self.sink.unwrap_or_else(|| Arc::new(TracingEventSink)),
            worker_id,
            worker_config: self.worker_config,
            lease_reaper_config: self.lease_reaper_config,
            retention_config: self.retention_config,
        })
    }
}

/// Configuration for a [`WorkerRuntime`].
pub struct WorkerRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    registry: Arc<ProvisionerRegistry>,
    connector: Arc<dyn SessionConnector>,
    credentials: Arc<dyn CredentialProvider>,
    sink: Arc<dyn EventSink>,
    worker_id: String,
    worker_config: QueueWorkerConfig,
    lease_reaper_config: LeaseReaperConfig,
    retention_config: EventRetentionConfig,
}

impl WorkerRuntimeConfig {
    /// Start the runtime, spawning the background tasks.
    pub async fn start(self) -> Result<WorkerRuntime> {
        let engine = ProvisioningEngine::new(
            self.persistence.clone(),
            self.registry,
            self.connector,
            self.credentials,
            self.sink,
            self.worker_id.clone(),
        );

        let queue_worker =
            QueueWorker::new(engine, self.persistence.clone(), self.worker_config);
        let worker_shutdown = queue_worker.shutdown_handle();
        let worker_handle = tokio::spawn(async move {
            queue_worker.run().await;
        });

        let lease_reaper = LeaseReaper::new(self.persistence.clone(), self.lease_reaper_config);
        let reaper_shutdown = lease_reaper.shutdown_handle();
        let reaper_handle = tokio::spawn(async move {
            lease_reaper.run().await;
        });

        let retention_worker =
            EventRetentionWorker::new(self.persistence.clone(), self.retention_config);
        let retention_shutdown = retention_worker.shutdown_handle();
        let retention_handle = tokio::spawn(async move {
            retention_worker.run().await;
        });

        info!(worker_id = %self.worker_id, "WorkerRuntime started");

        Ok(WorkerRuntime {
            worker_id: self.worker_id,
            worker_handle,
            reaper_handle,
            retention_handle,
            worker_shutdown,
            reaper_shutdown,
            retention_shutdown,
        })
    }
}

/// A running hostwright worker.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination. Operations
/// already running are allowed to finish.
pub struct WorkerRuntime {
    worker_id: String,
    worker_handle: JoinHandle<()>,
    reaper_handle: JoinHandle<()>,
    retention_handle: JoinHandle<()>,
    worker_shutdown: Arc<Notify>,
    reaper_shutdown: Arc<Notify>,
    retention_shutdown: Arc<Notify>,
}

impl WorkerRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> WorkerRuntimeBuilder {
        WorkerRuntimeBuilder::new()
    }

    /// Worker identity.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Signal every task to stop, then wait for them.
    pub async fn shutdown(self) -> Result<()> {
        info!("WorkerRuntime shutting down...");

        self.worker_shutdown.notify_one();
        self.reaper_shutdown.notify_one();
        self.retention_shutdown.notify_one();

        let mut panicked = false;
        for (name, handle) in [
            ("Queue worker", self.worker_handle),
            ("Lease reaper", self.reaper_handle),
            ("Event retention worker", self.retention_handle),
        ] {
            if let Err(e) = handle.await {
                error!("{} task panicked: {}", name, e);
                panicked = true;
            }
        }

        if panicked {
            return Err(anyhow::anyhow!("worker task panicked"));
        }
        info!("WorkerRuntime shutdown complete");
        Ok(())
    }

    /// Check if the queue worker and lease reaper are still running.
    pub fn is_running(&self) -> bool {
        !self.worker_handle.is_finished() && !self.reaper_handle.is_finished()
    }
}
