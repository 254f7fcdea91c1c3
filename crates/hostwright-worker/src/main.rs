// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hostwright Worker - Provisioning Queue Consumer
//!
//! Claims provisioning jobs from the shared store and runs them over SSH
//! until interrupted.

use std::sync::Arc;
use tracing::{info, warn};

use hostwright_core::persistence::Persistence;
use hostwright_core::{PostgresPersistence, SqlitePersistence, migrations};
use hostwright_worker::config::Config;
use hostwright_worker::credentials::FileCredentialProvider;
use hostwright_worker::runtime::WorkerRuntime;
use hostwright_worker::ssh::Ssh2Connector;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hostwright_worker=info,hostwright_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        worker_id = %config.worker_id,
        keys_dir = %config.keys_dir.display(),
        concurrency = config.worker.concurrency,
        sqlite = config.is_sqlite(),
        "Starting Hostwright Worker"
    );

    let persistence: Arc<dyn Persistence> = if config.is_sqlite() {
        let path = config
            .database_url
            .trim_start_matches("sqlite:")
            .trim_start_matches("//");
        Arc::new(SqlitePersistence::from_path(path).await?)
    } else {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(u32::try_from(config.worker.concurrency + 2).unwrap_or(u32::MAX))
            .connect(&config.database_url)
            .await?;
        migrations::run_postgres(&pool).await?;
        Arc::new(PostgresPersistence::new(pool))
    };

    info!("Database schema verified");

    let runtime = WorkerRuntime::builder()
        .persistence(persistence)
        .connector(Arc::new(Ssh2Connector::new(config.ssh_connect_timeout)))
        .credentials(Arc::new(FileCredentialProvider::new(&config.keys_dir)))
        .worker_id(&config.worker_id)
        .worker_config(config.worker)
        .lease_reaper_config(config.lease_reaper)
        .retention_config(config.retention)
        .build()?
        .start()
        .await?;

    info!(worker_id = %runtime.worker_id(), "Worker ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Running operations finish before this returns
    runtime.shutdown().await?;

    info!("Hostwright Worker shut down");

    Ok(())
}
