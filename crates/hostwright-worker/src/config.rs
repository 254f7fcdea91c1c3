// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for hostwright-worker.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

use crate::event_retention::EventRetentionConfig;
use crate::lease_reaper::LeaseReaperConfig;
use crate::worker::QueueWorkerConfig;

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL. `sqlite:` URLs select the embedded backend.
    pub database_url: String,
    /// Identity used for job reservations and lease owners.
    pub worker_id: String,
    /// Root of the per-server key directories.
    pub keys_dir: PathBuf,
    /// TCP connect, handshake and auth budget.
    pub ssh_connect_timeout: Duration,
    /// Queue consumer settings.
    pub worker: QueueWorkerConfig,
    /// Expired lease cleanup.
    pub lease_reaper: LeaseReaperConfig,
    /// Progress event retention.
    pub retention: EventRetentionConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("HOSTWRIGHT_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("HOSTWRIGHT_DATABASE_URL"))?;

        let worker_id = match std::env::var("HOSTWRIGHT_WORKER_ID") {
            Ok(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => default_worker_id(),
        };

        let keys_dir = PathBuf::from(
            std::env::var("HOSTWRIGHT_KEYS_DIR").unwrap_or_else(|_| ".data/keys".to_string()),
        );

        let ssh_connect_timeout =
            Duration::from_secs(parse_var("HOSTWRIGHT_SSH_CONNECT_TIMEOUT_SECS", 30)?);

        Ok(Self {
            database_url,
            worker_id,
            keys_dir,
            ssh_connect_timeout,
            worker: QueueWorkerConfig::from_env()?,
            lease_reaper: LeaseReaperConfig::from_env()?,
            retention: EventRetentionConfig::from_env()?,
        })
    }

    /// Whether the database URL points at SQLite.
    pub fn is_sqlite(&self) -> bool {
        self.database_url.starts_with("sqlite:")
    }
}

/// `<hostname>-<uuid8>`.
fn default_worker_id() -> String {
    let host = nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "worker".to_string());
    format!("{host}-{}", &Uuid::new_v4().simple().to_string()[..8])
}

/// Parse an optional variable, falling back to `default` when unset.
pub(crate) fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::Invalid(name, e.to_string())),
        Err(_) => Ok(default),
    }
}

/// Parse an optional boolean flag (`true`/`1` enable it).
pub(crate) fn flag_var(name: &'static str) -> bool {
    std::env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    /// An environment variable holds an unusable value.
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}
