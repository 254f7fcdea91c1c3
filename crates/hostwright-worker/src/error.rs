// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for hostwright-worker.

use thiserror::Error;

/// Worker errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Engine or store operation failed.
    #[error("Core error: {0}")]
    Core(#[from] hostwright_core::CoreError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using worker Error.
pub type Result<T> = std::result::Result<T, Error>;
