// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hostwright Worker - Provisioning Queue Consumer
//!
//! This crate runs [`hostwright_core::ProvisioningEngine`] against a real
//! store and real SSH sessions.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                    hostwright-worker (This Crate)             │
//! │  ┌─────────────┐   ┌──────────────┐   ┌─────────────────────┐ │
//! │  │ QueueWorker │   │ LeaseReaper  │   │ EventRetention      │ │
//! │  │ (N permits) │   │              │   │ Worker (optional)   │ │
//! │  └──────┬──────┘   └──────┬───────┘   └──────────┬──────────┘ │
//! └─────────┼─────────────────┼──────────────────────┼────────────┘
//!           │ claim/settle    │ purge                │ delete batch
//!           ▼                 ▼                      ▼
//! ┌───────────────────────────────────────────────────────────────┐
//! │               PostgreSQL or SQLite (hostwright-core)          │
//! └───────────────────────────────────────────────────────────────┘
//!           │
//!           │ Ssh2Connector + FileCredentialProvider
//!           ▼
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     Managed servers (SSH)                     │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `HOSTWRIGHT_DATABASE_URL` | required | `postgres://` or `sqlite:` URL |
//! | `HOSTWRIGHT_WORKER_ID` | `<hostname>-<uuid8>` | Reservation and lease owner |
//! | `HOSTWRIGHT_WORKER_CONCURRENCY` | 8 | Parallel operations |
//! | `HOSTWRIGHT_POLL_INTERVAL_MS` | 1000 | Idle poll interval |
//! | `HOSTWRIGHT_KEYS_DIR` | `.data/keys` | SSH key directory |
//! | `HOSTWRIGHT_SSH_CONNECT_TIMEOUT_SECS` | 30 | Connect and auth budget |
//! | `HOSTWRIGHT_LEASE_REAPER_INTERVAL_SECS` | 60 | Expired lease purge interval |
//! | `HOSTWRIGHT_EVENT_RETENTION_ENABLED` | false | Delete old progress events |
//! | `HOSTWRIGHT_EVENT_RETENTION_DAYS` | 90 | Event retention period |
//! | `HOSTWRIGHT_EVENT_RETENTION_POLL_INTERVAL_SECS` | 3600 | Retention interval |
//! | `HOSTWRIGHT_EVENT_RETENTION_BATCH_SIZE` | 500 | Events per delete |

#![deny(missing_docs)]

/// Environment configuration.
pub mod config;

/// Key material loaded from disk.
pub mod credentials;

/// Error types.
pub mod error;

/// Old progress event cleanup.
pub mod event_retention;

/// Expired lease cleanup.
pub mod lease_reaper;

/// Embeddable runtime.
pub mod runtime;

/// libssh2 session backend.
pub mod ssh;

/// Queue consumer.
pub mod worker;

pub use config::Config;
pub use error::{Error, Result};
