// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hostwright Core - Server Provisioning Engine
//!
//! This crate turns a queued request ("install PHP 8.3 on server X") into an
//! ordered sequence of shell commands, runs it over one SSH session, and keeps
//! a durable record of where the operation got to.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  submit   ┌───────────────┐  claim   ┌──────────────────────┐
//! │ Request path │──────────►│   Job queue   │◄─────────│  hostwright-worker   │
//! │ (service.rs) │           │ (persistence) │          │  (QueueWorker)       │
//! └──────────────┘           └───────────────┘          └──────────┬───────────┘
//!                                                                  │ run_attempt
//!                                                                  ▼
//!                  ┌──────────────────────────────────────────────────────────┐
//!                  │ ProvisioningEngine (lifecycle.rs)                         │
//!                  │  lease ─► status ─► build steps ─► execute ─► status      │
//!                  └──────┬─────────────┬──────────────┬──────────────┬───────┘
//!                         │             │              │              │
//!                         ▼             ▼              ▼              ▼
//!                 ┌─────────────┐ ┌───────────┐ ┌────────────┐ ┌────────────┐
//!                 │ Provisioner │ │ Executor  │ │  Tracker   │ │  Rollback  │
//!                 │  builders   │ │ (session) │ │ (events)   │ │ (defaults) │
//!                 └─────────────┘ └───────────┘ └────────────┘ └────────────┘
//! ```
//!
//! # Operations
//!
//! Every operation is a [`provisioner::Provisioner`]: a pure step builder,
//! an ordered milestone list ending in `complete`, a [`provisioner::JobPolicy`],
//! an [`provisioner::ExclusionScope`], the SSH role it connects as, and an
//! optional compensation. [`provisioner::ProvisionerRegistry::default`] holds
//! the built-in set listed in [`provisioners`].
//!
//! # Resource Status State Machine
//!
//! ```text
//!   pending ──► installing ──► installed | active ──► updating ──┐
//!      │             │                │     ▲                     │
//!      │             ▼                ▼     └─────────────────────┘
//!      └────────► failed ◄──────── removing ──► removed
//!                   │  ▲               ▲
//!                   │  └── (any non-terminal status)
//!                   └──── retry ─► pending, or ─► removing
//! ```
//!
//! See [`status::ResourceStatus::successors`] for the full table.
//!
//! # Failure Handling
//!
//! Transient errors (connection, timeout, non-zero exit, database) are
//! retried with exponential backoff until the policy's budget runs out.
//! Permanent errors (validation, missing rows, credentials) fail at once.
//! Either way the failure text lands in the resource's `error_log`, and the
//! permanent path writes one terminal `failed` audit event.

#![deny(missing_docs)]

/// Operation-level error type with retry classification.
pub mod error;

/// Resource status values and the transition table.
pub mod status;

/// Managed resources, servers and progress records.
pub mod resource;

/// Milestone definitions and the label catalog.
pub mod milestone;

/// Step and local-effect types produced by builders.
pub mod step;

/// Input validation shared by the builders.
pub mod validation;

/// SSH credential roles and the provider interface.
pub mod credentials;

/// Provisioner definitions, policies and the registry.
pub mod provisioner;

/// Built-in provisioners, one module per resource kind.
pub mod provisioners;

/// Remote session traits and the scripted test backend.
pub mod session;

/// Sequential step runner over one session.
pub mod executor;

/// Live progress notifications.
pub mod events;

/// Durable progress recording.
pub mod tracker;

/// Storage traits and the SQLite/PostgreSQL backends.
pub mod persistence;

/// Singleton snapshot and restore.
pub mod compensation;

/// The job lifecycle wrapper.
pub mod lifecycle;

/// Request-path helpers.
pub mod service;

/// Embedded schema migrations.
pub mod migrations;

pub use error::{CoreError, Result};
pub use lifecycle::{JobOutcome, ProvisioningEngine};
pub use persistence::{Persistence, PostgresPersistence, ProvisioningJob, SqlitePersistence};
pub use provisioner::{Provisioner, ProvisionerRegistry};
pub use resource::{ManagedResource, ResourceKind};
pub use service::{ProvisionRequest, ProvisioningService, Submission};
pub use status::ResourceStatus;
