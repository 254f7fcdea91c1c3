// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Progress notifications and the sinks that receive them.
//!
//! Publishing is best-effort. The resource row and its progress events are
//! the durable record; a sink that is down only loses live updates.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use crate::status::ResourceStatus;

/// Live progress update for one resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressNotification {
    /// Resource the update is about.
    pub resource_id: Uuid,
    /// Operation string.
    pub operation: String,
    /// Milestone key.
    pub milestone: String,
    /// Milestone label.
    pub label: String,
    /// Step reached.
    pub current_step: i32,
    /// Milestone count.
    pub total_steps: i32,
    /// Resource status at the time of the update.
    pub status: ResourceStatus,
    /// Failure text for failed steps and terminal failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the update was produced.
    pub at: DateTime<Utc>,
}

/// A sink refused or dropped a notification.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Nobody is listening.
    #[error("no subscribers")]
    NoSubscribers,
    /// Transport-specific failure.
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Receives progress notifications per server.
pub trait EventSink: Send + Sync {
    /// Publish without blocking the caller.
    fn publish(
        &self,
        server_id: Uuid,
        notification: &ProgressNotification,
    ) -> Result<(), SinkError>;
}

/// Logs every notification at `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(
        &self,
        server_id: Uuid,
        notification: &ProgressNotification,
    ) -> Result<(), SinkError> {
        info!(
            server_id = %server_id,
            resource_id = %notification.resource_id,
            operation = %notification.operation,
            milestone = %notification.milestone,
            step = notification.current_step,
            total = notification.total_steps,
            status = %notification.status,
            "Provisioning progress"
        );
        Ok(())
    }
}

/// Drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn publish(&self, _server_id: Uuid, _notification: &ProgressNotification) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Fans notifications out to in-process subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<(Uuid, ProgressNotification)>,
}

impl BroadcastEventSink {
    /// Sink buffering up to `capacity` notifications per lagging subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// New subscriber receiving `(server_id, notification)` pairs.
    pub fn subscribe(&self) -> broadcast::Receiver<(Uuid, ProgressNotification)> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastEventSink {
    fn publish(
        &self,
        server_id: Uuid,
        notification: &ProgressNotification,
    ) -> Result<(), SinkError> {
        self.sender
            .send((server_id, notification.clone()))
            .map(|_| ())
            .map_err(|_| SinkError::NoSubscribers)
    }
}
