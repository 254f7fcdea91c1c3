// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable progress: resource progress fields, audit events, live updates.
//!
//! Every write goes straight to the store. The sink only sees a
//! notification after the store accepted the event, and a sink failure never
//! fails the operation.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::events::{EventSink, ProgressNotification, SinkError};
use crate::executor::{StepOutcome, StepRecord};
use crate::milestone::{COMPLETE, Milestone, label_for};
use crate::persistence::Persistence;
use crate::resource::{Progress, ProgressEvent};
use crate::status::ResourceStatus;

/// Milestone key of the terminal failure audit event.
pub const FAILED: &str = "failed";

/// Identifies the operation run progress is recorded for.
#[derive(Debug, Clone, Copy)]
pub struct TrackedRun<'a> {
    /// Server of the resource.
    pub server_id: Uuid,
    /// Resource being provisioned.
    pub resource_id: Uuid,
    /// Operation string (`php.install`).
    pub operation: &'a str,
    /// Milestones of the operation.
    pub milestones: &'a [Milestone],
    /// Delivery number of the job.
    pub attempt: u32,
}

impl TrackedRun<'_> {
    fn total(&self) -> i32 {
        i32::try_from(self.milestones.len()).unwrap_or(i32::MAX)
    }
}

/// Records milestones reached by an operation.
#[derive(Clone)]
pub struct MilestoneTracker {
    store: Arc<dyn Persistence>,
    sink: Arc<dyn EventSink>,
}

impl MilestoneTracker {
    /// Tracker writing to `store` and publishing to `sink`.
    pub fn new(store: Arc<dyn Persistence>, sink: Arc<dyn EventSink>) -> Self {
        Self { store, sink }
    }

    /// Record the step at `index` (0-based) finishing with `record`.
    pub async fn record_step(
        &self,
        run: &TrackedRun<'_>,
        status: ResourceStatus,
        index: usize,
        record: &StepRecord,
    ) -> Result<()> {
        let step = i32::try_from(index + 1).unwrap_or(i32::MAX);
        let error = match record.outcome {
            StepOutcome::Failed => Some(failure_text(record)),
            StepOutcome::Succeeded => None,
        };
        let details = json!({
            "outcome": record.outcome.as_str(),
            "exit_code": record.exit_code,
            "attempt": run.attempt,
            "duration_ms": u64::try_from(record.duration.as_millis()).unwrap_or(u64::MAX),
        });
        self.record(run, status, record.milestone, step, Some(details), error)
            .await
    }

    /// Record the final `complete` milestone.
    pub async fn record_complete(&self, run: &TrackedRun<'_>, status: ResourceStatus) -> Result<()> {
        let details = json!({ "outcome": "succeeded", "attempt": run.attempt });
        self.record(run, status, COMPLETE, run.total(), Some(details), None)
            .await
    }

    /// Append the terminal `failed` audit event.
    ///
    /// The resource's progress fields are left at the last milestone reached.
    pub async fn record_terminal_failure(
        &self,
        run: &TrackedRun<'_>,
        reached: i32,
        error: &str,
    ) -> Result<()> {
        let event = ProgressEvent {
            id: None,
            server_id: run.server_id,
            resource_id: run.resource_id,
            operation: run.operation.to_string(),
            milestone: FAILED.to_string(),
            current_step: reached,
            total_steps: run.total(),
            status: ResourceStatus::Failed,
            details: Some(json!({ "outcome": "failed", "attempt": run.attempt })),
            error_log: Some(error.to_string()),
            created_at: Utc::now(),
        };
        self.store.append_event(&event).await?;
        self.publish(run, &event, "Failed".to_string());
        Ok(())
    }

    async fn record(
        &self,
        run: &TrackedRun<'_>,
        status: ResourceStatus,
        milestone: &str,
        step: i32,
        details: Option<Value>,
        error: Option<String>,
    ) -> Result<()> {
        let label = label_for(run.milestones, milestone);
        self.store
            .update_progress(
                run.resource_id,
                &Progress {
                    step,
                    total: run.total(),
                    label: Some(label.clone()),
                },
            )
            .await?;

        let event = ProgressEvent {
            id: None,
            server_id: run.server_id,
            resource_id: run.resource_id,
            operation: run.operation.to_string(),
            milestone: milestone.to_string(),
            current_step: step,
            total_steps: run.total(),
            status,
            details,
            error_log: error,
            created_at: Utc::now(),
        };
        self.store.append_event(&event).await?;
        self.publish(run, &event, label);
        Ok(())
    }

    fn publish(&self, run: &TrackedRun<'_>, event: &ProgressEvent, label: String) {
        let notification = ProgressNotification {
            resource_id: event.resource_id,
            operation: event.operation.clone(),
            milestone: event.milestone.clone(),
            label,
            current_step: event.current_step,
            total_steps: event.total_steps,
            status: event.status,
            error: event.error_log.clone(),
            at: event.created_at,
        };
        match self.sink.publish(run.server_id, &notification) {
            Ok(()) => {}
            Err(SinkError::NoSubscribers) => {
                debug!(resource_id = %run.resource_id, "No progress subscribers");
            }
            Err(e) => {
                warn!(resource_id = %run.resource_id, error = %e, "Failed to publish progress");
            }
        }
    }
}

fn failure_text(record: &StepRecord) -> String {
    let text = if record.stderr.trim().is_empty() {
        record.stdout.trim()
    } else {
        record.stderr.trim()
    };
    match record.exit_code {
        Some(code) if text.is_empty() => format!("exit code {code}"),
        _ => text.to_string(),
    }
}
