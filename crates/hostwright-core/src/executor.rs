// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runs a step sequence over one remote session.
//!
//! Steps execute strictly in order. A non-zero exit aborts the rest of the
//! sequence; local steps only run once the remote step before them has
//! succeeded. One deadline covers the whole session. There is no retry
//! here: a failed pass is reported to the caller as is.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::session::{CommandOutput, RemoteSession};
use crate::step::{LocalEffect, Step};

/// How a step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Remote exit zero, or local effect applied.
    Succeeded,
    /// Remote exit non-zero.
    Failed,
}

impl StepOutcome {
    /// Name stored in progress event details.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

/// Record of one executed step.
#[derive(Debug, Clone)]
pub struct StepRecord {
    /// Milestone key of the step.
    pub milestone: &'static str,
    /// Outcome.
    pub outcome: StepOutcome,
    /// Exit code for remote steps.
    pub exit_code: Option<i32>,
    /// Captured stdout for remote steps.
    pub stdout: String,
    /// Captured stderr for remote steps.
    pub stderr: String,
    /// Wall time spent on the step.
    pub duration: Duration,
}

/// Everything the executor ran, in order.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    /// One record per executed step.
    pub steps: Vec<StepRecord>,
}

impl ExecutionReport {
    /// Total wall time.
    pub fn duration(&self) -> Duration {
        self.steps.iter().map(|s| s.duration).sum()
    }
}

/// Callbacks the executor drives while running a sequence.
#[async_trait]
pub trait StepHooks: Send + Sync {
    /// Apply a local effect. `previous` is the output of the remote step
    /// right before it, if any.
    async fn apply_local(
        &self,
        effect: &LocalEffect,
        previous: Option<&CommandOutput>,
    ) -> Result<()>;

    /// Called after every step, successful or not.
    async fn step_finished(&self, index: usize, step: &Step, record: &StepRecord) -> Result<()>;
}

/// Single-pass sequence runner.
#[derive(Debug, Clone, Copy)]
pub struct RemoteExecutor {
    session_timeout: Duration,
}

impl RemoteExecutor {
    /// Executor with a whole-session budget.
    pub fn new(session_timeout: Duration) -> Self {
        Self { session_timeout }
    }

    /// Session budget.
    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    /// Run `steps` over `session`.
    pub async fn run(
        &self,
        session: &mut dyn RemoteSession,
        steps: &[Step],
        hooks: &dyn StepHooks,
    ) -> Result<ExecutionReport> {
        let deadline = Instant::now() + self.session_timeout;
        let mut report = ExecutionReport::default();
        let mut previous: Option<CommandOutput> = None;

        for (index, step) in steps.iter().enumerate() {
            let started = Instant::now();
            match step {
                Step::Remote { milestone, command } => {
                    let milestone = *milestone;
                    let remaining = deadline.saturating_duration_since(started);
                    if remaining.is_zero() {
                        return Err(self.timeout_error());
                    }
                    debug!(milestone, step = index + 1, "Running remote step");

                    let output = match tokio::time::timeout(
                        remaining,
                        session.execute(command.as_str(), remaining),
                    )
                    .await
                    {
                        Ok(result) => result?,
                        Err(_) => {
                            warn!(milestone, "Remote session exceeded its time budget");
                            return Err(self.timeout_error());
                        }
                    };

                    let record = StepRecord {
                        milestone,
                        outcome: if output.success() {
                            StepOutcome::Succeeded
                        } else {
                            StepOutcome::Failed
                        },
                        exit_code: Some(output.exit_code),
                        stdout: output.stdout.clone(),
                        stderr: output.stderr.clone(),
                        duration: started.elapsed(),
                    };
                    hooks.step_finished(index, step, &record).await?;
                    report.steps.push(record);

                    if !output.success() {
                        return Err(CoreError::RemoteCommandFailed {
                            milestone: milestone.to_string(),
                            exit_code: output.exit_code,
                            output: output.diagnostic(),
                        });
                    }
                    previous = Some(output);
                }
                Step::Local { milestone, effect } => {
                    let milestone = *milestone;
                    hooks.apply_local(effect, previous.as_ref()).await?;
                    let record = StepRecord {
                        milestone,
                        outcome: StepOutcome::Succeeded,
                        exit_code: None,
                        stdout: String::new(),
                        stderr: String::new(),
                        duration: started.elapsed(),
                    };
                    hooks.step_finished(index, step, &record).await?;
                    report.steps.push(record);
                }
            }
        }

        Ok(report)
    }

    fn timeout_error(&self) -> CoreError {
        CoreError::Timeout {
            after_secs: self.session_timeout.as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Credential;
    use crate::session::{ScriptedConnector, SessionConnector, SshTarget};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHooks {
        finished: Mutex<Vec<(usize, &'static str, StepOutcome)>>,
        captured: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl StepHooks for RecordingHooks {
        async fn apply_local(
            &self,
            _effect: &LocalEffect,
            previous: Option<&CommandOutput>,
        ) -> Result<()> {
            self.captured
                .lock()
                .unwrap()
                .push(previous.map(|o| o.stdout.clone()));
            Ok(())
        }

        async fn step_finished(&self, index: usize, step: &Step, record: &StepRecord) -> Result<()> {
            self.finished
                .lock()
                .unwrap()
                .push((index, step.milestone(), record.outcome));
            Ok(())
        }
    }

    async fn session(connector: &ScriptedConnector) -> Box<dyn RemoteSession> {
        let target = SshTarget {
            host: "127.0.0.1".to_string(),
            port: 22,
            user: "root".to_string(),
        };
        let credential = Credential {
            private_key: String::new(),
            public_key: None,
            passphrase: None,
        };
        connector.connect(&target, &credential).await.unwrap()
    }

    fn steps() -> Vec<Step> {
        vec![
            Step::remote("one", "echo one"),
            Step::local(
                "capture",
                LocalEffect::CaptureOutput {
                    config_key: "out",
                },
            ),
            Step::remote("two", "echo two"),
            Step::remote("three", "echo three"),
        ]
    }

    #[tokio::test]
    async fn test_runs_all_steps_in_order() {
        let connector = ScriptedConnector::new().respond("echo one", CommandOutput::ok("one\n"));
        let mut session = session(&connector).await;
        let hooks = RecordingHooks::default();

        let report = RemoteExecutor::new(Duration::from_secs(60))
            .run(session.as_mut(), &steps(), &hooks)
            .await
            .unwrap();

        assert_eq!(report.steps.len(), 4);
        assert_eq!(
            connector.commands().await,
            vec!["echo one", "echo two", "echo three"]
        );
        assert_eq!(
            hooks.captured.lock().unwrap().clone(),
            vec![Some("one\n".to_string())]
        );
        let finished: Vec<usize> = hooks.finished.lock().unwrap().iter().map(|f| f.0).collect();
        assert_eq!(finished, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_non_zero_exit_aborts_sequence() {
        let connector = ScriptedConnector::new().fail_on("echo one", 2, "no such file");
        let mut session = session(&connector).await;
        let hooks = RecordingHooks::default();

        let err = RemoteExecutor::new(Duration::from_secs(60))
            .run(session.as_mut(), &steps(), &hooks)
            .await
            .unwrap_err();

        match err {
            CoreError::RemoteCommandFailed {
                milestone,
                exit_code,
                output,
            } => {
                assert_eq!(milestone, "one");
                assert_eq!(exit_code, 2);
                assert_eq!(output, "no such file");
            }
            other => panic!("unexpected error {other:?}"),
        }
        // The local step after the failing command never ran.
        assert!(hooks.captured.lock().unwrap().is_empty());
        assert_eq!(connector.commands().await, vec!["echo one"]);
        assert_eq!(
            hooks.finished.lock().unwrap().clone(),
            vec![(0, "one", StepOutcome::Failed)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_deadline() {
        let connector = ScriptedConnector::new().delay_on("echo two", Duration::from_secs(120));
        let mut session = session(&connector).await;
        let hooks = RecordingHooks::default();

        let err = RemoteExecutor::new(Duration::from_secs(60))
            .run(session.as_mut(), &steps(), &hooks)
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), "SESSION_TIMEOUT");
        assert_eq!(err.to_string(), "Remote session timed out after 60s");
        assert!(!connector.commands().await.contains(&"echo three".to_string()));
    }
}
