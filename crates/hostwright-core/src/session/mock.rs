// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scripted sessions for testing.
//!
//! Commands are matched against substring rules in registration order; the
//! first match decides the output. Unmatched commands succeed with empty
//! output. Every executed command is recorded with its target.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::traits::*;
use crate::credentials::Credential;
use crate::error::{CoreError, Result};

#[derive(Debug, Clone)]
struct Rule {
    needle: String,
    output: CommandOutput,
    delay: Duration,
}

/// A command the scripted session ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedCommand {
    /// Target the session was opened for.
    pub target: SshTarget,
    /// Command text.
    pub command: String,
}

/// Connector whose sessions replay scripted outputs.
#[derive(Debug, Clone, Default)]
pub struct ScriptedConnector {
    rules: Arc<Vec<Rule>>,
    refuse: Option<String>,
    log: Arc<Mutex<Vec<ExecutedCommand>>>,
    connections: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    /// Connector whose sessions succeed on every command.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, rule: Rule) -> Self {
        Arc::make_mut(&mut self.rules).push(rule);
        self
    }

    /// Return `output` for commands containing `needle`.
    pub fn respond(self, needle: &str, output: CommandOutput) -> Self {
        self.push(Rule {
            needle: needle.to_string(),
            output,
            delay: Duration::ZERO,
        })
    }

    /// Fail commands containing `needle` with `exit_code` and `stderr`.
    pub fn fail_on(self, needle: &str, exit_code: i32, stderr: &str) -> Self {
        self.respond(needle, CommandOutput::failed(exit_code, stderr))
    }

    /// Make commands containing `needle` take `delay` before succeeding.
    pub fn delay_on(self, needle: &str, delay: Duration) -> Self {
        self.push(Rule {
            needle: needle.to_string(),
            output: CommandOutput::default(),
            delay,
        })
    }

    /// Refuse every connection attempt.
    pub fn refuse_connections(mut self, reason: &str) -> Self {
        self.refuse = Some(reason.to_string());
        self
    }

    /// Commands executed so far, across all sessions.
    pub async fn commands(&self) -> Vec<String> {
        self.log
            .lock()
            .await
            .iter()
            .map(|c| c.command.clone())
            .collect()
    }

    /// Commands executed so far, with their targets.
    pub async fn executed(&self) -> Vec<ExecutedCommand> {
        self.log.lock().await.clone()
    }

    /// Number of sessions opened.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionConnector for ScriptedConnector {
    async fn connect(
        &self,
        target: &SshTarget,
        _credential: &Credential,
    ) -> Result<Box<dyn RemoteSession>> {
        if let Some(reason) = &self.refuse {
            return Err(CoreError::Connection {
                host: format!("{}:{}", target.host, target.port),
                reason: reason.clone(),
            });
        }
        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            target: target.clone(),
            rules: Arc::clone(&self.rules),
            log: Arc::clone(&self.log),
        }))
    }
}

/// Session opened by [`ScriptedConnector`].
#[derive(Debug)]
pub struct ScriptedSession {
    target: SshTarget,
    rules: Arc<Vec<Rule>>,
    log: Arc<Mutex<Vec<ExecutedCommand>>>,
}

#[async_trait]
impl RemoteSession for ScriptedSession {
    async fn execute(&mut self, command: &str, _timeout: Duration) -> Result<CommandOutput> {
        self.log.lock().await.push(ExecutedCommand {
            target: self.target.clone(),
            command: command.to_string(),
        });
        let rule = self.rules.iter().find(|r| command.contains(&r.needle));
        match rule {
            Some(rule) => {
                if !rule.delay.is_zero() {
                    tokio::time::sleep(rule.delay).await;
                }
                Ok(rule.output.clone())
            }
            None => Ok(CommandOutput::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> SshTarget {
        SshTarget {
            host: "127.0.0.1".to_string(),
            port: 22,
            user: "root".to_string(),
        }
    }

    fn credential() -> Credential {
        Credential {
            private_key: "key".to_string(),
            public_key: None,
            passphrase: None,
        }
    }

    #[tokio::test]
    async fn test_first_matching_rule_wins() {
        let connector = ScriptedConnector::new()
            .fail_on("apt-get install", 100, "E: Unable to locate package")
            .respond("apt-get", CommandOutput::ok("fine"));
        let mut session = connector.connect(&target(), &credential()).await.unwrap();

        let out = session.execute("apt-get update", Duration::from_secs(1)).await.unwrap();
        assert_eq!(out.stdout, "fine");
        let out = session
            .execute("apt-get install -y php8.3", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 100);
        let out = session.execute("true", Duration::from_secs(1)).await.unwrap();
        assert!(out.success());

        assert_eq!(connector.commands().await.len(), 3);
        assert_eq!(connector.connections(), 1);
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let connector = ScriptedConnector::new().refuse_connections("connection refused");
        let err = connector.connect(&target(), &credential()).await.err().unwrap();
        assert_eq!(err.error_code(), "CONNECTION_FAILED");
        assert_eq!(connector.connections(), 0);
    }
}
