// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session trait definitions.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::credentials::Credential;
use crate::error::Result;

/// Longest diagnostic kept from a failed command.
pub const MAX_DIAGNOSTIC_CHARS: usize = 4000;

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    /// Hostname or IP address.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Login user.
    pub user: String,
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status reported by the remote shell.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Exit code zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Failure text: stderr, or stdout when stderr is empty, keeping the tail.
    pub fn diagnostic(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        let count = text.chars().count();
        if count <= MAX_DIAGNOSTIC_CHARS {
            text.to_string()
        } else {
            text.chars().skip(count - MAX_DIAGNOSTIC_CHARS).collect()
        }
    }
}

/// An open session to one host.
///
/// Commands run through a login shell; the session is closed on drop.
#[async_trait]
pub trait RemoteSession: Send {
    /// Run one command and wait for it, or fail after `timeout`.
    async fn execute(&mut self, command: &str, timeout: Duration) -> Result<CommandOutput>;
}

/// Opens sessions.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    /// Connect and authenticate.
    async fn connect(
        &self,
        target: &SshTarget,
        credential: &Credential,
    ) -> Result<Box<dyn RemoteSession>>;
}
