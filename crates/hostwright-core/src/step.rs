// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step model produced by provisioners and consumed by the executor.

use std::fmt;

use serde_json::{Map, Value};

/// One shell command to run over the session.
///
/// User input must only reach the command through [`shell_quote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand(String);

impl RemoteCommand {
    /// Wrap a fully assembled command line.
    pub fn new(command: impl Into<String>) -> Self {
        Self(command.into())
    }

    /// The command line.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Local state mutation applied by the engine between remote steps.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalEffect {
    /// Merge these keys into the resource config.
    MergeConfig(Map<String, Value>),
    /// Store the trimmed stdout of the preceding remote step under `config_key`.
    CaptureOutput {
        /// Config key to write.
        config_key: &'static str,
    },
    /// Make the resource the only default of its singleton scope.
    PromoteSingleton,
}

/// A step of a provisioning sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Run a command on the remote host.
    Remote {
        /// Milestone reached when the step finishes.
        milestone: &'static str,
        /// Command to execute.
        command: RemoteCommand,
    },
    /// Mutate local state.
    Local {
        /// Milestone reached when the step finishes.
        milestone: &'static str,
        /// Effect to apply.
        effect: LocalEffect,
    },
}

impl Step {
    /// Remote step shorthand.
    pub fn remote(milestone: &'static str, command: impl Into<String>) -> Self {
        Self::Remote {
            milestone,
            command: RemoteCommand::new(command),
        }
    }

    /// Local step shorthand.
    pub fn local(milestone: &'static str, effect: LocalEffect) -> Self {
        Self::Local { milestone, effect }
    }

    /// Milestone key of the step.
    pub fn milestone(&self) -> &'static str {
        match self {
            Self::Remote { milestone, .. } | Self::Local { milestone, .. } => milestone,
        }
    }

    /// Command text for remote steps.
    pub fn command(&self) -> Option<&str> {
        match self {
            Self::Remote { command, .. } => Some(command.as_str()),
            Self::Local { .. } => None,
        }
    }

    /// Whether the step runs on the remote host.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}

/// Quote a value for a POSIX shell.
///
/// Wraps in single quotes and rewrites each embedded `'` as `'\''`.
pub fn shell_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("main"), "'main'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn test_step_accessors() {
        let remote = Step::remote("clone", "git clone x");
        assert_eq!(remote.milestone(), "clone");
        assert_eq!(remote.command(), Some("git clone x"));
        assert!(remote.is_remote());

        let local = Step::local("promote", LocalEffect::PromoteSingleton);
        assert_eq!(local.milestone(), "promote");
        assert_eq!(local.command(), None);
        assert!(!local.is_remote());
    }
}
