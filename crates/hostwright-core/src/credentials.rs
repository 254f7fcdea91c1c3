// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SSH key material and the provider interface that resolves it.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Account an operation connects as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialRole {
    /// `root`, for package and service management.
    Root,
    /// The server's application user (checkouts, releases).
    Application,
    /// Dedicated worker account.
    Worker,
}

impl CredentialRole {
    /// Role name, also used as the key file name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Application => "application",
            Self::Worker => "worker",
        }
    }

    /// Remote login name for this role.
    pub fn login<'a>(&self, application_user: &'a str) -> &'a str {
        match self {
            Self::Root => "root",
            Self::Application => application_user,
            Self::Worker => "worker",
        }
    }
}

impl fmt::Display for CredentialRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key pair for one server and role.
#[derive(Clone)]
pub struct Credential {
    /// OpenSSH private key (PEM).
    pub private_key: String,
    /// OpenSSH public key line.
    pub public_key: Option<String>,
    /// Passphrase protecting the private key.
    pub passphrase: Option<String>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Hands out key material per server and role.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Resolve the credential, or fail with [`CoreError::Credential`](crate::CoreError::Credential).
    async fn resolve(&self, server_id: Uuid, role: CredentialRole) -> Result<Credential>;
}
