// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Key material from a directory tree.
//!
//! ```text
//! <keys_dir>/<server_id>/<role>             private key
//! <keys_dir>/<server_id>/<role>.pub         public key (optional)
//! <keys_dir>/<server_id>/<role>.passphrase  passphrase (optional)
//! <keys_dir>/default/<role>                 fallback for every server
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hostwright_core::CoreError;
use hostwright_core::credentials::{Credential, CredentialProvider, CredentialRole};
use tracing::debug;
use uuid::Uuid;

/// Directory shared by all servers.
pub const DEFAULT_DIR: &str = "default";

/// Reads keys from `keys_dir`.
#[derive(Debug, Clone)]
pub struct FileCredentialProvider {
    keys_dir: PathBuf,
}

impl FileCredentialProvider {
    /// Provider rooted at `keys_dir`.
    pub fn new(keys_dir: impl Into<PathBuf>) -> Self {
        Self {
            keys_dir: keys_dir.into(),
        }
    }

    /// Root directory.
    pub fn keys_dir(&self) -> &Path {
        &self.keys_dir
    }
}

async fn read_optional(path: PathBuf) -> std::io::Result<Option<String>> {
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => Ok(Some(contents.trim_end().to_string())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl CredentialProvider for FileCredentialProvider {
    async fn resolve(&self, server_id: Uuid, role: CredentialRole) -> hostwright_core::Result<Credential> {
        let unavailable = |reason: String| CoreError::Credential {
            server_id,
            role: role.as_str().to_string(),
            reason,
        };

        for dir in [
            self.keys_dir.join(server_id.to_string()),
            self.keys_dir.join(DEFAULT_DIR),
        ] {
            let key_path = dir.join(role.as_str());
            let Some(private_key) = read_optional(key_path.clone())
                .await
                .map_err(|e| unavailable(format!("{}: {e}", key_path.display())))?
            else {
                continue;
            };
            if private_key.trim().is_empty() {
                return Err(unavailable(format!("{} is empty", key_path.display())));
            }

            let public_key = read_optional(dir.join(format!("{}.pub", role.as_str())))
                .await
                .map_err(|e| unavailable(e.to_string()))?;
            let passphrase = read_optional(dir.join(format!("{}.passphrase", role.as_str())))
                .await
                .map_err(|e| unavailable(e.to_string()))?;

            debug!(server_id = %server_id, role = %role, path = %key_path.display(), "Resolved credential");
            return Ok(Credential {
                private_key: format!("{private_key}\n"),
                public_key,
                passphrase,
            });
        }

        Err(unavailable(format!(
            "no key under {}",
            self.keys_dir.display()
        )))
    }
}
