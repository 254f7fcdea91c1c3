// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for hostwright-core.
//!
//! Every error carries a stable machine-readable code and a retry class.
//! The job lifecycle wrapper uses [`CoreError::is_retryable`] to decide
//! between another attempt and permanent failure.

use thiserror::Error;
use uuid::Uuid;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the provisioning engine and its collaborators.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Builder input failed validation. Never retried.
    #[error("Validation error for '{field}': {message}")]
    Validation {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// The managed resource record does not exist.
    #[error("Resource '{resource_id}' not found")]
    ResourceNotFound {
        /// The resource ID that was not found.
        resource_id: Uuid,
    },

    /// The target server record does not exist.
    #[error("Server '{server_id}' not found")]
    ServerNotFound {
        /// The server ID that was not found.
        server_id: Uuid,
    },

    /// The requested status change is not in the transition table.
    #[error("Resource '{resource_id}' cannot move from '{from}' to '{to}'")]
    InvalidTransition {
        /// The resource ID.
        resource_id: Uuid,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// No provisioner is registered for the operation.
    #[error("Unknown operation '{operation}'")]
    UnknownOperation {
        /// The operation string as received.
        operation: String,
    },

    /// A live resource already occupies a singleton scope.
    #[error("Server '{server_id}' already has a live {kind} resource '{existing}'")]
    SingletonConflict {
        /// The server ID.
        server_id: Uuid,
        /// Resource kind of the scope.
        kind: String,
        /// The resource currently holding the scope.
        existing: Uuid,
    },

    /// A live resource with the same key already exists on the server.
    #[error("Server '{server_id}' already has a live {kind} resource '{resource_key}' ({existing})")]
    DuplicateResource {
        /// The server ID.
        server_id: Uuid,
        /// Resource kind.
        kind: String,
        /// The contested key.
        resource_key: String,
        /// The live resource holding the key.
        existing: Uuid,
    },

    /// SSH key material could not be resolved.
    #[error("Credential for server '{server_id}' (role {role}) unavailable: {reason}")]
    Credential {
        /// The server ID.
        server_id: Uuid,
        /// Credential role.
        role: String,
        /// Why resolution failed.
        reason: String,
    },

    /// SSH connection or authentication failed.
    #[error("Connection to {host} failed: {reason}")]
    Connection {
        /// Target host (with port).
        host: String,
        /// Failure details.
        reason: String,
    },

    /// The remote session exceeded its time budget.
    #[error("Remote session timed out after {after_secs}s")]
    Timeout {
        /// The configured session timeout in seconds.
        after_secs: u64,
    },

    /// A remote step exited non-zero; the rest of the sequence was aborted.
    #[error("Step '{milestone}' failed with exit code {exit_code}: {output}")]
    RemoteCommandFailed {
        /// Milestone key of the failing step.
        milestone: String,
        /// Exit status reported by the remote shell.
        exit_code: i32,
        /// Captured stderr/stdout (tail).
        output: String,
    },

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Shorthand for a validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::ResourceNotFound { .. } => "RESOURCE_NOT_FOUND",
            Self::ServerNotFound { .. } => "SERVER_NOT_FOUND",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::UnknownOperation { .. } => "UNKNOWN_OPERATION",
            Self::SingletonConflict { .. } => "SINGLETON_CONFLICT",
            Self::DuplicateResource { .. } => "DUPLICATE_RESOURCE",
            Self::Credential { .. } => "CREDENTIAL_UNAVAILABLE",
            Self::Connection { .. } => "CONNECTION_FAILED",
            Self::Timeout { .. } => "SESSION_TIMEOUT",
            Self::RemoteCommandFailed { .. } => "REMOTE_COMMAND_FAILED",
            Self::Database { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether another attempt may succeed.
    ///
    /// Remote command failures are retryable: they count against the retry
    /// budget like any transient infrastructure error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::Timeout { .. }
                | Self::RemoteCommandFailed { .. }
                | Self::Database { .. }
        )
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Database {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_and_retry_class() {
        let id = Uuid::nil();
        let test_cases = vec![
            (CoreError::validation("branch", "bad"), "VALIDATION_ERROR", false),
            (
                CoreError::ResourceNotFound { resource_id: id },
                "RESOURCE_NOT_FOUND",
                false,
            ),
            (
                CoreError::ServerNotFound { server_id: id },
                "SERVER_NOT_FOUND",
                false,
            ),
            (
                CoreError::InvalidTransition {
                    resource_id: id,
                    from: "removed".to_string(),
                    to: "installing".to_string(),
                },
                "INVALID_TRANSITION",
                false,
            ),
            (
                CoreError::UnknownOperation {
                    operation: "redis.install".to_string(),
                },
                "UNKNOWN_OPERATION",
                false,
            ),
            (
                CoreError::Credential {
                    server_id: id,
                    role: "root".to_string(),
                    reason: "missing".to_string(),
                },
                "CREDENTIAL_UNAVAILABLE",
                false,
            ),
            (
                CoreError::Connection {
                    host: "10.0.0.1:22".to_string(),
                    reason: "refused".to_string(),
                },
                "CONNECTION_FAILED",
                true,
            ),
            (CoreError::Timeout { after_secs: 600 }, "SESSION_TIMEOUT", true),
            (
                CoreError::RemoteCommandFailed {
                    milestone: "install_packages".to_string(),
                    exit_code: 100,
                    output: "E: Unable to locate package".to_string(),
                },
                "REMOTE_COMMAND_FAILED",
                true,
            ),
            (
                CoreError::Database {
                    operation: "update".to_string(),
                    details: "pool timed out".to_string(),
                },
                "DATABASE_ERROR",
                true,
            ),
        ];

        for (error, expected_code, retryable) in test_cases {
            assert_eq!(error.error_code(), expected_code, "{:?}", error);
            assert_eq!(error.is_retryable(), retryable, "{:?}", error);
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_error_display() {
        let err = CoreError::validation("repository", "expected owner/name or an SSH URL");
        assert_eq!(
            err.to_string(),
            "Validation error for 'repository': expected owner/name or an SSH URL"
        );

        let err = CoreError::RemoteCommandFailed {
            milestone: "clone".to_string(),
            exit_code: 128,
            output: "fatal: repository not found".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Step 'clone' failed with exit code 128: fatal: repository not found"
        );

        let err = CoreError::Timeout { after_secs: 600 };
        assert_eq!(err.to_string(), "Remote session timed out after 600s");
    }
}
