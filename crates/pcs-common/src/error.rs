//! Error types for pcs deployments
//!
//! Variants follow how the orchestrator reacts to them. Validation and
//! configuration failures abort before anything is provisioned. Provisioning
//! failures leave partial cloud state behind. Transport and timeout failures
//! are the only retried ones, and only inside the component that owns the call.

use std::path::PathBuf;

use thiserror::Error;

/// Message shown whenever the cached credential can no longer be used
pub const SESSION_EXPIRED_MESSAGE: &str = "Session expired, Please run pcs login again.";

/// Marker the token cache puts in its error when the entry is gone
const CACHE_MISS_MARKER: &str = "Entry not found in cache.";

/// Main error type for pcs operations
#[derive(Debug, Error)]
pub enum Error {
    /// The platform rejected the deployment before provisioning anything
    #[error("validation error: {message}")]
    Validation {
        /// Platform error, verbatim
        message: String,
    },

    /// A resource failed while being created; partial state persists
    #[error("provisioning error [{resource}]: {message}")]
    Provisioning {
        /// Resource (or deployment) that failed
        resource: String,
        /// Platform status message, verbatim
        message: String,
    },

    /// Transient connectivity failure that was not retried or not retryable
    #[error("transport error [{context}]: {message}")]
    Transport {
        /// Component or endpoint being called
        context: String,
        /// Underlying error
        message: String,
    },

    /// A bounded retry loop ran out of attempts
    #[error("{operation} failed after {attempts} attempts: {message}")]
    Timeout {
        /// Operation that was being retried
        operation: String,
        /// Number of attempts made
        attempts: u32,
        /// Last error observed
        message: String,
    },

    /// Missing or malformed local input (templates, manifests, cache)
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of what's wrong
        message: String,
        /// File involved, if any
        path: Option<PathBuf>,
    },

    /// The cached credential is missing or stale
    #[error("{}", SESSION_EXPIRED_MESSAGE)]
    AuthExpired {
        /// Why the credential was rejected (logged, not shown)
        reason: String,
    },

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML (de)serialization error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a provisioning error for the given resource
    pub fn provisioning(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provisioning {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a transport error.
    ///
    /// A token-cache miss surfaced by the transport layer becomes
    /// [`Error::AuthExpired`] so the user is told to log in again.
    pub fn transport(context: impl Into<String>, msg: impl Into<String>) -> Self {
        let message = msg.into();
        if message.contains(CACHE_MISS_MARKER) {
            return Self::auth_expired(message);
        }
        Self::Transport {
            context: context.into(),
            message,
        }
    }

    /// Create a timeout error after `attempts` tries
    pub fn timeout(operation: impl Into<String>, attempts: u32, msg: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
            attempts,
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
            path: None,
        }
    }

    /// Create a configuration error about a specific file
    pub fn configuration_at(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
            path: Some(path.into()),
        }
    }

    /// Create an auth-expired error
    pub fn auth_expired(reason: impl Into<String>) -> Self {
        Self::AuthExpired {
            reason: reason.into(),
        }
    }

    /// Whether this error is worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}
