//! Error types for the CLI

use std::path::PathBuf;

use pcs_common::error::SESSION_EXPIRED_MESSAGE;

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Deploy(#[from] pcs_deploy::Error),

    /// A deployment failure the progress reporter has already shown
    #[error(transparent)]
    Reported(pcs_deploy::Error),

    #[error("{}", SESSION_EXPIRED_MESSAGE)]
    NotLoggedIn,

    #[error("failed to read {path}: {message}")]
    InputFile { path: PathBuf, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("command failed: {message}")]
    CommandFailed { message: String },
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }

    pub fn command_failed(message: impl Into<String>) -> Self {
        Error::CommandFailed {
            message: message.into(),
        }
    }
}
