//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse failure classes used to decide how a failure is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network or tool hiccup; retried with backoff or left for a manual retry.
    Transient,
    /// Bad input or unavailable media; terminal for the job.
    Business,
    /// User-initiated; never reported as an error.
    Cancellation,
    /// Unexpected answer from the remote player.
    Protocol,
    /// Startup resource failure.
    Fatal,
}

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("{tool} failed: {message}")]
    Tool { tool: String, message: String },

    #[error("Requested format is not available: {0}")]
    FormatUnavailable(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Player error: {0}")]
    Remote(#[from] vlc_remote::RemoteError),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Cancelled => ErrorCategory::Cancellation,
            Self::Validation(_) | Self::NotFound { .. } | Self::FormatUnavailable(_) => {
                ErrorCategory::Business
            }
            Self::Configuration(_) => ErrorCategory::Fatal,
            Self::Remote(e) if e.is_transient() => ErrorCategory::Transient,
            Self::Remote(_) => ErrorCategory::Protocol,
            Self::Io(_) | Self::Tool { .. } | Self::Timeout(_) => ErrorCategory::Transient,
            Self::Serialization(_) | Self::Other(_) => ErrorCategory::Business,
        }
    }
}
