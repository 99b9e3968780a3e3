//! Error types for the player remote-control client.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RemoteError>;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid player URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid header value: {0}")]
    InvalidHeader(String),

    #[error("No session for player {0}")]
    SessionNotFound(String),

    #[error("No pending challenge for player {0}, request a new code first")]
    MissingChallenge(String),

    #[error("Player session is not authenticated")]
    NotAuthenticated,

    #[error("Player rejected the session credentials")]
    Unauthorized,

    #[error("Code verification failed with status {status}: {body}")]
    VerificationFailed { status: u16, body: String },

    #[error("Unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("Player returned an empty ticket")]
    EmptyTicket,

    #[error("Not connected to player")]
    NotConnected,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Remote-control client has been shut down")]
    TornDown,
}

impl From<tokio_tungstenite::tungstenite::Error> for RemoteError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

impl RemoteError {
    pub fn unexpected_status(status: u16, body: impl Into<String>) -> Self {
        Self::UnexpectedStatus {
            status,
            body: body.into().trim().to_string(),
        }
    }

    /// Whether retrying later may succeed without user involvement.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::WebSocket(_) | Self::Io(_) | Self::Timeout(_) | Self::EmptyTicket => true,
            Self::UnexpectedStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Whether the user has to go through the code challenge again.
    pub fn requires_relogin(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized
                | Self::NotAuthenticated
                | Self::MissingChallenge(_)
                | Self::VerificationFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(RemoteError::Unauthorized.requires_relogin());
        assert!(!RemoteError::Unauthorized.is_transient());
        assert!(RemoteError::unexpected_status(503, "busy").is_transient());
        assert!(!RemoteError::unexpected_status(404, "missing").is_transient());
        assert!(!RemoteError::NotConnected.requires_relogin());
    }

    #[test]
    fn test_unexpected_status_trims_body() {
        let err = RemoteError::unexpected_status(500, "  boom\n");
        assert_eq!(err.to_string(), "Unexpected status 500: boom");
    }
}
