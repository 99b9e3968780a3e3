use std::time::Duration;

use crate::protocol::InboundMessage;

/// Notifications emitted by a [`RemoteControlClient`](crate::RemoteControlClient).
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// Duplex session established and hello sent.
    Connected { endpoint: String },
    /// Duplex session lost.
    Disconnected { endpoint: String, reason: String },
    /// Waiting before the next connection attempt.
    Reconnecting {
        endpoint: String,
        attempt: u32,
        delay: Duration,
    },
    /// The player no longer accepts the stored credentials.
    SessionExpired { endpoint: String },
    /// A recognized frame from the player.
    Message(InboundMessage),
    /// A frame the client does not know how to interpret.
    Diagnostic { kind: String, detail: String },
}
