//! Remote control for the VLC Android web interface.
//!
//! Two phases:
//! - a challenge/response login over HTTP ([`SessionRegistry`],
//!   [`RemoteSession`]) whose cookies may be persisted and restored, and
//! - a ticket-authenticated WebSocket session ([`RemoteControlClient`]) that
//!   carries playback commands out and player state back, reconnecting with
//!   backoff until shut down.

pub mod auth;
pub mod backoff;
pub mod client;
pub mod config;
pub mod cookies;
pub mod error;
pub mod events;
pub mod persist;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod ticket;

use std::sync::OnceLock;

use tracing::debug;

pub use client::RemoteControlClient;
pub use config::ClientConfig;
pub use error::{RemoteError, Result};
pub use events::PlayerEvent;
pub use persist::{SessionFile, StoredSession};
pub use protocol::{Command, InboundMessage, MessageCategory};
pub use registry::{RestoreOutcome, SessionRegistry};
pub use session::RemoteSession;

/// Install the process-wide rustls crypto provider once.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// HTTP client used for every request to a player.
pub fn build_http_client(config: &ClientConfig) -> Result<reqwest::Client> {
    install_rustls_provider();
    Ok(reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()?)
}
