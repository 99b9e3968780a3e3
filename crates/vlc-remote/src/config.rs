use std::time::Duration;

/// Timing knobs for talking to a player endpoint.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Renew the duplex ticket once it is this old.
    pub ticket_renew_after: Duration,
    /// Lifetime the player grants a ticket.
    pub ticket_expiry: Duration,
    /// First reconnect delay.
    pub reconnect_initial_delay: Duration,
    /// Reconnect delay ceiling.
    pub reconnect_max_delay: Duration,
    /// A session that stayed up this long resets the reconnect delay.
    pub stable_after: Duration,
    /// Timeout for HTTP requests and the WebSocket handshake.
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ticket_renew_after: Duration::from_secs(50),
            ticket_expiry: Duration::from_secs(60),
            reconnect_initial_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            stable_after: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
        }
    }
}
