//! Short-lived duplex tickets and their renewal schedule.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use crate::error::Result;

/// Anything that can hand out a fresh ticket.
#[async_trait]
pub trait TicketSource: Send + Sync {
    async fn fetch_ticket(&self) -> Result<String>;
}

#[async_trait]
impl<T: TicketSource + ?Sized> TicketSource for Arc<T> {
    async fn fetch_ticket(&self) -> Result<String> {
        (**self).fetch_ticket().await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TicketPolicy {
    pub renew_after: Duration,
    pub expires_after: Duration,
}

impl Default for TicketPolicy {
    fn default() -> Self {
        Self {
            renew_after: Duration::from_secs(50),
            expires_after: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Ticket {
    value: String,
    issued_at: Instant,
}

impl Ticket {
    pub fn new(value: impl Into<String>, issued_at: Instant) -> Self {
        Self {
            value: value.into(),
            issued_at,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    pub fn is_stale(&self, policy: &TicketPolicy, now: Instant) -> bool {
        now.saturating_duration_since(self.issued_at) >= policy.renew_after
    }

    pub fn is_expired(&self, policy: &TicketPolicy, now: Instant) -> bool {
        now.saturating_duration_since(self.issued_at) >= policy.expires_after
    }
}

/// Holds the current ticket for one connection and renews it on demand.
///
/// The keeper itself is not synchronized; callers keep it behind the same
/// lock that guards the connection's write half, which makes renewal and
/// command sends mutually exclusive.
pub struct TicketKeeper<S> {
    source: S,
    policy: TicketPolicy,
    current: Option<Ticket>,
    renewals: u64,
}

impl<S: TicketSource> TicketKeeper<S> {
    pub fn new(source: S, policy: TicketPolicy) -> Self {
        Self {
            source,
            policy,
            current: None,
            renewals: 0,
        }
    }

    pub fn current(&self) -> Option<&Ticket> {
        self.current.as_ref()
    }

    pub fn policy(&self) -> &TicketPolicy {
        &self.policy
    }

    /// Number of tickets fetched so far.
    pub fn fetch_count(&self) -> u64 {
        self.renewals
    }

    /// Instant at which the current ticket should be renewed.
    pub fn next_renewal(&self) -> Option<Instant> {
        self.current
            .as_ref()
            .map(|t| t.issued_at() + self.policy.renew_after)
    }

    /// Fetch a new ticket unconditionally.
    pub async fn renew(&mut self) -> Result<&Ticket> {
        let value = self.source.fetch_ticket().await?;
        self.renewals += 1;
        debug!(renewals = self.renewals, "Ticket renewed");
        Ok(self.current.insert(Ticket::new(value, Instant::now())))
    }

    /// Return the current ticket, renewing first if it is missing or stale.
    pub async fn ensure_fresh(&mut self) -> Result<&Ticket> {
        let now = Instant::now();
        let stale = match &self.current {
            Some(ticket) => ticket.is_stale(&self.policy, now),
            None => true,
        };
        if stale {
            return self.renew().await;
        }
        // `current` is Some here
        self.current
            .as_ref()
            .ok_or(crate::error::RemoteError::EmptyTicket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingSource {
        calls: AtomicU32,
    }

    #[async_trait]
    impl TicketSource for CountingSource {
        async fn fetch_ticket(&self) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("ticket-{n}"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_scheduled_at_cadence() {
        let source = Arc::new(CountingSource::default());
        let mut keeper = TicketKeeper::new(source.clone(), TicketPolicy::default());

        let start = Instant::now();
        keeper.renew().await.unwrap();
        assert_eq!(keeper.next_renewal(), Some(start + Duration::from_secs(50)));

        tokio::time::sleep_until(keeper.next_renewal().unwrap()).await;
        keeper.ensure_fresh().await.unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert!(Instant::now() <= start + Duration::from_secs(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_after_renewal_window_renews_just_in_time() {
        let source = Arc::new(CountingSource::default());
        let mut keeper = TicketKeeper::new(source.clone(), TicketPolicy::default());
        keeper.renew().await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(keeper.ensure_fresh().await.unwrap().value(), "ticket-1");

        tokio::time::advance(Duration::from_secs(25)).await;
        assert_eq!(keeper.ensure_fresh().await.unwrap().value(), "ticket-2");
        assert_eq!(keeper.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ticket_is_fetched() {
        let mut keeper = TicketKeeper::new(CountingSource::default(), TicketPolicy::default());
        assert!(keeper.next_renewal().is_none());
        assert_eq!(keeper.ensure_fresh().await.unwrap().value(), "ticket-1");
    }

    #[test]
    fn test_ticket_expiry() {
        let policy = TicketPolicy::default();
        let issued = Instant::now();
        let ticket = Ticket::new("t", issued);
        assert!(!ticket.is_stale(&policy, issued + Duration::from_secs(49)));
        assert!(ticket.is_stale(&policy, issued + Duration::from_secs(50)));
        assert!(!ticket.is_expired(&policy, issued + Duration::from_secs(59)));
        assert!(ticket.is_expired(&policy, issued + Duration::from_secs(60)));
    }
}
