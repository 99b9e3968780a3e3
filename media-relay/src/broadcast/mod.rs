//! Fan-out of relay events to connected observers.
//!
//! Publishing never blocks: each subscriber gets a non-blocking `try_send`
//! into its own buffer. Closed subscribers are dropped, lagging ones miss the
//! event.

mod event;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::store::{Delivery, SessionStore, SubscriberId};

pub use event::RelayEvent;

/// Receiving side handed to one observer.
pub struct Subscription {
    pub id: SubscriberId,
    pub events: mpsc::Receiver<RelayEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        self.events.recv().await
    }
}

#[derive(Clone)]
pub struct Broadcaster {
    store: Arc<SessionStore>,
}

impl Broadcaster {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self { store }
    }

    /// Register an observer. Its first event is a full queue snapshot.
    pub fn subscribe(&self) -> Subscription {
        let jobs = &self.store.jobs;
        let (id, events) = self
            .store
            .subscribers
            .add_with(|| vec![RelayEvent::QueueSnapshot { jobs: jobs.snapshot() }]);
        debug!(subscriber = id, "Subscriber added");
        Subscription { id, events }
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        if self.store.subscribers.remove(id) {
            debug!(subscriber = id, "Subscriber removed");
        }
    }

    /// Deliver `event` to every current subscriber. Returns how many got it.
    pub fn publish(&self, event: RelayEvent) -> usize {
        self.fan_out(|| event)
    }

    /// Publish a point-in-time copy of the whole registry. The copy is taken
    /// while registration is held off, so it never lands after a newer
    /// greeting snapshot.
    pub fn publish_snapshot(&self) -> usize {
        let jobs = &self.store.jobs;
        self.fan_out(|| RelayEvent::QueueSnapshot { jobs: jobs.snapshot() })
    }

    fn fan_out<F>(&self, build: F) -> usize
    where
        F: FnOnce() -> RelayEvent,
    {
        let (event, outcomes) = self.store.subscribers.deliver_with(build);
        let mut delivered = 0;
        let mut closed = Vec::new();

        for (id, outcome) in outcomes {
            match outcome {
                Delivery::Delivered => delivered += 1,
                Delivery::Lagging => {
                    warn!(subscriber = id, event = event.kind(), "Subscriber lagging, event skipped");
                }
                Delivery::Closed => closed.push(id),
            }
        }

        if !closed.is_empty() {
            debug!(count = closed.len(), "Dropping closed subscribers");
            self.store.subscribers.remove_many(&closed);
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.store.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::model::{AcquisitionMode, Job, JobRequest};

    fn broadcaster() -> Broadcaster {
        let http = vlc_remote::build_http_client(&vlc_remote::ClientConfig::default()).unwrap();
        let players = Arc::new(vlc_remote::SessionRegistry::new(http, None));
        Broadcaster::new(Arc::new(SessionStore::new(players)))
    }

    #[tokio::test]
    async fn test_late_joiner_gets_snapshot() {
        let broadcaster = broadcaster();
        broadcaster.store.jobs.insert(
            Job::new("dl_1", JobRequest::new("u", AcquisitionMode::Download)),
            "queued",
        );

        let mut sub = broadcaster.subscribe();
        match sub.recv().await {
            Some(RelayEvent::QueueSnapshot { jobs }) => {
                assert_eq!(jobs.len(), 1);
                assert_eq!(jobs[0].id, "dl_1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_dropped() {
        let broadcaster = broadcaster();
        let mut kept = broadcaster.subscribe();
        let gone = broadcaster.subscribe();
        drop(gone);

        let delivered = broadcaster.publish(RelayEvent::Cancelled { id: "a".into() });
        assert_eq!(delivered, 1);
        assert_eq!(broadcaster.subscriber_count(), 1);

        assert!(matches!(kept.recv().await, Some(RelayEvent::QueueSnapshot { .. })));
        assert!(matches!(kept.recv().await, Some(RelayEvent::Cancelled { .. })));
    }

    #[tokio::test]
    async fn test_stalled_subscriber_does_not_block() {
        let broadcaster = broadcaster();
        let _stalled = broadcaster.subscribe();
        let mut active = broadcaster.subscribe();

        for i in 0..(crate::store::SUBSCRIBER_BUFFER * 2) {
            broadcaster.publish(RelayEvent::Cancelled { id: i.to_string() });
            // Drain the active subscriber so only the stalled one fills up.
            while active.events.try_recv().is_ok() {}
        }
        assert_eq!(broadcaster.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let broadcaster = broadcaster();
        let sub = broadcaster.subscribe();
        broadcaster.unsubscribe(sub.id);
        assert_eq!(broadcaster.publish_snapshot(), 0);
    }
}
