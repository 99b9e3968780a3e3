//! Connected observers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::broadcast::RelayEvent;

pub type SubscriberId = u64;

/// Outcome of handing one event to one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The subscriber's buffer is full; this event was skipped for it.
    Lagging,
    /// The receiving side is gone.
    Closed,
}

/// Write side of one observer. Each has its own bounded buffer, so a stalled
/// observer only ever affects itself.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub id: SubscriberId,
    tx: mpsc::Sender<RelayEvent>,
}

impl Subscriber {
    pub fn deliver(&self, event: RelayEvent) -> Delivery {
        match self.tx.try_send(event) {
            Ok(()) => Delivery::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Lagging,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

pub struct SubscriberSet {
    buffer: usize,
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
}

impl SubscriberSet {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            next_id: AtomicU64::new(1),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new observer. `greeting` runs under the write lock, before
    /// the observer becomes visible to publishers, and its events are the
    /// first the observer receives.
    pub fn add_with<F>(&self, greeting: F) -> (SubscriberId, mpsc::Receiver<RelayEvent>)
    where
        F: FnOnce() -> Vec<RelayEvent>,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        let subscriber = Subscriber { id, tx };

        let mut subscribers = self.subscribers.write();
        for event in greeting() {
            subscriber.deliver(event);
        }
        subscribers.insert(id, subscriber);
        (id, rx)
    }

    pub fn remove(&self, id: SubscriberId) -> bool {
        self.subscribers.write().remove(&id).is_some()
    }

    pub fn remove_many(&self, ids: &[SubscriberId]) {
        if ids.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.write();
        for id in ids {
            subscribers.remove(id);
        }
    }

    /// Build one event and hand it to every current subscriber, all under the
    /// read lock. A concurrent `add_with` waits until delivery is done, so an
    /// observer never receives an event built before its greeting.
    pub fn deliver_with<F>(&self, build: F) -> (RelayEvent, Vec<(SubscriberId, Delivery)>)
    where
        F: FnOnce() -> RelayEvent,
    {
        let subscribers = self.subscribers.read();
        let event = build();
        let outcomes = subscribers
            .values()
            .map(|subscriber| (subscriber.id, subscriber.deliver(event.clone())))
            .collect();
        (event, outcomes)
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }
}
