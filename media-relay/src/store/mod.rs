//! Shared mutable state.
//!
//! Each map sits behind its own lock and is only reachable through accessor
//! methods that hand out copies. No lock is held across I/O.

pub mod jobs;
pub mod player;
pub mod subscribers;

use std::sync::Arc;

use vlc_remote::SessionRegistry;

pub use jobs::{CancelOutcome, JobRegistry, RetryRefusal};
pub use player::{PlayerSnapshot, PlayerStateCache};
pub use subscribers::{Delivery, SubscriberId, SubscriberSet};

/// Per-subscriber buffer before events start being skipped for that observer.
pub const SUBSCRIBER_BUFFER: usize = 256;

pub struct SessionStore {
    pub jobs: JobRegistry,
    pub players: Arc<SessionRegistry>,
    pub player_state: PlayerStateCache,
    pub subscribers: SubscriberSet,
}

impl SessionStore {
    pub fn new(players: Arc<SessionRegistry>) -> Self {
        Self {
            jobs: JobRegistry::new(),
            players,
            player_state: PlayerStateCache::new(),
            subscribers: SubscriberSet::new(SUBSCRIBER_BUFFER),
        }
    }
}
