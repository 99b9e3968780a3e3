//! Last known player state and server-wide preferences.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use vlc_remote::InboundMessage;
use vlc_remote::protocol::{NowPlaying, PlayQueue};

/// Result of the most recent tool self-update check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolState {
    pub status: String,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSnapshot {
    pub now_playing: Option<NowPlaying>,
    pub playing: Option<bool>,
    pub queue: Option<PlayQueue>,
    pub volume: Option<i64>,
    pub last_update: Option<DateTime<Utc>>,
    pub autoplay: bool,
    pub tool: Option<ToolState>,
}

impl Default for PlayerSnapshot {
    fn default() -> Self {
        Self {
            now_playing: None,
            playing: None,
            queue: None,
            volume: None,
            last_update: None,
            autoplay: true,
            tool: None,
        }
    }
}

#[derive(Default)]
pub struct PlayerStateCache {
    inner: RwLock<PlayerSnapshot>,
}

impl PlayerStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        self.inner.read().clone()
    }

    /// Fold a player frame into the cache. Returns whether anything changed.
    pub fn apply(&self, message: &InboundMessage) -> bool {
        let mut state = self.inner.write();
        match message {
            InboundMessage::NowPlaying(np) => {
                state.playing = Some(np.playing);
                state.volume = Some(np.volume);
                state.now_playing = Some(np.clone());
            }
            InboundMessage::PlayerStatus(status) => {
                state.playing = Some(status.playing);
                if let Some(np) = state.now_playing.as_mut() {
                    np.playing = status.playing;
                }
            }
            InboundMessage::PlayQueue(queue) => state.queue = Some(queue.clone()),
            InboundMessage::Volume(v) => state.volume = Some(v.volume),
            InboundMessage::Legacy { status, .. } => {
                state.playing = Some(status.is_playing());
                if status.volume > 0 {
                    state.volume = Some(status.volume);
                }
            }
            _ => return false,
        }
        state.last_update = Some(Utc::now());
        true
    }

    /// Forget playback state, e.g. after the session is lost.
    pub fn clear_playback(&self) {
        let mut state = self.inner.write();
        state.now_playing = None;
        state.playing = None;
        state.queue = None;
        state.volume = None;
        state.last_update = Some(Utc::now());
    }

    pub fn autoplay(&self) -> bool {
        self.inner.read().autoplay
    }

    pub fn set_autoplay(&self, enabled: bool) {
        self.inner.write().autoplay = enabled;
    }

    pub fn set_tool_state(&self, status: impl Into<String>, message: impl Into<String>) {
        self.inner.write().tool = Some(ToolState {
            status: status.into(),
            message: message.into(),
            updated_at: Utc::now(),
        });
    }
}
