//! Wire messages of the `/echo` duplex endpoint.
//!
//! Outbound frames share one flat JSON shape. Inbound frames carry a `type`
//! discriminant and are decoded into one variant per known type; anything
//! else is kept verbatim as [`InboundMessage::Unknown`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Control intents understood by the player.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Play,
    Pause,
    /// Absolute position in milliseconds.
    SeekTo { position_ms: i64 },
    /// Absolute volume, clamped to 0..=100.
    SetVolume(u8),
    Next,
    Previous,
}

/// Optional value carried alongside a command.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Float(f64),
    Long(i64),
    Text(String),
}

/// Uniform `{name, id?, payload?}` form of a command.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedCommand {
    pub name: &'static str,
    pub id: Option<i64>,
    pub payload: Option<Payload>,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Play => "play",
            Self::Pause => "pause",
            Self::SeekTo { .. } => "set-progress",
            Self::SetVolume(_) => "set-volume",
            Self::Next => "next",
            Self::Previous => "previous",
        }
    }

    /// The player reads both the seek position and the volume from `id`.
    pub fn encode(&self) -> EncodedCommand {
        let id = match self {
            Self::SeekTo { position_ms } => Some((*position_ms).max(0)),
            Self::SetVolume(volume) => Some(i64::from((*volume).min(100))),
            _ => None,
        };
        EncodedCommand {
            name: self.name(),
            id,
            payload: None,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A frame sent to the player.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub float_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub long_value: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,
    pub auth_ticket: String,
}

impl OutboundMessage {
    /// First frame of every connection; binds it to the ticket holder.
    pub fn hello(ticket: &str) -> Self {
        Self {
            message: "hello".to_string(),
            id: None,
            float_value: None,
            long_value: None,
            string_value: None,
            auth_ticket: ticket.to_string(),
        }
    }

    pub fn command(encoded: EncodedCommand, ticket: &str) -> Self {
        let mut msg = Self::hello(ticket);
        msg.message = encoded.name.to_string();
        msg.id = encoded.id;
        match encoded.payload {
            Some(Payload::Float(v)) => msg.float_value = Some(v),
            Some(Payload::Long(v)) => msg.long_value = Some(v),
            Some(Payload::Text(v)) => msg.string_value = Some(v),
            None => {}
        }
        msg
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Bookmark {
    pub id: i64,
    pub title: String,
    pub time: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Chapter {
    pub title: String,
    pub time: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NowPlaying {
    pub title: String,
    pub artist: String,
    pub playing: bool,
    pub is_video_playing: bool,
    pub progress: i64,
    pub duration: i64,
    pub id: i64,
    #[serde(rename = "artworkURL")]
    pub artwork_url: String,
    pub uri: String,
    pub volume: i64,
    pub speed: f64,
    pub sleep_timer: i64,
    pub wait_for_media_end: bool,
    pub reset_on_interaction: bool,
    pub shuffle: bool,
    pub repeat: i64,
    pub should_show: bool,
    pub bookmarks: Vec<Bookmark>,
    pub chapters: Vec<Chapter>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Media {
    pub id: i64,
    pub title: String,
    pub artist: String,
    pub duration: i64,
    #[serde(rename = "artworkURL")]
    pub artwork_url: String,
    pub playing: bool,
    pub resolution: String,
    pub path: String,
    pub is_folder: bool,
    pub progress: i64,
    pub played: bool,
    pub file_type: String,
    pub favorite: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerStatus {
    pub playing: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayQueue {
    pub medias: Vec<Media>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthReply {
    pub status: String,
    /// Name of the command that was refused, when this answers a command.
    pub initial_message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Volume {
    pub volume: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoginNeeded {
    pub dialog_opened: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResumeConfirmation {
    pub media_title: String,
    pub consumed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserDescription {
    pub path: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackControlForbidden {
    pub forbidden: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MlRefreshNeeded {
    pub refresh_needed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkShares {
    #[serde(alias = "medias")]
    pub shares: Vec<Media>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorReply {
    pub text: String,
}

/// Older firmware reports playback through `status`/`state`/`time`/`title`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacyStatus {
    pub title: String,
    pub state: String,
    pub playing: bool,
    pub time: i64,
    pub length: i64,
    pub volume: i64,
}

impl LegacyStatus {
    pub fn is_playing(&self) -> bool {
        self.playing || self.state == "playing"
    }
}

/// A decoded frame received from the player.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    NowPlaying(NowPlaying),
    PlayerStatus(PlayerStatus),
    PlayQueue(PlayQueue),
    MlRefreshNeeded(MlRefreshNeeded),
    Auth(AuthReply),
    Volume(Volume),
    LoginNeeded(LoginNeeded),
    ResumeConfirmation(ResumeConfirmation),
    BrowserDescription(BrowserDescription),
    PlaybackControlForbidden(PlaybackControlForbidden),
    Error(ErrorReply),
    NetworkShares(NetworkShares),
    Legacy { kind: String, status: LegacyStatus },
    Unknown { kind: String, raw: Value },
}

/// Coarse grouping used to route inbound frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCategory {
    /// Full now-playing or legacy state snapshot.
    StateSnapshot,
    /// Bare playing/paused flip.
    PlaybackFlip,
    Queue,
    Volume,
    Error,
    LoginRequired,
    /// A command was refused, typically because no media is loaded.
    CommandForbidden,
    /// The connection itself was refused; the session must be rebuilt.
    SessionForbidden,
    AuthAccepted,
    /// Informational frames with no effect on client state.
    Informational,
    /// Unrecognized discriminant or auth status.
    Diagnostic,
}

impl InboundMessage {
    /// Decode one text frame.
    ///
    /// Fails only on invalid JSON; unknown or missing discriminants become
    /// [`InboundMessage::Unknown`].
    pub fn decode(text: &str) -> Result<Self> {
        let raw: Value = serde_json::from_str(text)?;
        let kind = raw
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let msg = match kind.as_str() {
            "now-playing" => Self::NowPlaying(serde_json::from_value(raw)?),
            "player-status" => Self::PlayerStatus(serde_json::from_value(raw)?),
            "play-queue" => Self::PlayQueue(serde_json::from_value(raw)?),
            "ml-refresh-needed" => Self::MlRefreshNeeded(serde_json::from_value(raw)?),
            "auth" => Self::Auth(serde_json::from_value(raw)?),
            "volume" => Self::Volume(serde_json::from_value(raw)?),
            "login-needed" => Self::LoginNeeded(serde_json::from_value(raw)?),
            "resume-confirmation" => Self::ResumeConfirmation(serde_json::from_value(raw)?),
            "browser-description" => Self::BrowserDescription(serde_json::from_value(raw)?),
            "playback-control-forbidden" => {
                Self::PlaybackControlForbidden(serde_json::from_value(raw)?)
            }
            "error" => Self::Error(serde_json::from_value(raw)?),
            "network-shares" => Self::NetworkShares(serde_json::from_value(raw)?),
            "status" | "state" | "time" | "title" => Self::Legacy {
                status: serde_json::from_value(raw)?,
                kind,
            },
            _ => Self::Unknown { kind, raw },
        };
        Ok(msg)
    }

    /// The `type` discriminant this message was decoded from.
    pub fn kind(&self) -> &str {
        match self {
            Self::NowPlaying(_) => "now-playing",
            Self::PlayerStatus(_) => "player-status",
            Self::PlayQueue(_) => "play-queue",
            Self::MlRefreshNeeded(_) => "ml-refresh-needed",
            Self::Auth(_) => "auth",
            Self::Volume(_) => "volume",
            Self::LoginNeeded(_) => "login-needed",
            Self::ResumeConfirmation(_) => "resume-confirmation",
            Self::BrowserDescription(_) => "browser-description",
            Self::PlaybackControlForbidden(_) => "playback-control-forbidden",
            Self::Error(_) => "error",
            Self::NetworkShares(_) => "network-shares",
            Self::Legacy { kind, .. } | Self::Unknown { kind, .. } => kind,
        }
    }

    pub fn category(&self) -> MessageCategory {
        match self {
            Self::NowPlaying(_) | Self::Legacy { .. } => MessageCategory::StateSnapshot,
            Self::PlayerStatus(_) => MessageCategory::PlaybackFlip,
            Self::PlayQueue(_) => MessageCategory::Queue,
            Self::Volume(_) => MessageCategory::Volume,
            Self::Error(_) => MessageCategory::Error,
            Self::LoginNeeded(_) => MessageCategory::LoginRequired,
            Self::Auth(reply) => match reply.status.as_str() {
                "ok" => MessageCategory::AuthAccepted,
                "forbidden" if reply.refused_command().is_some() => {
                    MessageCategory::CommandForbidden
                }
                "forbidden" => MessageCategory::SessionForbidden,
                _ => MessageCategory::Diagnostic,
            },
            Self::MlRefreshNeeded(_)
            | Self::ResumeConfirmation(_)
            | Self::BrowserDescription(_)
            | Self::PlaybackControlForbidden(_)
            | Self::NetworkShares(_) => MessageCategory::Informational,
            Self::Unknown { .. } => MessageCategory::Diagnostic,
        }
    }

    /// Whether the connection must be torn down and re-established.
    pub fn requires_reconnect(&self) -> bool {
        self.category() == MessageCategory::SessionForbidden
    }

    /// Typed fields re-encoded as JSON, without the discriminant.
    pub fn payload(&self) -> Value {
        let encoded = match self {
            Self::NowPlaying(m) => serde_json::to_value(m),
            Self::PlayerStatus(m) => serde_json::to_value(m),
            Self::PlayQueue(m) => serde_json::to_value(m),
            Self::MlRefreshNeeded(m) => serde_json::to_value(m),
            Self::Auth(m) => serde_json::to_value(m),
            Self::Volume(m) => serde_json::to_value(m),
            Self::LoginNeeded(m) => serde_json::to_value(m),
            Self::ResumeConfirmation(m) => serde_json::to_value(m),
            Self::BrowserDescription(m) => serde_json::to_value(m),
            Self::PlaybackControlForbidden(m) => serde_json::to_value(m),
            Self::Error(m) => serde_json::to_value(m),
            Self::NetworkShares(m) => serde_json::to_value(m),
            Self::Legacy { status, .. } => serde_json::to_value(status),
            Self::Unknown { raw, .. } => Ok(raw.clone()),
        };
        encoded.unwrap_or(Value::Null)
    }
}

impl AuthReply {
    /// Command name this reply refers to; `None` for connection-level replies.
    pub fn refused_command(&self) -> Option<&str> {
        self.initial_message
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty() && *m != "null")
    }
}
