//! Job identity, lifecycle states and the status projection observers see.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// How a job obtains its media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquisitionMode {
    /// Resolve the upstream media URL and hand it to the player as is.
    Direct,
    /// Download and merge into a local mp4.
    Download,
    /// Remux the upstream streams into a live HLS playlist.
    Stream,
}

impl AcquisitionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Download => "download",
            Self::Stream => "stream",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Some(Self::Direct),
            "download" => Some(Self::Download),
            "stream" => Some(Self::Stream),
            _ => None,
        }
    }
}

impl fmt::Display for AcquisitionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do once the media is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PostAction {
    #[default]
    None,
    RemotePlay,
}

/// Where finished media should be played.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackTarget {
    /// Base URL of the player's web interface.
    pub player_url: String,
    /// Base URL under which this service exposes `videos/`.
    pub media_base_url: String,
}

/// Parameters of an enqueue request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub source: String,
    pub mode: AcquisitionMode,
    #[serde(default)]
    pub post_action: PostAction,
    #[serde(default)]
    pub target: Option<PlaybackTarget>,
}

impl JobRequest {
    pub fn new(source: impl Into<String>, mode: AcquisitionMode) -> Self {
        Self {
            source: source.into(),
            mode,
            post_action: PostAction::None,
            target: None,
        }
    }

    pub fn with_remote_play(mut self, target: PlaybackTarget) -> Self {
        self.post_action = PostAction::RemotePlay;
        self.target = Some(target);
        self
    }
}

/// `dl_<unix seconds>_<random suffix>`.
pub fn generate_job_id() -> String {
    format!(
        "dl_{}_{:08x}",
        Utc::now().timestamp(),
        rand::random::<u32>()
    )
}

/// One run of a unit of acquisition work.
///
/// Everything but the cancellation handle is fixed at creation. A retry builds
/// a new `Job` with the same id and a higher `run`.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub source: String,
    pub mode: AcquisitionMode,
    pub post_action: PostAction,
    pub target: Option<PlaybackTarget>,
    pub created_at: DateTime<Utc>,
    pub run: u32,
    cancel: CancellationToken,
}

impl Job {
    pub fn new(id: impl Into<String>, request: JobRequest) -> Self {
        Self {
            id: id.into(),
            source: request.source,
            mode: request.mode,
            post_action: request.post_action,
            target: request.target,
            created_at: Utc::now(),
            run: 1,
            cancel: CancellationToken::new(),
        }
    }

    /// Fresh run with the same id, parameters and creation time.
    pub fn next_run(&self) -> Self {
        Self {
            id: self.id.clone(),
            source: self.source.clone(),
            mode: self.mode,
            post_action: self.post_action,
            target: self.target.clone(),
            created_at: self.created_at,
            run: self.run + 1,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Playback target, when the job asks for remote playback.
    pub fn playback_target(&self) -> Option<&PlaybackTarget> {
        match self.post_action {
            PostAction::RemotePlay => self.target.as_ref(),
            PostAction::None => None,
        }
    }
}

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Processing,
    Downloading,
    Streaming,
    Completed,
    Error,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Downloading => "downloading",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            Self::Queued | Self::Processing | Self::Downloading | Self::Streaming
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// Forward-only transitions within one run. Retry is not a transition; it
    /// starts a new run.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;
        match (self, target) {
            (Queued, Processing | Cancelled) => true,
            (Processing, Downloading | Streaming | Completed | Error | Cancelled) => true,
            (Downloading | Streaming, Completed | Error | Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable projection of a job, copied out to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub id: String,
    pub source: String,
    pub mode: AcquisitionMode,
    pub state: JobState,
    /// Human-readable progress line.
    pub progress: String,
    pub percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// File name or playlist produced by the job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub run: u32,
}

impl JobStatus {
    pub fn queued(job: &Job, message: impl Into<String>) -> Self {
        Self {
            id: job.id.clone(),
            source: job.source.clone(),
            mode: job.mode,
            state: JobState::Queued,
            progress: message.into(),
            percent: 0.0,
            error: None,
            output: None,
            created_at: job.created_at,
            finished_at: None,
            run: job.run,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_format() {
        let id = generate_job_id();
        assert!(id.starts_with("dl_"));
        assert_eq!(id.split('_').count(), 3);
        assert_ne!(id, generate_job_id());
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(AcquisitionMode::parse("Stream"), Some(AcquisitionMode::Stream));
        assert_eq!(AcquisitionMode::parse("bogus"), None);
        assert_eq!(AcquisitionMode::Download.to_string(), "download");
    }

    #[test]
    fn test_state_rules() {
        use JobState::*;
        for state in [Queued, Processing, Downloading, Streaming] {
            assert!(state.is_cancellable());
            assert!(!state.is_retryable());
            assert!(state.can_transition_to(Cancelled));
        }
        for state in [Completed, Error] {
            assert!(state.is_retryable());
            assert!(!state.is_cancellable());
        }
        assert!(!Cancelled.is_retryable());
        assert!(!Queued.can_transition_to(Downloading));
        assert!(!Completed.can_transition_to(Queued));
        assert!(!Cancelled.can_transition_to(Processing));
        assert!(!Downloading.can_transition_to(Processing));
    }

    #[test]
    fn test_next_run_gets_fresh_token() {
        let job = Job::new("dl_1", JobRequest::new("https://example/video", AcquisitionMode::Download));
        job.cancel_token().cancel();

        let retry = job.next_run();
        assert_eq!(retry.id, "dl_1");
        assert_eq!(retry.run, 2);
        assert_eq!(retry.created_at, job.created_at);
        assert!(!retry.is_cancelled());
    }

    #[test]
    fn test_playback_target_requires_remote_play() {
        let target = PlaybackTarget {
            player_url: "http://tv.lan:8080".into(),
            media_base_url: "http://nas.lan:8000".into(),
        };
        let mut request = JobRequest::new("u", AcquisitionMode::Download);
        request.target = Some(target.clone());
        assert!(Job::new("a", request.clone()).playback_target().is_none());

        let job = Job::new("b", request.with_remote_play(target.clone()));
        assert_eq!(job.playback_target(), Some(&target));
    }

    #[test]
    fn test_status_serialization() {
        let job = Job::new("dl_1", JobRequest::new("u", AcquisitionMode::Stream));
        let json = serde_json::to_value(JobStatus::queued(&job, "Queued")).unwrap();
        assert_eq!(json["state"], "queued");
        assert_eq!(json["mode"], "stream");
        assert!(json.get("error").is_none());
        assert!(json.get("createdAt").is_some());
    }
}
