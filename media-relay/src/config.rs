//! Runtime configuration read from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

pub const DEFAULT_VIDEO_DIR: &str = "/videos";
pub const DEFAULT_LOG_DIR: &str = "logs";
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
pub const DEFAULT_CLEANUP_GRACE_SECS: u64 = 3;

/// Progress emission limits for one external tool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottleConfig {
    /// Minimum time between two emitted samples.
    pub min_interval: Duration,
    /// A percentage jump at least this large is emitted regardless of time.
    pub min_percent_step: Option<f64>,
}

/// How long to wait for a streaming playlist before giving up on autoplay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadinessConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

/// Accessibility probe run before the player is asked to open a file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeConfig {
    pub attempts: u32,
    /// Wait after attempt `n` is `step * n`.
    pub step: Duration,
}

/// Bounded retry on "format unavailable" while resolving stream URLs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FormatRetryConfig {
    pub attempts: u32,
    pub delay: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub video_dir: PathBuf,
    /// Persisted player session credentials.
    pub session_file: PathBuf,
    pub log_dir: PathBuf,
    pub ytdlp_path: String,
    pub ffmpeg_path: String,
    pub queue_capacity: usize,
    /// Terminal jobs stay visible in snapshots this long.
    pub cleanup_grace: Duration,
    pub skip_tool_update: bool,
    pub download_progress: ThrottleConfig,
    pub transcode_progress: ThrottleConfig,
    pub readiness: ReadinessConfig,
    pub probe: ProbeConfig,
    pub format_retry: FormatRetryConfig,
    pub player: vlc_remote::ClientConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::with_video_dir(DEFAULT_VIDEO_DIR)
    }
}

impl AppConfig {
    /// Defaults rooted at `video_dir`.
    pub fn with_video_dir(video_dir: impl Into<PathBuf>) -> Self {
        let video_dir = video_dir.into();
        Self {
            session_file: video_dir.join("cookie").join("cookie.json"),
            video_dir,
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            ytdlp_path: "yt-dlp".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            cleanup_grace: Duration::from_secs(DEFAULT_CLEANUP_GRACE_SECS),
            skip_tool_update: false,
            download_progress: ThrottleConfig {
                min_interval: Duration::from_secs(1),
                min_percent_step: Some(1.0),
            },
            transcode_progress: ThrottleConfig {
                min_interval: Duration::from_secs(2),
                min_percent_step: None,
            },
            readiness: ReadinessConfig {
                timeout: Duration::from_secs(60),
                poll_interval: Duration::from_secs(1),
            },
            probe: ProbeConfig {
                attempts: 10,
                step: Duration::from_millis(500),
            },
            format_retry: FormatRetryConfig {
                attempts: 3,
                delay: Duration::from_secs(2),
            },
            player: vlc_remote::ClientConfig::default(),
        }
    }

    /// Build the configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let video_dir = get("MEDIA_RELAY_VIDEO_DIR").unwrap_or_else(|| DEFAULT_VIDEO_DIR.into());
        let mut config = Self::with_video_dir(video_dir);

        if let Some(path) = get("MEDIA_RELAY_SESSION_FILE") {
            config.session_file = PathBuf::from(path);
        }
        if let Some(path) = get("MEDIA_RELAY_LOG_DIR") {
            config.log_dir = PathBuf::from(path);
        }
        if let Some(path) = get("YTDLP_PATH") {
            config.ytdlp_path = path;
        }
        if let Some(path) = get("FFMPEG_PATH") {
            config.ffmpeg_path = path;
        }
        if let Some(raw) = get("MEDIA_RELAY_QUEUE_CAPACITY") {
            config.queue_capacity = parse_value("MEDIA_RELAY_QUEUE_CAPACITY", &raw)?;
            if config.queue_capacity == 0 {
                return Err(Error::config("MEDIA_RELAY_QUEUE_CAPACITY must be at least 1"));
            }
        }
        if let Some(raw) = get("MEDIA_RELAY_CLEANUP_GRACE_SECS") {
            config.cleanup_grace =
                Duration::from_secs(parse_value("MEDIA_RELAY_CLEANUP_GRACE_SECS", &raw)?);
        }
        if let Some(raw) = get("MEDIA_RELAY_SKIP_TOOL_UPDATE") {
            config.skip_tool_update = parse_flag("MEDIA_RELAY_SKIP_TOOL_UPDATE", &raw)?;
        }

        Ok(config)
    }

    /// Directory holding the HLS segments of one streaming job.
    pub fn segment_dir(&self, job_id: &str) -> PathBuf {
        self.video_dir.join("segments").join(job_id)
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::config(format!("{key} has an invalid value: {raw:?}")))
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::config(format!("{key} has an invalid value: {raw:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.video_dir, PathBuf::from("/videos"));
        assert_eq!(
            config.session_file,
            PathBuf::from("/videos/cookie/cookie.json")
        );
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.cleanup_grace, Duration::from_secs(3));
        assert_eq!(config.format_retry.attempts, 3);
        assert_eq!(config.readiness.timeout, Duration::from_secs(60));
        assert!(!config.skip_tool_update);
    }

    #[test]
    fn test_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            ("MEDIA_RELAY_VIDEO_DIR", "/srv/media"),
            ("MEDIA_RELAY_QUEUE_CAPACITY", "5"),
            ("MEDIA_RELAY_SKIP_TOOL_UPDATE", "yes"),
            ("FFMPEG_PATH", "/opt/ffmpeg"),
        ]))
        .unwrap();
        assert_eq!(config.video_dir, PathBuf::from("/srv/media"));
        assert_eq!(
            config.session_file,
            PathBuf::from("/srv/media/cookie/cookie.json")
        );
        assert_eq!(config.queue_capacity, 5);
        assert!(config.skip_tool_update);
        assert_eq!(config.ffmpeg_path, "/opt/ffmpeg");
        assert_eq!(
            config.segment_dir("dl_1"),
            PathBuf::from("/srv/media/segments/dl_1")
        );
    }

    #[test]
    fn test_malformed_values_are_rejected() {
        let err = AppConfig::from_lookup(lookup(&[("MEDIA_RELAY_QUEUE_CAPACITY", "many")]))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err =
            AppConfig::from_lookup(lookup(&[("MEDIA_RELAY_QUEUE_CAPACITY", "0")])).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = AppConfig::from_lookup(lookup(&[("MEDIA_RELAY_SKIP_TOOL_UPDATE", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
