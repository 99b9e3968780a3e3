//! Post-completion remote playback.
//!
//! A finished file is only handed to the player once the media server
//! actually serves it, so a HEAD probe with linearly growing waits runs first.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vlc_remote::{RemoteError, RemoteSession, SessionRegistry};

use crate::artifacts::{file_name, media_url};
use crate::config::ProbeConfig;
use crate::job::model::PlaybackTarget;
use crate::{Error, Result};

/// Asks a remote player to open finished media.
#[async_trait]
pub trait Playback: Send + Sync {
    /// Play a file written under the video directory.
    async fn play_file(
        &self,
        target: &PlaybackTarget,
        file: &Path,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Play an upstream URL as-is.
    async fn play_url(&self, target: &PlaybackTarget, url: &str) -> Result<()>;
}

pub struct PlaybackLauncher {
    sessions: Arc<SessionRegistry>,
    http: reqwest::Client,
    probe: ProbeConfig,
}

impl PlaybackLauncher {
    pub fn new(sessions: Arc<SessionRegistry>, http: reqwest::Client, probe: ProbeConfig) -> Self {
        Self {
            sessions,
            http,
            probe,
        }
    }

    fn session_for(&self, target: &PlaybackTarget) -> Result<Arc<RemoteSession>> {
        self.sessions
            .get(&target.player_url)
            .filter(|s| s.is_authenticated())
            .ok_or(Error::Remote(RemoteError::NotAuthenticated))
    }
}

/// HEAD `url` until it answers 200. Returns the attempt that succeeded.
pub async fn probe_media(
    http: &reqwest::Client,
    url: &str,
    probe: ProbeConfig,
    cancel: &CancellationToken,
) -> Result<u32> {
    for attempt in 1..=probe.attempts {
        match http.head(url).send().await {
            Ok(response) if response.status() == StatusCode::OK => {
                debug!(url, attempt, "Media reachable");
                return Ok(attempt);
            }
            Ok(response) => {
                debug!(url, attempt, status = %response.status(), "Media not reachable yet");
            }
            Err(e) => {
                debug!(url, attempt, error = %e, "Media probe failed");
            }
        }

        if attempt < probe.attempts {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(probe.step * attempt) => {}
            }
        }
    }

    Err(Error::Timeout(format!(
        "{url} not reachable after {} attempts",
        probe.attempts
    )))
}

#[async_trait]
impl Playback for PlaybackLauncher {
    async fn play_file(
        &self,
        target: &PlaybackTarget,
        file: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let session = self.session_for(target)?;
        let name = file_name(file)
            .ok_or_else(|| Error::validation(format!("no file name in {}", file.display())))?;
        let url = media_url(&target.media_base_url, &name);

        if let Err(e) = probe_media(&self.http, &url, self.probe, cancel).await {
            warn!(url = %url, error = %e, "Skipping playback, media not reachable");
            return Err(e);
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        session.play(&url).await?;
        info!(player = %target.player_url, url = %url, "Remote playback started");
        Ok(())
    }

    async fn play_url(&self, target: &PlaybackTarget, url: &str) -> Result<()> {
        let session = self.session_for(target)?;
        session.play(url).await?;
        info!(player = %target.player_url, url, "Remote playback started");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use axum::Router;
    use axum::extract::State;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::get;

    async fn flaky_media(State(hits): State<Arc<AtomicU32>>) -> AxumStatus {
        if hits.fetch_add(1, Ordering::SeqCst) < 2 {
            AxumStatus::NOT_FOUND
        } else {
            AxumStatus::OK
        }
    }

    async fn serve(hits: Arc<AtomicU32>) -> String {
        let app = Router::new()
            .route("/videos/{file}", get(flaky_media))
            .with_state(hits);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn fast_probe(attempts: u32) -> ProbeConfig {
        ProbeConfig {
            attempts,
            step: Duration::from_millis(10),
        }
    }

    fn http() -> reqwest::Client {
        vlc_remote::build_http_client(&vlc_remote::ClientConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_probe_retries_until_served() {
        let hits = Arc::new(AtomicU32::new(0));
        let base = serve(hits.clone()).await;
        let url = media_url(&base, "clip.mp4");

        let attempt = probe_media(&http(), &url, fast_probe(10), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(attempt, 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_probe_gives_up() {
        let hits = Arc::new(AtomicU32::new(0));
        let base = serve(hits.clone()).await;
        let url = media_url(&base, "clip.mp4");

        let err = probe_media(&http(), &url, fast_probe(2), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_unauthenticated_target_is_refused() {
        let sessions = Arc::new(SessionRegistry::new(http(), None));
        let launcher = PlaybackLauncher::new(sessions, http(), fast_probe(1));
        let target = PlaybackTarget {
            player_url: "http://127.0.0.1:9".to_string(),
            media_base_url: "http://127.0.0.1:9".to_string(),
        };

        let err = launcher.play_url(&target, "https://cdn/v.mp4").await.unwrap_err();
        assert!(matches!(err, Error::Remote(RemoteError::NotAuthenticated)));
    }
}
