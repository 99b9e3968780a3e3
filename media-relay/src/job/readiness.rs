//! Polling for a streaming playlist to become playable.

use std::path::Path;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::artifacts::playlist_is_ready;
use crate::config::ReadinessConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut,
    Cancelled,
}

/// Poll `playlist` until it has segments, the timeout elapses or `cancel`
/// fires, whichever comes first.
pub async fn wait_for_playlist(
    playlist: &Path,
    config: ReadinessConfig,
    cancel: &CancellationToken,
) -> Readiness {
    let deadline = Instant::now() + config.timeout;
    let mut polls = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Readiness::Cancelled;
        }
        polls += 1;
        if playlist_is_ready(playlist).await {
            debug!(path = %playlist.display(), polls, "Playlist ready");
            return Readiness::Ready;
        }

        let now = Instant::now();
        if now >= deadline {
            return Readiness::TimedOut;
        }
        let wait = config.poll_interval.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => return Readiness::Cancelled,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> ReadinessConfig {
        ReadinessConfig {
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_without_playlist() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let started = Instant::now();
        let result = wait_for_playlist(&dir.path().join("none.m3u8"), config(), &token).await;
        assert_eq!(result, Readiness::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_wins() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let path = dir.path().join("none.m3u8");

        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { wait_for_playlist(&path, config(), &token).await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        token.cancel();
        assert_eq!(waiter.await.unwrap(), Readiness::Cancelled);
    }

    #[tokio::test]
    async fn test_ready_playlist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.m3u8");
        std::fs::write(&path, "#EXTM3U\n#EXTINF:6.0,\nsegment_000.ts\n").unwrap();
        let token = CancellationToken::new();
        assert_eq!(wait_for_playlist(&path, config(), &token).await, Readiness::Ready);
    }
}
