//! On-disk outputs: file naming, discovery and HLS playlist readiness.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

/// Characters replaced when a media title becomes a file name.
const INVALID_TITLE_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Extensions considered playable outputs.
const ARTIFACT_EXTENSIONS: &[&str] = &["mp4", "m3u8"];

/// Make `title` safe to use as a file stem. Falls back to `fallback` when
/// nothing is left.
///
/// ```
/// use media_relay::artifacts::sanitize_title;
///
/// assert_eq!(sanitize_title("a/b: c?", "dl_1"), "a_b_ c_");
/// assert_eq!(sanitize_title("  ", "dl_1"), "dl_1");
/// ```
pub fn sanitize_title(title: &str, fallback: &str) -> String {
    let replaced: String = title
        .chars()
        .map(|c| {
            if c.is_control() || INVALID_TITLE_CHARS.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect();

    let trimmed = replaced.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

fn is_artifact(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| ARTIFACT_EXTENSIONS.iter().any(|a| e.eq_ignore_ascii_case(a)))
}

/// Most recently modified `.mp4` or `.m3u8` directly inside `dir`.
pub async fn newest_artifact(dir: &Path) -> std::io::Result<Option<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut newest: Option<(SystemTime, PathBuf)> = None;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !is_artifact(&path) {
            continue;
        }
        let metadata = match entry.metadata().await {
            Ok(m) if m.is_file() => m,
            _ => continue,
        };
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if newest.as_ref().is_none_or(|(t, _)| modified > *t) {
            newest = Some((modified, path));
        }
    }

    Ok(newest.map(|(_, path)| path))
}

/// A playlist can be handed to a player once it has a header and at least
/// one segment.
pub fn playlist_has_segments(content: &str) -> bool {
    let mut header = false;
    let mut segment = false;
    for line in content.lines().map(str::trim) {
        if line.starts_with("#EXTM3U") {
            header = true;
        } else if line.starts_with("#EXTINF:") || (!line.starts_with('#') && line.ends_with(".ts")) {
            segment = true;
        }
    }
    header && segment
}

/// Read `path` and check [`playlist_has_segments`]. Missing or unreadable
/// files are not ready.
pub async fn playlist_is_ready(path: &Path) -> bool {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => playlist_has_segments(&content),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Playlist not readable yet");
            false
        }
    }
}

/// URL under which the media server exposes `file_name`.
pub fn media_url(media_base_url: &str, file_name: &str) -> String {
    format!(
        "{}/videos/{}",
        media_base_url.trim_end_matches('/'),
        urlencoding::encode(file_name)
    )
}

/// File name component of `path`, lossily converted.
pub fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_sanitize_title() {
        assert_eq!(sanitize_title(r#"A/B\C:D*E?F"G<H>I|J"#, "x"), "A_B_C_D_E_F_G_H_I_J");
        assert_eq!(sanitize_title("  My Clip  ", "x"), "My Clip");
        assert_eq!(sanitize_title("观看一只青蛙?", "x"), "观看一只青蛙_");
        assert_eq!(sanitize_title("", "dl_1_abc"), "dl_1_abc");
    }

    #[test]
    fn test_playlist_readiness_rules() {
        assert!(!playlist_has_segments(""));
        assert!(!playlist_has_segments("#EXTM3U\n#EXT-X-VERSION:3\n"));
        assert!(playlist_has_segments("#EXTM3U\n#EXTINF:6.0,\nsegment_000.ts\n"));
        assert!(playlist_has_segments("#EXTM3U\nsegments/dl_1/segment_000.ts\n"));
        assert!(!playlist_has_segments("#EXTINF:6.0,\nsegment_000.ts\n"));
    }

    #[test]
    fn test_media_url() {
        assert_eq!(
            media_url("http://10.0.0.2:8080/", "My Clip.mp4"),
            "http://10.0.0.2:8080/videos/My%20Clip.mp4"
        );
        assert_eq!(
            media_url("http://host", "a&b.m3u8"),
            "http://host/videos/a%26b.m3u8"
        );
    }

    #[tokio::test]
    async fn test_newest_artifact() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(newest_artifact(dir.path()).await.unwrap(), None);

        let old = dir.path().join("old.mp4");
        std::fs::write(&old, b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("segments.mp4")).unwrap();

        let new = dir.path().join("new.m3u8");
        std::fs::write(&new, b"#EXTM3U").unwrap();
        let earlier = SystemTime::now() - Duration::from_secs(60);
        std::fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(earlier)
            .unwrap();

        assert_eq!(newest_artifact(dir.path()).await.unwrap(), Some(new));
    }

    #[tokio::test]
    async fn test_playlist_is_ready_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.m3u8");
        assert!(!playlist_is_ready(&path).await);

        std::fs::write(&path, "#EXTM3U\n#EXTINF:6.0,\nsegment_000.ts\n").unwrap();
        assert!(playlist_is_ready(&path).await);
    }
}
