//! On-disk record of an authenticated player session.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cookies::StoredCookie;
use crate::error::Result;

/// JSON layout of the session file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub url: String,
    pub authenticated: bool,
    /// RFC 3339 timestamp.
    pub last_activity: String,
    #[serde(default)]
    pub cookies: Vec<StoredCookie>,
}

/// Location of the persisted session record.
#[derive(Debug, Clone)]
pub struct SessionFile {
    path: PathBuf,
}

impl SessionFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored session, `None` when no file exists.
    pub async fn load(&self) -> Result<Option<StoredSession>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the record atomically (temp file + rename).
    pub async fn save(&self, session: &StoredSession) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_vec_pretty(session)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        info!(path = %self.path.display(), endpoint = %session.url, "Player session saved");
        Ok(())
    }

    pub async fn remove(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "Removed player session file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> StoredSession {
        StoredSession {
            url: "http://player.lan:8080".to_string(),
            authenticated: true,
            last_activity: "2026-03-01T10:00:00+00:00".to_string(),
            cookies: vec![StoredCookie {
                name: "sid".to_string(),
                value: "abc".to_string(),
                path: "/".to_string(),
                domain: String::new(),
            }],
        }
    }

    #[tokio::test]
    async fn test_save_load_remove() {
        let dir = TempDir::new().unwrap();
        let file = SessionFile::new(dir.path().join("cookie").join("cookie.json"));

        assert!(file.load().await.unwrap().is_none());

        file.save(&sample()).await.unwrap();
        assert_eq!(file.load().await.unwrap(), Some(sample()));

        file.remove().await.unwrap();
        assert!(file.load().await.unwrap().is_none());
        // removing twice is fine
        file.remove().await.unwrap();
    }

    #[test]
    fn test_json_field_names() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["url"], "http://player.lan:8080");
        assert_eq!(json["authenticated"], true);
        assert!(json["last_activity"].is_string());
        assert_eq!(json["cookies"][0]["name"], "sid");
        assert_eq!(json["cookies"][0]["domain"], "");
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cookie.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(SessionFile::new(path).load().await.is_err());
    }
}
