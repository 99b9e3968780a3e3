//! Registry of player sessions keyed by endpoint.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::error::{RemoteError, Result};
use crate::persist::SessionFile;
use crate::session::{RemoteSession, normalize_endpoint};

/// What happened to the persisted session during startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// No session file, or it recorded an unauthenticated session.
    NothingStored,
    /// The stored credentials passed the liveness probe.
    Restored { endpoint: String },
    /// The player rejected the stored credentials; the file was deleted.
    Rejected { endpoint: String },
    /// The player could not be reached; the file is kept for next time.
    Unreachable { endpoint: String, reason: String },
}

pub struct SessionRegistry {
    http: reqwest::Client,
    sessions: RwLock<HashMap<String, Arc<RemoteSession>>>,
    store: Option<SessionFile>,
}

impl SessionRegistry {
    pub fn new(http: reqwest::Client, store: Option<SessionFile>) -> Self {
        Self {
            http,
            sessions: RwLock::new(HashMap::new()),
            store,
        }
    }

    pub fn get(&self, endpoint: &str) -> Option<Arc<RemoteSession>> {
        let (_, key) = normalize_endpoint(endpoint).ok()?;
        self.sessions.read().get(&key).cloned()
    }

    /// Return the session for `endpoint`, creating an empty one if needed.
    pub fn get_or_create(&self, endpoint: &str) -> Result<Arc<RemoteSession>> {
        let (_, key) = normalize_endpoint(endpoint)?;
        if let Some(existing) = self.sessions.read().get(&key) {
            return Ok(existing.clone());
        }

        let mut sessions = self.sessions.write();
        let session = match sessions.get(&key) {
            Some(existing) => existing.clone(),
            None => {
                let created = Arc::new(RemoteSession::new(&key, self.http.clone())?);
                sessions.insert(key, created.clone());
                created
            }
        };
        Ok(session)
    }

    pub fn remove(&self, endpoint: &str) -> Option<Arc<RemoteSession>> {
        let (_, key) = normalize_endpoint(endpoint).ok()?;
        self.sessions.write().remove(&key)
    }

    /// Endpoints with a session, authenticated or not.
    pub fn endpoints(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.sessions.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// First authenticated session, if any.
    pub fn any_authenticated(&self) -> Option<Arc<RemoteSession>> {
        let sessions = self.sessions.read();
        let mut authenticated: Vec<&Arc<RemoteSession>> =
            sessions.values().filter(|s| s.is_authenticated()).collect();
        authenticated.sort_by(|a, b| b.last_activity().cmp(&a.last_activity()));
        authenticated.first().map(|s| (*s).clone())
    }

    /// Phase one of the login: fetch a challenge for `endpoint`.
    pub async fn begin_login(&self, endpoint: &str) -> Result<String> {
        let session = self.get_or_create(endpoint)?;
        session.request_challenge().await
    }

    /// Phase two: verify the on-screen code and persist the credentials.
    pub async fn complete_login(&self, endpoint: &str, code: &str) -> Result<Arc<RemoteSession>> {
        let session = self
            .get(endpoint)
            .ok_or_else(|| RemoteError::SessionNotFound(endpoint.to_string()))?;
        session.verify(code).await?;

        if let Some(store) = &self.store {
            if let Err(e) = store.save(&session.to_stored()).await {
                warn!(endpoint = %session.endpoint(), error = %e, "Failed to persist player session");
            }
        }
        Ok(session)
    }

    /// Drop the session for `endpoint` and forget its persisted credentials.
    pub async fn invalidate(&self, endpoint: &str) -> Result<()> {
        let removed = self.remove(endpoint);
        if let (Some(session), Some(store)) = (removed, &self.store) {
            match store.load().await {
                Ok(Some(stored)) if stored.url.trim_end_matches('/') == session.endpoint() => {
                    store.remove().await?;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Unreadable player session file, discarding");
                    store.remove().await?;
                }
            }
        }
        Ok(())
    }

    /// Load the persisted session as a candidate and only promote it into the
    /// registry once the player confirms it with a liveness probe.
    pub async fn restore(&self) -> Result<RestoreOutcome> {
        let Some(store) = &self.store else {
            return Ok(RestoreOutcome::NothingStored);
        };
        let stored = match store.load().await {
            Ok(Some(stored)) if stored.authenticated => stored,
            Ok(_) => return Ok(RestoreOutcome::NothingStored),
            Err(e) => {
                warn!(error = %e, "Unreadable player session file, discarding");
                store.remove().await?;
                return Ok(RestoreOutcome::NothingStored);
            }
        };

        let candidate = RemoteSession::from_stored(&stored, self.http.clone())?;
        let endpoint = candidate.endpoint().to_string();

        match candidate.probe().await {
            Ok(true) => {
                info!(endpoint = %endpoint, "Restored player session from disk");
                self.sessions
                    .write()
                    .insert(endpoint.clone(), Arc::new(candidate));
                Ok(RestoreOutcome::Restored { endpoint })
            }
            Ok(false) => {
                warn!(endpoint = %endpoint, "Stored player session was rejected");
                store.remove().await?;
                Ok(RestoreOutcome::Rejected { endpoint })
            }
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "Could not verify stored player session");
                Ok(RestoreOutcome::Unreachable {
                    endpoint,
                    reason: e.to_string(),
                })
            }
        }
    }
}
