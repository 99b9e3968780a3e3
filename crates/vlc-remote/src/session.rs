//! Per-endpoint HTTP session with the player.
//!
//! A [`RemoteSession`] tracks the pending challenge, whether the code
//! verification succeeded, the cookies the player handed out and the time of
//! the last successful exchange. All authentication traffic for one endpoint
//! (challenge, verification, ticket requests) is serialized through a single
//! async lock so two logins or a login and a ticket renewal never interleave.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::StatusCode;
use reqwest::header::COOKIE;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::challenge_digest;
use crate::cookies::CookieSet;
use crate::error::{RemoteError, Result};
use crate::persist::StoredSession;
use crate::ticket::TicketSource;

/// Parse and normalize a player base URL.
///
/// Only `http` and `https` are accepted. The returned key has no trailing
/// slash and is used to index sessions.
pub fn normalize_endpoint(raw: &str) -> Result<(Url, String)> {
    let url = Url::parse(raw.trim()).map_err(|e| RemoteError::InvalidUrl(format!("{raw}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(RemoteError::InvalidUrl(format!(
            "{raw}: unsupported scheme {}",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(RemoteError::InvalidUrl(format!("{raw}: missing host")));
    }
    let key = url.as_str().trim_end_matches('/').to_string();
    Ok((url, key))
}

#[derive(Debug, Default)]
struct SessionState {
    challenge: Option<String>,
    authenticated: bool,
    last_activity: Option<DateTime<Utc>>,
    cookies: CookieSet,
}

pub struct RemoteSession {
    endpoint: Url,
    base: String,
    http: reqwest::Client,
    state: RwLock<SessionState>,
    auth_lock: Mutex<()>,
}

impl std::fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession")
            .field("endpoint", &self.base)
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}

impl RemoteSession {
    pub fn new(endpoint: &str, http: reqwest::Client) -> Result<Self> {
        let (endpoint, base) = normalize_endpoint(endpoint)?;
        Ok(Self {
            endpoint,
            base,
            http,
            state: RwLock::new(SessionState::default()),
            auth_lock: Mutex::new(()),
        })
    }

    /// Rebuild a session from persisted credentials.
    ///
    /// The result is only a candidate: it keeps the stored authenticated flag
    /// but must pass [`RemoteSession::probe`] before being trusted.
    pub fn from_stored(stored: &StoredSession, http: reqwest::Client) -> Result<Self> {
        let session = Self::new(&stored.url, http)?;
        {
            let mut state = session.state.write();
            state.authenticated = stored.authenticated;
            state.last_activity = DateTime::parse_from_rfc3339(&stored.last_activity)
                .ok()
                .map(|t| t.with_timezone(&Utc));
            state.cookies = CookieSet::from_stored(stored.cookies.clone());
        }
        Ok(session)
    }

    /// Normalized endpoint key, without trailing slash.
    pub fn endpoint(&self) -> &str {
        &self.base
    }

    pub fn url(&self) -> &Url {
        &self.endpoint
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.read().authenticated
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.state.read().last_activity
    }

    pub fn cookie_header(&self) -> Option<String> {
        self.state.read().cookies.header_value()
    }

    /// Snapshot suitable for writing to the session file.
    pub fn to_stored(&self) -> StoredSession {
        let state = self.state.read();
        StoredSession {
            url: self.base.clone(),
            authenticated: state.authenticated,
            last_activity: state
                .last_activity
                .unwrap_or_else(Utc::now)
                .to_rfc3339(),
            cookies: state.cookies.to_stored(),
        }
    }

    fn path(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn with_cookies(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.cookie_header() {
            Some(cookies) => builder.header(COOKIE, cookies),
            None => builder,
        }
    }

    fn record_response(&self, response: &reqwest::Response) {
        self.state.write().cookies.absorb(response.headers());
    }

    fn touch(&self) {
        self.state.write().last_activity = Some(Utc::now());
    }

    fn mark_unauthenticated(&self) {
        let mut state = self.state.write();
        if state.authenticated {
            warn!(endpoint = %self.base, "Player session is no longer authenticated");
        }
        state.authenticated = false;
    }

    /// Ask the player for a fresh challenge (`POST /code`).
    pub async fn request_challenge(&self) -> Result<String> {
        let _guard = self.auth_lock.lock().await;

        debug!(endpoint = %self.base, "Requesting challenge");
        let response = self
            .with_cookies(self.http.post(self.path("/code")))
            .form(&[("challenge", "")])
            .send()
            .await?;
        self.record_response(&response);

        let status = response.status();
        let body = response.text().await?;
        if status != StatusCode::OK {
            return Err(RemoteError::unexpected_status(status.as_u16(), body));
        }

        self.state.write().challenge = Some(body.clone());
        info!(endpoint = %self.base, "Challenge received");
        Ok(body)
    }

    /// Prove possession of the on-screen `code` (`POST /verify-code`).
    pub async fn verify(&self, code: &str) -> Result<()> {
        let _guard = self.auth_lock.lock().await;

        let challenge = self
            .state
            .read()
            .challenge
            .clone()
            .ok_or_else(|| RemoteError::MissingChallenge(self.base.clone()))?;
        let digest = challenge_digest(code, &challenge);

        let response = self
            .with_cookies(self.http.post(self.path("/verify-code")))
            .form(&[("code", digest.as_str())])
            .send()
            .await?;
        self.record_response(&response);

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            warn!(endpoint = %self.base, status = status.as_u16(), "Code verification rejected");
            return Err(RemoteError::VerificationFailed {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }

        {
            let mut state = self.state.write();
            state.authenticated = true;
            state.challenge = None;
            state.last_activity = Some(Utc::now());
        }
        info!(endpoint = %self.base, "Player authentication succeeded");
        Ok(())
    }

    /// Request a short-lived duplex ticket (`GET /wsticket`).
    ///
    /// A 401 marks the session unauthenticated.
    pub async fn request_ticket(&self) -> Result<String> {
        let _guard = self.auth_lock.lock().await;

        let response = self
            .with_cookies(self.http.get(self.path("/wsticket")))
            .send()
            .await?;
        self.record_response(&response);

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            self.mark_unauthenticated();
            return Err(RemoteError::Unauthorized);
        }
        let body = response.text().await?;
        if status != StatusCode::OK {
            return Err(RemoteError::unexpected_status(status.as_u16(), body));
        }

        let ticket = body
            .split_whitespace()
            .next()
            .ok_or(RemoteError::EmptyTicket)?
            .to_string();
        self.touch();
        debug!(endpoint = %self.base, ticket_len = ticket.len(), "Received ticket");
        Ok(ticket)
    }

    /// Cheap liveness check of the stored credentials.
    ///
    /// Returns `Ok(false)` when the player answers 401.
    pub async fn probe(&self) -> Result<bool> {
        match self.request_ticket().await {
            Ok(_) => {
                self.state.write().authenticated = true;
                Ok(true)
            }
            Err(RemoteError::Unauthorized) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Ask the player to open `locator` (`GET /play`).
    pub async fn play(&self, locator: &str) -> Result<()> {
        if !self.is_authenticated() {
            return Err(RemoteError::NotAuthenticated);
        }

        let response = self
            .with_cookies(self.http.get(self.path("/play")))
            .query(&[("id", "-1"), ("path", locator), ("type", "stream")])
            .send()
            .await?;
        self.record_response(&response);

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            self.mark_unauthenticated();
            return Err(RemoteError::Unauthorized);
        }
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::unexpected_status(status.as_u16(), body));
        }

        self.touch();
        info!(endpoint = %self.base, locator = %locator, "Playback requested");
        Ok(())
    }
}

#[async_trait]
impl TicketSource for RemoteSession {
    async fn fetch_ticket(&self) -> Result<String> {
        self.request_ticket().await
    }
}
