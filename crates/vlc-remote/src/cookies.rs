//! Minimal cookie bookkeeping for a single player endpoint.
//!
//! The player only ever sets a handful of session cookies, and they have to
//! be persisted with their path and domain, so they are tracked by hand
//! instead of through an opaque jar.

use reqwest::header::{HeaderMap, SET_COOKIE};
use serde::{Deserialize, Serialize};

/// One cookie as persisted in the session file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub domain: String,
}

/// Parse a single `Set-Cookie` header value.
///
/// Returns the cookie and whether it asks for removal (`Max-Age=0` or an
/// empty value).
fn parse_set_cookie(raw: &str) -> Option<(StoredCookie, bool)> {
    let mut parts = raw.split(';');
    let (name, value) = parts.next()?.trim().split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let mut cookie = StoredCookie {
        name: name.to_string(),
        value: value.trim().trim_matches('"').to_string(),
        path: String::new(),
        domain: String::new(),
    };
    let mut expired = cookie.value.is_empty();

    for attr in parts {
        let (key, val) = match attr.trim().split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => (attr.trim(), ""),
        };
        if key.eq_ignore_ascii_case("path") {
            cookie.path = val.to_string();
        } else if key.eq_ignore_ascii_case("domain") {
            cookie.domain = val.trim_start_matches('.').to_string();
        } else if key.eq_ignore_ascii_case("max-age") && val.parse::<i64>().is_ok_and(|v| v <= 0)
        {
            expired = true;
        }
    }

    Some((cookie, expired))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieSet {
    cookies: Vec<StoredCookie>,
}

impl CookieSet {
    pub fn from_stored(cookies: Vec<StoredCookie>) -> Self {
        let mut set = Self::default();
        for cookie in cookies {
            set.upsert(cookie);
        }
        set
    }

    /// Apply every `Set-Cookie` header of a response.
    pub fn absorb(&mut self, headers: &HeaderMap) {
        for value in headers.get_all(SET_COOKIE) {
            let Ok(raw) = value.to_str() else {
                continue;
            };
            if let Some((cookie, expired)) = parse_set_cookie(raw) {
                if expired {
                    self.cookies.retain(|c| c.name != cookie.name);
                } else {
                    self.upsert(cookie);
                }
            }
        }
    }

    fn upsert(&mut self, cookie: StoredCookie) {
        match self.cookies.iter_mut().find(|c| c.name == cookie.name) {
            Some(existing) => *existing = cookie,
            None => self.cookies.push(cookie),
        }
    }

    /// Value for an outgoing `Cookie` header, if any cookie is known.
    pub fn header_value(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn to_stored(&self) -> Vec<StoredCookie> {
        self.cookies.clone()
    }
}
