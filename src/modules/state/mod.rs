//! Per-origin session cache.
//!
//! Holds the cookies and headers harvested from a solved browser challenge,
//! keyed by origin. Validity is derived from the creation timestamp and the
//! store TTL on every read; nothing is evicted in the background.

mod file;

pub use file::{SessionFile, SessionFileError, SingleOriginSession, StoredSession};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

/// Default lifetime of a harvested session.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(3600);

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| {
        let millis = duration.as_millis().min(i64::MAX as u128);
        chrono::Duration::milliseconds(millis as i64)
    })
}

/// Build the cache key for a URL (`scheme://host[:port]`, lowercase host).
///
/// Default ports are omitted so `https://example.com` and
/// `https://example.com:443/path` share a session.
pub fn origin_of(url: &Url) -> String {
    let host = url.host_str().unwrap_or("").to_ascii_lowercase();
    let mut origin = format!("{}://{}", url.scheme().to_ascii_lowercase(), host);
    if let Some(port) = url.port() {
        origin.push(':');
        origin.push_str(&port.to_string());
    }
    origin
}

/// Harvested challenge state for one origin.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub origin: String,
    pub cookies: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        origin: impl Into<String>,
        cookies: HashMap<String, String>,
        headers: HashMap<String, String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            origin: origin.into(),
            cookies,
            headers,
            created_at,
        }
    }

    /// Whether the session is still usable at `now` for the given TTL.
    pub fn is_valid_at(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.created_at <= chrono_duration(ttl)
    }
}

/// Read-only view of a stored session handed out to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub origin: String,
    pub cookies: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub valid: bool,
}

/// Origin -> session map with lazy TTL checks.
#[derive(Debug, Clone)]
pub struct SessionStore {
    sessions: HashMap<String, Session>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn set_ttl(&mut self, ttl: Duration) {
        self.ttl = ttl;
    }

    /// Overwrite the session for the URL's origin, stamped with the current time.
    pub fn update(
        &mut self,
        url: &Url,
        cookies: HashMap<String, String>,
        headers: HashMap<String, String>,
    ) {
        self.update_at(url, cookies, headers, Utc::now());
    }

    pub fn update_at(
        &mut self,
        url: &Url,
        cookies: HashMap<String, String>,
        headers: HashMap<String, String>,
        created_at: DateTime<Utc>,
    ) {
        let origin = origin_of(url);
        log::debug!(
            "session stored for {origin} ({} cookies, {} headers)",
            cookies.len(),
            headers.len()
        );
        self.sessions
            .insert(origin.clone(), Session::new(origin, cookies, headers, created_at));
    }

    /// Insert an already-built session under its own origin key.
    pub fn insert(&mut self, session: Session) {
        self.sessions.insert(session.origin.clone(), session);
    }

    pub fn session(&self, url: &Url) -> Option<&Session> {
        self.sessions.get(&origin_of(url))
    }

    /// Stored cookies regardless of TTL.
    pub fn cookies(&self, url: &Url) -> Option<&HashMap<String, String>> {
        self.session(url).map(|session| &session.cookies)
    }

    /// Stored headers regardless of TTL.
    pub fn headers(&self, url: &Url) -> Option<&HashMap<String, String>> {
        self.session(url).map(|session| &session.headers)
    }

    pub fn has_valid_session(&self, url: &Url) -> bool {
        self.has_valid_session_at(url, Utc::now())
    }

    pub fn has_valid_session_at(&self, url: &Url, now: DateTime<Utc>) -> bool {
        self.session(url)
            .is_some_and(|session| session.is_valid_at(now, self.ttl))
    }

    pub fn snapshot(&self, url: &Url) -> Option<SessionSnapshot> {
        let now = Utc::now();
        self.session(url).map(|session| SessionSnapshot {
            origin: session.origin.clone(),
            cookies: session.cookies.clone(),
            headers: session.headers.clone(),
            created_at: session.created_at,
            valid: session.is_valid_at(now, self.ttl),
        })
    }

    /// Remove one origin's session, or every session when `url` is `None`.
    pub fn clear(&mut self, url: Option<&Url>) {
        match url {
            Some(url) => {
                self.sessions.remove(&origin_of(url));
            }
            None => self.sessions.clear(),
        }
    }

    pub fn origins(&self) -> impl Iterator<Item = &str> + '_ {
        self.sessions.keys().map(String::as_str)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> + '_ {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    fn pairs(items: &[(&str, &str)]) -> HashMap<String, String> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn origin_ignores_path_and_default_port() {
        assert_eq!(
            origin_of(&url("https://Example.COM:443/a/b?c=d")),
            "https://example.com"
        );
        assert_eq!(
            origin_of(&url("http://example.com:8080/")),
            "http://example.com:8080"
        );
    }

    #[test]
    fn session_expires_after_ttl() {
        let mut store = SessionStore::new(Duration::from_secs(60));
        let target = url("https://example.com/page");
        let created = Utc::now();
        store.update_at(&target, pairs(&[("cf_clearance", "abc")]), HashMap::new(), created);

        assert!(store.has_valid_session_at(&target, created));
        assert!(store.has_valid_session_at(&target, created + chrono::Duration::seconds(60)));
        assert!(!store.has_valid_session_at(&target, created + chrono::Duration::seconds(61)));
        // expired sessions stay readable until cleared
        assert!(store.cookies(&target).is_some());
    }

    #[test]
    fn update_overwrites_previous_session() {
        let mut store = SessionStore::default();
        let target = url("https://example.com/");
        store.update(
            &target,
            pairs(&[("a", "1"), ("b", "2")]),
            pairs(&[("User-Agent", "old")]),
        );
        store.update(
            &target,
            pairs(&[("a", "3")]),
            pairs(&[("User-Agent", "new")]),
        );

        assert_eq!(store.cookies(&target), Some(&pairs(&[("a", "3")])));
        assert_eq!(store.headers(&target), Some(&pairs(&[("User-Agent", "new")])));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn clear_only_touches_one_origin() {
        let mut store = SessionStore::default();
        let first = url("https://one.example/");
        let second = url("https://two.example/");
        store.update(&first, pairs(&[("x", "1")]), HashMap::new());
        store.update(&second, pairs(&[("y", "2")]), HashMap::new());

        store.clear(Some(&first));
        assert!(!store.has_valid_session(&first));
        assert!(store.has_valid_session(&second));

        store.clear(None);
        assert!(store.is_empty());
    }

    #[test]
    fn missing_origin_reports_absent() {
        let store = SessionStore::default();
        let target = url("https://nowhere.example/");
        assert!(store.cookies(&target).is_none());
        assert!(store.headers(&target).is_none());
        assert!(!store.has_valid_session(&target));
    }
}
