//! JSON persistence for harvested sessions.
//!
//! Two layouts are understood:
//! - single origin: `{"cookies": {..}, "headers": {..}, "timestamp": 1.0, "url": ".."}`
//! - multi origin: `{"<host>": {"cookies": {..}, "headers": {..}, "timestamp": 1.0}, ..}`
//!
//! A document with both `cookies` and `url` at the top level is read as the
//! single-origin layout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use super::{Session, SessionStore, origin_of};

#[derive(Debug, Error)]
pub enum SessionFileError {
    #[error("failed to access session file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid session json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid session file: {0}")]
    InvalidFormat(String),
    #[error("no session stored for {0}")]
    MissingSession(String),
}

/// Session entry as written in the multi-origin layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    #[serde(default)]
    pub cookies: HashMap<String, String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub timestamp: f64,
}

/// Session entry as written in the single-origin layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleOriginSession {
    #[serde(default)]
    pub cookies: HashMap<String, String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub timestamp: f64,
    pub url: String,
}

/// Either persisted layout.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionFile {
    Single(SingleOriginSession),
    Multi(BTreeMap<String, StoredSession>),
}

fn to_timestamp(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

fn from_timestamp(seconds: f64) -> Result<DateTime<Utc>, SessionFileError> {
    if !seconds.is_finite() {
        return Err(SessionFileError::InvalidFormat(format!(
            "timestamp {seconds} is not a finite number"
        )));
    }
    DateTime::from_timestamp_millis((seconds * 1000.0).round() as i64).ok_or_else(|| {
        SessionFileError::InvalidFormat(format!("timestamp {seconds} is out of range"))
    })
}

/// Multi-origin key for an origin: https origins are written as a bare
/// `host[:port]`, other schemes keep their full origin.
fn origin_key(origin: &str) -> String {
    origin.strip_prefix("https://").unwrap_or(origin).to_string()
}

/// Multi-origin keys are usually bare hosts (read as `https://`); full
/// origins are accepted too.
fn origin_key_url(key: &str) -> Result<Url, SessionFileError> {
    let raw = if key.contains("://") {
        key.to_string()
    } else {
        format!("https://{key}")
    };
    Url::parse(&raw)
        .map_err(|err| SessionFileError::InvalidFormat(format!("origin '{key}': {err}")))
}

impl SessionFile {
    pub fn from_json_str(contents: &str) -> Result<Self, SessionFileError> {
        let value: Value = serde_json::from_str(contents)?;
        let object = value.as_object().ok_or_else(|| {
            SessionFileError::InvalidFormat("top-level value must be an object".into())
        })?;

        if object.contains_key("cookies") && object.contains_key("url") {
            Ok(SessionFile::Single(serde_json::from_value(value)?))
        } else {
            Ok(SessionFile::Multi(serde_json::from_value(value)?))
        }
    }

    pub fn to_json_string(&self) -> Result<String, SessionFileError> {
        let json = match self {
            SessionFile::Single(single) => serde_json::to_string_pretty(single)?,
            SessionFile::Multi(multi) => serde_json::to_string_pretty(multi)?,
        };
        Ok(json)
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self, SessionFileError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| SessionFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), SessionFileError> {
        let path = path.as_ref();
        let json = self.to_json_string()?;
        fs::write(path, json).map_err(|source| SessionFileError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Rebuild sessions, each paired with a URL for its origin.
    pub fn into_sessions(self) -> Result<Vec<(Url, Session)>, SessionFileError> {
        match self {
            SessionFile::Single(single) => {
                let url = Url::parse(&single.url).map_err(|err| {
                    SessionFileError::InvalidFormat(format!("url '{}': {err}", single.url))
                })?;
                let session = Session::new(
                    origin_of(&url),
                    single.cookies,
                    single.headers,
                    from_timestamp(single.timestamp)?,
                );
                Ok(vec![(url, session)])
            }
            SessionFile::Multi(multi) => multi
                .into_iter()
                .map(|(key, stored)| {
                    let url = origin_key_url(&key)?;
                    let session = Session::new(
                        origin_of(&url),
                        stored.cookies,
                        stored.headers,
                        from_timestamp(stored.timestamp)?,
                    );
                    Ok((url, session))
                })
                .collect(),
        }
    }
}

impl SessionStore {
    /// Single-origin document for the URL's origin.
    pub fn export_origin(&self, url: &Url) -> Option<SessionFile> {
        self.session(url).map(|session| {
            SessionFile::Single(SingleOriginSession {
                cookies: session.cookies.clone(),
                headers: session.headers.clone(),
                timestamp: to_timestamp(session.created_at),
                url: url.as_str().to_string(),
            })
        })
    }

    /// Multi-origin document with every stored session.
    pub fn export_all(&self) -> SessionFile {
        let entries = self
            .sessions()
            .map(|session| {
                (
                    origin_key(&session.origin),
                    StoredSession {
                        cookies: session.cookies.clone(),
                        headers: session.headers.clone(),
                        timestamp: to_timestamp(session.created_at),
                    },
                )
            })
            .collect();
        SessionFile::Multi(entries)
    }

    /// Merge a persisted document into the store, returning the origins loaded.
    pub fn import(&mut self, file: SessionFile) -> Result<Vec<Url>, SessionFileError> {
        let sessions = file.into_sessions()?;
        let mut urls = Vec::with_capacity(sessions.len());
        for (url, session) in sessions {
            self.insert(session);
            urls.push(url);
        }
        Ok(urls)
    }

    /// Persist one origin (when `url` is given) or every session.
    pub fn save(&self, path: impl AsRef<Path>, url: Option<&Url>) -> Result<(), SessionFileError> {
        let file = match url {
            Some(url) => self
                .export_origin(url)
                .ok_or_else(|| SessionFileError::MissingSession(origin_of(url)))?,
            None => self.export_all(),
        };
        file.write(path)
    }

    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<Vec<Url>, SessionFileError> {
        let file = SessionFile::read(path)?;
        self.import(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_single_origin_layout() {
        let json = r#"{
            "cookies": {"cf_clearance": "abc"},
            "headers": {"User-Agent": "ua"},
            "timestamp": 1700000000.5,
            "url": "https://example.com/page"
        }"#;
        let file = SessionFile::from_json_str(json).unwrap();
        assert!(matches!(file, SessionFile::Single(_)));

        let sessions = file.into_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].1.origin, "https://example.com");
        assert_eq!(sessions[0].1.created_at.timestamp_millis(), 1_700_000_000_500);
    }

    #[test]
    fn multi_origin_bare_hosts_get_https() {
        let json = r#"{
            "example.com": {"cookies": {"a": "1"}, "headers": {}, "timestamp": 1700000000.0},
            "http://other.example:8080": {"cookies": {}, "headers": {"X": "y"}, "timestamp": 1700000000.0}
        }"#;
        let file = SessionFile::from_json_str(json).unwrap();
        let origins: Vec<_> = file
            .into_sessions()
            .unwrap()
            .into_iter()
            .map(|(_, session)| session.origin)
            .collect();
        assert!(origins.contains(&"https://example.com".to_string()));
        assert!(origins.contains(&"http://other.example:8080".to_string()));
    }

    #[test]
    fn multi_origin_export_uses_bare_https_hosts() {
        let mut store = SessionStore::default();
        for raw in [
            "https://example.com/a",
            "https://secure.example:8443/",
            "http://plain.example/",
        ] {
            let url = Url::parse(raw).unwrap();
            store.update(&url, HashMap::new(), HashMap::new());
        }

        let SessionFile::Multi(entries) = store.export_all() else {
            panic!("expected multi-origin layout");
        };
        let keys: Vec<_> = entries.keys().map(String::as_str).collect();
        assert_eq!(keys, ["example.com", "http://plain.example", "secure.example:8443"]);

        let origins: Vec<_> = SessionFile::Multi(entries)
            .into_sessions()
            .unwrap()
            .into_iter()
            .map(|(_, session)| session.origin)
            .collect();
        assert!(origins.contains(&"https://example.com".to_string()));
        assert!(origins.contains(&"https://secure.example:8443".to_string()));
        assert!(origins.contains(&"http://plain.example".to_string()));
    }

    #[test]
    fn rejects_non_object_documents() {
        let err = SessionFile::from_json_str("[1, 2]").unwrap_err();
        assert!(matches!(err, SessionFileError::InvalidFormat(_)));
    }

    #[test]
    fn saving_unknown_origin_fails() {
        let store = SessionStore::default();
        let dir = std::env::temp_dir().join("cloudbridge-missing-origin.json");
        let url = Url::parse("https://missing.example/").unwrap();
        let err = store.save(&dir, Some(&url)).unwrap_err();
        assert!(matches!(err, SessionFileError::MissingSession(_)));
    }
}
