//! Fast request path used once a challenge has been solved.
//!
//! A [`TransportEngine`] keeps a persistent cookie and header context that the
//! bridge fills with harvested browser state, and performs arbitrary HTTP
//! calls with it.

mod reqwest_transport;

pub use reqwest_transport::ReqwestTransport;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to build http client: {0}")]
    Build(String),
    #[error("invalid header '{0}'")]
    InvalidHeader(String),
    /// The response was a Cloudflare challenge page.
    #[error("cloudflare challenge detected at {url} (status {status}, {challenge})")]
    ChallengeDetected {
        url: String,
        status: u16,
        challenge: String,
    },
}

/// One HTTP call.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub url: Url,
    pub query: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub json: Option<Value>,
    pub headers: HashMap<String, String>,
    pub timeout: Option<Duration>,
    pub follow_redirects: bool,
}

impl RequestOptions {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            query: Vec::new(),
            body: None,
            json: None,
            headers: HashMap::new(),
            timeout: None,
            follow_redirects: true,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_query<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_json(mut self, json: Value) -> Self {
        self.json = Some(json);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }
}

/// Normalized response.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub cookies: HashMap<String, String>,
    pub body: Bytes,
    pub url: Url,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Contract for the request-performing engine.
#[async_trait]
pub trait TransportEngine: Send {
    /// Set or replace cookies by name.
    fn apply_cookies(&mut self, cookies: &HashMap<String, String>);

    /// Merge headers; the last write wins per header name.
    fn apply_headers(&mut self, headers: &HashMap<String, String>);

    async fn execute(&mut self, request: &RequestOptions) -> Result<TransportResponse, TransportError>;

    /// Release connection resources. Safe to call repeatedly.
    async fn close(&mut self);
}

/// Insert a header, replacing any existing entry with the same name in any case.
pub(crate) fn merge_header(headers: &mut HashMap<String, String>, name: &str, value: &str) {
    headers.retain(|existing, _| !existing.eq_ignore_ascii_case(name));
    headers.insert(name.to_string(), value.to_string());
}
