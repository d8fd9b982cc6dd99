//! Reqwest-backed [`TransportEngine`].
//!
//! Cookies and headers live in plain maps owned by the engine rather than in
//! reqwest's cookie store, so harvested browser state can be injected and
//! inspected directly. `Set-Cookie` replies refresh the map.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use http::header::{COOKIE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Proxy, redirect::Policy};

use super::{RequestOptions, TransportEngine, TransportError, TransportResponse, merge_header};
use crate::challenges::core::ChallengeResponse;
use crate::challenges::detectors::ChallengeDetector;
use crate::config::CloudBridgeConfig;
use crate::modules::spoofing::{BrowserFingerprint, FingerprintProvider, baseline_headers};
use crate::modules::tls::TlsParameters;

const MAX_REDIRECTS: usize = 10;

/// Transport built on `reqwest::Client`.
pub struct ReqwestTransport {
    proxy: Option<String>,
    timeout: Duration,
    fingerprint: BrowserFingerprint,
    cookies: HashMap<String, String>,
    headers: HashMap<String, String>,
    detector: ChallengeDetector,
    following: Option<Client>,
    manual: Option<Client>,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, TransportError> {
        Self::from_config(&CloudBridgeConfig::default())
    }

    pub fn from_config(config: &CloudBridgeConfig) -> Result<Self, TransportError> {
        let fingerprint = FingerprintProvider::new().fingerprint(config.fingerprint.as_deref());
        let mut transport = Self {
            proxy: config.proxy.clone(),
            timeout: config.timeout(),
            headers: baseline_headers(&fingerprint.user_agent),
            fingerprint,
            cookies: HashMap::new(),
            detector: ChallengeDetector::new(),
            following: None,
            manual: None,
        };
        // Surface a bad proxy at construction rather than on first use.
        transport.client(true)?;
        Ok(transport)
    }

    pub fn cookies(&self) -> &HashMap<String, String> {
        &self.cookies
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn fingerprint(&self) -> &BrowserFingerprint {
        &self.fingerprint
    }

    /// TLS parameters of the impersonated browser. Reported only; reqwest
    /// negotiates with its own TLS stack.
    pub fn tls_parameters(&self) -> &TlsParameters {
        &self.fingerprint.tls
    }

    fn build_client(&self, follow_redirects: bool) -> Result<Client, TransportError> {
        let policy = if follow_redirects {
            Policy::limited(MAX_REDIRECTS)
        } else {
            Policy::none()
        };
        let mut builder = Client::builder()
            .timeout(self.timeout)
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .redirect(policy);
        if let Some(proxy) = &self.proxy {
            let proxy = Proxy::all(proxy).map_err(|err| TransportError::Build(err.to_string()))?;
            builder = builder.proxy(proxy);
        }
        builder
            .build()
            .map_err(|err| TransportError::Build(err.to_string()))
    }

    /// Client for the given redirect policy, built on first use.
    fn client(&mut self, follow_redirects: bool) -> Result<Client, TransportError> {
        let slot = if follow_redirects {
            &self.following
        } else {
            &self.manual
        };
        if let Some(client) = slot {
            return Ok(client.clone());
        }
        let client = self.build_client(follow_redirects)?;
        if follow_redirects {
            self.following = Some(client.clone());
        } else {
            self.manual = Some(client.clone());
        }
        Ok(client)
    }

    fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        let ordered: BTreeMap<_, _> = self.cookies.iter().collect();
        Some(
            ordered
                .into_iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    fn request_headers(&self, request: &RequestOptions) -> Result<HeaderMap, TransportError> {
        let mut merged = self.headers.clone();
        for (name, value) in &request.headers {
            merge_header(&mut merged, name, value);
        }

        let mut map = HeaderMap::new();
        for (name, value) in &merged {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| TransportError::InvalidHeader(name.clone()))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|_| TransportError::InvalidHeader(name.clone()))?;
            map.insert(header_name, header_value);
        }

        let explicit_cookie = merged.keys().any(|name| name.eq_ignore_ascii_case("cookie"));
        if !explicit_cookie && let Some(cookie) = self.cookie_header() {
            let value = HeaderValue::from_str(&cookie)
                .map_err(|_| TransportError::InvalidHeader("Cookie".into()))?;
            map.insert(COOKIE, value);
        }
        Ok(map)
    }
}

#[async_trait]
impl TransportEngine for ReqwestTransport {
    fn apply_cookies(&mut self, cookies: &HashMap<String, String>) {
        for (name, value) in cookies {
            self.cookies.insert(name.clone(), value.clone());
        }
    }

    fn apply_headers(&mut self, headers: &HashMap<String, String>) {
        for (name, value) in headers {
            merge_header(&mut self.headers, name, value);
        }
    }

    async fn execute(&mut self, request: &RequestOptions) -> Result<TransportResponse, TransportError> {
        let client = self.client(request.follow_redirects)?;
        let headers = self.request_headers(request)?;

        let mut builder = client
            .request(request.method.clone(), request.url.clone())
            .headers(headers);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(json) = &request.json {
            builder = builder.json(json);
        } else if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let url = response.url().clone();
        let headers = response.headers().clone();
        let cookies: HashMap<String, String> = response
            .cookies()
            .map(|cookie| (cookie.name().to_string(), cookie.value().to_string()))
            .collect();
        let body = response.bytes().await?;

        for (name, value) in &cookies {
            self.cookies.insert(name.clone(), value.clone());
        }

        let text = String::from_utf8_lossy(&body);
        let view = ChallengeResponse {
            url: &url,
            status,
            headers: &headers,
            body: &text,
            request_method: &request.method,
        };
        if let Some(detection) = self.detector.detect(&view) {
            return Err(TransportError::ChallengeDetected {
                url: url.to_string(),
                status,
                challenge: detection.challenge_type.as_str().to_string(),
            });
        }

        Ok(TransportResponse {
            status,
            headers,
            cookies,
            body,
            url,
        })
    }

    async fn close(&mut self) {
        self.following = None;
        self.manual = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_sorted_cookie_header() {
        let mut transport = ReqwestTransport::new().unwrap();
        transport.apply_cookies(&HashMap::from([
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "1".to_string()),
        ]));
        assert_eq!(transport.cookie_header().as_deref(), Some("a=1; b=2"));
    }

    #[test]
    fn baseline_headers_are_preloaded() {
        let transport = ReqwestTransport::new().unwrap();
        assert_eq!(
            transport.headers().get("User-Agent"),
            Some(&transport.fingerprint().user_agent)
        );
    }

    #[test]
    fn rejects_unusable_proxy() {
        let config = CloudBridgeConfig {
            proxy: Some("::not a proxy::".into()),
            ..CloudBridgeConfig::default()
        };
        assert!(matches!(
            ReqwestTransport::from_config(&config),
            Err(TransportError::Build(_))
        ));
    }
}
