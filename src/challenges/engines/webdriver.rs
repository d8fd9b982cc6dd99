//! W3C WebDriver engine.
//!
//! Talks to an existing WebDriver endpoint, or spawns `chromedriver` on a
//! free port when none is configured. Sessions are created on first
//! navigation and deleted on close.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time::sleep;
use url::Url;

use super::browser::{BrowserLocator, BrowserOptions, chrome_args, fingerprint_script, free_port};
use super::{ChallengeEngine, EngineKind};
use crate::challenges::core::{
    ChallengeEngineError, MarkerScan, PageProbe, PollSettings, poll_challenge, probe_expression,
};
use crate::config::CloudBridgeConfig;
use crate::modules::spoofing::{BrowserFingerprint, FingerprintProvider, baseline_headers};

const DEFAULT_DRIVER_BINARY: &str = "chromedriver";
const DRIVER_ATTEMPTS: usize = 40;
const DRIVER_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
enum WebDriverError {
    /// The endpoint answered with a W3C error object.
    #[error("webdriver {error}: {message}")]
    Command { error: String, message: String },
    #[error("webdriver transport error: {0}")]
    Transport(String),
}

impl From<WebDriverError> for ChallengeEngineError {
    fn from(err: WebDriverError) -> Self {
        let message = err.to_string();
        ChallengeEngineError::automation_caused_by(message, err)
    }
}

/// Minimal W3C WebDriver client bound to one endpoint.
#[derive(Debug, Clone)]
struct WireClient {
    http: Client,
    base: Url,
    verbose: bool,
}

impl WireClient {
    fn new(base: Url, command_timeout: Duration, verbose: bool) -> Result<Self, WebDriverError> {
        let http = Client::builder()
            .timeout(command_timeout)
            .build()
            .map_err(|err| WebDriverError::Transport(err.to_string()))?;
        Ok(Self {
            http,
            base,
            verbose,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, WebDriverError> {
        let base = self.base.as_str().trim_end_matches('/');
        Url::parse(&format!("{base}/{path}")).map_err(|err| WebDriverError::Transport(err.to_string()))
    }

    /// Issue one command and unwrap the `value` member of the reply.
    async fn command(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, WebDriverError> {
        let url = self.endpoint(path)?;
        if self.verbose {
            log::debug!("webdriver -> {method} {path}");
        }
        let mut request = self.http.request(method, url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .map_err(|err| WebDriverError::Transport(err.to_string()))?;
        let payload: Value = response
            .json()
            .await
            .map_err(|err| WebDriverError::Transport(err.to_string()))?;
        let value = payload.get("value").cloned().unwrap_or(Value::Null);

        if let Some(error) = value.get("error").and_then(Value::as_str) {
            return Err(WebDriverError::Command {
                error: error.to_string(),
                message: value
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            });
        }
        Ok(value)
    }

    async fn is_ready(&self) -> bool {
        matches!(
            self.command(Method::GET, "status", None).await,
            Ok(value) if value.get("ready").and_then(Value::as_bool).unwrap_or(false)
        )
    }
}

struct WebDriverSession {
    client: WireClient,
    id: String,
    driver: Option<Child>,
}

impl WebDriverSession {
    fn path(&self, suffix: &str) -> String {
        format!("session/{}/{suffix}", self.id)
    }

    async fn execute(&self, script: &str) -> Result<Value, WebDriverError> {
        self.client
            .command(
                Method::POST,
                &self.path("execute/sync"),
                Some(json!({ "script": script, "args": [] })),
            )
            .await
    }

    async fn shutdown(mut self) {
        let path = format!("session/{}", self.id);
        if let Err(err) = self.client.command(Method::DELETE, &path, None).await {
            log::debug!("failed to delete webdriver session: {err}");
        }
        if let Some(mut driver) = self.driver.take() {
            let _ = driver.kill().await;
        }
    }
}

#[async_trait]
impl PageProbe for WebDriverSession {
    async fn scan(&mut self) -> Result<MarkerScan, ChallengeEngineError> {
        let script = format!("return {};", probe_expression());
        match self.execute(&script).await {
            Ok(Value::String(raw)) => Ok(MarkerScan::from_probe_json(&raw).unwrap_or_else(|err| {
                log::debug!("unreadable marker probe output: {err}");
                MarkerScan::unavailable()
            })),
            Ok(_) => Ok(MarkerScan::unavailable()),
            Err(err @ WebDriverError::Command { .. }) => {
                log::debug!("marker probe unavailable: {err}");
                Ok(MarkerScan::unavailable())
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Challenge engine driving Chromium through WebDriver.
pub struct WebDriverEngine {
    endpoint: Option<Url>,
    driver_binary: PathBuf,
    browser_binary: Option<PathBuf>,
    options: BrowserOptions,
    fingerprint: Option<BrowserFingerprint>,
    fallback_user_agent: String,
    poll: PollSettings,
    command_timeout: Duration,
    verbose: bool,
    session: Option<WebDriverSession>,
}

impl WebDriverEngine {
    pub fn from_config(config: &CloudBridgeConfig) -> Self {
        let provider = FingerprintProvider::new();
        let fingerprint = config
            .fingerprint
            .as_deref()
            .map(|identifier| provider.fingerprint(Some(identifier)));
        let fallback_user_agent = fingerprint
            .as_ref()
            .map(|fp| fp.user_agent.clone())
            .unwrap_or_else(|| provider.user_agent(None));

        let options = BrowserOptions {
            headless: config.headless,
            proxy: config.proxy.clone(),
            window_size: fingerprint.as_ref().map(|fp| fp.screen_resolution),
            user_agent: fingerprint.as_ref().map(|fp| fp.user_agent.clone()),
        };

        Self {
            endpoint: config
                .webdriver_url
                .as_deref()
                .and_then(|raw| Url::parse(raw).ok()),
            driver_binary: PathBuf::from(DEFAULT_DRIVER_BINARY),
            browser_binary: BrowserLocator::new(config.chrome_path.clone()).resolve(),
            options,
            fingerprint,
            fallback_user_agent,
            poll: config.poll_settings(),
            command_timeout: config.timeout(),
            verbose: config.debug,
            session: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: Url) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn with_driver_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.driver_binary = binary.into();
        self
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    fn capabilities(&self) -> Value {
        let mut chrome_options = json!({ "args": chrome_args(&self.options, None) });
        if let Some(binary) = &self.browser_binary {
            chrome_options["binary"] = Value::String(binary.display().to_string());
        }
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "pageLoadStrategy": "normal",
                    "timeouts": { "pageLoad": self.command_timeout.as_millis() as u64 },
                    "goog:chromeOptions": chrome_options,
                }
            }
        })
    }

    async fn spawn_driver(&self) -> Result<(WireClient, Child), ChallengeEngineError> {
        let port = free_port()?;
        log::debug!("spawning {} on port {port}", self.driver_binary.display());
        let mut child = Command::new(&self.driver_binary)
            .arg(format!("--port={port}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                ChallengeEngineError::automation_caused_by(
                    format!("failed to launch {}", self.driver_binary.display()),
                    err,
                )
            })?;

        let base = Url::parse(&format!("http://127.0.0.1:{port}"))
            .map_err(|err| ChallengeEngineError::automation_caused_by("invalid driver address", err))?;
        let client = WireClient::new(base, self.command_timeout, self.verbose)?;

        for _ in 0..DRIVER_ATTEMPTS {
            sleep(DRIVER_INTERVAL).await;
            if let Ok(Some(status)) = child.try_wait() {
                return Err(ChallengeEngineError::automation(format!(
                    "webdriver exited before becoming ready ({status})"
                )));
            }
            if client.is_ready().await {
                return Ok((client, child));
            }
        }

        let _ = child.kill().await;
        Err(ChallengeEngineError::automation(format!(
            "webdriver on port {port} never became ready"
        )))
    }

    async fn start(&self) -> Result<WebDriverSession, ChallengeEngineError> {
        let (client, mut driver) = match &self.endpoint {
            Some(endpoint) => (
                WireClient::new(endpoint.clone(), self.command_timeout, self.verbose)?,
                None,
            ),
            None => {
                let (client, child) = self.spawn_driver().await?;
                (client, Some(child))
            }
        };

        let created = match client
            .command(Method::POST, "session", Some(self.capabilities()))
            .await
        {
            Ok(created) => created,
            Err(err) => {
                if let Some(child) = driver.as_mut() {
                    let _ = child.kill().await;
                }
                return Err(err.into());
            }
        };
        let Some(id) = created.get("sessionId").and_then(Value::as_str) else {
            if let Some(child) = driver.as_mut() {
                let _ = child.kill().await;
            }
            return Err(ChallengeEngineError::automation("new session reply has no sessionId"));
        };

        let session = WebDriverSession {
            client,
            id: id.to_string(),
            driver,
        };

        if let Some(fingerprint) = &self.fingerprint {
            let params = json!({
                "cmd": "Page.addScriptToEvaluateOnNewDocument",
                "params": { "source": fingerprint_script(fingerprint) },
            });
            if let Err(err) = session
                .client
                .command(Method::POST, &session.path("goog/cdp/execute"), Some(params))
                .await
            {
                log::warn!("failed to apply fingerprint: {err}");
            }
        }
        Ok(session)
    }

    fn active_session(&mut self) -> Result<&mut WebDriverSession, ChallengeEngineError> {
        self.session
            .as_mut()
            .ok_or_else(|| ChallengeEngineError::automation("browser session is not active"))
    }
}

#[async_trait]
impl ChallengeEngine for WebDriverEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::WebDriver
    }

    async fn navigate(&mut self, url: &Url) -> Result<(), ChallengeEngineError> {
        if self.session.is_none() {
            self.session = Some(self.start().await?);
        }
        let session = self.active_session()?;
        let path = session.path("url");
        let outcome = session
            .client
            .command(Method::POST, &path, Some(json!({ "url": url.as_str() })))
            .await;
        match outcome {
            Ok(_) => Ok(()),
            Err(err @ WebDriverError::Transport(_)) => {
                if let Some(session) = self.session.take() {
                    session.shutdown().await;
                }
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn wait_for_challenge(&mut self, timeout: Duration) -> Result<(), ChallengeEngineError> {
        let settings = PollSettings {
            timeout,
            ..self.poll
        };
        let session = self.active_session()?;
        poll_challenge(session, &settings).await?.into_result()
    }

    async fn cookies(&mut self) -> Result<HashMap<String, String>, ChallengeEngineError> {
        let session = self.active_session()?;
        let path = session.path("cookie");
        let value = session.client.command(Method::GET, &path, None).await?;
        let cookies = value
            .as_array()
            .map(|cookies| {
                cookies
                    .iter()
                    .filter_map(|cookie| {
                        let name = cookie.get("name")?.as_str()?;
                        let value = cookie.get("value")?.as_str()?;
                        Some((name.to_string(), value.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(cookies)
    }

    async fn headers(&mut self) -> Result<HashMap<String, String>, ChallengeEngineError> {
        let fallback = self.fallback_user_agent.clone();
        let session = self.active_session()?;
        let user_agent = match session.execute("return navigator.userAgent;").await {
            Ok(Value::String(agent)) if !agent.is_empty() => agent,
            Ok(_) | Err(WebDriverError::Command { .. }) => fallback,
            Err(err) => return Err(err.into()),
        };
        Ok(baseline_headers(&user_agent))
    }

    async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            log::debug!("closing webdriver session {}", session.id);
            session.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_config() -> CloudBridgeConfig {
        CloudBridgeConfig {
            settle_delay_ms: 0,
            poll_interval_ms: 10,
            timeout_secs: 5,
            ..CloudBridgeConfig::default()
        }
    }

    async fn driver_endpoint() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "value": { "sessionId": "abc", "capabilities": {} } })),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/session/abc/url"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": null })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/session/abc/cookie"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [
                    { "name": "cf_clearance", "value": "token", "domain": "example.com" },
                    { "name": "__cf_bm", "value": "bm" }
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/session/abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": null })))
            .expect(1)
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn drives_remote_endpoint() {
        let server = driver_endpoint().await;
        Mock::given(method("POST"))
            .and(path("/session/abc/execute/sync"))
            .and(body_string_contains("querySelector"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": "{\"present\":[],\"errorText\":null}"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/session/abc/execute/sync"))
            .and(body_string_contains("navigator.userAgent"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "value": "remote-agent/1.0" })),
            )
            .mount(&server)
            .await;

        let endpoint = Url::parse(&server.uri()).unwrap();
        let mut engine = WebDriverEngine::from_config(&fast_config()).with_endpoint(endpoint);
        let target = Url::parse("https://example.com/").unwrap();

        engine.navigate(&target).await.unwrap();
        engine
            .wait_for_challenge(Duration::from_secs(1))
            .await
            .unwrap();

        let cookies = engine.cookies().await.unwrap();
        assert_eq!(cookies.get("cf_clearance").map(String::as_str), Some("token"));
        assert_eq!(cookies.len(), 2);

        let headers = engine.headers().await.unwrap();
        assert_eq!(headers.get("User-Agent").map(String::as_str), Some("remote-agent/1.0"));
        assert_eq!(headers.get("Sec-Fetch-Mode").map(String::as_str), Some("navigate"));

        engine.close().await;
        engine.close().await;
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn surfaces_challenge_error_marker() {
        let server = driver_endpoint().await;
        Mock::given(method("POST"))
            .and(path("/session/abc/execute/sync"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": "{\"present\":[\"#challenge-error-title\"],\"errorText\":\"Access blocked\"}"
            })))
            .mount(&server)
            .await;

        let endpoint = Url::parse(&server.uri()).unwrap();
        let mut engine = WebDriverEngine::from_config(&fast_config()).with_endpoint(endpoint);
        engine
            .navigate(&Url::parse("https://example.com/").unwrap())
            .await
            .unwrap();

        let err = engine
            .wait_for_challenge(Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            ChallengeEngineError::Failed(message) => assert_eq!(message, "Access blocked"),
            other => panic!("unexpected error: {other}"),
        }
        engine.close().await;
    }

    #[tokio::test]
    async fn driver_errors_keep_their_cause() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "value": { "error": "session not created", "message": "chrome not reachable" }
            })))
            .mount(&server)
            .await;

        let endpoint = Url::parse(&server.uri()).unwrap();
        let mut engine = WebDriverEngine::from_config(&fast_config()).with_endpoint(endpoint);
        let err = engine
            .navigate(&Url::parse("https://example.com/").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ChallengeEngineError::Automation { .. }));
        let cause = std::error::Error::source(&err).expect("driver error kept as source");
        assert!(cause.to_string().contains("session not created"));
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn inactive_session_is_automation_error() {
        let mut engine = WebDriverEngine::from_config(&fast_config());
        assert!(matches!(
            engine.headers().await,
            Err(ChallengeEngineError::Automation { .. })
        ));
    }
}
