//! Chrome DevTools Protocol engine.
//!
//! Launches a Chromium-family browser with a remote debugging port, attaches
//! to a fresh page target over a websocket, and evaluates the marker probe in
//! that page while a challenge runs.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::browser::{
    BrowserLocator, BrowserOptions, chrome_args, fingerprint_script, free_port, profile_dir,
};
use super::{ChallengeEngine, EngineKind};
use crate::challenges::core::{
    ChallengeEngineError, MarkerScan, PageProbe, PollSettings, poll_challenge, probe_expression,
};
use crate::config::CloudBridgeConfig;
use crate::modules::spoofing::{BrowserFingerprint, FingerprintProvider, baseline_headers};

const ENDPOINT_ATTEMPTS: usize = 40;
const ENDPOINT_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
enum CdpError {
    /// The browser answered with a protocol error.
    #[error("{method} failed: {message}")]
    Protocol { method: String, message: String },
    #[error("devtools connection error: {0}")]
    Connection(String),
}

impl From<CdpError> for ChallengeEngineError {
    fn from(err: CdpError) -> Self {
        let message = err.to_string();
        ChallengeEngineError::automation_caused_by(message, err)
    }
}

/// `/json/version` response subset.
#[derive(Debug, Deserialize)]
struct VersionInfo {
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: String,
    #[serde(rename = "Browser")]
    browser: Option<String>,
}

async fn fetch_version(port: u16) -> Result<VersionInfo, String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(400))
        .build()
        .map_err(|err| err.to_string())?;
    let response = client
        .get(format!("http://127.0.0.1:{port}/json/version"))
        .send()
        .await
        .map_err(|err| err.to_string())?;
    if !response.status().is_success() {
        return Err(format!("unexpected status {}", response.status()));
    }
    response.json().await.map_err(|err| err.to_string())
}

async fn wait_for_endpoint(child: &mut Child, port: u16) -> Result<VersionInfo, ChallengeEngineError> {
    let mut last_error = "endpoint not reachable".to_string();
    for _ in 0..ENDPOINT_ATTEMPTS {
        sleep(ENDPOINT_INTERVAL).await;

        if let Ok(Some(status)) = child.try_wait() {
            return Err(ChallengeEngineError::automation(format!(
                "browser exited before the debugging endpoint came up ({status})"
            )));
        }

        match fetch_version(port).await {
            Ok(info) => return Ok(info),
            Err(err) => last_error = err,
        }
    }
    Err(ChallengeEngineError::automation(format!(
        "debugging endpoint on port {port} not available: {last_error}"
    )))
}

/// Request/response channel over the browser websocket.
struct CdpConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
    command_timeout: Duration,
    verbose: bool,
}

impl CdpConnection {
    async fn connect(ws_url: &str, command_timeout: Duration, verbose: bool) -> Result<Self, CdpError> {
        let (ws, _) = connect_async(ws_url)
            .await
            .map_err(|err| CdpError::Connection(format!("failed to connect to {ws_url}: {err}")))?;
        Ok(Self {
            ws,
            next_id: 0,
            command_timeout,
            verbose,
        })
    }

    /// Send one command and wait for its reply, skipping events.
    async fn call(
        &mut self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
    ) -> Result<Value, CdpError> {
        self.next_id += 1;
        let id = self.next_id;
        let mut message = json!({ "id": id, "method": method, "params": params });
        if let Some(session_id) = session_id {
            message["sessionId"] = Value::String(session_id.to_string());
        }
        if self.verbose {
            log::debug!("cdp -> {method} (#{id})");
        }

        let ws = &mut self.ws;
        ws.send(Message::Text(message.to_string()))
            .await
            .map_err(|err| CdpError::Connection(err.to_string()))?;

        let reply = async {
            while let Some(frame) = ws.next().await {
                let text = match frame.map_err(|err| CdpError::Connection(err.to_string()))? {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    _ => continue,
                };
                let Ok(value) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                if value.get("id").and_then(Value::as_u64) != Some(id) {
                    continue;
                }
                if let Some(error) = value.get("error") {
                    return Err(CdpError::Protocol {
                        method: method.to_string(),
                        message: error
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown error")
                            .to_string(),
                    });
                }
                return Ok(value.get("result").cloned().unwrap_or(Value::Null));
            }
            Err(CdpError::Connection("websocket closed".into()))
        };

        timeout(self.command_timeout, reply)
            .await
            .map_err(|_| CdpError::Connection(format!("{method} timed out")))?
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// One launched browser with an attached page.
struct DevToolsSession {
    child: Option<Child>,
    profile_dir: Option<PathBuf>,
    cdp: CdpConnection,
    session_id: String,
}

impl DevToolsSession {
    async fn page_call(&mut self, method: &str, params: Value) -> Result<Value, CdpError> {
        let session_id = self.session_id.clone();
        self.cdp.call(method, params, Some(&session_id)).await
    }

    async fn evaluate(&mut self, expression: &str) -> Result<Value, CdpError> {
        let result = self
            .page_call(
                "Runtime.evaluate",
                json!({ "expression": expression, "returnByValue": true }),
            )
            .await?;
        if let Some(details) = result.get("exceptionDetails") {
            return Err(CdpError::Protocol {
                method: "Runtime.evaluate".into(),
                message: details
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or("script exception")
                    .to_string(),
            });
        }
        Ok(result
            .get("result")
            .and_then(|remote| remote.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn shutdown(mut self) {
        let _ = self.cdp.call("Browser.close", json!({}), None).await;
        self.cdp.close().await;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
        }
        if let Some(dir) = self.profile_dir.take() {
            let _ = fs::remove_dir_all(dir);
        }
    }
}

#[async_trait]
impl PageProbe for DevToolsSession {
    async fn scan(&mut self) -> Result<MarkerScan, ChallengeEngineError> {
        match self.evaluate(&probe_expression()).await {
            Ok(Value::String(raw)) => Ok(MarkerScan::from_probe_json(&raw).unwrap_or_else(|err| {
                log::debug!("unreadable marker probe output: {err}");
                MarkerScan::unavailable()
            })),
            Ok(_) => Ok(MarkerScan::unavailable()),
            Err(err @ CdpError::Protocol { .. }) => {
                log::debug!("marker probe unavailable: {err}");
                Ok(MarkerScan::unavailable())
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Challenge engine driving Chromium through the DevTools protocol.
pub struct DevToolsEngine {
    binary: Option<PathBuf>,
    options: BrowserOptions,
    fingerprint: Option<BrowserFingerprint>,
    fallback_user_agent: String,
    poll: PollSettings,
    command_timeout: Duration,
    verbose: bool,
    session: Option<DevToolsSession>,
}

impl DevToolsEngine {
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
            binary: BrowserLocator::new(config.chrome_path.clone()).resolve(),
            options,
            fingerprint,
            fallback_user_agent,
            poll: config.poll_settings(),
            command_timeout: config.timeout(),
            verbose: config.debug,
            session: None,
        }
    }

    pub fn with_locator(mut self, locator: &BrowserLocator) -> Self {
        self.binary = locator.resolve();
        self
    }

    /// Resolved browser binary, if any.
    pub fn binary(&self) -> Option<&PathBuf> {
        self.binary.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    async fn launch(&self) -> Result<DevToolsSession, ChallengeEngineError> {
        let binary = self.binary.clone().ok_or_else(|| {
            ChallengeEngineError::automation(
                "no Chromium-family browser found; set chrome_path or CHROME_BIN",
            )
        })?;
        let port = free_port()?;
        let profile = profile_dir("devtools", port);

        let mut args = chrome_args(&self.options, Some(&profile));
        args.push(format!("--remote-debugging-port={port}"));
        args.push("about:blank".into());
        log::debug!("launching {} on debugging port {port}", binary.display());

        let mut child = Command::new(&binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                ChallengeEngineError::automation_caused_by(
                    format!("failed to launch {}", binary.display()),
                    err,
                )
            })?;

        match self.attach(&mut child, port).await {
            Ok((cdp, session_id)) => Ok(DevToolsSession {
                child: Some(child),
                profile_dir: Some(profile),
                cdp,
                session_id,
            }),
            Err(err) => {
                let _ = child.kill().await;
                let _ = fs::remove_dir_all(&profile);
                Err(err)
            }
        }
    }

    async fn attach(
        &self,
        child: &mut Child,
        port: u16,
    ) -> Result<(CdpConnection, String), ChallengeEngineError> {
        let info = wait_for_endpoint(child, port).await?;
        if let Some(browser) = &info.browser {
            log::debug!("connected to {browser}");
        }

        let mut cdp =
            CdpConnection::connect(&info.web_socket_debugger_url, self.command_timeout, self.verbose)
                .await?;
        let target = cdp
            .call("Target.createTarget", json!({ "url": "about:blank" }), None)
            .await?;
        let target_id = target
            .get("targetId")
            .and_then(Value::as_str)
            .ok_or_else(|| ChallengeEngineError::automation("createTarget returned no targetId"))?
            .to_string();
        let attached = cdp
            .call(
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
                None,
            )
            .await?;
        let session_id = attached
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| ChallengeEngineError::automation("attachToTarget returned no sessionId"))?
            .to_string();

        cdp.call("Page.enable", json!({}), Some(&session_id)).await?;

        if let Some(fingerprint) = &self.fingerprint {
            let script = fingerprint_script(fingerprint);
            if let Err(err) = cdp
                .call(
                    "Page.addScriptToEvaluateOnNewDocument",
                    json!({ "source": script }),
                    Some(&session_id),
                )
                .await
            {
                log::warn!("failed to apply fingerprint: {err}");
            }
            if let Err(err) = cdp
                .call(
                    "Network.setUserAgentOverride",
                    json!({
                        "userAgent": fingerprint.user_agent,
                        "acceptLanguage": fingerprint.accept_language(),
                    }),
                    Some(&session_id),
                )
                .await
            {
                log::warn!("failed to override user agent: {err}");
            }
        }

        Ok((cdp, session_id))
    }

    fn active_session(&mut self) -> Result<&mut DevToolsSession, ChallengeEngineError> {
        self.session
            .as_mut()
            .ok_or_else(|| ChallengeEngineError::automation("browser session is not active"))
    }

    /// Drop a session whose connection is gone so the next call relaunches.
    async fn discard_if_disconnected(&mut self, err: &CdpError) {
        if matches!(err, CdpError::Connection(_))
            && let Some(session) = self.session.take()
        {
            session.shutdown().await;
        }
    }
}

#[async_trait]
impl ChallengeEngine for DevToolsEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::DevTools
    }

    async fn navigate(&mut self, url: &Url) -> Result<(), ChallengeEngineError> {
        if self.session.is_none() {
            self.session = Some(self.launch().await?);
        }
        let session = self.active_session()?;
        let outcome = session
            .page_call("Page.navigate", json!({ "url": url.as_str() }))
            .await;
        let result = match outcome {
            Ok(result) => result,
            Err(err) => {
                self.discard_if_disconnected(&err).await;
                return Err(err.into());
            }
        };

        if let Some(error_text) = result.get("errorText").and_then(Value::as_str) {
            return Err(ChallengeEngineError::automation(format!(
                "failed to load {url}: {error_text}"
            )));
        }
        Ok(())
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
        let result = session.page_call("Network.getCookies", json!({})).await?;
        let cookies = result
            .get("cookies")
            .and_then(Value::as_array)
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
        let user_agent = match session.evaluate("navigator.userAgent").await {
            Ok(Value::String(agent)) if !agent.is_empty() => agent,
            Ok(_) | Err(CdpError::Protocol { .. }) => fallback,
            Err(err) => return Err(err.into()),
        };
        Ok(baseline_headers(&user_agent))
    }

    async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            log::debug!("closing devtools browser");
            session.shutdown().await;
        }
    }
}
