//! High level bridge orchestration.
//!
//! Decides per request whether a browser challenge has to run, moves the
//! harvested cookies and headers from the challenge engine to the transport,
//! and turns transport failures that look like a fresh challenge into an
//! actionable [`CloudBridgeError::SessionExpired`].
//!
//! One lock guards the whole challenge-then-request sequence, so concurrent
//! callers on the same bridge are serialized.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use http::{HeaderMap, Method};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;
use url::Url;

use crate::challenges::core::{ChallengeEngineError, is_challenge_document, mentions_challenge};
use crate::challenges::engines::{ChallengeEngine, EngineKind, engine_for};
use crate::config::{CloudBridgeConfig, ConfigError, EngineMode};
use crate::modules::events::{
	BridgeEvent, ChallengeEvent, ErrorEvent, EventDispatcher, EventHandler, LoggingHandler,
	MetricsHandler, PostResponseEvent, PreRequestEvent, RetryEvent, SessionExpiredEvent,
};
use crate::modules::metrics::{MetricsCollector, MetricsSnapshot};
use crate::modules::state::{SessionFileError, SessionSnapshot, SessionStore, origin_of};
use crate::transport::{
	ReqwestTransport, RequestOptions, TransportEngine, TransportError, TransportResponse,
};

/// Result alias used across the orchestration layer.
pub type CloudBridgeResult<T> = Result<T, CloudBridgeError>;

/// High-level error surfaced by the bridge.
#[derive(Debug, Error)]
pub enum CloudBridgeError {
	#[error("invalid url: {0}")]
	InvalidUrl(#[from] url::ParseError),
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),
	#[error("challenge error: {0}")]
	Challenge(#[from] ChallengeEngineError),
	#[error("challenge not solved after {attempts} attempts: {last_error}")]
	ChallengeExhausted {
		attempts: u32,
		#[source]
		last_error: Box<CloudBridgeError>,
	},
	#[error("transport error: {0}")]
	Transport(#[from] TransportError),
	/// A transport failure looked like a renewed challenge; solve again before retrying.
	#[error("session for {origin} expired: {source}")]
	SessionExpired {
		origin: String,
		#[source]
		source: TransportError,
	},
	#[error("session file error: {0}")]
	Session(#[from] SessionFileError),
	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
}

/// Coarse error category for callers deciding whether to re-solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
	Automation,
	ChallengeFailed,
	ChallengeTimeout,
	ChallengeExhausted,
	Transport,
	SessionExpired,
	Session,
	Config,
	InvalidUrl,
	Decode,
}

impl CloudBridgeError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			CloudBridgeError::InvalidUrl(_) => ErrorKind::InvalidUrl,
			CloudBridgeError::Config(_) => ErrorKind::Config,
			CloudBridgeError::Challenge(ChallengeEngineError::Automation { .. }) => {
				ErrorKind::Automation
			}
			CloudBridgeError::Challenge(ChallengeEngineError::Failed(_)) => {
				ErrorKind::ChallengeFailed
			}
			CloudBridgeError::Challenge(ChallengeEngineError::Timeout(_)) => {
				ErrorKind::ChallengeTimeout
			}
			CloudBridgeError::ChallengeExhausted { .. } => ErrorKind::ChallengeExhausted,
			CloudBridgeError::Transport(_) => ErrorKind::Transport,
			CloudBridgeError::SessionExpired { .. } => ErrorKind::SessionExpired,
			CloudBridgeError::Session(_) => ErrorKind::Session,
			CloudBridgeError::Json(_) => ErrorKind::Decode,
		}
	}

	/// Whether running the challenge again may fix the failure.
	pub fn needs_challenge(&self) -> bool {
		matches!(
			self.kind(),
			ErrorKind::SessionExpired
				| ErrorKind::ChallengeFailed
				| ErrorKind::ChallengeTimeout
				| ErrorKind::ChallengeExhausted
		)
	}
}

/// Keyword heuristic: a transport error whose text names a challenge
/// poisons the session, anything else passes through untouched.
fn classify_transport_error(origin: &str, err: TransportError) -> CloudBridgeError {
	if mentions_challenge(&err.to_string()) {
		CloudBridgeError::SessionExpired {
			origin: origin.to_string(),
			source: err,
		}
	} else {
		CloudBridgeError::Transport(err)
	}
}

/// Read-only HTTP response returned by the bridge.
#[derive(Debug, Clone)]
pub struct BridgeResponse {
	status: u16,
	headers: HeaderMap,
	cookies: HashMap<String, String>,
	body: Bytes,
	url: Url,
}

impl BridgeResponse {
	/// HTTP status code.
	pub fn status(&self) -> u16 {
		self.status
	}

	/// Final URL after redirects.
	pub fn url(&self) -> &Url {
		&self.url
	}

	pub fn headers(&self) -> &HeaderMap {
		&self.headers
	}

	/// Cookies set by this response.
	pub fn cookies(&self) -> &HashMap<String, String> {
		&self.cookies
	}

	pub fn is_success(&self) -> bool {
		(200..300).contains(&self.status)
	}

	/// Body decoded as UTF-8, replacing invalid sequences.
	pub fn text(&self) -> String {
		String::from_utf8_lossy(&self.body).into_owned()
	}

	pub fn json<T: DeserializeOwned>(&self) -> CloudBridgeResult<T> {
		Ok(serde_json::from_slice(&self.body)?)
	}

	/// Raw body bytes.
	pub fn bytes(&self) -> Bytes {
		self.body.clone()
	}
}

impl From<TransportResponse> for BridgeResponse {
	fn from(response: TransportResponse) -> Self {
		Self {
			status: response.status,
			headers: response.headers,
			cookies: response.cookies,
			body: response.body,
			url: response.url,
		}
	}
}

fn saturating_millis(duration: Duration) -> u64 {
	u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Fluent builder for [`CloudBridge`].
pub struct CloudBridgeBuilder {
	config: CloudBridgeConfig,
	engine: Option<Box<dyn ChallengeEngine>>,
	transport: Option<Box<dyn TransportEngine>>,
	handlers: Vec<Arc<dyn EventHandler>>,
}

impl CloudBridgeBuilder {
	pub fn new() -> Self {
		Self {
			config: CloudBridgeConfig::default(),
			engine: None,
			transport: None,
			handlers: Vec::new(),
		}
	}

	pub fn with_config(mut self, config: CloudBridgeConfig) -> Self {
		self.config = config;
		self
	}

	pub fn with_engine_mode(mut self, mode: EngineMode) -> Self {
		self.config.engine = mode;
		self
	}

	pub fn headless(mut self, headless: bool) -> Self {
		self.config.headless = headless;
		self
	}

	pub fn with_fingerprint(mut self, identifier: impl Into<String>) -> Self {
		self.config.fingerprint = Some(identifier.into());
		self
	}

	pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
		self.config.proxy = Some(proxy.into());
		self
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.config.timeout_secs = timeout.as_secs().max(1);
		self
	}

	pub fn with_max_retries(mut self, retries: u32) -> Self {
		self.config.max_retries = retries;
		self
	}

	pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
		self.config.retry_backoff_ms = saturating_millis(backoff);
		self
	}

	pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
		self.config.session_ttl_secs = ttl.as_secs();
		self
	}

	pub fn with_poll_timing(mut self, settle_delay: Duration, interval: Duration) -> Self {
		self.config.settle_delay_ms = saturating_millis(settle_delay);
		self.config.poll_interval_ms = saturating_millis(interval);
		self
	}

	pub fn with_chrome_path(mut self, path: impl Into<PathBuf>) -> Self {
		self.config.chrome_path = Some(path.into());
		self
	}

	pub fn with_webdriver_url(mut self, url: impl Into<String>) -> Self {
		self.config.webdriver_url = Some(url.into());
		self
	}

	pub fn with_debug(mut self, debug: bool) -> Self {
		self.config.debug = debug;
		self
	}

	/// Replace the engine the configuration would select.
	pub fn with_challenge_engine(mut self, engine: Box<dyn ChallengeEngine>) -> Self {
		self.engine = Some(engine);
		self
	}

	pub fn with_transport(mut self, transport: Box<dyn TransportEngine>) -> Self {
		self.transport = Some(transport);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn build(self) -> CloudBridgeResult<CloudBridge> {
		CloudBridge::assemble(self.config, self.engine, self.transport, self.handlers)
	}
}

impl Default for CloudBridgeBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// State touched by the challenge-then-request sequence.
struct BridgeInner {
	engine: Box<dyn ChallengeEngine>,
	transport: Box<dyn TransportEngine>,
	store: SessionStore,
	/// Origin whose session was last pushed into the transport.
	applied_origin: Option<String>,
}

impl BridgeInner {
	fn apply_stored_session(&mut self, url: &Url) {
		if let Some(session) = self.store.session(url) {
			self.transport.apply_cookies(&session.cookies);
			self.transport.apply_headers(&session.headers);
			self.applied_origin = Some(session.origin.clone());
		}
	}
}

/// Cloudflare-aware client that solves challenges in a browser once and
/// replays the session on a fast transport.
pub struct CloudBridge {
	config: CloudBridgeConfig,
	engine_kind: EngineKind,
	metrics: MetricsCollector,
	events: Arc<EventDispatcher>,
	inner: Mutex<BridgeInner>,
}

impl CloudBridge {
	/// Construct a bridge with default configuration.
	pub fn new() -> CloudBridgeResult<Self> {
		Self::from_config(CloudBridgeConfig::default())
	}

	pub fn builder() -> CloudBridgeBuilder {
		CloudBridgeBuilder::new()
	}

	pub fn from_config(config: CloudBridgeConfig) -> CloudBridgeResult<Self> {
		Self::assemble(config, None, None, Vec::new())
	}

	/// Construct a bridge around caller-supplied engines.
	pub fn with_engines(
		config: CloudBridgeConfig,
		engine: Box<dyn ChallengeEngine>,
		transport: Box<dyn TransportEngine>,
	) -> CloudBridgeResult<Self> {
		Self::assemble(config, Some(engine), Some(transport), Vec::new())
	}

	fn assemble(
		config: CloudBridgeConfig,
		engine: Option<Box<dyn ChallengeEngine>>,
		transport: Option<Box<dyn TransportEngine>>,
		handlers: Vec<Arc<dyn EventHandler>>,
	) -> CloudBridgeResult<Self> {
		config.validate()?;

		let engine = engine.unwrap_or_else(|| engine_for(&config));
		let transport: Box<dyn TransportEngine> = match transport {
			Some(transport) => transport,
			None => Box::new(ReqwestTransport::from_config(&config)?),
		};
		let engine_kind = engine.kind();

		let metrics = MetricsCollector::new();
		let mut events = EventDispatcher::new();
		events.register_handler(Arc::new(LoggingHandler::new(config.debug)));
		events.register_handler(Arc::new(MetricsHandler::new(metrics.clone())));
		for handler in handlers {
			events.register_handler(handler);
		}

		log::debug!("bridge ready with {engine_kind} engine");

		Ok(Self {
			inner: Mutex::new(BridgeInner {
				engine,
				transport,
				store: SessionStore::new(config.session_ttl()),
				applied_origin: None,
			}),
			config,
			engine_kind,
			metrics,
			events: Arc::new(events),
		})
	}

	pub fn config(&self) -> &CloudBridgeConfig {
		&self.config
	}

	/// Engine variant fixed at construction.
	pub fn engine_kind(&self) -> EngineKind {
		self.engine_kind
	}

	pub fn metrics(&self) -> MetricsSnapshot {
		self.metrics.snapshot()
	}

	/// Perform an HTTP GET request.
	pub async fn get(&self, url: &str) -> CloudBridgeResult<BridgeResponse> {
		self.request(RequestOptions::get(Url::parse(url)?)).await
	}

	/// POST a raw body.
	pub async fn post(&self, url: &str, body: impl Into<Bytes>) -> CloudBridgeResult<BridgeResponse> {
		self.request(RequestOptions::new(Method::POST, Url::parse(url)?).with_body(body))
			.await
	}

	pub async fn post_json<T: Serialize + ?Sized>(
		&self,
		url: &str,
		json: &T,
	) -> CloudBridgeResult<BridgeResponse> {
		let json = serde_json::to_value(json)?;
		self.request(RequestOptions::new(Method::POST, Url::parse(url)?).with_json(json))
			.await
	}

	pub async fn put(&self, url: &str, body: impl Into<Bytes>) -> CloudBridgeResult<BridgeResponse> {
		self.request(RequestOptions::new(Method::PUT, Url::parse(url)?).with_body(body))
			.await
	}

	pub async fn delete(&self, url: &str) -> CloudBridgeResult<BridgeResponse> {
		self.request(RequestOptions::new(Method::DELETE, Url::parse(url)?))
			.await
	}

	/// Perform an arbitrary request, solving a challenge first when the
	/// origin has no valid session. Challenge failures are not retried here.
	pub async fn request(&self, options: RequestOptions) -> CloudBridgeResult<BridgeResponse> {
		let mut inner = self.inner.lock().await;
		let origin = origin_of(&options.url);
		let challenge_required = !inner.store.has_valid_session(&options.url);

		self.events.dispatch(BridgeEvent::PreRequest(PreRequestEvent {
			url: options.url.clone(),
			method: options.method.clone(),
			challenge_required,
			timestamp: Utc::now(),
		}));

		if challenge_required {
			let started = Instant::now();
			let outcome = Self::run_challenge(&mut inner, &options.url, self.config.timeout()).await;
			self.record_challenge(&origin, 1, started.elapsed(), outcome.as_ref().err());
			outcome?;
		} else if inner.applied_origin.as_deref() != Some(origin.as_str()) {
			log::debug!("applying stored session for {origin}");
			inner.apply_stored_session(&options.url);
		}

		self.execute(&mut inner, &origin, &options).await
	}

	/// Solve the challenge for `url` with the configured retry budget.
	pub async fn solve_challenge(&self, url: &str) -> CloudBridgeResult<SessionSnapshot> {
		self.solve_challenge_with_retries(url, self.config.max_retries)
			.await
	}

	/// Run navigate, wait, harvest, apply and a verification GET up to
	/// `max_retries` times, sleeping the configured backoff in between.
	pub async fn solve_challenge_with_retries(
		&self,
		url: &str,
		max_retries: u32,
	) -> CloudBridgeResult<SessionSnapshot> {
		let url = Url::parse(url)?;
		let origin = origin_of(&url);
		let attempts = max_retries.max(1);
		let backoff = self.config.retry_backoff();
		let mut inner = self.inner.lock().await;
		let mut attempt = 0;

		loop {
			attempt += 1;
			let started = Instant::now();
			let err = match self.attempt_solve(&mut inner, &url, &origin).await {
				Ok(()) => {
					self.record_challenge(&origin, attempt, started.elapsed(), None::<&CloudBridgeError>);
					if let Some(snapshot) = inner.store.snapshot(&url) {
						return Ok(snapshot);
					}
					CloudBridgeError::Challenge(ChallengeEngineError::automation(
						"session vanished after a successful solve",
					))
				}
				Err(err) => err,
			};

			self.record_challenge(&origin, attempt, started.elapsed(), Some(&err));
			if attempt >= attempts {
				return Err(CloudBridgeError::ChallengeExhausted {
					attempts: attempt,
					last_error: Box::new(err),
				});
			}

			self.events.dispatch(BridgeEvent::Retry(RetryEvent {
				origin: origin.clone(),
				attempt: attempt + 1,
				reason: err.to_string(),
				scheduled_after: backoff,
				timestamp: Utc::now(),
			}));
			if !backoff.is_zero() {
				sleep(backoff).await;
			}
		}
	}

	async fn attempt_solve(
		&self,
		inner: &mut BridgeInner,
		url: &Url,
		origin: &str,
	) -> CloudBridgeResult<()> {
		Self::run_challenge(inner, url, self.config.timeout()).await?;

		let verification = RequestOptions::get(url.clone());
		let started = Instant::now();
		let response = match inner.transport.execute(&verification).await {
			Ok(response) => response,
			Err(err) => {
				inner.store.clear(Some(url));
				return Err(CloudBridgeError::Transport(err));
			}
		};
		self.record_response(origin, &verification, &response, started.elapsed());

		if is_challenge_document(&response.text()) {
			inner.store.clear(Some(url));
			return Err(CloudBridgeError::Challenge(ChallengeEngineError::Failed(
				"verification response still shows challenge markers".into(),
			)));
		}
		Ok(())
	}

	/// Navigate, wait out the challenge, then store and apply the harvest.
	async fn run_challenge(
		inner: &mut BridgeInner,
		url: &Url,
		timeout: Duration,
	) -> Result<(), ChallengeEngineError> {
		inner.engine.navigate(url).await?;
		inner.engine.wait_for_challenge(timeout).await?;
		let harvest = inner.engine.harvest().await?;

		inner.transport.apply_cookies(&harvest.cookies);
		inner.transport.apply_headers(&harvest.headers);
		inner.store.update(url, harvest.cookies, harvest.headers);
		inner.applied_origin = Some(origin_of(url));
		Ok(())
	}

	async fn execute(
		&self,
		inner: &mut BridgeInner,
		origin: &str,
		options: &RequestOptions,
	) -> CloudBridgeResult<BridgeResponse> {
		let started = Instant::now();
		match inner.transport.execute(options).await {
			Ok(response) => {
				self.record_response(origin, options, &response, started.elapsed());
				Ok(response.into())
			}
			Err(err) => match classify_transport_error(origin, err) {
				CloudBridgeError::SessionExpired { origin, source } => {
					inner.store.clear(Some(&options.url));
					self.events.dispatch(BridgeEvent::SessionExpired(SessionExpiredEvent {
						origin: origin.clone(),
						reason: source.to_string(),
						timestamp: Utc::now(),
					}));
					Err(CloudBridgeError::SessionExpired { origin, source })
				}
				other => {
					self.events.dispatch(BridgeEvent::Error(ErrorEvent {
						origin: origin.to_string(),
						error: other.to_string(),
						timestamp: Utc::now(),
					}));
					Err(other)
				}
			},
		}
	}

	fn record_response(
		&self,
		origin: &str,
		options: &RequestOptions,
		response: &TransportResponse,
		latency: Duration,
	) {
		self.events.dispatch(BridgeEvent::PostResponse(PostResponseEvent {
			origin: origin.to_string(),
			url: response.url.clone(),
			method: options.method.clone(),
			status: response.status,
			latency,
			timestamp: Utc::now(),
		}));
	}

	fn record_challenge<E: std::fmt::Display>(
		&self,
		origin: &str,
		attempt: u32,
		elapsed: Duration,
		error: Option<&E>,
	) {
		self.events.dispatch(BridgeEvent::Challenge(ChallengeEvent {
			origin: origin.to_string(),
			engine: self.engine_kind.to_string(),
			success: error.is_none(),
			attempt,
			elapsed,
			detail: error.map(|err| err.to_string()),
			timestamp: Utc::now(),
		}));
	}

	/// Stored session for the URL's origin, valid or not.
	pub async fn session_info(&self, url: &str) -> CloudBridgeResult<Option<SessionSnapshot>> {
		let url = Url::parse(url)?;
		Ok(self.inner.lock().await.store.snapshot(&url))
	}

	/// Forget one origin's session, or every session when `url` is `None`.
	pub async fn clear_session(&self, url: Option<&str>) -> CloudBridgeResult<()> {
		let url = url.map(Url::parse).transpose()?;
		let mut inner = self.inner.lock().await;
		inner.store.clear(url.as_ref());
		let cleared_applied = match (&url, &inner.applied_origin) {
			(Some(url), Some(applied)) => origin_of(url) == *applied,
			(None, _) => true,
			_ => false,
		};
		if cleared_applied {
			inner.applied_origin = None;
		}
		Ok(())
	}

	/// Write one origin (single-origin layout) or every session
	/// (multi-origin layout) to `path`.
	pub async fn save_session(&self, path: impl AsRef<Path>, url: Option<&str>) -> CloudBridgeResult<()> {
		let url = url.map(Url::parse).transpose()?;
		let inner = self.inner.lock().await;
		inner.store.save(path, url.as_ref())?;
		Ok(())
	}

	/// Merge sessions from `path`, returning the origins loaded. Loaded
	/// sessions reach the transport on the next request to their origin.
	pub async fn load_session(&self, path: impl AsRef<Path>) -> CloudBridgeResult<Vec<Url>> {
		let mut inner = self.inner.lock().await;
		let loaded = inner.store.load(path)?;
		inner.applied_origin = None;
		log::info!("loaded {} stored session(s)", loaded.len());
		Ok(loaded)
	}

	/// Release both engines. Safe to call repeatedly; a later request
	/// relaunches what it needs.
	pub async fn close(&self) {
		let mut inner = self.inner.lock().await;
		inner.engine.close().await;
		inner.transport.close().await;
	}
}
