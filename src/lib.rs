//! # cloudbridge-rs
//!
//! Get past Cloudflare challenges once in a real browser, then reuse the
//! harvested session on a fast HTTP client.
//!
//! A [`CloudBridge`] drives a Chrome instance (over the DevTools protocol or
//! a WebDriver endpoint) only when an origin has no valid session. The
//! resulting cookies and browser-consistent headers are replayed by a
//! reqwest-based transport until the session expires.
//!
//! ## Features
//!
//! - Per-origin session store with TTL and JSON persistence
//! - DevTools and WebDriver challenge engines
//! - Marker-based challenge polling with timeout and error detection
//! - Response-side challenge detection that flags expired sessions
//! - Browser fingerprint profiles shared by both engines and the transport
//! - Lifecycle events and request/challenge metrics
//!
//! ## Example
//!
//! ```no_run
//! use cloudbridge_rs::CloudBridge;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bridge = CloudBridge::builder().headless(true).build()?;
//!     let response = bridge.get("https://example.com").await?;
//!     println!("Response: {}", response.text());
//!     bridge.close().await;
//!     Ok(())
//! }
//! ```

mod cloudbridge;

pub mod challenges;
pub mod config;
pub mod modules;
pub mod transport;

pub use crate::cloudbridge::{
    BridgeResponse,
    CloudBridge,
    CloudBridgeBuilder,
    CloudBridgeError,
    CloudBridgeResult,
    ErrorKind,
};

pub use crate::config::{CloudBridgeConfig, ConfigError, EngineMode};

pub use crate::challenges::core::{
    ChallengeEngineError,
    ChallengeResponse,
    ChallengeResult,
    MarkerScan,
    PageProbe,
    PollOutcome,
    PollSettings,
};

pub use crate::challenges::detectors::{ChallengeDetection, ChallengeDetector, ChallengeType};

pub use crate::challenges::engines::{
    BrowserLocator,
    ChallengeEngine,
    DevToolsEngine,
    EngineKind,
    WebDriverEngine,
};

pub use crate::transport::{
    ReqwestTransport,
    RequestOptions,
    TransportEngine,
    TransportError,
    TransportResponse,
};

pub use crate::modules::{
    BridgeEvent,
    BrowserFingerprint,
    BrowserType,
    ChallengeEvent,
    ErrorEvent,
    EventDispatcher,
    EventHandler,
    FingerprintProvider,
    GlobalStats,
    LoggingHandler,
    MetricsCollector,
    MetricsHandler,
    MetricsSnapshot,
    OriginStats,
    PostResponseEvent,
    PreRequestEvent,
    RetryEvent,
    SessionExpiredEvent,
    SessionSnapshot,
    SessionStore,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
