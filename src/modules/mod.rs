//! Cross-cutting services module
//!
//! Browser identity, session state, metrics and lifecycle events shared by
//! the bridge, its engines and its transport.

pub mod events;
pub mod metrics;
pub mod spoofing;
pub mod state;
pub mod tls;

// Re-export commonly used types
pub use events::{
    BridgeEvent, ChallengeEvent, ErrorEvent, EventDispatcher, EventHandler, LoggingHandler,
    MetricsHandler, PostResponseEvent, PreRequestEvent, RetryEvent, SessionExpiredEvent,
};
pub use metrics::{GlobalStats, MetricsCollector, MetricsSnapshot, OriginStats};
pub use spoofing::{BrowserFingerprint, BrowserType, FingerprintProvider, baseline_headers};
pub use state::{
    DEFAULT_SESSION_TTL, Session, SessionFile, SessionFileError, SessionSnapshot, SessionStore,
    origin_of,
};
pub use tls::{TlsParameters, tls_parameters_for};
