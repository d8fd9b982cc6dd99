//! Event system for the bridge.
//!
//! Broadcasts structured events around challenge runs and transport calls to
//! registered handlers (logging, metrics, or user-provided hooks).

use chrono::{DateTime, Utc};
use http::Method;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::metrics::MetricsCollector;

#[derive(Debug, Clone)]
pub struct PreRequestEvent {
    pub url: Url,
    pub method: Method,
    pub challenge_required: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PostResponseEvent {
    pub origin: String,
    pub url: Url,
    pub method: Method,
    pub status: u16,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ChallengeEvent {
    pub origin: String,
    pub engine: String,
    pub success: bool,
    pub attempt: u32,
    pub elapsed: Duration,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub origin: String,
    pub attempt: u32,
    pub reason: String,
    pub scheduled_after: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionExpiredEvent {
    pub origin: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub origin: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum BridgeEvent {
    PreRequest(PreRequestEvent),
    PostResponse(PostResponseEvent),
    Challenge(ChallengeEvent),
    Retry(RetryEvent),
    SessionExpired(SessionExpiredEvent),
    Error(ErrorEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &BridgeEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: BridgeEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug, Default)]
pub struct LoggingHandler {
    verbose: bool,
}

impl LoggingHandler {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &BridgeEvent) {
        match event {
            BridgeEvent::PreRequest(pre) => {
                if pre.challenge_required {
                    log::info!("-> {} {} (challenge required)", pre.method, pre.url);
                } else {
                    log::debug!("-> {} {}", pre.method, pre.url);
                }
            }
            BridgeEvent::PostResponse(post) => {
                log::debug!(
                    "<- {} {} -> {} ({:.2}s)",
                    post.method,
                    post.url,
                    post.status,
                    post.latency.as_secs_f64()
                );
            }
            BridgeEvent::Challenge(challenge) => {
                if challenge.success {
                    log::info!(
                        "challenge {} solved by {} on attempt {} ({:.2}s)",
                        challenge.origin,
                        challenge.engine,
                        challenge.attempt,
                        challenge.elapsed.as_secs_f64()
                    );
                } else {
                    log::warn!(
                        "challenge {} failed on attempt {}: {}",
                        challenge.origin,
                        challenge.attempt,
                        challenge.detail.as_deref().unwrap_or("unknown error")
                    );
                }
                if self.verbose
                    && let Some(detail) = challenge.detail.as_deref()
                {
                    log::debug!("challenge detail for {}: {detail}", challenge.origin);
                }
            }
            BridgeEvent::Retry(retry) => {
                log::info!(
                    "retry {} attempt {} after {:.2}s ({})",
                    retry.origin,
                    retry.attempt,
                    retry.scheduled_after.as_secs_f64(),
                    retry.reason
                );
            }
            BridgeEvent::SessionExpired(expired) => {
                log::warn!("session for {} looks poisoned: {}", expired.origin, expired.reason);
            }
            BridgeEvent::Error(error) => {
                log::warn!("warning {} -> {}", error.origin, error.error);
            }
        }
    }
}

/// Metrics handler that feeds the metrics collector.
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: MetricsCollector,
}

impl MetricsHandler {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &BridgeEvent) {
        match event {
            BridgeEvent::PostResponse(post) => {
                self.metrics
                    .record_response(&post.origin, post.status, post.latency);
            }
            BridgeEvent::Challenge(challenge) => {
                self.metrics
                    .record_challenge(&challenge.origin, challenge.success, challenge.elapsed);
            }
            BridgeEvent::SessionExpired(expired) => {
                self.metrics.record_session_expired(&expired.origin);
            }
            BridgeEvent::Error(error) => {
                self.metrics.record_error(&error.origin);
            }
            BridgeEvent::PreRequest(_) | BridgeEvent::Retry(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHandler(std::sync::Mutex<usize>);

    impl EventHandler for CountingHandler {
        fn handle(&self, _event: &BridgeEvent) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[test]
    fn dispatches_to_handlers() {
        let mut dispatcher = EventDispatcher::new();
        let counter = Arc::new(CountingHandler(std::sync::Mutex::new(0)));
        dispatcher.register_handler(counter.clone());
        dispatcher.register_handler(Arc::new(LoggingHandler::new(true)));
        dispatcher.dispatch(BridgeEvent::Error(ErrorEvent {
            origin: "https://example.com".into(),
            error: "timeout".into(),
            timestamp: Utc::now(),
        }));
        assert_eq!(*counter.0.lock().unwrap(), 1);
    }

    #[test]
    fn metrics_handler_counts_challenges() {
        let metrics = MetricsCollector::new();
        let handler = MetricsHandler::new(metrics.clone());
        handler.handle(&BridgeEvent::Challenge(ChallengeEvent {
            origin: "https://example.com".into(),
            engine: "devtools".into(),
            success: true,
            attempt: 1,
            elapsed: Duration::from_millis(40),
            detail: None,
            timestamp: Utc::now(),
        }));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.global.challenges_solved, 1);
    }
}
