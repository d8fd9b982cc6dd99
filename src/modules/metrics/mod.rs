//! Metrics collection utilities.
//!
//! Aggregates per-origin request outcomes, challenge runs and session
//! expiries, with latency percentiles for observability.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Aggregated metrics across all origins.
#[derive(Debug, Clone)]
pub struct GlobalStats {
    pub started_at: DateTime<Utc>,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub challenges_solved: u64,
    pub challenges_failed: u64,
    pub sessions_expired: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            total_requests: 0,
            successes: 0,
            failures: 0,
            challenges_solved: 0,
            challenges_failed: 0,
            sessions_expired: 0,
            average_latency: None,
            p95_latency: None,
        }
    }
}

/// Origin-scoped metrics snapshot.
#[derive(Debug, Clone)]
pub struct OriginStats {
    pub origin: String,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub challenges_solved: u64,
    pub challenges_failed: u64,
    pub sessions_expired: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
    pub average_challenge_time: Option<Duration>,
    pub last_status: Option<u16>,
}

impl OriginStats {
    fn from_accumulator(origin: &str, acc: &OriginAccumulator) -> Self {
        let (avg, p95) = acc.latency_stats();
        let average_challenge_time = (acc.challenges_solved > 0).then(|| {
            Duration::from_secs_f64(
                acc.challenge_time.as_secs_f64() / acc.challenges_solved as f64,
            )
        });
        Self {
            origin: origin.to_string(),
            total_requests: acc.total_requests,
            successes: acc.successes,
            failures: acc.failures,
            challenges_solved: acc.challenges_solved,
            challenges_failed: acc.challenges_failed,
            sessions_expired: acc.sessions_expired,
            average_latency: avg,
            p95_latency: p95,
            average_challenge_time,
            last_status: acc.last_status,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub global: GlobalStats,
    pub origins: Vec<OriginStats>,
}

impl MetricsSnapshot {
    pub fn origin(&self, origin: &str) -> Option<&OriginStats> {
        self.origins.iter().find(|stats| stats.origin == origin)
    }
}

#[derive(Debug)]
struct OriginAccumulator {
    total_requests: u64,
    successes: u64,
    failures: u64,
    challenges_solved: u64,
    challenges_failed: u64,
    sessions_expired: u64,
    challenge_time: Duration,
    latencies: VecDeque<Duration>,
    max_window: usize,
    last_status: Option<u16>,
}

impl OriginAccumulator {
    fn new(max_window: usize) -> Self {
        Self {
            total_requests: 0,
            successes: 0,
            failures: 0,
            challenges_solved: 0,
            challenges_failed: 0,
            sessions_expired: 0,
            challenge_time: Duration::ZERO,
            latencies: VecDeque::with_capacity(max_window),
            max_window,
            last_status: None,
        }
    }

    fn record(&mut self, status: u16, latency: Duration) {
        self.total_requests += 1;
        self.last_status = Some(status);

        if status < 500 {
            self.successes += 1;
        } else {
            self.failures += 1;
        }

        if self.latencies.len() == self.max_window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    fn latency_stats(&self) -> (Option<Duration>, Option<Duration>) {
        if self.latencies.is_empty() {
            return (None, None);
        }
        let mut samples: Vec<_> = self.latencies.iter().cloned().collect();
        samples.sort_unstable();
        let avg = samples.iter().map(|d| d.as_secs_f64()).sum::<f64>() / samples.len() as f64;
        let p95_index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        let p95 = samples[p95_index];
        (Some(Duration::from_secs_f64(avg)), Some(p95))
    }
}

#[derive(Debug)]
struct MetricsState {
    global: GlobalStats,
    max_window: usize,
    origins: HashMap<String, OriginAccumulator>,
}

impl MetricsState {
    fn new(max_window: usize) -> Self {
        Self {
            global: GlobalStats::default(),
            max_window,
            origins: HashMap::new(),
        }
    }

    fn accumulator_mut(&mut self, origin: &str) -> &mut OriginAccumulator {
        let window = self.max_window;
        self.origins
            .entry(origin.to_string())
            .or_insert_with(|| OriginAccumulator::new(window))
    }
}

/// Thread-safe metrics collector used by the orchestration layer.
#[derive(Clone, Debug)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(128))),
        }
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(window.max(16)))),
        }
    }

    fn with_state<F>(&self, f: F)
    where
        F: FnOnce(&mut MetricsState),
    {
        if let Ok(mut guard) = self.inner.lock() {
            f(&mut guard);
        }
    }

    pub fn record_response(&self, origin: &str, status: u16, latency: Duration) {
        self.with_state(|state| {
            state.global.total_requests += 1;
            if status < 500 {
                state.global.successes += 1;
            } else {
                state.global.failures += 1;
            }

            state.global.average_latency = Some(match state.global.average_latency {
                Some(avg) => {
                    Duration::from_secs_f64(avg.as_secs_f64() * 0.9 + latency.as_secs_f64() * 0.1)
                }
                None => latency,
            });

            state.accumulator_mut(origin).record(status, latency);

            let mut samples: Vec<_> = state
                .origins
                .values()
                .flat_map(|acc| acc.latencies.iter())
                .cloned()
                .collect();
            samples.sort_unstable();
            if !samples.is_empty() {
                let idx = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
                state.global.p95_latency = Some(samples[idx]);
            }
        });
    }

    pub fn record_challenge(&self, origin: &str, success: bool, elapsed: Duration) {
        self.with_state(|state| {
            if success {
                state.global.challenges_solved += 1;
            } else {
                state.global.challenges_failed += 1;
            }
            let acc = state.accumulator_mut(origin);
            if success {
                acc.challenges_solved += 1;
                acc.challenge_time += elapsed;
            } else {
                acc.challenges_failed += 1;
            }
        });
    }

    pub fn record_session_expired(&self, origin: &str) {
        self.with_state(|state| {
            state.global.sessions_expired += 1;
            state.accumulator_mut(origin).sessions_expired += 1;
        });
    }

    pub fn record_error(&self, origin: &str) {
        self.with_state(|state| {
            state.global.total_requests += 1;
            state.global.failures += 1;
            let acc = state.accumulator_mut(origin);
            acc.total_requests += 1;
            acc.failures += 1;
            acc.last_status = Some(0);
        });
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        match self.inner.lock() {
            Ok(guard) => MetricsSnapshot {
                global: guard.global.clone(),
                origins: guard
                    .origins
                    .iter()
                    .map(|(origin, acc)| OriginStats::from_accumulator(origin, acc))
                    .collect(),
            },
            Err(_) => MetricsSnapshot {
                global: GlobalStats::default(),
                origins: Vec::new(),
            },
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
