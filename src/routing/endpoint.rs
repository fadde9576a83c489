//! Routable model endpoints and their performance record.
//!
//! # Responsibilities
//! - Track outcomes, latency samples and reported accuracy per endpoint
//! - Track health-check results and active connections
//! - Own the endpoint's circuit breaker
//!
//! # Design Decisions
//! - Latency samples live in a bounded window; percentiles are computed on
//!   aggregation, the running average on every record
//! - All mutable bookkeeping sits behind one lock per endpoint
//! - Admission goes through the breaker: a half-open endpoint hands out at
//!   most `half_open_max_calls` guards, and a guard dropped without an
//!   outcome returns its trial slot

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use url::Url;

use crate::config::{CircuitBreakerConfig, EndpointConfig};
use crate::resilience::{CircuitBreaker, CircuitState};

/// Aggregated performance of one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EndpointMetrics {
    pub total_requests: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub avg_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub success_rate: f64,
    pub error_rate: f64,
    /// Mean reported accuracy, `None` until a report arrives.
    pub accuracy: Option<f64>,
}

#[derive(Debug)]
struct EndpointState {
    healthy: bool,
    last_health_check: Option<Instant>,
    samples: VecDeque<Duration>,
    latency_total: Duration,
    success_count: u64,
    error_count: u64,
    accuracy_sum: f64,
    accuracy_reports: u64,
    percentiles: (f64, f64, f64),
}

/// One model endpoint known to the router.
#[derive(Debug)]
pub struct ServiceEndpoint {
    pub name: String,
    pub url: Url,
    pub endpoint_type: String,
    pub weight: u32,
    window: usize,
    active: Arc<AtomicUsize>,
    breaker: CircuitBreaker,
    state: Mutex<EndpointState>,
}

impl ServiceEndpoint {
    /// New endpoints count as healthy and freshly checked.
    pub fn new(config: &EndpointConfig, breaker: CircuitBreakerConfig, window: usize) -> Self {
        Self {
            name: config.name.clone(),
            url: config.url.clone(),
            endpoint_type: config.endpoint_type.clone(),
            weight: config.weight,
            window: window.max(1),
            active: Arc::new(AtomicUsize::new(0)),
            breaker: CircuitBreaker::new(config.name.clone(), breaker),
            state: Mutex::new(EndpointState {
                healthy: true,
                last_health_check: Some(Instant::now()),
                samples: VecDeque::new(),
                latency_total: Duration::ZERO,
                success_count: 0,
                error_count: 0,
                accuracy_sum: 0.0,
                accuracy_reports: 0,
                percentiles: (0.0, 0.0, 0.0),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EndpointState> {
        self.state.lock().expect("endpoint mutex poisoned")
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn is_healthy(&self) -> bool {
        self.lock().healthy
    }

    pub fn last_health_check(&self) -> Option<Instant> {
        self.lock().last_health_check
    }

    /// Store a health-check result. Returns true when the flag flipped.
    pub fn set_health(&self, healthy: bool, checked_at: Instant) -> bool {
        let mut state = self.lock();
        let changed = state.healthy != healthy;
        state.healthy = healthy;
        state.last_health_check = Some(checked_at);
        changed
    }

    /// Healthy, checked within `ttl`, and the breaker would admit a call.
    /// Reserves nothing; see [`ServiceEndpoint::admit`].
    pub fn is_routable(&self, ttl: Duration, now: Instant) -> bool {
        let fresh = {
            let state = self.lock();
            state.healthy
                && state
                    .last_health_check
                    .is_some_and(|at| now.saturating_duration_since(at) <= ttl)
        };
        fresh && self.breaker.is_allowed()
    }

    /// Reserve a breaker slot and count an in-flight request.
    ///
    /// `None` when the breaker refuses the call.
    pub fn admit(self: &Arc<Self>) -> Option<EndpointGuard> {
        let trial = self.breaker.state() != CircuitState::Closed;
        if !self.breaker.try_acquire() {
            return None;
        }
        self.active.fetch_add(1, Ordering::AcqRel);
        Some(EndpointGuard {
            endpoint: Arc::clone(self),
            trial,
            settled: false,
        })
    }

    /// Feed one call outcome into the metrics and the breaker.
    pub fn record_outcome(&self, latency: Duration, success: bool) {
        self.record(latency, success);
        if success {
            self.breaker.record_success();
        } else {
            self.breaker.record_failure();
        }
    }

    pub fn record(&self, latency: Duration, success: bool) {
        let mut state = self.lock();
        if state.samples.len() == self.window {
            if let Some(oldest) = state.samples.pop_front() {
                state.latency_total = state.latency_total.saturating_sub(oldest);
            }
        }
        state.samples.push_back(latency);
        state.latency_total += latency;
        if success {
            state.success_count += 1;
        } else {
            state.error_count += 1;
        }
    }

    /// Accuracy report in `[0, 1]`; out-of-range values are clamped.
    pub fn record_accuracy(&self, accuracy: f64) {
        let mut state = self.lock();
        state.accuracy_sum += accuracy.clamp(0.0, 1.0);
        state.accuracy_reports += 1;
    }

    /// Recompute latency percentiles from the sample window.
    pub fn aggregate(&self) -> EndpointMetrics {
        let mut state = self.lock();
        let mut sorted: Vec<Duration> = state.samples.iter().copied().collect();
        sorted.sort_unstable();
        state.percentiles = (
            percentile_ms(&sorted, 0.50),
            percentile_ms(&sorted, 0.95),
            percentile_ms(&sorted, 0.99),
        );
        snapshot(&state)
    }

    /// Latest metrics; percentiles are as of the last `aggregate`.
    pub fn metrics(&self) -> EndpointMetrics {
        snapshot(&self.lock())
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

fn snapshot(state: &EndpointState) -> EndpointMetrics {
    let total = state.success_count + state.error_count;
    let (success_rate, error_rate) = if total == 0 {
        (0.0, 0.0)
    } else {
        (
            state.success_count as f64 / total as f64,
            state.error_count as f64 / total as f64,
        )
    };
    let avg_latency_ms = if state.samples.is_empty() {
        0.0
    } else {
        state.latency_total.as_secs_f64() * 1000.0 / state.samples.len() as f64
    };
    EndpointMetrics {
        total_requests: total,
        success_count: state.success_count,
        error_count: state.error_count,
        avg_latency_ms,
        p50_latency_ms: state.percentiles.0,
        p95_latency_ms: state.percentiles.1,
        p99_latency_ms: state.percentiles.2,
        success_rate,
        error_rate,
        accuracy: (state.accuracy_reports > 0).then(|| state.accuracy_sum / state.accuracy_reports as f64),
    }
}

/// Nearest-rank percentile over sorted samples.
fn percentile_ms(sorted: &[Duration], quantile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (quantile * sorted.len() as f64).ceil() as usize;
    let index = rank.clamp(1, sorted.len()) - 1;
    sorted[index].as_secs_f64() * 1000.0
}

/// An admitted request against one endpoint.
///
/// Counts as an active connection until dropped. Dropping it without
/// [`EndpointGuard::finish`] gives back a half-open trial slot.
#[derive(Debug)]
pub struct EndpointGuard {
    endpoint: Arc<ServiceEndpoint>,
    /// Admitted while the breaker was probing recovery.
    trial: bool,
    settled: bool,
}

impl EndpointGuard {
    pub fn endpoint(&self) -> &Arc<ServiceEndpoint> {
        &self.endpoint
    }

    /// Report the call outcome and end the request.
    pub fn finish(mut self, latency: Duration, success: bool) {
        self.endpoint.record_outcome(latency, success);
        self.settled = true;
    }
}

impl Drop for EndpointGuard {
    fn drop(&mut self) {
        self.endpoint.active.fetch_sub(1, Ordering::AcqRel);
        if self.trial && !self.settled {
            self.endpoint.breaker.release();
        }
    }
}
