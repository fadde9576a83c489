//! Circuit breaker for target protection.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: target assumed down, calls fail fast
//! - Half-Open: a bounded number of trial calls probe recovery
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures >= failure_threshold
//! Open → Half-Open: first call attempt after recovery_timeout (lazy)
//! Half-Open → Closed: successes >= success_threshold
//! Half-Open → Open: any failure (recovery timer restarts)
//! Open | Half-Open → Closed: manual reset
//! ```
//!
//! # Design Decisions
//! - One breaker per target (service or routing endpoint), never global
//! - Each breaker owns its state behind its own lock
//! - State only changes through `transition`, which rejects illegal edges
//! - Caller-side errors (cancellation, deadline) do not count as target failures

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::error::{MeshError, MeshResult};
use crate::observability::metrics;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Edges of the state machine. Only a reset leads from open back to
    /// closed.
    fn can_transition_to(self, next: CircuitState, trigger: Trigger) -> bool {
        match trigger {
            Trigger::Outcome => matches!(
                (self, next),
                (CircuitState::Closed, CircuitState::Open)
                    | (CircuitState::Open, CircuitState::HalfOpen)
                    | (CircuitState::HalfOpen, CircuitState::Closed)
                    | (CircuitState::HalfOpen, CircuitState::Open)
            ),
            Trigger::Reset => self != CircuitState::Closed && next == CircuitState::Closed,
        }
    }
}

/// What drove a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// Call outcomes and the recovery timer.
    Outcome,
    Reset,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a breaker's bookkeeping.
#[derive(Debug, Clone)]
pub struct CircuitBreakerState {
    pub target: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure: Option<Instant>,
    pub last_success: Option<Instant>,
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub last_state_change: Instant,
    /// Earliest time an open breaker admits a trial call.
    pub next_attempt: Option<Instant>,
    /// Trial calls admitted since entering half-open.
    pub half_open_calls: u32,
}

/// Per-target circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitBreakerState>,
}

impl CircuitBreaker {
    pub fn new(target: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let inner = CircuitBreakerState {
            target: target.into(),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            last_success: None,
            failure_threshold: config.failure_threshold,
            recovery_timeout: config.recovery_timeout(),
            last_state_change: Instant::now(),
            next_attempt: None,
            half_open_calls: 0,
        };
        Self {
            config,
            inner: Mutex::new(inner),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitBreakerState> {
        self.inner.lock().expect("circuit breaker mutex poisoned")
    }

    pub fn target(&self) -> String {
        self.lock().target.clone()
    }

    /// Current state without applying the lazy open → half-open step.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        self.lock().clone()
    }

    pub fn is_open(&self) -> bool {
        self.poll_state() == CircuitState::Open
    }

    /// Apply the timed open → half-open step if due and return the state.
    pub fn poll_state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.poll(&mut inner, Instant::now());
        inner.state
    }

    /// Whether a call would currently be admitted.
    pub fn is_allowed(&self) -> bool {
        let mut inner = self.lock();
        self.poll(&mut inner, Instant::now());
        self.admits(&inner)
    }

    /// Admit a call, reserving a half-open trial slot when needed.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        self.poll(&mut inner, Instant::now());
        if !self.admits(&inner) {
            return false;
        }
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_calls += 1;
        }
        true
    }

    /// Give back a trial slot for a call that produced no verdict.
    pub fn release(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_calls = inner.half_open_calls.saturating_sub(1);
        }
    }

    pub fn record_success(&self) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.last_success = Some(now);

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.success_count = inner.success_count.saturating_add(1);
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed, now, Trigger::Outcome);
                }
            }
            // Late result of a call admitted before the trip.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.last_failure = Some(now);

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                inner.success_count = 0;
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open, now, Trigger::Outcome);
                }
            }
            CircuitState::HalfOpen => {
                inner.failure_count += 1;
                self.transition(&mut inner, CircuitState::Open, now, Trigger::Outcome);
            }
            CircuitState::Open => {
                inner.failure_count = inner.failure_count.saturating_add(1);
            }
        }
    }

    /// Run `call` if admitted and feed its outcome back into the breaker.
    ///
    /// Errors from `call` are returned unchanged; a refused call yields
    /// [`MeshError::CircuitOpen`].
    pub async fn execute<F, Fut, T>(&self, call: F) -> MeshResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = MeshResult<T>>,
    {
        if !self.try_acquire() {
            let target = self.target();
            metrics::record_circuit_rejected(&target);
            return Err(MeshError::CircuitOpen { target });
        }

        let result = call().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(e) if counts_as_failure(e) => self.record_failure(),
            Err(_) => self.release(),
        }
        result
    }

    /// Force the breaker closed and clear its counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::Closed {
            inner.failure_count = 0;
            inner.success_count = 0;
            return;
        }
        tracing::info!(target = %inner.target, from = %inner.state, "Circuit breaker reset");
        self.transition(&mut inner, CircuitState::Closed, Instant::now(), Trigger::Reset);
    }

    fn admits(&self, inner: &CircuitBreakerState) -> bool {
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => inner.half_open_calls < self.config.half_open_max_calls,
        }
    }

    fn poll(&self, inner: &mut CircuitBreakerState, now: Instant) {
        if inner.state != CircuitState::Open {
            return;
        }
        if inner.next_attempt.map_or(true, |at| now >= at) {
            self.transition(inner, CircuitState::HalfOpen, now, Trigger::Outcome);
        }
    }

    fn transition(&self, inner: &mut CircuitBreakerState, to: CircuitState, now: Instant, trigger: Trigger) {
        let from = inner.state;
        if !from.can_transition_to(to, trigger) {
            tracing::warn!(target = %inner.target, from = %from, to = %to, "Ignoring illegal circuit transition");
            return;
        }

        inner.state = to;
        inner.last_state_change = now;
        match to {
            CircuitState::Open => {
                inner.next_attempt = Some(now + inner.recovery_timeout);
                inner.success_count = 0;
                inner.half_open_calls = 0;
            }
            CircuitState::HalfOpen => {
                inner.failure_count = 0;
                inner.success_count = 0;
                inner.half_open_calls = 0;
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.success_count = 0;
                inner.half_open_calls = 0;
                inner.next_attempt = None;
            }
        }

        if to == CircuitState::Open {
            tracing::warn!(target = %inner.target, from = %from, to = %to, "Circuit breaker state change");
        } else {
            tracing::info!(target = %inner.target, from = %from, to = %to, "Circuit breaker state change");
        }
        metrics::record_circuit_state(&inner.target, to);
    }
}

/// Only failures attributable to the target trip the breaker.
fn counts_as_failure(err: &MeshError) -> bool {
    matches!(err, MeshError::Upstream { .. } | MeshError::Timeout { .. })
}

/// Breakers keyed by target name, created on first use.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, target: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(target) {
            return existing.value().clone();
        }
        self.breakers
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(target, self.config.clone())))
            .value()
            .clone()
    }

    pub fn get(&self, target: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(target).map(|r| r.value().clone())
    }

    pub fn snapshots(&self) -> Vec<CircuitBreakerState> {
        self.breakers.iter().map(|r| r.value().snapshot()).collect()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            recovery_timeout_ms: 1000,
            half_open_max_calls: 2,
        }
    }

    fn upstream_err() -> MeshError {
        MeshError::Upstream {
            target: "ml".into(),
            message: "boom".into(),
            retryable: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_after_threshold() {
        let breaker = CircuitBreaker::new("ml", config());

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.is_allowed());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.is_allowed());

        // Still open just before the recovery timeout.
        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!breaker.is_allowed());
        assert_eq!(breaker.state(), CircuitState::Open);

        // The next call attempt after the timeout moves to half-open.
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.is_allowed());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_failures() {
        let breaker = CircuitBreaker::new("ml", config());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("ml", config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(breaker.try_acquire());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_failure();
        let snap = breaker.snapshot();
        assert_eq!(snap.state, CircuitState::Open);
        assert_eq!(snap.next_attempt, Some(Instant::now() + Duration::from_millis(1000)));
        assert!(!breaker.is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_after_successes() {
        let breaker = CircuitBreaker::new("ml", config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(breaker.try_acquire());
        assert!(breaker.try_acquire());
        // Trial slots exhausted.
        assert!(!breaker.try_acquire());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_refuses_when_open() {
        let breaker = CircuitBreaker::new("ml", config());

        for _ in 0..3 {
            let result: MeshResult<()> = breaker.execute(|| async { Err(upstream_err()) }).await;
            assert!(matches!(result, Err(MeshError::Upstream { .. })));
        }

        let mut called = false;
        let result: MeshResult<u32> = breaker
            .execute(|| {
                called = true;
                async { Ok(1) }
            })
            .await;
        assert!(matches!(result, Err(MeshError::CircuitOpen { ref target }) if target == "ml"));
        assert!(!called);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_errors_do_not_trip() {
        let breaker = CircuitBreaker::new("ml", config());
        for _ in 0..5 {
            let _: MeshResult<()> = breaker.execute(|| async { Err(MeshError::Cancelled) }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_closes() {
        let breaker = CircuitBreaker::new("ml", config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_from_half_open_clears_trial_slots() {
        let breaker = CircuitBreaker::new("ml", config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(breaker.try_acquire());
        assert!(breaker.try_acquire());

        breaker.reset();
        let snap = breaker.snapshot();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.half_open_calls, 0);
        assert_eq!(snap.next_attempt, None);
        assert_eq!(snap.last_state_change, Instant::now());

        // Closed breakers follow the normal edges again.
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_reset_is_the_only_way_from_open_to_closed() {
        assert!(!CircuitState::Open.can_transition_to(CircuitState::Closed, Trigger::Outcome));
        assert!(CircuitState::Open.can_transition_to(CircuitState::Closed, Trigger::Reset));
        assert!(CircuitState::HalfOpen.can_transition_to(CircuitState::Closed, Trigger::Reset));
        assert!(!CircuitState::Closed.can_transition_to(CircuitState::Open, Trigger::Reset));
    }

    #[test]
    fn test_registry_one_breaker_per_target() {
        let registry = CircuitBreakerRegistry::new(config());
        let a1 = registry.get_or_create("a");
        let a2 = registry.get_or_create("a");
        let b = registry.get_or_create("b");

        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
        assert_eq!(registry.len(), 2);

        for _ in 0..3 {
            a1.record_failure();
        }
        assert_eq!(a2.state(), CircuitState::Open);
        assert_eq!(b.state(), CircuitState::Closed);
    }
}
