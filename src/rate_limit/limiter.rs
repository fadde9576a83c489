//! Enhanced per-provider rate limiter.
//!
//! # Responsibilities
//! - Enforce a fixed-window quota per provider
//! - Shape rejections with the configured strategy
//! - Prefer a fallback provider over retrying an exhausted primary
//! - Run the optimization sublayer (cache, predictive, adaptive, groups, shaping)
//!
//! # Design Decisions
//! - Unknown providers get the default quota on first use
//! - Window accounting happens under the limiter lock; breakers, fallbacks,
//!   cache and stats each have their own
//! - Every wait goes through the caller's context

use std::collections::HashMap;
use std::future::Future;
use std::sync::RwLock;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::error::{MeshError, MeshResult};
use crate::observability::metrics;
use crate::rate_limit::fallback::FallbackRegistry;
use crate::rate_limit::optimizer::{ProviderStats, RateLimitOptimizer};
use crate::rate_limit::strategy::RateLimitStrategy;
use crate::resilience::backoff::calculate_backoff;
use crate::resilience::circuit_breaker::{CircuitBreakerRegistry, CircuitBreakerState};
use crate::resilience::context::Context;

/// Window state of one provider.
#[derive(Debug, Clone)]
pub struct ProviderRateLimit {
    pub provider: String,
    /// Current (possibly adapted) quota per window.
    pub requests_per_minute: u32,
    /// Configured quota; adaptive limits are bounded relative to it.
    pub base_limit: u32,
    pub current_requests: u32,
    pub window_start: Instant,
    pub quota_exceeded: bool,
    pub retry_at: Option<Instant>,
    pub consecutive_rejections: u32,
    pub success_count: u64,
    pub failure_count: u64,
    /// Outcomes since the last adaptive adjustment.
    pub recent_successes: u64,
    pub recent_failures: u64,
    pub last_adjusted: Option<Instant>,
}

impl ProviderRateLimit {
    pub fn new(provider: impl Into<String>, requests_per_minute: u32, now: Instant) -> Self {
        Self {
            provider: provider.into(),
            requests_per_minute,
            base_limit: requests_per_minute,
            current_requests: 0,
            window_start: now,
            quota_exceeded: false,
            retry_at: None,
            consecutive_rejections: 0,
            success_count: 0,
            failure_count: 0,
            recent_successes: 0,
            recent_failures: 0,
            last_adjusted: None,
        }
    }

    pub fn window_end(&self, window: Duration) -> Instant {
        self.window_start + window
    }

    fn roll_window(&mut self, now: Instant, window: Duration) {
        if now.saturating_duration_since(self.window_start) >= window {
            self.window_start = now;
            self.current_requests = 0;
            self.quota_exceeded = false;
            self.retry_at = None;
        }
    }

    fn try_admit(&mut self, window: Duration) -> bool {
        if self.current_requests < self.requests_per_minute {
            self.current_requests += 1;
            self.consecutive_rejections = 0;
            return true;
        }
        self.quota_exceeded = true;
        self.retry_at = Some(self.window_end(window));
        self.consecutive_rejections = self.consecutive_rejections.saturating_add(1);
        false
    }

    pub fn remaining(&self) -> u32 {
        self.requests_per_minute.saturating_sub(self.current_requests)
    }

    pub fn usage_ratio(&self) -> f64 {
        if self.requests_per_minute == 0 {
            return 1.0;
        }
        self.current_requests as f64 / self.requests_per_minute as f64
    }
}

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    QuotaExceeded,
    Predictive,
    CircuitOpen,
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone)]
pub struct RateLimitResult {
    pub provider: String,
    pub allowed: bool,
    pub remaining_requests: u32,
    pub limit: u32,
    /// End of the window that produced this decision.
    pub reset_at: Instant,
    /// Time until a retry can succeed, set on rejection.
    pub retry_after: Option<Duration>,
    /// Wait suggested by the backoff or jitter strategy.
    pub wait_time: Option<Duration>,
    pub should_retry: bool,
    pub retry_count: u32,
    pub fallback_provider: Option<String>,
    pub reason: Option<RejectReason>,
    pub from_cache: bool,
}

impl RateLimitResult {
    fn admitted(provider: &str, state: &ProviderRateLimit, window: Duration) -> Self {
        Self {
            provider: provider.to_string(),
            allowed: true,
            remaining_requests: state.remaining(),
            limit: state.requests_per_minute,
            reset_at: state.window_end(window),
            retry_after: None,
            wait_time: None,
            should_retry: false,
            retry_count: 0,
            fallback_provider: None,
            reason: None,
            from_cache: false,
        }
    }

    fn rejected(
        provider: &str,
        state: &ProviderRateLimit,
        window: Duration,
        reason: RejectReason,
        retry_after: Duration,
    ) -> Self {
        Self {
            allowed: false,
            remaining_requests: 0,
            retry_after: Some(retry_after),
            reason: Some(reason),
            ..Self::admitted(provider, state, window)
        }
    }

    /// Typed error for a rejection, `None` when admitted.
    pub fn to_error(&self) -> Option<MeshError> {
        if self.allowed {
            return None;
        }
        Some(match self.reason {
            Some(RejectReason::CircuitOpen) => MeshError::CircuitOpen {
                target: self.provider.clone(),
            },
            _ => MeshError::RateLimitExceeded {
                provider: self.provider.clone(),
                retry_after: self.retry_after.unwrap_or_default(),
            },
        })
    }
}

/// Windowed quota enforcement with fallback and optimization.
#[derive(Debug)]
pub struct EnhancedRateLimiter {
    config: RateLimitConfig,
    provider_limits: HashMap<String, u32>,
    limits: RwLock<HashMap<String, ProviderRateLimit>>,
    breakers: CircuitBreakerRegistry,
    fallbacks: FallbackRegistry,
    optimizer: RateLimitOptimizer,
}

impl EnhancedRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let provider_limits = config
            .providers
            .iter()
            .map(|p| (p.name.clone(), p.requests_per_minute))
            .collect();
        let breakers = CircuitBreakerRegistry::new(config.circuit_breaker.clone());
        let fallbacks = FallbackRegistry::from_config(
            &config.fallback_providers,
            config.min_fallback_success_rate,
            config.fallback_retry(),
        );
        let optimizer = RateLimitOptimizer::new(config.optimization.clone());
        Self {
            config,
            provider_limits,
            limits: RwLock::new(HashMap::new()),
            breakers,
            fallbacks,
            optimizer,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn fallbacks(&self) -> &FallbackRegistry {
        &self.fallbacks
    }

    fn window(&self) -> Duration {
        self.config.window()
    }

    fn configured_limit(&self, provider: &str) -> u32 {
        self.provider_limits
            .get(provider)
            .copied()
            .unwrap_or(self.config.default_requests_per_minute)
    }

    /// Run `f` on the provider's state with its window rolled forward.
    fn with_limit<R>(&self, provider: &str, now: Instant, f: impl FnOnce(&mut ProviderRateLimit) -> R) -> R {
        let window = self.window();
        let mut limits = self.limits.write().expect("rate limiter lock poisoned");
        let state = limits
            .entry(provider.to_string())
            .or_insert_with(|| ProviderRateLimit::new(provider, self.configured_limit(provider), now));
        state.roll_window(now, window);
        f(state)
    }

    /// Fixed-window admission for one request.
    pub fn check_rate_limit(&self, provider: &str) -> RateLimitResult {
        let now = Instant::now();
        let window = self.window();

        if !self.config.enabled {
            let state = ProviderRateLimit::new(provider, u32::MAX, now);
            return RateLimitResult::admitted(provider, &state, window);
        }

        let breaker = (self.config.strategy == RateLimitStrategy::CircuitBreaker)
            .then(|| self.breakers.get_or_create(provider));

        if let Some(breaker) = &breaker {
            if !breaker.try_acquire() {
                let state = self.with_limit(provider, now, |s| s.clone());
                let retry_after = breaker
                    .snapshot()
                    .next_attempt
                    .map(|at| at.saturating_duration_since(now))
                    .unwrap_or_default();
                let mut result = RateLimitResult::rejected(provider, &state, window, RejectReason::CircuitOpen, retry_after);
                result.fallback_provider = self.fallbacks.select();
                self.account(&result);
                return result;
            }
        }

        let (allowed, state) = self.with_limit(provider, now, |s| (s.try_admit(window), s.clone()));

        let result = if allowed {
            if let Some(breaker) = &breaker {
                breaker.record_success();
            }
            RateLimitResult::admitted(provider, &state, window)
        } else {
            let retry_at = state.retry_at.unwrap_or_else(|| state.window_end(window));
            let mut result = RateLimitResult::rejected(
                provider,
                &state,
                window,
                RejectReason::QuotaExceeded,
                retry_at.saturating_duration_since(now),
            );
            self.apply_strategy(&mut result, state.consecutive_rejections);
            if let Some(breaker) = &breaker {
                breaker.record_failure();
            }
            result.fallback_provider = self.fallbacks.select();
            result
        };

        self.account(&result);
        result
    }

    fn apply_strategy(&self, result: &mut RateLimitResult, rejections: u32) {
        let retry = &self.config.retry;
        match self.config.strategy {
            RateLimitStrategy::Retry | RateLimitStrategy::ExponentialBackoff | RateLimitStrategy::Jitter => {
                result.retry_count = rejections;
                result.should_retry = rejections <= retry.max_retries;
                result.wait_time = self.config.strategy.wait_time(rejections, retry);
            }
            RateLimitStrategy::FailFast | RateLimitStrategy::CircuitBreaker => {}
        }
    }

    fn account(&self, result: &RateLimitResult) {
        self.optimizer.update_stats(&result.provider, |s| {
            s.requests += 1;
            if result.allowed {
                s.admitted += 1;
            } else {
                s.rejected += 1;
            }
            if result.reason == Some(RejectReason::Predictive) {
                s.predictive_rejections += 1;
            }
        });
        metrics::record_rate_limit_decision(&result.provider, result.allowed);
        if !result.allowed {
            tracing::debug!(
                provider = %result.provider,
                reason = ?result.reason,
                retry_after_ms = result.retry_after.unwrap_or_default().as_millis() as u64,
                fallback = ?result.fallback_provider,
                "Rate limit rejection"
            );
        }
    }

    /// Admission through the optimization sublayer.
    ///
    /// `provider` may name a provider group when group load balancing is on;
    /// the returned result names the member that was charged.
    pub async fn check_rate_limit_optimized(&self, ctx: &Context, provider: &str) -> MeshResult<RateLimitResult> {
        ctx.check()?;
        let provider = self.resolve_provider(provider);
        let provider = provider.as_str();

        // A cached rejection was decided against the old limit.
        if self.config.enabled && self.maybe_adapt(provider, Instant::now()) {
            self.optimizer.forget(provider);
        }

        if let Some(hit) = self.optimizer.cached(provider) {
            self.optimizer.update_stats(provider, |s| {
                s.requests += 1;
                s.rejected += 1;
                s.cache_hits += 1;
            });
            metrics::record_cache_hit();
            return Ok(hit);
        }

        if self.config.enabled {
            let now = Instant::now();
            let window = self.window();

            if self.optimizer.predictive_reject(self.usage_ratio(provider)) {
                let state = self.with_limit(provider, now, |s| s.clone());
                let retry_after = state.window_end(window).saturating_duration_since(now);
                let mut result = RateLimitResult::rejected(provider, &state, window, RejectReason::Predictive, retry_after);
                result.fallback_provider = self.fallbacks.select();
                self.account(&result);
                self.optimizer.remember(&result);
                return Ok(result);
            }
        }

        let result = self.check_rate_limit(provider);
        if !result.allowed {
            self.optimizer.remember(&result);
            return Ok(result);
        }

        if let Some(delay) = self.optimizer.shaping_delay(self.window(), result.limit) {
            self.optimizer.update_stats(provider, |s| s.shaped_requests += 1);
            ctx.sleep(delay).await?;
        }
        Ok(result)
    }

    fn resolve_provider(&self, name: &str) -> String {
        if !self.optimizer.config().load_balancing_enabled {
            return name.to_string();
        }
        match self.config.provider_groups.get(name) {
            Some(members) => self
                .optimizer
                .select_from_group(name, members, |m| self.usage_ratio(m))
                .unwrap_or_else(|| name.to_string()),
            None => name.to_string(),
        }
    }

    /// Returns true when the provider's limit changed.
    fn maybe_adapt(&self, provider: &str, now: Instant) -> bool {
        let window = self.window();
        let changed = self.with_limit(provider, now, |state| {
            let target = self.optimizer.adaptive_target(state, window, now)?;
            let previous = state.requests_per_minute;
            state.requests_per_minute = target;
            state.last_adjusted = Some(now);
            state.recent_successes = 0;
            state.recent_failures = 0;
            Some((previous, target))
        });

        if let Some((previous, target)) = changed {
            tracing::info!(provider = %provider, from = previous, to = target, "Adaptive rate limit adjusted");
            self.optimizer.update_stats(provider, |s| s.adaptive_adjustments += 1);
            metrics::record_adaptive_limit(provider, target);
        }
        changed.is_some()
    }

    /// Current window usage, 0 for providers never seen or whose window elapsed.
    pub fn usage_ratio(&self, provider: &str) -> f64 {
        let limits = self.limits.read().expect("rate limiter lock poisoned");
        match limits.get(provider) {
            Some(state) if Instant::now().saturating_duration_since(state.window_start) < self.window() => {
                state.usage_ratio()
            }
            _ => 0.0,
        }
    }

    /// Feed a call outcome into the provider's success bookkeeping.
    pub fn record_outcome(&self, provider: &str, success: bool) {
        self.with_limit(provider, Instant::now(), |state| {
            if success {
                state.success_count += 1;
                state.recent_successes += 1;
            } else {
                state.failure_count += 1;
                state.recent_failures += 1;
            }
        });
    }

    /// Run `primary` under the provider's quota, falling back when it is exhausted.
    ///
    /// If a fallback was used and failed, its error is returned.
    pub async fn execute_with_fallback<T, P, PF, B, BF>(
        &self,
        ctx: &Context,
        provider: &str,
        primary: P,
        fallback: B,
    ) -> MeshResult<T>
    where
        P: Fn() -> PF,
        PF: Future<Output = MeshResult<T>>,
        B: Fn(String) -> BF,
        BF: Future<Output = MeshResult<T>>,
    {
        ctx.check()?;

        let check = self.check_rate_limit(provider);
        if check.allowed {
            let result = primary().await;
            self.record_outcome(provider, result.is_ok());
            return result;
        }

        if let Some(name) = self.fallbacks.select() {
            tracing::info!(provider = %provider, fallback = %name, "Primary rate limited, using fallback provider");
            return self.run_fallback(&name, &fallback).await;
        }

        let first = check.to_error().unwrap_or_else(|| MeshError::RateLimitExceeded {
            provider: provider.to_string(),
            retry_after: Duration::ZERO,
        });
        self.retry_with_backoff(ctx, provider, &primary, &fallback, first).await
    }

    async fn run_fallback<T, B, BF>(&self, name: &str, fallback: &B) -> MeshResult<T>
    where
        B: Fn(String) -> BF,
        BF: Future<Output = MeshResult<T>>,
    {
        let result = fallback(name.to_string()).await;
        self.fallbacks.record_result(name, result.is_ok());
        if let Err(e) = &result {
            tracing::warn!(fallback = %name, error = %e, "Fallback provider failed");
        }
        result
    }

    /// Alternate primary retries with fallback attempts until retries run out.
    async fn retry_with_backoff<T, P, PF, B, BF>(
        &self,
        ctx: &Context,
        provider: &str,
        primary: &P,
        fallback: &B,
        first_error: MeshError,
    ) -> MeshResult<T>
    where
        P: Fn() -> PF,
        PF: Future<Output = MeshResult<T>>,
        B: Fn(String) -> BF,
        BF: Future<Output = MeshResult<T>>,
    {
        let max_retries = self.config.retry.max_retries;
        let mut last_error = first_error;
        let mut attempts = 0u32;

        for attempt in 0..max_retries {
            ctx.sleep(calculate_backoff(attempt, &self.config.retry)).await?;
            attempts += 1;

            let check = self.check_rate_limit(provider);
            if check.allowed {
                match primary().await {
                    Ok(value) => {
                        self.record_outcome(provider, true);
                        return Ok(value);
                    }
                    Err(e) => {
                        self.record_outcome(provider, false);
                        last_error = e;
                    }
                }
            } else if let Some(err) = check.to_error() {
                last_error = err;
            }

            if let Some(name) = self.fallbacks.select() {
                match self.run_fallback(&name, fallback).await {
                    Ok(value) => return Ok(value),
                    Err(e) => last_error = e,
                }
            }
        }

        tracing::warn!(provider = %provider, attempts, error = %last_error, "All providers failed");
        Err(MeshError::AllProvidersFailed {
            provider: provider.to_string(),
            attempts,
            last_error: Box::new(last_error),
        })
    }

    /// Override a provider's quota (base and current).
    pub fn set_limit(&self, provider: &str, requests_per_minute: u32) {
        self.with_limit(provider, Instant::now(), |state| {
            state.requests_per_minute = requests_per_minute;
            state.base_limit = requests_per_minute;
        });
        self.optimizer.forget(provider);
    }

    /// Forget all window state for a provider.
    pub fn reset(&self, provider: &str) {
        self.limits
            .write()
            .expect("rate limiter lock poisoned")
            .remove(provider);
        self.optimizer.forget(provider);
        if let Some(breaker) = self.breakers.get(provider) {
            breaker.reset();
        }
    }

    pub fn provider_state(&self, provider: &str) -> Option<ProviderRateLimit> {
        self.limits
            .read()
            .expect("rate limiter lock poisoned")
            .get(provider)
            .cloned()
    }

    pub fn breaker_state(&self, provider: &str) -> Option<CircuitBreakerState> {
        self.breakers.get(provider).map(|b| b.snapshot())
    }

    pub fn stats(&self) -> HashMap<String, ProviderStats> {
        self.optimizer.stats()
    }

    pub fn stats_for(&self, provider: &str) -> ProviderStats {
        self.optimizer.stats_for(provider)
    }

    /// Purge expired cache entries. Driven by the cleanup worker.
    pub fn cleanup_cache(&self) -> usize {
        let removed = self.optimizer.cleanup_cache();
        if removed > 0 {
            tracing::debug!(removed, remaining = self.optimizer.cache_len(), "Rate limit cache cleanup");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FallbackProviderConfig, ProviderLimitConfig};
    use crate::rate_limit::fallback::FallbackProvider;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(rpm: u32) -> RateLimitConfig {
        RateLimitConfig {
            default_requests_per_minute: rpm,
            ..RateLimitConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exact_quota_then_reject() {
        let limiter = EnhancedRateLimiter::new(config(3));
        let start = Instant::now();

        for expected_remaining in [2, 1, 0] {
            let result = limiter.check_rate_limit("bert");
            assert!(result.allowed);
            assert_eq!(result.remaining_requests, expected_remaining);
        }

        tokio::time::advance(Duration::from_secs(10)).await;
        let rejected = limiter.check_rate_limit("bert");
        assert!(!rejected.allowed);
        assert_eq!(rejected.reason, Some(RejectReason::QuotaExceeded));
        assert_eq!(rejected.reset_at, start + Duration::from_secs(60));
        assert_eq!(rejected.retry_after, Some(Duration::from_secs(50)));
        assert!(limiter.provider_state("bert").unwrap().quota_exceeded);

        match rejected.to_error() {
            Some(MeshError::RateLimitExceeded { retry_after, .. }) => {
                assert_eq!(retry_after, Duration::from_secs(50))
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets() {
        let limiter = EnhancedRateLimiter::new(config(1));
        assert!(limiter.check_rate_limit("bert").allowed);
        assert!(!limiter.check_rate_limit("bert").allowed);

        tokio::time::advance(Duration::from_secs(60)).await;
        let result = limiter.check_rate_limit("bert");
        assert!(result.allowed);
        assert!(!limiter.provider_state("bert").unwrap().quota_exceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_provider_quotas() {
        let mut cfg = config(1);
        cfg.providers.push(ProviderLimitConfig {
            name: "bert".into(),
            requests_per_minute: 2,
        });
        let limiter = EnhancedRateLimiter::new(cfg);

        assert!(limiter.check_rate_limit("bert").allowed);
        assert!(limiter.check_rate_limit("bert").allowed);
        assert!(!limiter.check_rate_limit("bert").allowed);
        assert!(limiter.check_rate_limit("other").allowed);
        assert!(!limiter.check_rate_limit("other").allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_strategy_grows() {
        let mut cfg = config(1);
        cfg.strategy = RateLimitStrategy::ExponentialBackoff;
        cfg.retry.jitter_factor = 0.0;
        let limiter = EnhancedRateLimiter::new(cfg);

        limiter.check_rate_limit("bert");
        let first = limiter.check_rate_limit("bert");
        let second = limiter.check_rate_limit("bert");
        assert_eq!(first.wait_time, Some(Duration::from_millis(100)));
        assert_eq!(second.wait_time, Some(Duration::from_millis(200)));
        assert_eq!(second.retry_count, 2);
        assert!(second.should_retry);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_strategy() {
        let mut cfg = config(1);
        cfg.strategy = RateLimitStrategy::CircuitBreaker;
        cfg.circuit_breaker.failure_threshold = 2;
        let limiter = EnhancedRateLimiter::new(cfg);

        assert!(limiter.check_rate_limit("bert").allowed);
        limiter.check_rate_limit("bert");
        limiter.check_rate_limit("bert");

        let refused = limiter.check_rate_limit("bert");
        assert_eq!(refused.reason, Some(RejectReason::CircuitOpen));
        assert!(matches!(refused.to_error(), Some(MeshError::CircuitOpen { .. })));
        assert_eq!(
            limiter.breaker_state("bert").unwrap().state,
            crate::resilience::CircuitState::Open
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_suggests_fallback() {
        let mut cfg = config(1);
        cfg.fallback_providers.push(FallbackProviderConfig {
            name: "rules".into(),
            priority: 1,
            success_rate: 1.0,
            available: true,
        });
        let limiter = EnhancedRateLimiter::new(cfg);

        assert!(limiter.check_rate_limit("bert").fallback_provider.is_none());
        let rejected = limiter.check_rate_limit("bert");
        assert_eq!(rejected.fallback_provider.as_deref(), Some("rules"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_prefers_fallback() {
        let limiter = EnhancedRateLimiter::new(config(1));
        limiter.fallbacks().register(FallbackProvider::new("rules", 1));
        let ctx = Context::background();

        let first: MeshResult<String> = limiter
            .execute_with_fallback(&ctx, "bert", || async { Ok("primary".to_string()) }, |fb| async move {
                Ok(fb)
            })
            .await;
        assert_eq!(first.unwrap(), "primary");

        let second: MeshResult<String> = limiter
            .execute_with_fallback(&ctx, "bert", || async { Ok("primary".to_string()) }, |fb| async move {
                Ok(fb)
            })
            .await;
        assert_eq!(second.unwrap(), "rules");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_fallback_returns_its_error() {
        let limiter = EnhancedRateLimiter::new(config(0));
        limiter.fallbacks().register(FallbackProvider::new("rules", 1));

        let result: MeshResult<()> = limiter
            .execute_with_fallback(
                &Context::background(),
                "bert",
                || async { Ok(()) },
                |fb| async move {
                    Err(MeshError::Upstream {
                        target: fb,
                        message: "down".into(),
                        retryable: false,
                    })
                },
            )
            .await;

        assert!(matches!(result, Err(MeshError::Upstream { ref target, .. }) if target == "rules"));
        assert!(limiter.fallbacks().snapshot()[0].success_rate < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_providers_failed() {
        let mut cfg = config(0);
        cfg.retry.max_retries = 2;
        let limiter = EnhancedRateLimiter::new(cfg);
        let calls = AtomicU32::new(0);

        let result: MeshResult<()> = limiter
            .execute_with_fallback(
                &Context::background(),
                "bert",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
                |_| async { Ok(()) },
            )
            .await;

        match result {
            Err(MeshError::AllProvidersFailed { attempts, last_error, .. }) => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last_error, MeshError::RateLimitExceeded { .. }));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_in_next_window() {
        let mut cfg = config(1);
        cfg.window_secs = 1;
        cfg.retry.max_retries = 3;
        cfg.retry.base_delay_ms = 600;
        cfg.retry.max_delay_ms = 2000;
        cfg.retry.jitter_factor = 0.0;
        let limiter = EnhancedRateLimiter::new(cfg);
        let ctx = Context::background();

        limiter.check_rate_limit("bert");
        let result: MeshResult<&str> = limiter
            .execute_with_fallback(&ctx, "bert", || async { Ok("primary") }, |_| async { Ok("fallback") })
            .await;
        assert_eq!(result.unwrap(), "primary");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_context_aborts_retry() {
        let mut cfg = config(0);
        cfg.retry.base_delay_ms = 10_000;
        cfg.retry.max_delay_ms = 10_000;
        let limiter = EnhancedRateLimiter::new(cfg);
        let ctx = Context::with_timeout(Duration::from_millis(50));

        let result: MeshResult<()> = limiter
            .execute_with_fallback(&ctx, "bert", || async { Ok(()) }, |_| async { Ok(()) })
            .await;
        assert!(matches!(result, Err(MeshError::DeadlineExceeded)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_optimized_caches_rejections() {
        let limiter = EnhancedRateLimiter::new(config(1));
        let ctx = Context::background();

        assert!(limiter.check_rate_limit_optimized(&ctx, "bert").await.unwrap().allowed);
        let rejected = limiter.check_rate_limit_optimized(&ctx, "bert").await.unwrap();
        assert!(!rejected.allowed && !rejected.from_cache);

        let cached = limiter.check_rate_limit_optimized(&ctx, "bert").await.unwrap();
        assert!(!cached.allowed && cached.from_cache);

        let stats = limiter.stats_for("bert");
        assert_eq!(stats.requests, 3);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.rejected, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_predictive_rejects_early() {
        let mut cfg = config(10);
        cfg.optimization.predictive_enabled = true;
        cfg.optimization.predictive_threshold = 0.8;
        cfg.optimization.cache_enabled = false;
        let limiter = EnhancedRateLimiter::new(cfg);
        let ctx = Context::background();

        for _ in 0..8 {
            assert!(limiter.check_rate_limit_optimized(&ctx, "bert").await.unwrap().allowed);
        }
        let result = limiter.check_rate_limit_optimized(&ctx, "bert").await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.reason, Some(RejectReason::Predictive));
        assert_eq!(limiter.provider_state("bert").unwrap().current_requests, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_raises_limit() {
        let mut cfg = config(10);
        cfg.optimization.adaptive_enabled = true;
        cfg.optimization.adaptive_min_samples = 5;
        let limiter = EnhancedRateLimiter::new(cfg);
        let ctx = Context::background();

        for _ in 0..5 {
            limiter.record_outcome("bert", true);
        }
        let result = limiter.check_rate_limit_optimized(&ctx, "bert").await.unwrap();
        assert_eq!(result.limit, 11);
        assert_eq!(limiter.stats_for("bert").adaptive_adjustments, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_raise_clears_cached_rejection() {
        let mut cfg = config(1);
        cfg.optimization.adaptive_enabled = true;
        cfg.optimization.adaptive_min_samples = 3;
        cfg.optimization.cache_ttl_ms = 30_000;
        let limiter = EnhancedRateLimiter::new(cfg);
        let ctx = Context::background();

        assert!(limiter.check_rate_limit_optimized(&ctx, "bert").await.unwrap().allowed);
        assert!(!limiter.check_rate_limit_optimized(&ctx, "bert").await.unwrap().allowed);
        assert!(limiter.check_rate_limit_optimized(&ctx, "bert").await.unwrap().from_cache);

        for _ in 0..3 {
            limiter.record_outcome("bert", true);
        }
        let result = limiter.check_rate_limit_optimized(&ctx, "bert").await.unwrap();
        assert!(result.allowed);
        assert!(!result.from_cache);
        assert_eq!(result.limit, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_round_robin() {
        let mut cfg = config(5);
        cfg.optimization.load_balancing_enabled = true;
        cfg.provider_groups
            .insert("classifiers".into(), vec!["bert".into(), "roberta".into()]);
        let limiter = EnhancedRateLimiter::new(cfg);
        let ctx = Context::background();

        let first = limiter.check_rate_limit_optimized(&ctx, "classifiers").await.unwrap();
        let second = limiter.check_rate_limit_optimized(&ctx, "classifiers").await.unwrap();
        assert_eq!(first.provider, "bert");
        assert_eq!(second.provider, "roberta");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shaping_delays_admission() {
        let mut cfg = config(60);
        cfg.optimization.shaping_enabled = true;
        cfg.optimization.shaping_factor = 0.1;
        cfg.optimization.shaping_max_delay_ms = 500;
        let limiter = EnhancedRateLimiter::new(cfg);

        let start = Instant::now();
        let result = limiter
            .check_rate_limit_optimized(&Context::background(), "bert")
            .await
            .unwrap();
        assert!(result.allowed);
        // 60s / 60 × 0.1
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_disabled_always_admits() {
        let mut cfg = config(1);
        cfg.enabled = false;
        let limiter = EnhancedRateLimiter::new(cfg);
        for _ in 0..5 {
            assert!(limiter.check_rate_limit("bert").allowed);
        }
    }
}
