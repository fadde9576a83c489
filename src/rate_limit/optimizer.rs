//! Optimization sublayer for the rate limiter.
//!
//! # Responsibilities
//! - Short-circuit repeated rejections through the decision cache
//! - Reject early when a window is nearly used up (predictive)
//! - Nudge per-provider limits up or down from observed success rates (adaptive)
//! - Spread load over providers of one group
//! - Compute rate-shaping delays
//! - Keep per-provider statistics
//!
//! # Design Decisions
//! - Only rejections are cached; admissions must always be counted
//! - A cached rejection never outlives the window that produced it
//! - Adaptive limits move at most once per window and stay within
//!   `[1, base × adaptive_max_factor]`

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::OptimizationConfig;
use crate::rate_limit::cache::DecisionCache;
use crate::rate_limit::limiter::{ProviderRateLimit, RateLimitResult};
use crate::rate_limit::strategy::ProviderSelection;

/// Per-provider counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProviderStats {
    pub requests: u64,
    pub admitted: u64,
    pub rejected: u64,
    pub cache_hits: u64,
    pub predictive_rejections: u64,
    pub adaptive_adjustments: u64,
    pub shaped_requests: u64,
}

#[derive(Debug)]
pub struct RateLimitOptimizer {
    config: OptimizationConfig,
    cache: DecisionCache<RateLimitResult>,
    stats: Mutex<HashMap<String, ProviderStats>>,
    group_cursors: Mutex<HashMap<String, usize>>,
}

impl RateLimitOptimizer {
    pub fn new(config: OptimizationConfig) -> Self {
        let cache = DecisionCache::new(config.cache_max_size);
        Self {
            config,
            cache,
            stats: Mutex::new(HashMap::new()),
            group_cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &OptimizationConfig {
        &self.config
    }

    /// Cached rejection for `provider`, with `retry_after` re-based on now.
    pub fn cached(&self, provider: &str) -> Option<RateLimitResult> {
        if !self.config.cache_enabled {
            return None;
        }
        let mut hit = self.cache.get(provider)?;
        hit.retry_after = Some(hit.reset_at.saturating_duration_since(Instant::now()));
        hit.from_cache = true;
        Some(hit)
    }

    pub fn remember(&self, result: &RateLimitResult) {
        if !self.config.cache_enabled || result.allowed {
            return;
        }
        let until_reset = result.reset_at.saturating_duration_since(Instant::now());
        let ttl = self.config.cache_ttl().min(until_reset);
        if ttl.is_zero() {
            return;
        }
        self.cache.insert(result.provider.clone(), result.clone(), ttl);
    }

    pub fn forget(&self, provider: &str) {
        self.cache.remove(provider);
    }

    pub fn cleanup_cache(&self) -> usize {
        self.cache.purge_expired()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Pick a member of a provider group. `usage` reports a member's
    /// current window usage ratio.
    pub fn select_from_group<F>(&self, group: &str, members: &[String], usage: F) -> Option<String>
    where
        F: Fn(&str) -> f64,
    {
        if members.is_empty() {
            return None;
        }
        match self.config.provider_selection {
            ProviderSelection::RoundRobin => {
                let mut cursors = self.group_cursors.lock().expect("group cursors poisoned");
                let cursor = cursors.entry(group.to_string()).or_insert(0);
                let index = *cursor % members.len();
                *cursor = cursor.wrapping_add(1);
                Some(members[index].clone())
            }
            ProviderSelection::LeastLoaded => members
                .iter()
                .min_by(|a, b| usage(a.as_str()).total_cmp(&usage(b.as_str())))
                .cloned(),
        }
    }

    pub fn predictive_reject(&self, usage_ratio: f64) -> bool {
        self.config.predictive_enabled && usage_ratio >= self.config.predictive_threshold
    }

    /// New limit for `limit` if an adaptive step is due.
    pub fn adaptive_target(&self, limit: &ProviderRateLimit, window: Duration, now: Instant) -> Option<u32> {
        if !self.config.adaptive_enabled {
            return None;
        }
        if let Some(last) = limit.last_adjusted {
            if now.saturating_duration_since(last) < window {
                return None;
            }
        }
        let samples = limit.recent_successes + limit.recent_failures;
        if samples == 0 || samples < self.config.adaptive_min_samples {
            return None;
        }

        let success_rate = limit.recent_successes as f64 / samples as f64;
        let current = limit.requests_per_minute as f64;
        let ceiling = (limit.base_limit as f64 * self.config.adaptive_max_factor).floor().max(1.0);

        let target = if success_rate > self.config.adaptive_success_threshold {
            (current * (1.0 + self.config.adaptive_step))
                .round()
                .max(current + 1.0)
                .min(ceiling)
        } else if success_rate < self.config.adaptive_success_threshold / 2.0 {
            (current * (1.0 - self.config.adaptive_step))
                .round()
                .min(current - 1.0)
                .max(1.0)
        } else {
            return None;
        };

        let target = target as u32;
        (target != limit.requests_per_minute).then_some(target)
    }

    /// Smoothing delay for an admitted request, `None` when shaping is off.
    pub fn shaping_delay(&self, window: Duration, limit: u32) -> Option<Duration> {
        if !self.config.shaping_enabled || limit == 0 || self.config.shaping_factor <= 0.0 {
            return None;
        }
        let spacing = window.as_secs_f64() / limit as f64;
        let delay = Duration::from_secs_f64(spacing * self.config.shaping_factor);
        Some(delay.min(self.config.shaping_max_delay()))
    }

    pub fn update_stats<F>(&self, provider: &str, update: F)
    where
        F: FnOnce(&mut ProviderStats),
    {
        let mut stats = self.stats.lock().expect("rate limit stats poisoned");
        update(stats.entry(provider.to_string()).or_default());
    }

    pub fn stats(&self) -> HashMap<String, ProviderStats> {
        self.stats.lock().expect("rate limit stats poisoned").clone()
    }

    pub fn stats_for(&self, provider: &str) -> ProviderStats {
        let stats = self.stats.lock().expect("rate limit stats poisoned");
        stats.get(provider).cloned().unwrap_or_default()
    }
}
