//! Rejection handling strategies.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::RetryConfig;
use crate::resilience::backoff::{exponential_delay, with_jitter};

/// How a quota rejection is shaped before it reaches the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStrategy {
    /// Return the rejection unchanged.
    #[default]
    FailFast,
    /// Flag the rejection for the caller's retry loop.
    Retry,
    /// Suggest `base × multiplier^n` before retrying, capped.
    ExponentialBackoff,
    /// Suggest `base` plus bounded random jitter.
    Jitter,
    /// Feed rejections into a per-provider circuit breaker.
    CircuitBreaker,
}

/// Picks a member of a provider group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderSelection {
    #[default]
    RoundRobin,
    LeastLoaded,
}

impl RateLimitStrategy {
    /// Suggested wait after the `rejections`-th consecutive rejection (1-based).
    pub fn wait_time(&self, rejections: u32, retry: &RetryConfig) -> Option<Duration> {
        match self {
            RateLimitStrategy::ExponentialBackoff => Some(exponential_delay(
                rejections.saturating_sub(1),
                retry.base_delay(),
                retry.backoff_multiplier,
                retry.max_delay(),
            )),
            RateLimitStrategy::Jitter => Some(with_jitter(retry.base_delay(), retry.jitter_factor)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_times() {
        let retry = RetryConfig {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 1000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.5,
        };

        let backoff = RateLimitStrategy::ExponentialBackoff;
        assert_eq!(backoff.wait_time(1, &retry), Some(Duration::from_millis(100)));
        assert_eq!(backoff.wait_time(3, &retry), Some(Duration::from_millis(400)));
        assert_eq!(backoff.wait_time(10, &retry), Some(Duration::from_millis(1000)));

        let jitter = RateLimitStrategy::Jitter.wait_time(1, &retry).unwrap();
        assert!(jitter >= Duration::from_millis(124) && jitter <= Duration::from_millis(150));

        assert_eq!(RateLimitStrategy::FailFast.wait_time(5, &retry), None);
    }
}
