//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// `base × multiplier^attempt`, capped at `max`.
pub fn exponential_delay(attempt: u32, base: Duration, multiplier: f64, max: Duration) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let factor = multiplier.max(1.0).powi(exponent);
    let delay_secs = base.as_secs_f64() * factor;

    if !delay_secs.is_finite() || delay_secs >= max.as_secs_f64() {
        return max;
    }
    Duration::from_secs_f64(delay_secs)
}

/// Additive jitter: `base + base × factor × (0.5 + 0.5 × r)` with `r` in `[0, 1)`.
pub fn with_jitter(base: Duration, factor: f64) -> Duration {
    if factor <= 0.0 || base.is_zero() {
        return base;
    }
    let r: f64 = rand::thread_rng().gen_range(0.0..1.0);
    base + base.mul_f64(factor * (0.5 + 0.5 * r))
}

/// Delay before retry number `attempt` (0-based) under `config`.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let delay = exponential_delay(
        attempt,
        config.base_delay(),
        config.backoff_multiplier,
        config.max_delay(),
    );
    with_jitter(delay, config.jitter_factor)
}
