//! Weighted endpoint scoring.
//!
//! ```text
//! latency  = clamp(1 - avg_latency / max_latency_threshold, 0, 1)
//! accuracy = mean reported accuracy (0.5 until reported)
//! success  = success_rate
//! score    = (w_l·latency + w_a·accuracy + w_s·success) / (w_l + w_a + w_s)
//! ```
//!
//! An endpoint without recorded outcomes scores 0.

use std::time::Duration;

use crate::config::ScoringWeights;
use crate::routing::endpoint::EndpointMetrics;

const UNREPORTED_ACCURACY: f64 = 0.5;

pub fn score(metrics: &EndpointMetrics, weights: &ScoringWeights, max_latency: Duration) -> f64 {
    if metrics.total_requests == 0 {
        return 0.0;
    }

    let max_ms = max_latency.as_secs_f64() * 1000.0;
    let latency = if max_ms > 0.0 {
        (1.0 - metrics.avg_latency_ms / max_ms).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let accuracy = metrics.accuracy.unwrap_or(UNREPORTED_ACCURACY);

    let total_weight = weights.latency + weights.accuracy + weights.success_rate;
    if total_weight <= 0.0 {
        return 0.0;
    }
    (weights.latency * latency + weights.accuracy * accuracy + weights.success_rate * metrics.success_rate)
        / total_weight
}

/// Whether recorded performance satisfies a request's bounds. Missing
/// bounds are always met; a bound on an unmeasured value is not.
pub fn meets_requirements(
    metrics: &EndpointMetrics,
    max_latency: Option<Duration>,
    min_accuracy: Option<f64>,
) -> bool {
    let latency_ok = match max_latency {
        None => true,
        Some(bound) => {
            metrics.total_requests > 0 && metrics.avg_latency_ms <= bound.as_secs_f64() * 1000.0
        }
    };
    let accuracy_ok = match min_accuracy {
        None => true,
        Some(bound) => metrics.accuracy.is_some_and(|a| a >= bound),
    };
    latency_ok && accuracy_ok
}
