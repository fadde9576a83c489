//! Intelligent request routing across model endpoints.
//!
//! # Data Flow
//! ```text
//! RouteRequest (id, type, latency/accuracy requirements)
//!     → flags.rs (A/B or rollout claims the request?)
//!     → router.rs (performance / feature-flag / hybrid choice)
//!     → endpoint.rs (healthy within TTL, breaker not open?)
//!     → Return: RouteDecision, or fallback chain, or NoHealthyEndpoint
//!
//! Background (router workers):
//!     health probes → endpoint.healthy / last_health_check
//!     circuit monitor → breaker.poll_state
//!     metrics aggregation → percentiles, gauges
//!     alerting → warn on error rate / open breaker / unhealthy
//! ```
//!
//! # Design Decisions
//! - Endpoints are keyed by name; registration order breaks score ties last
//! - Scores come from recorded outcomes only; an endpoint with no samples scores 0
//! - Each endpoint owns its circuit breaker

pub mod endpoint;
pub mod flags;
pub mod router;
pub mod scoring;

use serde::{Deserialize, Serialize};

pub use endpoint::{EndpointGuard, EndpointMetrics, ServiceEndpoint};
pub use flags::{FeatureFlagProvider, FeatureFlags, StaticFeatureFlags};
pub use router::{IntelligentRouter, RouteDecision, RouteReason, RouteRequest, RouterAlert};

/// How the router picks an endpoint when no experiment claims the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Highest weighted score among endpoints of the request type.
    PerformanceBased,
    /// First enabled model in priority order.
    FeatureFlagBased,
    /// Performance choice when it meets the request's requirements,
    /// otherwise the feature-flag choice.
    #[default]
    Hybrid,
}

impl RoutingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingStrategy::PerformanceBased => "performance_based",
            RoutingStrategy::FeatureFlagBased => "feature_flag_based",
            RoutingStrategy::Hybrid => "hybrid",
        }
    }
}
