//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the mesh.
//! All types derive Serde traits for deserialization from config files.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::isolation::{FallbackStrategy, IsolationLevel};
use crate::discovery::instance::Protocol;
use crate::load_balancer::BalancingStrategyKind;
use crate::rate_limit::strategy::{ProviderSelection, RateLimitStrategy};
use crate::registry::ServiceKind;
use crate::routing::flags::FeatureFlags;
use crate::routing::RoutingStrategy;

/// Root configuration for the service-communication layer.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct MeshConfig {
    /// Instance bookkeeping and watch settings.
    pub discovery: DiscoveryConfig,

    /// Active health check settings.
    pub health_check: HealthCheckConfig,

    /// Service contracts and their statically known instances.
    pub services: Vec<ServiceConfig>,

    /// Instance selection strategy.
    pub load_balancer: LoadBalancerConfig,

    /// Per-service circuit breaker thresholds used by the client.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Provider quotas, rejection strategy, fallbacks and optimizations.
    pub rate_limit: RateLimitConfig,

    /// Model/endpoint routing.
    pub router: RouterConfig,

    /// Initial feature flags (hot-reloadable).
    pub feature_flags: FeatureFlags,

    /// Service client composition.
    pub client: ClientConfig,

    /// Logging and metrics.
    pub observability: ObservabilityConfig,
}

/// Discovery settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Capacity of each watcher's event channel.
    pub watch_buffer: usize,

    /// Instances not seen for this long are evicted.
    pub stale_timeout_secs: u64,

    /// How often the stale sweep runs.
    pub cleanup_interval_secs: u64,
}

impl DiscoveryConfig {
    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            watch_buffer: 64,
            stale_timeout_secs: 90,
            cleanup_interval_secs: 30,
        }
    }
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable active health checks.
    pub enabled: bool,

    /// Health check interval in seconds.
    pub interval_secs: u64,

    /// Health check timeout in milliseconds.
    pub timeout_ms: u64,

    /// Path to probe for HTTP health checks.
    pub path: String,

    /// Number of consecutive failures before marking unhealthy.
    pub unhealthy_threshold: u32,

    /// Number of consecutive successes before marking healthy.
    pub healthy_threshold: u32,
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
            timeout_ms: 2000,
            path: "/health".to_string(),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        }
    }
}

/// A logical service and its known instances.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Logical service name.
    pub name: String,

    /// Contract version.
    #[serde(default = "default_version")]
    pub version: String,

    /// Kind of backend behind this service.
    #[serde(default)]
    pub kind: ServiceKind,

    /// Capabilities advertised by the contract.
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Instances registered at startup.
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

fn default_version() -> String {
    "v1".to_string()
}

/// A statically configured instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InstanceConfig {
    /// Instance ID; generated when absent.
    #[serde(default)]
    pub id: Option<String>,

    pub host: String,

    pub port: u16,

    #[serde(default)]
    pub protocol: Protocol,

    /// Concurrent requests the instance is sized for (least-loaded denominator).
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_capacity() -> usize {
    100
}

/// Load balancer configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub strategy: BalancingStrategyKind,
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures (while closed) that trip the breaker.
    pub failure_threshold: u32,

    /// Successes (while half-open) that close the breaker.
    pub success_threshold: u32,

    /// Time spent open before a trial call is allowed.
    pub recovery_timeout_ms: u64,

    /// Trial calls admitted while half-open.
    pub half_open_max_calls: u32,
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout_ms: 30_000,
            half_open_max_calls: 3,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_retries: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,

    /// Growth factor between attempts.
    pub backoff_multiplier: f64,

    /// Fraction of the base delay added as random jitter.
    pub jitter_factor: f64,
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 2000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Fixed window length in seconds.
    pub window_secs: u64,

    /// Quota for providers without an explicit entry.
    pub default_requests_per_minute: u32,

    /// Per-provider quotas.
    pub providers: Vec<ProviderLimitConfig>,

    /// How rejections are shaped.
    pub strategy: RateLimitStrategy,

    /// Backoff policy for the `retry`, `exponential_backoff` and `jitter` strategies.
    pub retry: RetryConfig,

    /// Breaker thresholds for the `circuit_breaker` strategy.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Alternative providers used when a primary is exhausted.
    pub fallback_providers: Vec<FallbackProviderConfig>,

    /// Fallbacks below this success rate are skipped.
    pub min_fallback_success_rate: f64,

    /// Seconds after its last call before a skipped fallback is tried again.
    pub fallback_retry_secs: u64,

    /// Groups of interchangeable providers (group name -> members).
    pub provider_groups: HashMap<String, Vec<String>>,

    pub optimization: OptimizationConfig,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn fallback_retry(&self) -> Duration {
        Duration::from_secs(self.fallback_retry_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: 60,
            default_requests_per_minute: 60,
            providers: Vec::new(),
            strategy: RateLimitStrategy::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            fallback_providers: Vec::new(),
            min_fallback_success_rate: 0.2,
            fallback_retry_secs: 30,
            provider_groups: HashMap::new(),
            optimization: OptimizationConfig::default(),
        }
    }
}

/// Quota for a single provider.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderLimitConfig {
    pub name: String,
    pub requests_per_minute: u32,
}

/// A fallback provider known at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FallbackProviderConfig {
    pub name: String,

    /// Higher = preferred.
    #[serde(default)]
    pub priority: u32,

    /// Initial success rate estimate.
    #[serde(default = "default_success_rate")]
    pub success_rate: f64,

    #[serde(default = "default_true")]
    pub available: bool,
}

fn default_success_rate() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

/// Optimization sublayer of the rate limiter.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OptimizationConfig {
    pub cache_enabled: bool,
    pub cache_ttl_ms: u64,
    pub cache_max_size: usize,
    pub cache_cleanup_interval_secs: u64,

    /// Reject early once window usage reaches `predictive_threshold`.
    pub predictive_enabled: bool,
    pub predictive_threshold: f64,

    /// Grow/shrink quotas based on observed success rate.
    pub adaptive_enabled: bool,
    pub adaptive_success_threshold: f64,
    pub adaptive_step: f64,
    pub adaptive_max_factor: f64,
    pub adaptive_min_samples: u64,

    /// Spread load across `provider_groups`.
    pub load_balancing_enabled: bool,
    pub provider_selection: ProviderSelection,

    /// Sleep `window / limit * shaping_factor` (capped) after each admission.
    pub shaping_enabled: bool,
    pub shaping_factor: f64,
    pub shaping_max_delay_ms: u64,
}

impl OptimizationConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn cache_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cache_cleanup_interval_secs)
    }

    pub fn shaping_max_delay(&self) -> Duration {
        Duration::from_millis(self.shaping_max_delay_ms)
    }
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_ttl_ms: 1000,
            cache_max_size: 1000,
            cache_cleanup_interval_secs: 30,
            predictive_enabled: false,
            predictive_threshold: 0.8,
            adaptive_enabled: false,
            adaptive_success_threshold: 0.95,
            adaptive_step: 0.1,
            adaptive_max_factor: 2.0,
            adaptive_min_samples: 20,
            load_balancing_enabled: false,
            provider_selection: ProviderSelection::default(),
            shaping_enabled: false,
            shaping_factor: 0.1,
            shaping_max_delay_ms: 100,
        }
    }
}

/// Weights of the performance score.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub latency: f64,
    pub accuracy: f64,
    pub success_rate: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            latency: 0.3,
            accuracy: 0.4,
            success_rate: 0.3,
        }
    }
}

/// Intelligent router configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RouterConfig {
    pub strategy: RoutingStrategy,

    /// Endpoint used when the chosen one is unroutable.
    pub default_endpoint: String,

    /// Latency at which the latency score reaches zero.
    pub max_latency_threshold_ms: u64,

    pub weights: ScoringWeights,

    /// Model flags checked in order by `feature_flag_based` routing.
    pub model_priority: Vec<String>,

    /// A health check older than this makes an endpoint unroutable.
    pub health_ttl_secs: u64,

    pub health_path: String,
    pub health_check_interval_secs: u64,
    pub circuit_monitor_interval_secs: u64,
    pub metrics_interval_secs: u64,
    pub alert_interval_secs: u64,

    /// Error rate above which an alert is logged.
    pub alert_error_rate: f64,

    /// Latency samples kept per endpoint for percentiles.
    pub latency_window: usize,

    pub circuit_breaker: CircuitBreakerConfig,

    pub endpoints: Vec<EndpointConfig>,
}

impl RouterConfig {
    pub fn max_latency_threshold(&self) -> Duration {
        Duration::from_millis(self.max_latency_threshold_ms)
    }

    pub fn health_ttl(&self) -> Duration {
        Duration::from_secs(self.health_ttl_secs)
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            strategy: RoutingStrategy::default(),
            default_endpoint: "rule_based".to_string(),
            max_latency_threshold_ms: 1000,
            weights: ScoringWeights::default(),
            model_priority: vec![
                "bert_classification".to_string(),
                "ensemble_classification".to_string(),
                "ml_classification".to_string(),
                "keyword_classification".to_string(),
            ],
            health_ttl_secs: 300,
            health_path: "/health".to_string(),
            health_check_interval_secs: 30,
            circuit_monitor_interval_secs: 5,
            metrics_interval_secs: 15,
            alert_interval_secs: 30,
            alert_error_rate: 0.5,
            latency_window: 1000,
            circuit_breaker: CircuitBreakerConfig::default(),
            endpoints: Vec::new(),
        }
    }
}

/// A routable model endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndpointConfig {
    pub name: String,
    pub url: url::Url,

    /// Request type served (e.g. "classification").
    pub endpoint_type: String,

    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Service client composition.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub isolation_level: IsolationLevel,
    pub fallback_strategy: FallbackStrategy,

    /// Per-attempt timeout in milliseconds.
    pub request_timeout_ms: u64,

    pub retry: RetryConfig,

    /// Responses served by the `static_data` fallback, keyed by service.
    pub static_data: HashMap<String, serde_json::Value>,

    /// Service -> alternative service for the `alternative_service` fallback.
    pub alternative_services: HashMap<String, String>,
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            isolation_level: IsolationLevel::default(),
            fallback_strategy: FallbackStrategy::default(),
            request_timeout_ms: 5000,
            retry: RetryConfig::default(),
            static_data: HashMap::new(),
            alternative_services: HashMap::new(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MeshConfig::default();
        assert_eq!(config.rate_limit.window(), Duration::from_secs(60));
        assert_eq!(config.circuit_breaker.recovery_timeout(), Duration::from_secs(30));
        assert_eq!(config.router.default_endpoint, "rule_based");
        assert_eq!(config.router.health_ttl(), Duration::from_secs(300));
        assert!((config.router.weights.accuracy - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn test_minimal_toml() {
        let raw = r#"
            [rate_limit]
            default_requests_per_minute = 2
            strategy = "exponential_backoff"

            [[rate_limit.providers]]
            name = "bert"
            requests_per_minute = 10

            [[services]]
            name = "ml_classifier"
            kind = "ml_classifier"

            [[services.instances]]
            host = "10.0.0.1"
            port = 8080

            [[router.endpoints]]
            name = "rule_based"
            url = "http://rules.internal:9000"
            endpoint_type = "classification"
            weight = 50
        "#;

        let config: MeshConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.rate_limit.default_requests_per_minute, 2);
        assert_eq!(config.rate_limit.strategy, RateLimitStrategy::ExponentialBackoff);
        assert_eq!(config.rate_limit.providers[0].requests_per_minute, 10);
        assert_eq!(config.services[0].instances[0].capacity, 100);
        assert_eq!(config.services[0].version, "v1");
        assert_eq!(config.router.endpoints[0].weight, 50);
        // Untouched sections keep their defaults.
        assert_eq!(config.health_check.path, "/health");
    }
}
