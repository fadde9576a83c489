//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → MeshConfig (validated, immutable)
//!     → handed by value/Arc to each component at startup
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → runner swaps hot-reloadable parts (feature flags)
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; only feature flags are hot-swapped
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use schema::{
    CircuitBreakerConfig, ClientConfig, DiscoveryConfig, EndpointConfig, FallbackProviderConfig,
    HealthCheckConfig, InstanceConfig, LoadBalancerConfig, LogFormat, MeshConfig,
    ObservabilityConfig, OptimizationConfig, ProviderLimitConfig, RateLimitConfig, RetryConfig,
    RouterConfig, ScoringWeights, ServiceConfig,
};
