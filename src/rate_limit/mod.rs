//! Rate limiting subsystem.
//!
//! # Data Flow
//! ```text
//! check_rate_limit_optimized(provider or group)
//!     → optimizer.rs (group member selection)
//!     → cache.rs (recent rejection for this provider?)
//!     → optimizer.rs (predictive early rejection, adaptive limit step)
//!     → limiter.rs check_rate_limit (fixed window + strategy.rs shaping)
//!     → optimizer.rs (cache rejection / shaping delay on admission)
//!
//! execute_with_fallback(provider, primary, fallback)
//!     → limiter.rs check_rate_limit
//!     → primary, else fallback.rs best provider, else backoff retries
//! ```

pub mod cache;
pub mod fallback;
pub mod limiter;
pub mod optimizer;
pub mod strategy;

pub use cache::{CacheEntry, DecisionCache};
pub use fallback::{FallbackProvider, FallbackRegistry};
pub use limiter::{EnhancedRateLimiter, ProviderRateLimit, RateLimitResult, RejectReason};
pub use optimizer::{ProviderStats, RateLimitOptimizer};
pub use strategy::{ProviderSelection, RateLimitStrategy};
