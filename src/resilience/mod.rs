//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to a target:
//!     → context.rs (fail fast on expired/cancelled caller context)
//!     → circuit_breaker.rs (refuse while the target's circuit is open)
//!     → On transient failure: retries.rs (backoff.rs delay, context-aware wait)
//! ```
//!
//! # Design Decisions
//! - Every wait is cancellable through the caller's context
//! - One breaker per target; no shared lock between targets
//! - Rejections (rate limit, open circuit) are never retried locally

pub mod backoff;
pub mod circuit_breaker;
pub mod context;
pub mod retries;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitBreakerState, CircuitState};
pub use context::Context;
pub use retries::RetryPolicy;
