//! Service client façade.
//!
//! # Data Flow
//! ```text
//! call(ctx, service, method, request)
//!     → context check (expired/cancelled fails here)
//!     → rate limiter admission (RateLimitExceeded, no queuing)
//!     → retry loop (transient errors only)
//!         → load balancer select → load guard
//!         → circuit breaker → per-attempt timeout → transport
//!         → passive health report
//!     → metrics sink
//!     → fallback strategy (isolation level full)
//! ```

pub mod isolation;
pub mod service_client;
pub mod transport;

pub use isolation::{FallbackStrategy, IsolationLevel};
pub use service_client::{CallResult, ServiceClient};
pub use transport::{HttpTransport, ServiceTransport};
