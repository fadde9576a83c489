//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (active.rs):
//!     Periodic worker
//!     → probe.rs (GET <instance>/<path>)
//!     → state.rs tracker per instance
//!     → discovery health update on transition
//!
//! Passive health checks (passive.rs):
//!     Client call failure observed
//!     → Increment consecutive failure count
//!     → load balancer marks the instance unhealthy past the threshold
//! ```
//!
//! # Design Decisions
//! - Active and passive checks are complementary
//! - State transitions require consecutive successes/failures
//! - Health state is per-instance, rolled up per service contract

pub mod active;
pub mod passive;
pub mod probe;
pub mod state;

pub use active::HealthMonitor;
pub use passive::PassiveHealth;
pub use probe::{HealthProbe, HttpHealthProbe};
pub use state::{HealthStatus, HealthTracker};
