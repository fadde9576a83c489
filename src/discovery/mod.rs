//! Service discovery subsystem.
//!
//! # Data Flow
//! ```text
//! Registration (startup config, embedding application):
//!     → service.rs (upsert instance, publish Added/Updated)
//!
//! Health verdicts (health monitor, load balancer, passive checks):
//!     → service.rs (update health + last_seen, publish Updated)
//!
//! Stale cleanup worker:
//!     → service.rs (evict instances idle > stale_timeout, publish Removed)
//!
//! Load balancer:
//!     → service.rs discover() (healthy instances only)
//! ```

pub mod events;
pub mod instance;
pub mod service;

pub use events::{DiscoveryEvent, DiscoveryEventKind};
pub use instance::{InstanceLoad, LoadGuard, Protocol, ServiceInstance};
pub use service::ServiceDiscovery;
