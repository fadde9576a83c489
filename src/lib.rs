//! Resilient service-communication layer for business classification.
//!
//! # Architecture Overview
//!
//! ```text
//!   route_request ──▶ routing (flags / performance / hybrid)
//!                        │ endpoint name
//!                        ▼
//!   ServiceClient::call ──▶ rate_limit ──▶ load_balancer ──▶ resilience ──▶ transport
//!                              │              │ (discovery)      (breaker,
//!                              ▼              ▼                   retries,
//!                          fallbacks      health (active,         timeout)
//!                                         passive)
//!
//!   Cross-cutting: config, observability, lifecycle, registry
//! ```

// Core subsystems
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod registry;
pub mod routing;

// Traffic management
pub mod health;
pub mod load_balancer;
pub mod rate_limit;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use client::ServiceClient;
pub use config::MeshConfig;
pub use error::{MeshError, MeshResult};
pub use lifecycle::{Mesh, Shutdown};
pub use resilience::Context;
