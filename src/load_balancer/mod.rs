//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Client call for service S
//!     → balancer.rs (healthy instances of S from discovery)
//!     → Apply load balancing strategy:
//!         - round_robin.rs (rotate through instances, per service)
//!         - least_loaded.rs (lowest active / capacity ratio)
//!     → Return the instance or NoHealthyInstances
//! ```
//!
//! # Design Decisions
//! - Strategies only see healthy instances
//! - Strategy chosen once from config
//! - Health verdicts flow back into discovery, never into the strategy

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::discovery::ServiceInstance;

pub mod balancer;
pub mod least_loaded;
pub mod round_robin;

pub use balancer::LoadBalancer;
pub use least_loaded::LeastLoaded;
pub use round_robin::RoundRobin;

/// Configured strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancingStrategyKind {
    #[default]
    RoundRobin,
    LeastLoaded,
}

/// Picks one instance out of a service's healthy instances.
pub trait BalancingStrategy: Send + Sync + fmt::Debug {
    fn select(&self, service: &str, instances: &[ServiceInstance]) -> Option<ServiceInstance>;

    fn name(&self) -> &'static str;
}

pub fn strategy_for(kind: BalancingStrategyKind) -> Box<dyn BalancingStrategy> {
    match kind {
        BalancingStrategyKind::RoundRobin => Box::new(RoundRobin::new()),
        BalancingStrategyKind::LeastLoaded => Box::new(LeastLoaded::new()),
    }
}
