//! Round-robin load balancing strategy.

use dashmap::DashMap;

use crate::discovery::ServiceInstance;
use crate::load_balancer::BalancingStrategy;

/// Round-robin selector.
/// Keeps one rotating cursor per service name.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursors: DashMap<String, usize>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BalancingStrategy for RoundRobin {
    fn select(&self, service: &str, instances: &[ServiceInstance]) -> Option<ServiceInstance> {
        if instances.is_empty() {
            return None;
        }

        let mut cursor = self.cursors.entry(service.to_string()).or_insert(0);
        let index = *cursor % instances.len();
        *cursor = cursor.wrapping_add(1);
        Some(instances[index].clone())
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}
