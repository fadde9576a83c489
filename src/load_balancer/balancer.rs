//! Instance selection over discovery.

use std::sync::Arc;

use crate::discovery::{ServiceDiscovery, ServiceInstance};
use crate::error::{MeshError, MeshResult};
use crate::health::state::HealthStatus;
use crate::load_balancer::{strategy_for, BalancingStrategy, BalancingStrategyKind};

/// Picks a healthy instance of a service with the configured strategy.
#[derive(Debug)]
pub struct LoadBalancer {
    discovery: Arc<ServiceDiscovery>,
    strategy: Box<dyn BalancingStrategy>,
}

impl LoadBalancer {
    pub fn new(discovery: Arc<ServiceDiscovery>, kind: BalancingStrategyKind) -> Self {
        Self::with_strategy(discovery, strategy_for(kind))
    }

    pub fn with_strategy(discovery: Arc<ServiceDiscovery>, strategy: Box<dyn BalancingStrategy>) -> Self {
        Self { discovery, strategy }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn select(&self, service: &str) -> MeshResult<ServiceInstance> {
        let healthy: Vec<ServiceInstance> = self
            .discovery
            .discover(service)?
            .into_iter()
            .filter(|i| i.is_healthy())
            .collect();

        self.strategy
            .select(service, &healthy)
            .ok_or_else(|| MeshError::NoHealthyInstances {
                service: service.to_string(),
            })
    }

    /// Push a health verdict for an instance back into discovery.
    pub fn update_health(&self, instance_id: &str, health: HealthStatus) -> MeshResult<()> {
        self.discovery.set_health_by_id(instance_id, health)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<ServiceDiscovery>, LoadBalancer) {
        let discovery = Arc::new(ServiceDiscovery::new(8));
        discovery
            .register(ServiceInstance::new("ml", "10.0.0.1", 8080).with_id("a"))
            .unwrap();
        discovery
            .register(ServiceInstance::new("ml", "10.0.0.2", 8080).with_id("b"))
            .unwrap();
        let lb = LoadBalancer::new(discovery.clone(), BalancingStrategyKind::RoundRobin);
        (discovery, lb)
    }

    #[test]
    fn test_unhealthy_never_selected() {
        let (_discovery, lb) = setup();
        lb.update_health("a", HealthStatus::Unhealthy).unwrap();

        for _ in 0..4 {
            assert_eq!(lb.select("ml").unwrap().id, "b");
        }
    }

    #[test]
    fn test_no_healthy_instances() {
        let (_discovery, lb) = setup();
        lb.update_health("a", HealthStatus::Unhealthy).unwrap();
        lb.update_health("b", HealthStatus::Unhealthy).unwrap();

        assert!(matches!(lb.select("ml"), Err(MeshError::NoHealthyInstances { .. })));
        assert!(matches!(lb.select("nope"), Err(MeshError::ServiceNotFound { .. })));
    }

    #[test]
    fn test_update_unknown_instance() {
        let (_discovery, lb) = setup();
        assert!(matches!(
            lb.update_health("zzz", HealthStatus::Healthy),
            Err(MeshError::InstanceNotFound { .. })
        ));
    }
}
