//! Active health checking.
//!
//! # Responsibilities
//! - Probe every registered instance on each tick
//! - Apply hysteresis before flipping an instance's health
//! - Roll instance health up into the service contracts
//!
//! # Design Decisions
//! - Discovery holds the verdict; a tracker adopts it whenever passive
//!   checks or manual updates changed it, so probes can bring the
//!   instance back

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::HealthCheckConfig;
use crate::discovery::{ServiceDiscovery, ServiceInstance};
use crate::health::probe::HealthProbe;
use crate::health::state::{HealthStatus, HealthTracker};
use crate::registry::ServiceRegistry;

pub struct HealthMonitor {
    discovery: Arc<ServiceDiscovery>,
    registry: Arc<ServiceRegistry>,
    probe: Arc<dyn HealthProbe>,
    config: HealthCheckConfig,
    trackers: Mutex<HashMap<String, HealthTracker>>,
}

impl HealthMonitor {
    pub fn new(
        discovery: Arc<ServiceDiscovery>,
        registry: Arc<ServiceRegistry>,
        probe: Arc<dyn HealthProbe>,
        config: HealthCheckConfig,
    ) -> Self {
        Self {
            discovery,
            registry,
            probe,
            config,
            trackers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// One probe round over every instance.
    pub async fn check_all(&self) {
        let instances = self.discovery.snapshot();

        for instance in &instances {
            let healthy = self.probe_instance(instance).await;
            let transition = {
                let mut trackers = self.trackers.lock().expect("health trackers poisoned");
                let tracker = trackers.entry(instance.id.clone()).or_insert_with(|| {
                    HealthTracker::new(
                        instance.health,
                        self.config.healthy_threshold,
                        self.config.unhealthy_threshold,
                    )
                });
                if tracker.status() != instance.health {
                    tracker.set(instance.health);
                }
                if healthy {
                    tracker.record_success()
                } else {
                    tracker.record_failure()
                }
            };

            let result = match transition {
                Some(status) => self
                    .discovery
                    .update_instance_health(&instance.service, &instance.id, status),
                None if healthy => self.discovery.heartbeat(&instance.service, &instance.id),
                None => Ok(()),
            };
            if let Err(e) = result {
                // Unregistered while the probe was in flight.
                tracing::debug!(instance = %instance.id, error = %e, "Skipping health update");
            }
        }

        self.forget_departed(&instances);
        self.roll_up();
    }

    async fn probe_instance(&self, instance: &ServiceInstance) -> bool {
        let url = match instance.base_url().and_then(|base| base.join(&self.config.path)) {
            Ok(url) => url,
            Err(e) => {
                tracing::error!(instance = %instance.id, error = %e, "Failed to build health check URL");
                return false;
            }
        };
        self.probe.probe(&url).await
    }

    fn forget_departed(&self, instances: &[ServiceInstance]) {
        let mut trackers = self.trackers.lock().expect("health trackers poisoned");
        trackers.retain(|id, _| instances.iter().any(|i| &i.id == id));
    }

    /// A contract is healthy while at least one of its instances is.
    fn roll_up(&self) {
        for service in self.discovery.services() {
            if !self.registry.contains(&service) {
                continue;
            }
            let status = match self.discovery.discover(&service) {
                Ok(healthy) if !healthy.is_empty() => HealthStatus::Healthy,
                _ => HealthStatus::Unhealthy,
            };
            if let Err(e) = self.registry.update_health(&service, status) {
                tracing::debug!(service = %service, error = %e, "Contract vanished during health roll-up");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::GenericContract;
    use futures_util::future::BoxFuture;
    use std::collections::HashSet;
    use url::Url;

    /// Hosts listed as down fail their probe.
    struct StubProbe {
        down: Mutex<HashSet<String>>,
    }

    impl HealthProbe for StubProbe {
        fn probe<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, bool> {
            let host = url.host_str().unwrap_or_default().to_string();
            let up = !self.down.lock().unwrap().contains(&host);
            Box::pin(async move { up })
        }
    }

    fn setup() -> (Arc<ServiceDiscovery>, Arc<ServiceRegistry>, Arc<StubProbe>, HealthMonitor) {
        let discovery = Arc::new(ServiceDiscovery::new(8));
        discovery
            .register(ServiceInstance::new("ml", "ml-a", 8080).with_id("a"))
            .unwrap();
        let registry = Arc::new(ServiceRegistry::new());
        registry.register(Box::new(GenericContract::new("ml", "v1", Vec::new())));
        let probe = Arc::new(StubProbe {
            down: Mutex::new(HashSet::new()),
        });
        let config = HealthCheckConfig {
            unhealthy_threshold: 2,
            healthy_threshold: 2,
            ..HealthCheckConfig::default()
        };
        let monitor = HealthMonitor::new(discovery.clone(), registry.clone(), probe.clone(), config);
        (discovery, registry, probe, monitor)
    }

    #[tokio::test]
    async fn test_flips_after_thresholds() {
        let (discovery, registry, probe, monitor) = setup();
        probe.down.lock().unwrap().insert("ml-a".into());

        monitor.check_all().await;
        assert_eq!(discovery.discover("ml").unwrap().len(), 1);

        monitor.check_all().await;
        assert!(discovery.discover("ml").unwrap().is_empty());
        assert_eq!(registry.get("ml").unwrap().health, HealthStatus::Unhealthy);

        probe.down.lock().unwrap().clear();
        monitor.check_all().await;
        assert!(discovery.discover("ml").unwrap().is_empty());
        monitor.check_all().await;
        assert_eq!(discovery.discover("ml").unwrap().len(), 1);
        assert_eq!(registry.get("ml").unwrap().health, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_probes_readmit_instance_ejected_elsewhere() {
        use crate::health::passive::PassiveHealth;
        use crate::load_balancer::{BalancingStrategyKind, LoadBalancer};

        let (discovery, registry, _probe, monitor) = setup();
        let balancer = Arc::new(LoadBalancer::new(discovery.clone(), BalancingStrategyKind::RoundRobin));
        monitor.check_all().await;

        let passive = PassiveHealth::new(balancer.clone(), 1);
        let timeout = crate::error::MeshError::Timeout {
            target: "ml".into(),
            after: std::time::Duration::from_secs(1),
        };
        assert!(passive.record_failure("a", &timeout));
        assert!(balancer.select("ml").is_err());

        // Hysteresis still applies on the way back.
        monitor.check_all().await;
        assert!(discovery.discover("ml").unwrap().is_empty());
        monitor.check_all().await;
        assert_eq!(balancer.select("ml").unwrap().id, "a");
        assert_eq!(registry.get("ml").unwrap().health, HealthStatus::Healthy);

        // A manual ejection is recovered the same way.
        balancer.update_health("a", HealthStatus::Unhealthy).unwrap();
        monitor.check_all().await;
        monitor.check_all().await;
        assert_eq!(discovery.discover("ml").unwrap().len(), 1);
    }
}
