//! Instance tracking per logical service.
//!
//! # Responsibilities
//! - Register, update and remove instances
//! - Answer discovery queries with healthy instances only
//! - Evict instances that stopped reporting
//! - Notify watchers of every change without ever blocking
//!
//! # Design Decisions
//! - Instances and watchers sit behind separate locks
//! - Watch channels are bounded; a full channel drops the event with a warning
//! - Events are published after the instance lock is released
//! - A service name stays known after its last instance leaves
//! - Instance IDs are unique across services

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;

use crate::config::ServiceConfig;
use crate::discovery::events::DiscoveryEvent;
use crate::discovery::instance::ServiceInstance;
use crate::error::{MeshError, MeshResult};
use crate::health::state::HealthStatus;
use crate::observability::metrics;

/// Registry of live instances with change notification.
#[derive(Debug)]
pub struct ServiceDiscovery {
    instances: RwLock<HashMap<String, Vec<ServiceInstance>>>,
    watchers: Mutex<HashMap<String, Vec<mpsc::Sender<DiscoveryEvent>>>>,
    watch_buffer: usize,
}

impl ServiceDiscovery {
    pub fn new(watch_buffer: usize) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
            watch_buffer: watch_buffer.max(1),
        }
    }

    /// Register every statically configured instance.
    pub fn register_from_config(&self, services: &[ServiceConfig]) -> MeshResult<()> {
        for service in services {
            self.ensure_service(&service.name);
            for instance in &service.instances {
                self.register(ServiceInstance::from_config(service, instance))?;
            }
        }
        Ok(())
    }

    /// Make a service name known without registering an instance.
    pub fn ensure_service(&self, service: &str) {
        let mut instances = self.instances.write().expect("discovery lock poisoned");
        instances.entry(service.to_string()).or_default();
    }

    /// Upsert an instance keyed by ID.
    ///
    /// An ID already registered under another service is refused; unregister
    /// it there first.
    pub fn register(&self, mut instance: ServiceInstance) -> MeshResult<()> {
        if instance.service.is_empty() {
            return Err(MeshError::Validation("instance service name is empty".into()));
        }
        if instance.id.is_empty() {
            return Err(MeshError::Validation("instance id is empty".into()));
        }
        instance.last_seen = Instant::now();

        let event = {
            let mut instances = self.instances.write().expect("discovery lock poisoned");
            let owner = instances
                .iter()
                .find(|(service, list)| **service != instance.service && list.iter().any(|i| i.id == instance.id))
                .map(|(service, _)| service.clone());
            if let Some(owner) = owner {
                return Err(MeshError::Validation(format!(
                    "instance id '{}' is already registered under service '{}'",
                    instance.id, owner
                )));
            }
            let list = instances.entry(instance.service.clone()).or_default();
            match list.iter_mut().find(|i| i.id == instance.id) {
                Some(existing) => {
                    // Keep in-flight counters across re-registration.
                    if existing.load.capacity() == instance.load.capacity() {
                        instance.load = existing.load.clone();
                    }
                    *existing = instance.clone();
                    DiscoveryEvent::Updated(instance)
                }
                None => {
                    list.push(instance.clone());
                    DiscoveryEvent::Added(instance)
                }
            }
        };

        let inst = event.instance();
        tracing::info!(
            service = %inst.service,
            instance = %inst.id,
            address = %inst.address(),
            event = ?event.kind(),
            "Instance registered"
        );
        metrics::record_instance_health(&inst.service, &inst.id, inst.is_healthy());
        self.publish(vec![event]);
        Ok(())
    }

    pub fn unregister(&self, service: &str, id: &str) -> MeshResult<ServiceInstance> {
        let removed = {
            let mut instances = self.instances.write().expect("discovery lock poisoned");
            let list = instances
                .get_mut(service)
                .ok_or_else(|| MeshError::ServiceNotFound {
                    service: service.to_string(),
                })?;
            let pos = list
                .iter()
                .position(|i| i.id == id)
                .ok_or_else(|| MeshError::InstanceNotFound { id: id.to_string() })?;
            list.remove(pos)
        };

        tracing::info!(service = %service, instance = %id, "Instance unregistered");
        self.publish(vec![DiscoveryEvent::Removed(removed.clone())]);
        Ok(removed)
    }

    /// Healthy instances of `service`, in registration order.
    pub fn discover(&self, service: &str) -> MeshResult<Vec<ServiceInstance>> {
        let instances = self.instances.read().expect("discovery lock poisoned");
        let list = instances.get(service).ok_or_else(|| MeshError::ServiceNotFound {
            service: service.to_string(),
        })?;
        Ok(list.iter().filter(|i| i.is_healthy()).cloned().collect())
    }

    /// Every instance of `service` regardless of health.
    pub fn all_instances(&self, service: &str) -> MeshResult<Vec<ServiceInstance>> {
        let instances = self.instances.read().expect("discovery lock poisoned");
        instances
            .get(service)
            .cloned()
            .ok_or_else(|| MeshError::ServiceNotFound {
                service: service.to_string(),
            })
    }

    /// Every instance of every service.
    pub fn snapshot(&self) -> Vec<ServiceInstance> {
        let instances = self.instances.read().expect("discovery lock poisoned");
        instances.values().flatten().cloned().collect()
    }

    pub fn find_instance(&self, id: &str) -> Option<ServiceInstance> {
        let instances = self.instances.read().expect("discovery lock poisoned");
        instances.values().flatten().find(|i| i.id == id).cloned()
    }

    /// Known service names, sorted.
    pub fn services(&self) -> Vec<String> {
        let instances = self.instances.read().expect("discovery lock poisoned");
        let mut names: Vec<String> = instances.keys().cloned().collect();
        names.sort();
        names
    }

    /// Record a health verdict. Also counts as a heartbeat.
    pub fn update_instance_health(&self, service: &str, id: &str, health: HealthStatus) -> MeshResult<()> {
        let event = {
            let mut instances = self.instances.write().expect("discovery lock poisoned");
            let list = instances
                .get_mut(service)
                .ok_or_else(|| MeshError::ServiceNotFound {
                    service: service.to_string(),
                })?;
            let instance = list
                .iter_mut()
                .find(|i| i.id == id)
                .ok_or_else(|| MeshError::InstanceNotFound { id: id.to_string() })?;
            Self::apply_health(instance, health)
        };

        metrics::record_instance_health(service, id, health.is_healthy());
        if let Some(event) = event {
            self.publish(vec![event]);
        }
        Ok(())
    }

    /// Record a health verdict for an instance known only by ID.
    pub fn set_health_by_id(&self, id: &str, health: HealthStatus) -> MeshResult<()> {
        let (service, event) = {
            let mut instances = self.instances.write().expect("discovery lock poisoned");
            let instance = instances
                .values_mut()
                .flatten()
                .find(|i| i.id == id)
                .ok_or_else(|| MeshError::InstanceNotFound { id: id.to_string() })?;
            (instance.service.clone(), Self::apply_health(instance, health))
        };

        metrics::record_instance_health(&service, id, health.is_healthy());
        if let Some(event) = event {
            self.publish(vec![event]);
        }
        Ok(())
    }

    fn apply_health(instance: &mut ServiceInstance, health: HealthStatus) -> Option<DiscoveryEvent> {
        instance.last_seen = Instant::now();
        if instance.health == health {
            return None;
        }
        tracing::info!(
            service = %instance.service,
            instance = %instance.id,
            from = %instance.health,
            to = %health,
            "Instance health changed"
        );
        instance.health = health;
        Some(DiscoveryEvent::Updated(instance.clone()))
    }

    /// Refresh `last_seen` without changing health.
    pub fn heartbeat(&self, service: &str, id: &str) -> MeshResult<()> {
        let mut instances = self.instances.write().expect("discovery lock poisoned");
        let instance = instances
            .get_mut(service)
            .ok_or_else(|| MeshError::ServiceNotFound {
                service: service.to_string(),
            })?
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| MeshError::InstanceNotFound { id: id.to_string() })?;
        instance.last_seen = Instant::now();
        Ok(())
    }

    /// Drop instances not seen within `timeout`. Returns how many were removed.
    pub fn cleanup_stale_instances(&self, timeout: Duration) -> usize {
        let now = Instant::now();
        let mut removed = Vec::new();
        {
            let mut instances = self.instances.write().expect("discovery lock poisoned");
            for list in instances.values_mut() {
                list.retain(|i| {
                    let stale = now.saturating_duration_since(i.last_seen) > timeout;
                    if stale {
                        removed.push(i.clone());
                    }
                    !stale
                });
            }
        }

        if removed.is_empty() {
            return 0;
        }
        for instance in &removed {
            tracing::warn!(
                service = %instance.service,
                instance = %instance.id,
                idle_secs = now.saturating_duration_since(instance.last_seen).as_secs(),
                "Evicting stale instance"
            );
            metrics::record_stale_evicted(&instance.service);
        }
        let count = removed.len();
        self.publish(removed.into_iter().map(DiscoveryEvent::Removed).collect());
        count
    }

    /// Subscribe to changes of `service`.
    pub fn watch(&self, service: &str) -> mpsc::Receiver<DiscoveryEvent> {
        let (tx, rx) = mpsc::channel(self.watch_buffer);
        let mut watchers = self.watchers.lock().expect("discovery watchers poisoned");
        watchers.entry(service.to_string()).or_default().push(tx);
        rx
    }

    pub fn watcher_count(&self, service: &str) -> usize {
        let watchers = self.watchers.lock().expect("discovery watchers poisoned");
        watchers.get(service).map_or(0, |w| w.len())
    }

    fn publish(&self, events: Vec<DiscoveryEvent>) {
        let mut watchers = self.watchers.lock().expect("discovery watchers poisoned");
        for event in events {
            let Some(senders) = watchers.get_mut(event.service()) else {
                continue;
            };
            senders.retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(dropped)) => {
                    tracing::warn!(
                        service = %dropped.service(),
                        instance = %dropped.instance().id,
                        event = ?dropped.kind(),
                        "Watcher channel full, dropping discovery event"
                    );
                    metrics::record_watch_event_dropped(dropped.service());
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            });
        }
    }
}

impl Default for ServiceDiscovery {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::events::DiscoveryEventKind;

    fn instance(id: &str) -> ServiceInstance {
        ServiceInstance::new("ml", "10.0.0.1", 8080).with_id(id)
    }

    #[test]
    fn test_register_is_upsert() {
        let discovery = ServiceDiscovery::new(8);
        let mut rx = discovery.watch("ml");

        discovery.register(instance("a")).unwrap();
        discovery.register(instance("a").with_version("v2")).unwrap();

        assert_eq!(rx.try_recv().unwrap().kind(), DiscoveryEventKind::Added);
        let updated = rx.try_recv().unwrap();
        assert_eq!(updated.kind(), DiscoveryEventKind::Updated);
        assert_eq!(updated.instance().version, "v2");
        assert_eq!(discovery.all_instances("ml").unwrap().len(), 1);
    }

    #[test]
    fn test_instance_id_unique_across_services() {
        let discovery = ServiceDiscovery::new(8);
        discovery.register(instance("a")).unwrap();

        let err = discovery
            .register(ServiceInstance::new("rules", "10.0.0.2", 9090).with_id("a"))
            .unwrap_err();
        assert!(matches!(err, MeshError::Validation(ref msg) if msg.contains("'ml'")));
        assert!(discovery.all_instances("rules").is_err());

        // Health updates by ID reach the one registered copy.
        discovery.set_health_by_id("a", HealthStatus::Unhealthy).unwrap();
        assert!(discovery.discover("ml").unwrap().is_empty());

        discovery.unregister("ml", "a").unwrap();
        discovery
            .register(ServiceInstance::new("rules", "10.0.0.2", 9090).with_id("a"))
            .unwrap();
        assert_eq!(discovery.find_instance("a").unwrap().service, "rules");
    }

    #[test]
    fn test_discover_filters_unhealthy() {
        let discovery = ServiceDiscovery::new(8);
        discovery.register(instance("a")).unwrap();
        discovery.register(instance("b")).unwrap();
        discovery.update_instance_health("ml", "a", HealthStatus::Unhealthy).unwrap();

        let healthy = discovery.discover("ml").unwrap();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].id, "b");

        assert!(matches!(
            discovery.discover("unknown"),
            Err(MeshError::ServiceNotFound { .. })
        ));
    }

    #[test]
    fn test_known_service_without_instances() {
        let discovery = ServiceDiscovery::new(8);
        discovery.register(instance("a")).unwrap();
        discovery.unregister("ml", "a").unwrap();
        assert!(discovery.discover("ml").unwrap().is_empty());
        assert!(matches!(
            discovery.unregister("ml", "a"),
            Err(MeshError::InstanceNotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_instances_evicted() {
        let discovery = ServiceDiscovery::new(8);
        discovery.register(instance("old")).unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        discovery.register(instance("fresh")).unwrap();
        let mut rx = discovery.watch("ml");

        tokio::time::advance(Duration::from_secs(15)).await;
        let removed = discovery.cleanup_stale_instances(Duration::from_secs(30));
        assert_eq!(removed, 1);

        let remaining: Vec<String> = discovery.discover("ml").unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(remaining, vec!["fresh"]);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind(), DiscoveryEventKind::Removed);
        assert_eq!(event.instance().id, "old");
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_instance() {
        let discovery = ServiceDiscovery::new(8);
        discovery.register(instance("a")).unwrap();
        tokio::time::advance(Duration::from_secs(25)).await;
        discovery.heartbeat("ml", "a").unwrap();
        tokio::time::advance(Duration::from_secs(25)).await;

        assert_eq!(discovery.cleanup_stale_instances(Duration::from_secs(30)), 0);
    }

    #[test]
    fn test_full_watcher_never_blocks() {
        let discovery = ServiceDiscovery::new(1);
        let mut rx = discovery.watch("ml");

        for id in ["a", "b", "c"] {
            discovery.register(instance(id)).unwrap();
        }

        // Only the first event fit; the rest were dropped.
        assert_eq!(rx.try_recv().unwrap().instance().id, "a");
        assert!(rx.try_recv().is_err());
        assert_eq!(discovery.all_instances("ml").unwrap().len(), 3);
    }

    #[test]
    fn test_closed_watcher_removed() {
        let discovery = ServiceDiscovery::new(4);
        let rx = discovery.watch("ml");
        drop(rx);
        discovery.register(instance("a")).unwrap();
        assert_eq!(discovery.watcher_count("ml"), 0);
    }
}
