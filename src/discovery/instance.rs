//! Service instance abstraction.
//!
//! # Responsibilities
//! - Represent one live process of a logical service
//! - Track in-flight requests for least-loaded balancing
//! - Carry the latest health verdict and last-seen time

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use url::Url;

use crate::config::{InstanceConfig, ServiceConfig};
use crate::health::state::HealthStatus;

/// Wire protocol spoken by an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    Http,
    Https,
    Grpc,
}

impl Protocol {
    /// URL scheme used to reach the instance over HTTP.
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Https => "https",
            Protocol::Http | Protocol::Grpc => "http",
        }
    }
}

/// In-flight request counter shared by every copy of an instance.
#[derive(Debug)]
pub struct InstanceLoad {
    active: AtomicUsize,
    capacity: usize,
}

impl InstanceLoad {
    pub fn new(capacity: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            capacity: capacity.max(1),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// `active / capacity`.
    pub fn ratio(&self) -> f64 {
        self.active() as f64 / self.capacity as f64
    }

    /// Count one request until the guard drops.
    pub fn acquire(self: &Arc<Self>) -> LoadGuard {
        self.active.fetch_add(1, Ordering::Relaxed);
        LoadGuard { load: self.clone() }
    }
}

/// RAII guard for one in-flight request.
#[derive(Debug)]
pub struct LoadGuard {
    load: Arc<InstanceLoad>,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.load.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// One registered instance of a service.
#[derive(Debug, Clone)]
pub struct ServiceInstance {
    pub id: String,
    pub service: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub health: HealthStatus,
    pub metadata: HashMap<String, String>,
    pub last_seen: Instant,
    pub load: Arc<InstanceLoad>,
}

impl ServiceInstance {
    /// New healthy instance with a generated ID.
    pub fn new(service: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            service: service.into(),
            version: "v1".to_string(),
            host: host.into(),
            port,
            protocol: Protocol::Http,
            health: HealthStatus::Healthy,
            metadata: HashMap::new(),
            last_seen: Instant::now(),
            load: Arc::new(InstanceLoad::new(100)),
        }
    }

    pub fn from_config(service: &ServiceConfig, config: &InstanceConfig) -> Self {
        let mut instance = Self::new(&service.name, &config.host, config.port)
            .with_version(&service.version)
            .with_protocol(config.protocol)
            .with_capacity(config.capacity);
        if let Some(id) = &config.id {
            instance.id = id.clone();
        }
        instance.metadata = config.metadata.clone();
        instance
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.load = Arc::new(InstanceLoad::new(capacity));
        self
    }

    pub fn with_health(mut self, health: HealthStatus) -> Self {
        self.health = health;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    /// `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn base_url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&format!("{}://{}", self.protocol.scheme(), self.address()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_guard_counts() {
        let instance = ServiceInstance::new("ml", "10.0.0.1", 8080).with_capacity(4);
        let copy = instance.clone();

        let g1 = instance.load.acquire();
        let g2 = copy.load.acquire();
        assert_eq!(instance.load.active(), 2);
        assert!((copy.load.ratio() - 0.5).abs() < f64::EPSILON);

        drop(g1);
        drop(g2);
        assert_eq!(instance.load.active(), 0);
    }

    #[test]
    fn test_base_url() {
        let instance = ServiceInstance::new("ml", "ml.internal", 8443).with_protocol(Protocol::Https);
        assert_eq!(instance.base_url().unwrap().as_str(), "https://ml.internal:8443/");
    }
}
