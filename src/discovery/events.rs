//! Discovery change notifications.

use serde::Serialize;

use crate::discovery::instance::ServiceInstance;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryEventKind {
    Added,
    Updated,
    Removed,
}

/// A change to one instance, delivered to watchers of its service.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Added(ServiceInstance),
    Updated(ServiceInstance),
    Removed(ServiceInstance),
}

impl DiscoveryEvent {
    pub fn kind(&self) -> DiscoveryEventKind {
        match self {
            DiscoveryEvent::Added(_) => DiscoveryEventKind::Added,
            DiscoveryEvent::Updated(_) => DiscoveryEventKind::Updated,
            DiscoveryEvent::Removed(_) => DiscoveryEventKind::Removed,
        }
    }

    pub fn instance(&self) -> &ServiceInstance {
        match self {
            DiscoveryEvent::Added(i) | DiscoveryEvent::Updated(i) | DiscoveryEvent::Removed(i) => i,
        }
    }

    pub fn service(&self) -> &str {
        &self.instance().service
    }
}
