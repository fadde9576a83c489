//! Passive health checking (failure detection).
//!
//! # Responsibilities
//! - Observe call outcomes reported by the client
//! - Track consecutive failures per instance
//! - Mark an instance unhealthy through the load balancer on threshold breach
//!
//! # Design Decisions
//! - Only transient errors (retryable upstream failures, timeouts) count
//! - Rejections and caller errors say nothing about the instance
//! - Recovery is left to active health checks

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::MeshError;
use crate::health::state::HealthStatus;
use crate::load_balancer::LoadBalancer;

#[derive(Debug)]
pub struct PassiveHealth {
    balancer: Arc<LoadBalancer>,
    unhealthy_threshold: u32,
    failures: DashMap<String, u32>,
}

impl PassiveHealth {
    pub fn new(balancer: Arc<LoadBalancer>, unhealthy_threshold: u32) -> Self {
        Self {
            balancer,
            unhealthy_threshold: unhealthy_threshold.max(1),
            failures: DashMap::new(),
        }
    }

    pub fn record_success(&self, instance_id: &str) {
        self.failures.remove(instance_id);
    }

    /// Returns true when this failure marked the instance unhealthy.
    pub fn record_failure(&self, instance_id: &str, error: &MeshError) -> bool {
        if !error.is_transient() {
            return false;
        }

        let count = {
            let mut entry = self.failures.entry(instance_id.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        if count < self.unhealthy_threshold {
            return false;
        }

        self.failures.remove(instance_id);
        tracing::warn!(instance = %instance_id, failures = count, "Passive health check marking instance unhealthy");
        match self.balancer.update_health(instance_id, HealthStatus::Unhealthy) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(instance = %instance_id, error = %e, "Instance gone before passive health update");
                false
            }
        }
    }
}
