//! Health state machine.
//!
//! # States
//! - Unknown: no verdict yet
//! - Healthy: instance receives traffic
//! - Unhealthy: instance excluded from discovery results
//!
//! # State Transitions
//! ```text
//! * → Unhealthy: consecutive failures >= unhealthy_threshold
//! * → Healthy: consecutive successes >= healthy_threshold
//! ```
//!
//! # Design Decisions
//! - Hysteresis prevents flapping
//! - Counters reset on state transition
//! - Callers log the transition the tracker reports

use std::fmt;

use serde::{Deserialize, Serialize};

/// Health snapshot of an instance, endpoint or service contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    /// Only an explicit healthy verdict counts.
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consecutive-outcome counter with hysteresis.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    status: HealthStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    healthy_threshold: u32,
    unhealthy_threshold: u32,
}

impl HealthTracker {
    pub fn new(initial: HealthStatus, healthy_threshold: u32, unhealthy_threshold: u32) -> Self {
        Self {
            status: initial,
            consecutive_failures: 0,
            consecutive_successes: 0,
            healthy_threshold: healthy_threshold.max(1),
            unhealthy_threshold: unhealthy_threshold.max(1),
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Record a successful probe. Returns the new status on a transition.
    pub fn record_success(&mut self) -> Option<HealthStatus> {
        self.consecutive_failures = 0;
        if self.status == HealthStatus::Healthy {
            return None;
        }

        self.consecutive_successes += 1;
        if self.consecutive_successes >= self.healthy_threshold {
            self.set(HealthStatus::Healthy);
            return Some(HealthStatus::Healthy);
        }
        None
    }

    /// Record a failed probe. Returns the new status on a transition.
    pub fn record_failure(&mut self) -> Option<HealthStatus> {
        self.consecutive_successes = 0;
        if self.status == HealthStatus::Unhealthy {
            return None;
        }

        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.unhealthy_threshold {
            self.set(HealthStatus::Unhealthy);
            return Some(HealthStatus::Unhealthy);
        }
        None
    }

    /// Adopt a status decided elsewhere (manual update, re-registration).
    pub fn set(&mut self, status: HealthStatus) {
        self.status = status;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
    }
}
