//! Feature flags consumed by the router.
//!
//! # Responsibilities
//! - Expose A/B testing, gradual rollout and per-model toggles
//! - Deterministically bucket requests for A/B and rollout selection
//!
//! # Design Decisions
//! - Readers get an immutable snapshot; reloads swap the whole set atomically
//! - Bucketing hashes the request id so one request always lands in one bucket

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub ab_testing_enabled: bool,

    /// Models split evenly under A/B testing.
    pub ab_variants: Vec<String>,

    pub gradual_rollout_enabled: bool,

    /// Model receiving rollout traffic.
    pub rollout_model: Option<String>,

    /// Share of requests (0-100) sent to `rollout_model`.
    pub rollout_percentage: u8,

    /// Per-model toggles keyed by endpoint name.
    pub models: HashMap<String, bool>,
}

impl FeatureFlags {
    pub fn is_model_enabled(&self, model: &str) -> bool {
        self.models.get(model).copied().unwrap_or(false)
    }

    /// Whether model selection is delegated to A/B or rollout bucketing.
    pub fn experiments_active(&self) -> bool {
        self.ab_testing_enabled || self.gradual_rollout_enabled
    }
}

/// How a flag-driven selection was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagSelection {
    AbTest,
    Rollout,
}

/// A/B or rollout choice for one request, if the experiment claims it.
pub fn select_experiment_model(flags: &FeatureFlags, request_id: &str) -> Option<(String, FlagSelection)> {
    if flags.ab_testing_enabled && !flags.ab_variants.is_empty() {
        let index = (bucket(request_id) % flags.ab_variants.len() as u64) as usize;
        return Some((flags.ab_variants[index].clone(), FlagSelection::AbTest));
    }

    if flags.gradual_rollout_enabled {
        if let Some(model) = &flags.rollout_model {
            if bucket(request_id) % 100 < u64::from(flags.rollout_percentage.min(100)) {
                return Some((model.clone(), FlagSelection::Rollout));
            }
        }
    }
    None
}

fn bucket(request_id: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    request_id.hash(&mut hasher);
    hasher.finish()
}

/// Read-only source of the current flags.
pub trait FeatureFlagProvider: Send + Sync {
    fn flags(&self) -> Arc<FeatureFlags>;
}

/// In-process flags, replaceable at runtime.
#[derive(Debug)]
pub struct StaticFeatureFlags {
    current: ArcSwap<FeatureFlags>,
}

impl StaticFeatureFlags {
    pub fn new(flags: FeatureFlags) -> Self {
        Self {
            current: ArcSwap::from_pointee(flags),
        }
    }

    /// Atomically replace every flag.
    pub fn store(&self, flags: FeatureFlags) {
        self.current.store(Arc::new(flags));
        tracing::info!("Feature flags updated");
    }
}

impl Default for StaticFeatureFlags {
    fn default() -> Self {
        Self::new(FeatureFlags::default())
    }
}

impl FeatureFlagProvider for StaticFeatureFlags {
    fn flags(&self) -> Arc<FeatureFlags> {
        self.current.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ab_split_is_deterministic() {
        let flags = FeatureFlags {
            ab_testing_enabled: true,
            ab_variants: vec!["bert_classification".into(), "ensemble_classification".into()],
            ..FeatureFlags::default()
        };

        let first = select_experiment_model(&flags, "req-42").unwrap();
        let again = select_experiment_model(&flags, "req-42").unwrap();
        assert_eq!(first, again);
        assert_eq!(first.1, FlagSelection::AbTest);

        let mut seen = std::collections::HashSet::new();
        for i in 0..200 {
            seen.insert(select_experiment_model(&flags, &format!("req-{i}")).unwrap().0);
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_rollout_bounds() {
        let mut flags = FeatureFlags {
            gradual_rollout_enabled: true,
            rollout_model: Some("bert_classification".into()),
            rollout_percentage: 0,
            ..FeatureFlags::default()
        };
        assert!((0..100).all(|i| select_experiment_model(&flags, &format!("r{i}")).is_none()));

        flags.rollout_percentage = 100;
        assert!((0..100).all(|i| select_experiment_model(&flags, &format!("r{i}")).is_some()));
    }

    #[test]
    fn test_store_swaps_snapshot() {
        let provider = StaticFeatureFlags::default();
        let before = provider.flags();

        let mut next = FeatureFlags::default();
        next.models.insert("bert_classification".into(), true);
        provider.store(next);

        assert!(!before.is_model_enabled("bert_classification"));
        assert!(provider.flags().is_model_enabled("bert_classification"));
    }
}
