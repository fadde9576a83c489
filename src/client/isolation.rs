//! Isolation levels and fallback strategies for client calls.
//!
//! ```text
//! none      → select instance, dispatch
//! basic     → + rate-limit admission, circuit breaker, per-attempt timeout
//! enhanced  → + local retries, passive health reporting
//! full      → + fallback strategy on failure
//! ```

use serde::{Deserialize, Serialize};

/// How many protections wrap a call. Levels are cumulative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    None,
    Basic,
    #[default]
    Enhanced,
    Full,
}

impl IsolationLevel {
    pub fn rate_limited(self) -> bool {
        self >= IsolationLevel::Basic
    }

    pub fn circuit_protected(self) -> bool {
        self >= IsolationLevel::Basic
    }

    pub fn retried(self) -> bool {
        self >= IsolationLevel::Enhanced
    }

    pub fn falls_back(self) -> bool {
        self == IsolationLevel::Full
    }
}

/// What a `full` isolation call returns once the primary path fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// Configured JSON for the service.
    StaticData,
    /// Last successful response for the same service and method.
    CachedData,
    /// Same method on a configured alternate service.
    AlternativeService,
    /// Synthetic payload flagged as degraded.
    #[default]
    DegradedResponse,
}

impl FallbackStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackStrategy::StaticData => "static_data",
            FallbackStrategy::CachedData => "cached_data",
            FallbackStrategy::AlternativeService => "alternative_service",
            FallbackStrategy::DegradedResponse => "degraded_response",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_are_cumulative() {
        assert!(!IsolationLevel::None.rate_limited());
        assert!(IsolationLevel::Basic.circuit_protected());
        assert!(!IsolationLevel::Basic.retried());
        assert!(IsolationLevel::Enhanced.retried());
        assert!(!IsolationLevel::Enhanced.falls_back());
        assert!(IsolationLevel::Full.retried() && IsolationLevel::Full.falls_back());
    }

    #[test]
    fn test_deserialize_snake_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            level: IsolationLevel,
            fallback: FallbackStrategy,
        }
        let parsed: Wrapper = toml::from_str("level = \"full\"\nfallback = \"alternative_service\"").unwrap();
        assert_eq!(parsed.level, IsolationLevel::Full);
        assert_eq!(parsed.fallback, FallbackStrategy::AlternativeService);
    }
}
