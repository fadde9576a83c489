//! Fallback providers used when the primary provider is exhausted.
//!
//! A provider whose success rate sank below the minimum is skipped, but
//! once `retry_after` has passed since its last call it is offered again
//! when no provider above the minimum is left. One good result lifts it
//! back over the bar; a bad one restarts the wait.

use std::sync::RwLock;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::FallbackProviderConfig;

/// Weight of the newest outcome in the success-rate average.
const SUCCESS_RATE_ALPHA: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct FallbackProvider {
    pub name: String,
    /// Higher is preferred.
    pub priority: u32,
    /// Exponential moving average of call outcomes.
    pub success_rate: f64,
    pub available: bool,
    pub total_calls: u64,
    pub last_used: Option<Instant>,
}

impl FallbackProvider {
    pub fn new(name: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            priority,
            success_rate: 1.0,
            available: true,
            total_calls: 0,
            last_used: None,
        }
    }
}

impl From<&FallbackProviderConfig> for FallbackProvider {
    fn from(config: &FallbackProviderConfig) -> Self {
        Self {
            success_rate: config.success_rate,
            available: config.available,
            ..Self::new(&config.name, config.priority)
        }
    }
}

/// Fallback providers in registration order.
#[derive(Debug)]
pub struct FallbackRegistry {
    providers: RwLock<Vec<FallbackProvider>>,
    min_success_rate: f64,
    retry_after: Duration,
}

impl FallbackRegistry {
    pub fn new(min_success_rate: f64, retry_after: Duration) -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
            min_success_rate,
            retry_after,
        }
    }

    pub fn from_config(configs: &[FallbackProviderConfig], min_success_rate: f64, retry_after: Duration) -> Self {
        let registry = Self::new(min_success_rate, retry_after);
        for config in configs {
            registry.register(FallbackProvider::from(config));
        }
        registry
    }

    /// Add or replace by name.
    pub fn register(&self, provider: FallbackProvider) {
        let mut providers = self.providers.write().expect("fallback lock poisoned");
        match providers.iter_mut().find(|p| p.name == provider.name) {
            Some(existing) => *existing = provider,
            None => providers.push(provider),
        }
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut providers = self.providers.write().expect("fallback lock poisoned");
        let before = providers.len();
        providers.retain(|p| p.name != name);
        providers.len() != before
    }

    /// Returns false when no provider has this name.
    pub fn set_available(&self, name: &str, available: bool) -> bool {
        let mut providers = self.providers.write().expect("fallback lock poisoned");
        match providers.iter_mut().find(|p| p.name == name) {
            Some(p) => {
                if p.available != available {
                    tracing::info!(fallback = %name, available, "Fallback availability changed");
                }
                p.available = available;
                true
            }
            None => false,
        }
    }

    /// Highest-priority usable provider. Ties prefer the better success rate,
    /// then registration order. Providers due for a retry are only chosen
    /// when every provider above the minimum rate is gone.
    pub fn select(&self) -> Option<String> {
        let now = Instant::now();
        let providers = self.providers.read().expect("fallback lock poisoned");
        let pick = |eligible: &dyn Fn(&FallbackProvider) -> bool| {
            let mut best: Option<&FallbackProvider> = None;
            for p in providers.iter().filter(|p| p.available && eligible(*p)) {
                let better = match best {
                    None => true,
                    Some(b) => {
                        p.priority > b.priority || (p.priority == b.priority && p.success_rate > b.success_rate)
                    }
                };
                if better {
                    best = Some(p);
                }
            }
            best.map(|p| p.name.clone())
        };

        pick(&|p: &FallbackProvider| p.success_rate >= self.min_success_rate).or_else(|| {
            pick(&|p: &FallbackProvider| {
                p.last_used
                    .map_or(true, |at| now.saturating_duration_since(at) >= self.retry_after)
            })
        })
    }

    pub fn has_available(&self) -> bool {
        self.select().is_some()
    }

    pub fn record_result(&self, name: &str, success: bool) {
        let mut providers = self.providers.write().expect("fallback lock poisoned");
        let Some(p) = providers.iter_mut().find(|p| p.name == name) else {
            return;
        };
        let outcome = if success { 1.0 } else { 0.0 };
        p.success_rate = p.success_rate * (1.0 - SUCCESS_RATE_ALPHA) + outcome * SUCCESS_RATE_ALPHA;
        p.total_calls += 1;
        p.last_used = Some(Instant::now());

        if p.success_rate < self.min_success_rate {
            tracing::warn!(
                fallback = %name,
                success_rate = p.success_rate,
                retry_after = ?self.retry_after,
                "Fallback success rate below minimum, skipping it"
            );
        }
    }

    pub fn snapshot(&self) -> Vec<FallbackProvider> {
        self.providers.read().expect("fallback lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_by_priority() {
        let registry = FallbackRegistry::new(0.2, Duration::from_secs(30));
        registry.register(FallbackProvider::new("cache", 1));
        registry.register(FallbackProvider::new("rules", 5));
        registry.register(FallbackProvider::new("backup", 5));

        assert_eq!(registry.select().as_deref(), Some("rules"));

        registry.set_available("rules", false);
        assert_eq!(registry.select().as_deref(), Some("backup"));

        registry.set_available("backup", false);
        assert_eq!(registry.select().as_deref(), Some("cache"));

        assert!(registry.remove("cache"));
        assert!(registry.select().is_none());
    }

    #[test]
    fn test_success_rate_average() {
        let registry = FallbackRegistry::new(0.5, Duration::from_secs(30));
        registry.register(FallbackProvider::new("rules", 1));

        registry.record_result("rules", false);
        let rate = registry.snapshot()[0].success_rate;
        assert!((rate - 0.9).abs() < 1e-9);

        for _ in 0..10 {
            registry.record_result("rules", false);
        }
        // 0.9^11 < 0.5
        assert!(registry.select().is_none());
        assert_eq!(registry.snapshot()[0].total_calls, 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipped_fallback_retried_after_cooldown() {
        let registry = FallbackRegistry::new(0.2, Duration::from_secs(30));
        registry.register(FallbackProvider::new("rules", 1));

        for _ in 0..16 {
            registry.record_result("rules", false);
        }
        assert!(registry.select().is_none());

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(registry.select().is_none());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(registry.select().as_deref(), Some("rules"));

        // A failed retry restarts the wait.
        registry.record_result("rules", false);
        assert!(registry.select().is_none());

        tokio::time::advance(Duration::from_secs(30)).await;
        registry.record_result("rules", true);
        assert!(registry.snapshot()[0].success_rate >= 0.2);
        assert_eq!(registry.select().as_deref(), Some("rules"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_fallback_preferred_over_retry() {
        let registry = FallbackRegistry::new(0.2, Duration::from_secs(30));
        registry.register(FallbackProvider::new("primary_backup", 9));
        registry.register(FallbackProvider::new("cache", 1));

        for _ in 0..16 {
            registry.record_result("primary_backup", false);
        }
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(registry.select().as_deref(), Some("cache"));

        registry.set_available("cache", false);
        assert_eq!(registry.select().as_deref(), Some("primary_backup"));
    }
}
