//! Startup orchestration.
//!
//! # Responsibilities
//! - Build every mesh component from a validated `MeshConfig`
//! - Start the background workers in one `WorkerGroup`
//! - Apply hot-reloaded configuration
//!
//! # Design Decisions
//! - Fail fast: any construction error is fatal
//! - Components initialize in dependency order: registry and discovery,
//!   then balancer and limiter, then router and client
//! - Only feature flags are hot-reloadable; other changes need a restart

use std::sync::Arc;

use thiserror::Error;

use crate::client::{HttpTransport, ServiceClient, ServiceTransport};
use crate::config::MeshConfig;
use crate::discovery::ServiceDiscovery;
use crate::error::MeshError;
use crate::health::active::HealthMonitor;
use crate::health::passive::PassiveHealth;
use crate::health::probe::{HealthProbe, HttpHealthProbe};
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::workers::WorkerGroup;
use crate::load_balancer::LoadBalancer;
use crate::rate_limit::EnhancedRateLimiter;
use crate::registry::ServiceRegistry;
use crate::resilience::CircuitBreakerRegistry;
use crate::routing::{FeatureFlagProvider, IntelligentRouter, StaticFeatureFlags};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("failed to register configured instances: {0}")]
    Discovery(#[from] MeshError),
}

/// Every component of one running mesh.
pub struct Mesh {
    pub config: MeshConfig,
    pub registry: Arc<ServiceRegistry>,
    pub discovery: Arc<ServiceDiscovery>,
    pub balancer: Arc<LoadBalancer>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub limiter: Arc<EnhancedRateLimiter>,
    pub health: Arc<HealthMonitor>,
    pub passive: Arc<PassiveHealth>,
    pub flags: Arc<StaticFeatureFlags>,
    pub router: Arc<IntelligentRouter>,
    pub client: Arc<ServiceClient>,
}

impl Mesh {
    /// Build with HTTP health probes and the HTTP transport.
    pub fn from_config(config: MeshConfig) -> Result<Self, StartupError> {
        let probe: Arc<dyn HealthProbe> = Arc::new(HttpHealthProbe::new(config.health_check.timeout())?);
        let transport: Arc<dyn ServiceTransport> = Arc::new(HttpTransport::new(config.client.request_timeout())?);
        Self::with_parts(config, probe, transport)
    }

    /// Build with caller-supplied probe and transport.
    pub fn with_parts(
        config: MeshConfig,
        probe: Arc<dyn HealthProbe>,
        transport: Arc<dyn ServiceTransport>,
    ) -> Result<Self, StartupError> {
        let registry = Arc::new(ServiceRegistry::from_config(&config.services));

        let discovery = Arc::new(ServiceDiscovery::new(config.discovery.watch_buffer));
        discovery.register_from_config(&config.services)?;

        let balancer = Arc::new(LoadBalancer::new(Arc::clone(&discovery), config.load_balancer.strategy));
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        let limiter = Arc::new(EnhancedRateLimiter::new(config.rate_limit.clone()));

        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&discovery),
            Arc::clone(&registry),
            Arc::clone(&probe),
            config.health_check.clone(),
        ));
        let passive = Arc::new(PassiveHealth::new(
            Arc::clone(&balancer),
            config.health_check.unhealthy_threshold,
        ));

        let flags = Arc::new(StaticFeatureFlags::new(config.feature_flags.clone()));
        let router = Arc::new(IntelligentRouter::new(config.router.clone(), flags.clone(), probe));

        let client = Arc::new(
            ServiceClient::new(
                config.client.clone(),
                Arc::clone(&balancer),
                Arc::clone(&limiter),
                Arc::clone(&breakers),
                transport,
            )
            .with_passive_health(Arc::clone(&passive)),
        );

        tracing::info!(
            services = registry.len(),
            endpoints = router.endpoint_names().len(),
            balancing = balancer.strategy_name(),
            routing = config.router.strategy.as_str(),
            isolation = ?config.client.isolation_level,
            "Mesh initialized"
        );

        Ok(Self {
            config,
            registry,
            discovery,
            balancer,
            breakers,
            limiter,
            health,
            passive,
            flags,
            router,
            client,
        })
    }

    /// Start every periodic worker.
    pub fn start_workers(&self, shutdown: &Shutdown) -> WorkerGroup {
        let mut workers = WorkerGroup::new();

        if self.config.health_check.enabled {
            let health = Arc::clone(&self.health);
            workers.spawn_periodic("discovery_health_check", self.config.health_check.interval(), shutdown, move || {
                let health = Arc::clone(&health);
                async move { health.check_all().await }
            });
        } else {
            tracing::info!("Active health checks disabled");
        }

        let discovery = Arc::clone(&self.discovery);
        let stale_timeout = self.config.discovery.stale_timeout();
        workers.spawn_periodic("discovery_stale_cleanup", self.config.discovery.cleanup_interval(), shutdown, move || {
            let discovery = Arc::clone(&discovery);
            async move {
                discovery.cleanup_stale_instances(stale_timeout);
            }
        });

        let router_config = self.router.config();
        let interval = |secs: u64| std::time::Duration::from_secs(secs);

        let router = Arc::clone(&self.router);
        workers.spawn_periodic("router_health_check", interval(router_config.health_check_interval_secs), shutdown, move || {
            let router = Arc::clone(&router);
            async move { router.check_health().await }
        });

        let router = Arc::clone(&self.router);
        workers.spawn_periodic("router_circuit_monitor", interval(router_config.circuit_monitor_interval_secs), shutdown, move || {
            let router = Arc::clone(&router);
            async move {
                let open = router.monitor_circuits();
                if !open.is_empty() {
                    tracing::debug!(open = ?open, "Router endpoints with open circuits");
                }
            }
        });

        let router = Arc::clone(&self.router);
        workers.spawn_periodic("router_metrics", interval(router_config.metrics_interval_secs), shutdown, move || {
            let router = Arc::clone(&router);
            async move { router.aggregate_metrics() }
        });

        let router = Arc::clone(&self.router);
        workers.spawn_periodic("router_alerts", interval(router_config.alert_interval_secs), shutdown, move || {
            let router = Arc::clone(&router);
            async move {
                router.process_alerts();
            }
        });

        if self.config.rate_limit.optimization.cache_enabled {
            let limiter = Arc::clone(&self.limiter);
            workers.spawn_periodic(
                "rate_limit_cache_cleanup",
                self.config.rate_limit.optimization.cache_cleanup_interval(),
                shutdown,
                move || {
                    let limiter = Arc::clone(&limiter);
                    async move {
                        let purged = limiter.cleanup_cache();
                        if purged > 0 {
                            tracing::debug!(purged, "Expired rate-limit decisions purged");
                        }
                    }
                },
            );
        }

        tracing::info!(workers = ?workers.names(), "Background workers started");
        workers
    }

    /// Apply a reloaded configuration.
    pub fn apply_reload(&self, config: &MeshConfig) {
        if config.feature_flags != *self.flags.flags() {
            self.flags.store(config.feature_flags.clone());
        }
        if config.router.endpoints.len() != self.config.router.endpoints.len()
            || config.services.len() != self.config.services.len()
        {
            tracing::warn!("Service and endpoint changes take effect after restart");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::ServiceInstance;
    use crate::error::MeshResult;
    use futures_util::future::BoxFuture;
    use serde_json::Value;
    use std::time::Duration;
    use url::Url;

    struct AlwaysUp;

    impl HealthProbe for AlwaysUp {
        fn probe<'a>(&'a self, _url: &'a Url) -> BoxFuture<'a, bool> {
            Box::pin(async { true })
        }
    }

    struct Echo;

    impl ServiceTransport for Echo {
        fn call<'a>(
            &'a self,
            _instance: &'a ServiceInstance,
            _method: &'a str,
            request: &'a Value,
        ) -> BoxFuture<'a, MeshResult<Value>> {
            Box::pin(async move { Ok(request.clone()) })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_workers_start_and_stop() {
        let mesh = Mesh::with_parts(MeshConfig::default(), Arc::new(AlwaysUp), Arc::new(Echo)).unwrap();
        let shutdown = Shutdown::new();
        let workers = mesh.start_workers(&shutdown);
        assert!(workers.names().contains(&"router_health_check"));

        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.trigger();
        assert_eq!(workers.join_all(Duration::from_secs(5)).await, 0);
    }

    #[test]
    fn test_reload_swaps_flags() {
        let mesh = Mesh::with_parts(MeshConfig::default(), Arc::new(AlwaysUp), Arc::new(Echo)).unwrap();
        let mut next = MeshConfig::default();
        next.feature_flags.models.insert("bert_classification".into(), true);

        mesh.apply_reload(&next);
        assert!(mesh.flags.flags().is_model_enabled("bert_classification"));
    }
}
