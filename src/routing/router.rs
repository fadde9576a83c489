//! Endpoint selection for classification requests.
//!
//! # Responsibilities
//! - Pick an endpoint per request from flags, experiments or measured performance
//! - Refuse endpoints that are unhealthy, stale or behind an open breaker
//! - Fall back to the default endpoint, then any endpoint of the request
//!   type, then any routable endpoint
//! - Run the router's periodic work: health checks, breaker monitoring,
//!   metrics aggregation and alerting
//!
//! # Design Decisions
//! - Performance ties resolve to the default endpoint, then higher weight,
//!   then registration order
//! - An expired or cancelled context fails before any selection work
//! - A decision holds the endpoint's admission guard; half-open endpoints
//!   only receive as many requests as they have trial slots
//! - The endpoint list has its own lock and is never held across an await

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::{EndpointConfig, RouterConfig};
use crate::error::{MeshError, MeshResult};
use crate::health::probe::HealthProbe;
use crate::observability::metrics;
use crate::resilience::{CircuitState, Context};
use crate::routing::endpoint::{EndpointGuard, ServiceEndpoint};
use crate::routing::flags::{select_experiment_model, FeatureFlagProvider, FeatureFlags, FlagSelection};
use crate::routing::scoring::{meets_requirements, score};
use crate::routing::RoutingStrategy;

const SCORE_EPSILON: f64 = 1e-9;

/// A request to be routed.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub request_id: String,
    pub request_type: String,
    /// Highest acceptable average latency.
    pub max_latency: Option<Duration>,
    /// Lowest acceptable reported accuracy.
    pub min_accuracy: Option<f64>,
}

impl RouteRequest {
    pub fn new(request_id: impl Into<String>, request_type: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            request_type: request_type.into(),
            max_latency: None,
            min_accuracy: None,
        }
    }

    pub fn with_max_latency(mut self, max_latency: Duration) -> Self {
        self.max_latency = Some(max_latency);
        self
    }

    pub fn with_min_accuracy(mut self, min_accuracy: f64) -> Self {
        self.min_accuracy = Some(min_accuracy);
        self
    }
}

/// Why an endpoint was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteReason {
    AbTest,
    Rollout,
    FeatureFlag,
    Performance,
    Fallback,
}

impl RouteReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteReason::AbTest => "ab_test",
            RouteReason::Rollout => "rollout",
            RouteReason::FeatureFlag => "feature_flag",
            RouteReason::Performance => "performance",
            RouteReason::Fallback => "fallback",
        }
    }
}

impl From<FlagSelection> for RouteReason {
    fn from(selection: FlagSelection) -> Self {
        match selection {
            FlagSelection::AbTest => RouteReason::AbTest,
            FlagSelection::Rollout => RouteReason::Rollout,
        }
    }
}

/// Outcome of `route_request`.
///
/// Holds the request's admission on the endpoint: keep the decision alive
/// for the duration of the call and report the outcome with
/// [`RouteDecision::finish`].
#[derive(Debug)]
pub struct RouteDecision {
    pub endpoint: Arc<ServiceEndpoint>,
    pub reason: RouteReason,
    /// Endpoint picked before the routability check, when it differs.
    pub rejected: Option<String>,
    guard: EndpointGuard,
}

impl RouteDecision {
    fn new(guard: EndpointGuard, reason: RouteReason, rejected: Option<String>) -> Self {
        Self {
            endpoint: Arc::clone(guard.endpoint()),
            reason,
            rejected,
            guard,
        }
    }

    pub fn name(&self) -> &str {
        &self.endpoint.name
    }

    /// Record the call outcome against the endpoint and release it.
    pub fn finish(self, latency: Duration, success: bool) {
        self.guard.finish(latency, success);
    }
}

/// Condition raised by alert processing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouterAlert {
    HighErrorRate { endpoint: String, error_rate: f64 },
    CircuitOpen { endpoint: String },
    Unhealthy { endpoint: String },
}

pub struct IntelligentRouter {
    config: RouterConfig,
    flags: Arc<dyn FeatureFlagProvider>,
    probe: Arc<dyn HealthProbe>,
    endpoints: RwLock<Vec<Arc<ServiceEndpoint>>>,
}

impl std::fmt::Debug for IntelligentRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntelligentRouter")
            .field("strategy", &self.config.strategy)
            .field("endpoints", &self.endpoint_names())
            .finish()
    }
}

impl IntelligentRouter {
    /// Build a router with the configured endpoints registered.
    pub fn new(config: RouterConfig, flags: Arc<dyn FeatureFlagProvider>, probe: Arc<dyn HealthProbe>) -> Self {
        let router = Self {
            flags,
            probe,
            endpoints: RwLock::new(Vec::new()),
            config,
        };
        for endpoint in router.config.endpoints.clone() {
            router.register_endpoint(&endpoint);
        }
        router
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Add an endpoint, replacing any endpoint with the same name in place.
    pub fn register_endpoint(&self, config: &EndpointConfig) -> Arc<ServiceEndpoint> {
        let endpoint = Arc::new(ServiceEndpoint::new(
            config,
            self.config.circuit_breaker.clone(),
            self.config.latency_window,
        ));
        let mut endpoints = self.endpoints.write().expect("router lock poisoned");
        match endpoints.iter_mut().find(|e| e.name == config.name) {
            Some(slot) => *slot = Arc::clone(&endpoint),
            None => endpoints.push(Arc::clone(&endpoint)),
        }
        tracing::info!(
            endpoint = %config.name,
            url = %config.url,
            endpoint_type = %config.endpoint_type,
            weight = config.weight,
            "Endpoint registered"
        );
        endpoint
    }

    pub fn unregister_endpoint(&self, name: &str) -> bool {
        let mut endpoints = self.endpoints.write().expect("router lock poisoned");
        let before = endpoints.len();
        endpoints.retain(|e| e.name != name);
        before != endpoints.len()
    }

    pub fn endpoint(&self, name: &str) -> Option<Arc<ServiceEndpoint>> {
        let endpoints = self.endpoints.read().expect("router lock poisoned");
        endpoints.iter().find(|e| e.name == name).cloned()
    }

    pub fn endpoints(&self) -> Vec<Arc<ServiceEndpoint>> {
        self.endpoints.read().expect("router lock poisoned").clone()
    }

    pub fn endpoint_names(&self) -> Vec<String> {
        let endpoints = self.endpoints.read().expect("router lock poisoned");
        endpoints.iter().map(|e| e.name.clone()).collect()
    }

    /// Choose the endpoint that should answer `request`.
    pub fn route_request(&self, ctx: &Context, request: &RouteRequest) -> MeshResult<RouteDecision> {
        ctx.check()?;

        let flags = self.flags.flags();
        let endpoints = self.endpoints();
        let choice = self.choose(&flags, &endpoints, request);

        let now = Instant::now();
        let ttl = self.config.health_ttl();

        if let Some((name, reason)) = &choice {
            let admitted = endpoints
                .iter()
                .find(|e| &e.name == name)
                .filter(|e| e.is_routable(ttl, now))
                .and_then(|e| e.admit());
            if let Some(guard) = admitted {
                metrics::record_route_decision(name, reason.as_str());
                return Ok(RouteDecision::new(guard, *reason, None));
            }
        }

        let rejected = choice.map(|(name, _)| name);
        let fallback = self
            .fallback_candidates(&endpoints, &request.request_type, now)
            .into_iter()
            .find_map(|e| e.admit());
        match fallback {
            Some(guard) => {
                let endpoint = &guard.endpoint().name;
                tracing::info!(
                    request_id = %request.request_id,
                    rejected = ?rejected,
                    fallback = %endpoint,
                    "Routing to fallback endpoint"
                );
                metrics::record_route_decision(endpoint, RouteReason::Fallback.as_str());
                Ok(RouteDecision::new(guard, RouteReason::Fallback, rejected))
            }
            None => {
                tracing::warn!(
                    request_id = %request.request_id,
                    request_type = %request.request_type,
                    "No routable endpoint"
                );
                Err(MeshError::NoHealthyEndpoint {
                    request_type: request.request_type.clone(),
                })
            }
        }
    }

    fn choose(
        &self,
        flags: &FeatureFlags,
        endpoints: &[Arc<ServiceEndpoint>],
        request: &RouteRequest,
    ) -> Option<(String, RouteReason)> {
        if flags.experiments_active() {
            if let Some((model, selection)) = select_experiment_model(flags, &request.request_id) {
                return Some((model, selection.into()));
            }
            return Some((self.feature_flag_choice(flags, endpoints, request), RouteReason::FeatureFlag));
        }

        match self.config.strategy {
            RoutingStrategy::PerformanceBased => self
                .performance_choice(endpoints, request)
                .map(|name| (name, RouteReason::Performance)),
            RoutingStrategy::FeatureFlagBased => {
                Some((self.feature_flag_choice(flags, endpoints, request), RouteReason::FeatureFlag))
            }
            RoutingStrategy::Hybrid => Some(self.hybrid_choice(flags, endpoints, request)),
        }
    }

    /// First enabled model of the request type in priority order, else the
    /// default endpoint.
    fn feature_flag_choice(
        &self,
        flags: &FeatureFlags,
        endpoints: &[Arc<ServiceEndpoint>],
        request: &RouteRequest,
    ) -> String {
        self.config
            .model_priority
            .iter()
            .find(|model| {
                flags.is_model_enabled(model)
                    && endpoints
                        .iter()
                        .any(|e| &e.name == *model && e.endpoint_type == request.request_type)
            })
            .cloned()
            .unwrap_or_else(|| self.config.default_endpoint.clone())
    }

    /// Highest-scoring routable endpoint of the request type.
    fn performance_choice(&self, endpoints: &[Arc<ServiceEndpoint>], request: &RouteRequest) -> Option<String> {
        let now = Instant::now();
        let ttl = self.config.health_ttl();
        let max_latency = self.config.max_latency_threshold();

        let mut best: Option<(&Arc<ServiceEndpoint>, f64)> = None;
        for endpoint in endpoints
            .iter()
            .filter(|e| e.endpoint_type == request.request_type && e.is_routable(ttl, now))
        {
            let candidate = score(&endpoint.metrics(), &self.config.weights, max_latency);
            best = match best {
                None => Some((endpoint, candidate)),
                Some((current, current_score)) => {
                    if self.outranks(endpoint, candidate, current, current_score) {
                        Some((endpoint, candidate))
                    } else {
                        Some((current, current_score))
                    }
                }
            };
        }
        best.map(|(endpoint, _)| endpoint.name.clone())
    }

    fn outranks(&self, a: &ServiceEndpoint, a_score: f64, b: &ServiceEndpoint, b_score: f64) -> bool {
        if (a_score - b_score).abs() > SCORE_EPSILON {
            return a_score > b_score;
        }
        let a_default = a.name == self.config.default_endpoint;
        let b_default = b.name == self.config.default_endpoint;
        if a_default != b_default {
            return a_default;
        }
        a.weight > b.weight
    }

    fn hybrid_choice(
        &self,
        flags: &FeatureFlags,
        endpoints: &[Arc<ServiceEndpoint>],
        request: &RouteRequest,
    ) -> (String, RouteReason) {
        let flagged = self.feature_flag_choice(flags, endpoints, request);
        let Some(performant) = self.performance_choice(endpoints, request) else {
            return (flagged, RouteReason::FeatureFlag);
        };
        if performant == flagged {
            return (flagged, RouteReason::FeatureFlag);
        }

        let satisfies = endpoints
            .iter()
            .find(|e| e.name == performant)
            .is_some_and(|e| meets_requirements(&e.metrics(), request.max_latency, request.min_accuracy));
        if satisfies {
            (performant, RouteReason::Performance)
        } else {
            (flagged, RouteReason::FeatureFlag)
        }
    }

    /// Routable endpoints in fallback order: the default endpoint, then the
    /// request type, then anything else.
    fn fallback_candidates<'a>(
        &self,
        endpoints: &'a [Arc<ServiceEndpoint>],
        request_type: &str,
        now: Instant,
    ) -> Vec<&'a Arc<ServiceEndpoint>> {
        let ttl = self.config.health_ttl();
        let mut routable: Vec<&Arc<ServiceEndpoint>> =
            endpoints.iter().filter(|e| e.is_routable(ttl, now)).collect();
        routable.sort_by_key(|e| {
            if e.name == self.config.default_endpoint {
                0
            } else if e.endpoint_type == request_type {
                1
            } else {
                2
            }
        });
        routable
    }

    /// Record an outcome reported by endpoint name rather than through a
    /// held [`RouteDecision`].
    pub fn record_result(&self, name: &str, latency: Duration, success: bool) -> MeshResult<()> {
        let endpoint = self.endpoint(name).ok_or_else(|| MeshError::ServiceNotFound {
            service: name.to_string(),
        })?;
        endpoint.record_outcome(latency, success);
        Ok(())
    }

    pub fn record_accuracy(&self, name: &str, accuracy: f64) -> MeshResult<()> {
        let endpoint = self.endpoint(name).ok_or_else(|| MeshError::ServiceNotFound {
            service: name.to_string(),
        })?;
        endpoint.record_accuracy(accuracy);
        Ok(())
    }

    /// Probe every endpoint's health path.
    pub async fn check_health(&self) {
        for endpoint in self.endpoints() {
            let healthy = match endpoint.url.join(&self.config.health_path) {
                Ok(url) => self.probe.probe(&url).await,
                Err(e) => {
                    tracing::warn!(endpoint = %endpoint.name, error = %e, "Invalid health check URL");
                    false
                }
            };
            if endpoint.set_health(healthy, Instant::now()) {
                tracing::info!(endpoint = %endpoint.name, healthy, "Endpoint health changed");
            }
            metrics::record_endpoint_health(&endpoint.name, healthy);
        }
    }

    /// Apply due open → half-open transitions. Returns the open endpoints.
    pub fn monitor_circuits(&self) -> Vec<String> {
        self.endpoints()
            .iter()
            .filter(|e| e.breaker().poll_state() == CircuitState::Open)
            .map(|e| e.name.clone())
            .collect()
    }

    /// Recompute percentiles and publish endpoint gauges.
    pub fn aggregate_metrics(&self) {
        for endpoint in self.endpoints() {
            let snapshot = endpoint.aggregate();
            metrics::record_endpoint_metrics(&endpoint.name, &snapshot, endpoint.active_connections());
        }
    }

    /// Log and return the alert conditions currently present.
    pub fn process_alerts(&self) -> Vec<RouterAlert> {
        let mut alerts = Vec::new();
        for endpoint in self.endpoints() {
            let snapshot = endpoint.metrics();
            if snapshot.total_requests > 0 && snapshot.error_rate > self.config.alert_error_rate {
                tracing::warn!(
                    endpoint = %endpoint.name,
                    error_rate = snapshot.error_rate,
                    threshold = self.config.alert_error_rate,
                    "Endpoint error rate above threshold"
                );
                alerts.push(RouterAlert::HighErrorRate {
                    endpoint: endpoint.name.clone(),
                    error_rate: snapshot.error_rate,
                });
            }
            if endpoint.breaker().state() == CircuitState::Open {
                tracing::warn!(endpoint = %endpoint.name, "Endpoint circuit open");
                alerts.push(RouterAlert::CircuitOpen {
                    endpoint: endpoint.name.clone(),
                });
            }
            if !endpoint.is_healthy() {
                tracing::warn!(endpoint = %endpoint.name, "Endpoint unhealthy");
                alerts.push(RouterAlert::Unhealthy {
                    endpoint: endpoint.name.clone(),
                });
            }
        }
        alerts
    }
}
