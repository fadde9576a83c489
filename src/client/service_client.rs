//! The service client.
//!
//! # Responsibilities
//! - Compose rate limiting, load balancing, circuit breaking, timeouts,
//!   retries and metrics into one `call`
//! - Deliver `call_async` results on a one-shot channel
//! - Apply the configured fallback strategy under `full` isolation
//!
//! # Design Decisions
//! - Rate-limit and open-circuit rejections are returned at once, never retried
//! - One breaker per service name, shared with anything else using the registry
//! - A failed fallback returns the fallback's error, not the original
//! - An abandoned `call_async` drops the in-flight call

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::client::isolation::{FallbackStrategy, IsolationLevel};
use crate::client::transport::ServiceTransport;
use crate::config::ClientConfig;
use crate::discovery::ServiceInstance;
use crate::error::{MeshError, MeshResult};
use crate::health::passive::PassiveHealth;
use crate::load_balancer::LoadBalancer;
use crate::observability::metrics::{MetricsSink, PrometheusSink};
use crate::rate_limit::EnhancedRateLimiter;
use crate::resilience::{CircuitBreakerRegistry, Context, RetryPolicy};

/// Outcome delivered by `call_async`.
#[derive(Debug, Clone)]
pub struct CallResult {
    pub data: Option<Value>,
    pub error: Option<MeshError>,
    pub latency: Duration,
}

impl CallResult {
    fn from_result(result: MeshResult<Value>, latency: Duration) -> Self {
        match result {
            Ok(data) => Self {
                data: Some(data),
                error: None,
                latency,
            },
            Err(error) => Self {
                data: None,
                error: Some(error),
                latency,
            },
        }
    }

    pub fn into_result(self) -> MeshResult<Value> {
        match (self.data, self.error) {
            (_, Some(error)) => Err(error),
            (Some(data), None) => Ok(data),
            (None, None) => Ok(Value::Null),
        }
    }
}

pub struct ServiceClient {
    config: ClientConfig,
    balancer: Arc<LoadBalancer>,
    limiter: Arc<EnhancedRateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
    transport: Arc<dyn ServiceTransport>,
    retry: RetryPolicy,
    passive: Option<Arc<PassiveHealth>>,
    metrics: Arc<dyn MetricsSink>,
    last_responses: DashMap<(String, String), Value>,
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient")
            .field("isolation_level", &self.config.isolation_level)
            .field("fallback_strategy", &self.config.fallback_strategy)
            .finish()
    }
}

impl ServiceClient {
    pub fn new(
        config: ClientConfig,
        balancer: Arc<LoadBalancer>,
        limiter: Arc<EnhancedRateLimiter>,
        breakers: Arc<CircuitBreakerRegistry>,
        transport: Arc<dyn ServiceTransport>,
    ) -> Self {
        let retry = RetryPolicy::new(config.retry.clone());
        Self {
            config,
            balancer,
            limiter,
            breakers,
            transport,
            retry,
            passive: None,
            metrics: Arc::new(PrometheusSink),
            last_responses: DashMap::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_passive_health(mut self, passive: Arc<PassiveHealth>) -> Self {
        self.passive = Some(passive);
        self
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.config.isolation_level
    }

    /// Call `method` on a healthy instance of `service`.
    pub async fn call(&self, ctx: &Context, service: &str, method: &str, request: Value) -> MeshResult<Value> {
        ctx.check()?;

        let start = Instant::now();
        let result = self.call_protected(ctx, service, method, &request).await;
        let latency = start.elapsed();

        self.metrics.record_request(service, method, latency, result.is_ok());
        match result {
            Ok(response) => {
                self.metrics.record_latency(service, method, latency);
                if self.config.isolation_level.falls_back()
                    && self.config.fallback_strategy == FallbackStrategy::CachedData
                {
                    self.last_responses
                        .insert((service.to_string(), method.to_string()), response.clone());
                }
                Ok(response)
            }
            Err(e) => {
                self.metrics.record_error(service, method, e.kind());
                if self.config.isolation_level.falls_back() && !is_caller_error(&e) {
                    self.fallback(ctx, service, method, &request, e).await
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Run `call` on its own task and deliver exactly one `CallResult`.
    ///
    /// Dropping the receiver cancels the in-flight call.
    pub fn call_async(
        self: &Arc<Self>,
        ctx: Context,
        service: impl Into<String>,
        method: impl Into<String>,
        request: Value,
    ) -> oneshot::Receiver<CallResult> {
        let (mut tx, rx) = oneshot::channel();
        let client = Arc::clone(self);
        let service = service.into();
        let method = method.into();

        tokio::spawn(async move {
            let start = Instant::now();
            let outcome = tokio::select! {
                result = client.call(&ctx, &service, &method, request) => Some(result),
                _ = tx.closed() => None,
            };
            match outcome {
                Some(result) => {
                    let _ = tx.send(CallResult::from_result(result, start.elapsed()));
                }
                None => {
                    tracing::debug!(service = %service, method = %method, "Async call abandoned by caller");
                }
            }
        });
        rx
    }

    async fn call_protected(&self, ctx: &Context, service: &str, method: &str, request: &Value) -> MeshResult<Value> {
        let level = self.config.isolation_level;

        if level.rate_limited() {
            let decision = self.limiter.check_rate_limit_optimized(ctx, service).await?;
            if let Some(rejection) = decision.to_error() {
                tracing::debug!(service = %service, error = %rejection, "Call rejected by rate limiter");
                return Err(rejection);
            }
        }

        let outcome = if level.retried() {
            self.retry
                .run(ctx, service, move |_| self.attempt(ctx, service, method, request))
                .await
        } else {
            self.attempt(ctx, service, method, request).await
        };

        if level.rate_limited() {
            self.limiter.record_outcome(service, outcome.is_ok());
        }
        outcome
    }

    /// One attempt against one selected instance.
    async fn attempt(&self, ctx: &Context, service: &str, method: &str, request: &Value) -> MeshResult<Value> {
        ctx.check()?;
        let level = self.config.isolation_level;
        let instance = self.balancer.select(service)?;
        let _load = instance.load.acquire();

        let result = if level.circuit_protected() {
            let breaker = self.breakers.get_or_create(service);
            breaker
                .execute(|| self.dispatch(ctx, &instance, method, request))
                .await
        } else {
            ctx.run(self.transport.call(&instance, method, request)).await?
        };

        if level.retried() {
            if let Some(passive) = &self.passive {
                match &result {
                    Ok(_) => passive.record_success(&instance.id),
                    Err(e) => {
                        passive.record_failure(&instance.id, e);
                    }
                }
            }
        }
        result
    }

    async fn dispatch(
        &self,
        ctx: &Context,
        instance: &ServiceInstance,
        method: &str,
        request: &Value,
    ) -> MeshResult<Value> {
        let timeout = self.config.request_timeout();
        match ctx
            .run(tokio::time::timeout(timeout, self.transport.call(instance, method, request)))
            .await?
        {
            Ok(result) => result,
            Err(_) => Err(MeshError::Timeout {
                target: instance.service.clone(),
                after: timeout,
            }),
        }
    }

    async fn fallback(
        &self,
        ctx: &Context,
        service: &str,
        method: &str,
        request: &Value,
        error: MeshError,
    ) -> MeshResult<Value> {
        let strategy = self.config.fallback_strategy;
        let result = match strategy {
            FallbackStrategy::StaticData => self.config.static_data.get(service).cloned(),
            FallbackStrategy::CachedData => self
                .last_responses
                .get(&(service.to_string(), method.to_string()))
                .map(|entry| entry.value().clone()),
            FallbackStrategy::DegradedResponse => Some(json!({
                "degraded": true,
                "service": service,
                "method": method,
                "reason": error.kind(),
            })),
            FallbackStrategy::AlternativeService => {
                let Some(alternative) = self.config.alternative_services.get(service) else {
                    return Err(error);
                };
                tracing::info!(service = %service, alternative = %alternative, error = %error, "Calling alternative service");
                return match self.call_protected(ctx, alternative, method, request).await {
                    Ok(response) => Ok(response),
                    Err(fallback_error) => {
                        tracing::warn!(
                            service = %service,
                            alternative = %alternative,
                            error = %fallback_error,
                            "Alternative service failed"
                        );
                        Err(fallback_error)
                    }
                };
            }
        };

        match result {
            Some(response) => {
                tracing::info!(service = %service, method = %method, strategy = strategy.as_str(), error = %error, "Serving fallback response");
                Ok(response)
            }
            None => {
                tracing::warn!(service = %service, method = %method, strategy = strategy.as_str(), "No fallback data available");
                Err(error)
            }
        }
    }
}

fn is_caller_error(error: &MeshError) -> bool {
    matches!(
        error,
        MeshError::Cancelled | MeshError::DeadlineExceeded | MeshError::Validation(_)
    )
}
