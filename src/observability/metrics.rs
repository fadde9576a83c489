//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define mesh metrics (calls, latency, errors, breaker and limiter state)
//! - Expose a Prometheus scrape endpoint
//! - Offer the write-only `MetricsSink` the client reports through
//!
//! # Metrics
//! - `mesh_requests_total` (counter): calls by service, method, outcome
//! - `mesh_request_duration_seconds` (histogram): successful call latency
//! - `mesh_errors_total` (counter): failed calls by error kind
//! - `mesh_instance_health` (gauge): 1=healthy, 0=unhealthy
//! - `mesh_circuit_state` (gauge): 0=closed, 1=half_open, 2=open
//! - `mesh_rate_limit_decisions_total` (counter): admissions and rejections
//! - `mesh_endpoint_*` (gauges): router endpoint performance
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - Labels are target names, never request data

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::resilience::CircuitState;
use crate::routing::endpoint::EndpointMetrics;

/// Write-only metrics interface for call outcomes.
pub trait MetricsSink: Send + Sync {
    fn record_request(&self, target: &str, method: &str, duration: Duration, success: bool);
    fn record_latency(&self, target: &str, method: &str, latency: Duration);
    fn record_error(&self, target: &str, method: &str, kind: &str);
}

/// Sink backed by the global `metrics` recorder.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusSink;

impl MetricsSink for PrometheusSink {
    fn record_request(&self, target: &str, method: &str, _duration: Duration, success: bool) {
        let outcome = if success { "success" } else { "error" };
        metrics::counter!(
            "mesh_requests_total",
            "service" => target.to_string(),
            "method" => method.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }

    fn record_latency(&self, target: &str, method: &str, latency: Duration) {
        metrics::histogram!(
            "mesh_request_duration_seconds",
            "service" => target.to_string(),
            "method" => method.to_string()
        )
        .record(latency.as_secs_f64());
    }

    fn record_error(&self, target: &str, method: &str, kind: &str) {
        metrics::counter!(
            "mesh_errors_total",
            "service" => target.to_string(),
            "method" => method.to_string(),
            "kind" => kind.to_string()
        )
        .increment(1);
    }
}

/// Install the Prometheus recorder and its HTTP listener on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_instance_health(service: &str, instance: &str, healthy: bool) {
    metrics::gauge!(
        "mesh_instance_health",
        "service" => service.to_string(),
        "instance" => instance.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_stale_evicted(service: &str) {
    metrics::counter!("mesh_stale_instances_evicted_total", "service" => service.to_string()).increment(1);
}

pub fn record_watch_event_dropped(service: &str) {
    metrics::counter!("mesh_watch_events_dropped_total", "service" => service.to_string()).increment(1);
}

pub fn record_circuit_state(target: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    metrics::gauge!("mesh_circuit_state", "target" => target.to_string()).set(value);
}

pub fn record_circuit_rejected(target: &str) {
    metrics::counter!("mesh_circuit_rejections_total", "target" => target.to_string()).increment(1);
}

pub fn record_rate_limit_decision(provider: &str, allowed: bool) {
    let decision = if allowed { "admitted" } else { "rejected" };
    metrics::counter!(
        "mesh_rate_limit_decisions_total",
        "provider" => provider.to_string(),
        "decision" => decision
    )
    .increment(1);
}

pub fn record_cache_hit() {
    metrics::counter!("mesh_rate_limit_cache_hits_total").increment(1);
}

pub fn record_cache_eviction() {
    metrics::counter!("mesh_rate_limit_cache_evictions_total").increment(1);
}

pub fn record_adaptive_limit(provider: &str, limit: u32) {
    metrics::gauge!("mesh_rate_limit_limit", "provider" => provider.to_string()).set(f64::from(limit));
}

pub fn record_route_decision(endpoint: &str, reason: &'static str) {
    metrics::counter!(
        "mesh_route_decisions_total",
        "endpoint" => endpoint.to_string(),
        "reason" => reason
    )
    .increment(1);
}

pub fn record_endpoint_health(endpoint: &str, healthy: bool) {
    metrics::gauge!("mesh_endpoint_health", "endpoint" => endpoint.to_string()).set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_endpoint_metrics(endpoint: &str, snapshot: &EndpointMetrics, active_connections: usize) {
    let label = endpoint.to_string();
    metrics::gauge!("mesh_endpoint_latency_p50_ms", "endpoint" => label.clone()).set(snapshot.p50_latency_ms);
    metrics::gauge!("mesh_endpoint_latency_p95_ms", "endpoint" => label.clone()).set(snapshot.p95_latency_ms);
    metrics::gauge!("mesh_endpoint_latency_p99_ms", "endpoint" => label.clone()).set(snapshot.p99_latency_ms);
    metrics::gauge!("mesh_endpoint_error_rate", "endpoint" => label.clone()).set(snapshot.error_rate);
    metrics::gauge!("mesh_endpoint_active_connections", "endpoint" => label).set(active_connections as f64);
}
