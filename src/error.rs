//! Error taxonomy shared by every mesh component.
//!
//! # Design Decisions
//! - One enum for the whole call path so the client, router and rate limiter
//!   can hand errors to each other without re-wrapping
//! - Callers branch on `is_retry_later()` vs. terminal errors, never on strings
//! - Rate-limit and open-circuit rejections are not transient: they are never
//!   retried locally and consume no retry budget

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the service-communication layer.
#[derive(Debug, Clone, Error)]
pub enum MeshError {
    /// Provider quota for the current window is used up.
    #[error("rate limit exceeded for '{provider}', retry after {retry_after:?}")]
    RateLimitExceeded {
        provider: String,
        retry_after: Duration,
    },

    /// The target's circuit breaker refused the call.
    #[error("circuit open for '{target}'")]
    CircuitOpen { target: String },

    /// Discovery knows the service but none of its instances are healthy.
    #[error("no healthy instances for service '{service}'")]
    NoHealthyInstances { service: String },

    /// The router could not find any routable endpoint.
    #[error("no healthy endpoint for request type '{request_type}'")]
    NoHealthyEndpoint { request_type: String },

    /// Primary provider, every fallback and every retry failed.
    #[error("all providers failed for '{provider}' after {attempts} attempts: {last_error}")]
    AllProvidersFailed {
        provider: String,
        attempts: u32,
        last_error: Box<MeshError>,
    },

    /// No instance with this ID is registered under any service.
    #[error("instance '{id}' not found")]
    InstanceNotFound { id: String },

    /// The service name was never registered.
    #[error("service '{service}' not found")]
    ServiceNotFound { service: String },

    /// The downstream call itself failed.
    #[error("call to '{target}' failed: {message}")]
    Upstream {
        target: String,
        message: String,
        retryable: bool,
    },

    /// The per-call timeout elapsed before the downstream answered.
    #[error("call to '{target}' timed out after {after:?}")]
    Timeout { target: String, after: Duration },

    /// Transient failures persisted through every local retry.
    #[error("gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<MeshError>,
    },

    /// The caller's context was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The caller's context deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// The request can never succeed as given.
    #[error("invalid request: {0}")]
    Validation(String),
}

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;

impl MeshError {
    /// Worth retrying locally with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            MeshError::Upstream { retryable, .. } => *retryable,
            MeshError::Timeout { .. } => true,
            _ => false,
        }
    }

    /// "Try again later" as opposed to "this request cannot succeed".
    pub fn is_retry_later(&self) -> bool {
        match self {
            MeshError::RateLimitExceeded { .. } | MeshError::CircuitOpen { .. } => true,
            MeshError::RetriesExhausted { source, .. } => source.is_retry_later(),
            other => other.is_transient(),
        }
    }

    /// Suggested wait for rate-limit rejections.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            MeshError::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            MeshError::RateLimitExceeded { .. } => "rate_limited",
            MeshError::CircuitOpen { .. } => "circuit_open",
            MeshError::NoHealthyInstances { .. } => "no_healthy_instances",
            MeshError::NoHealthyEndpoint { .. } => "no_healthy_endpoint",
            MeshError::AllProvidersFailed { .. } => "all_providers_failed",
            MeshError::InstanceNotFound { .. } => "instance_not_found",
            MeshError::ServiceNotFound { .. } => "service_not_found",
            MeshError::Upstream { .. } => "upstream",
            MeshError::Timeout { .. } => "timeout",
            MeshError::RetriesExhausted { .. } => "retries_exhausted",
            MeshError::Cancelled => "cancelled",
            MeshError::DeadlineExceeded => "deadline_exceeded",
            MeshError::Validation(_) => "validation",
        }
    }
}
