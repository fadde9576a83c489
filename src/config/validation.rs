//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (default endpoint exists, unique IDs)
//! - Validate value ranges (thresholds > 0, ratios within [0, 1])
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: MeshConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;

use thiserror::Error;

use crate::config::schema::{CircuitBreakerConfig, MeshConfig, RetryConfig};

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &MeshConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.discovery.watch_buffer == 0 {
        errors.push(ValidationError::new("discovery.watch_buffer", "must be > 0"));
    }
    if config.discovery.stale_timeout_secs == 0 {
        errors.push(ValidationError::new("discovery.stale_timeout_secs", "must be > 0"));
    }
    if config.health_check.enabled && config.health_check.interval_secs == 0 {
        errors.push(ValidationError::new("health_check.interval_secs", "must be > 0"));
    }

    validate_breaker("circuit_breaker", &config.circuit_breaker, &mut errors);
    validate_breaker("rate_limit.circuit_breaker", &config.rate_limit.circuit_breaker, &mut errors);
    validate_breaker("router.circuit_breaker", &config.router.circuit_breaker, &mut errors);
    validate_retry("rate_limit.retry", &config.rate_limit.retry, &mut errors);
    validate_retry("client.retry", &config.client.retry, &mut errors);

    // Services and instances
    let mut service_names = HashSet::new();
    let mut instance_ids = HashSet::new();
    for service in &config.services {
        if service.name.is_empty() {
            errors.push(ValidationError::new("services.name", "must not be empty"));
        }
        if !service_names.insert(service.name.as_str()) {
            errors.push(ValidationError::new(
                "services.name",
                format!("duplicate service '{}'", service.name),
            ));
        }
        for instance in &service.instances {
            if instance.capacity == 0 {
                errors.push(ValidationError::new(
                    format!("services.{}.instances.capacity", service.name),
                    "must be > 0",
                ));
            }
            if let Some(id) = &instance.id {
                if !instance_ids.insert(id.as_str()) {
                    errors.push(ValidationError::new(
                        format!("services.{}.instances.id", service.name),
                        format!("duplicate instance id '{}'", id),
                    ));
                }
            }
        }
    }

    // Rate limiting
    let rl = &config.rate_limit;
    if rl.window_secs == 0 {
        errors.push(ValidationError::new("rate_limit.window_secs", "must be > 0"));
    }
    if rl.default_requests_per_minute == 0 {
        errors.push(ValidationError::new("rate_limit.default_requests_per_minute", "must be > 0"));
    }
    for provider in &rl.providers {
        if provider.requests_per_minute == 0 {
            errors.push(ValidationError::new(
                format!("rate_limit.providers.{}.requests_per_minute", provider.name),
                "must be > 0",
            ));
        }
    }
    for fallback in &rl.fallback_providers {
        if !(0.0..=1.0).contains(&fallback.success_rate) {
            errors.push(ValidationError::new(
                format!("rate_limit.fallback_providers.{}.success_rate", fallback.name),
                "must be within [0, 1]",
            ));
        }
    }
    for (group, members) in &rl.provider_groups {
        if members.is_empty() {
            errors.push(ValidationError::new(
                format!("rate_limit.provider_groups.{}", group),
                "must list at least one provider",
            ));
        }
    }

    let opt = &rl.optimization;
    if opt.cache_enabled && opt.cache_max_size == 0 {
        errors.push(ValidationError::new("rate_limit.optimization.cache_max_size", "must be > 0"));
    }
    if !(opt.predictive_threshold > 0.0 && opt.predictive_threshold <= 1.0) {
        errors.push(ValidationError::new(
            "rate_limit.optimization.predictive_threshold",
            "must be within (0, 1]",
        ));
    }
    if !(0.0..=1.0).contains(&opt.adaptive_success_threshold) {
        errors.push(ValidationError::new(
            "rate_limit.optimization.adaptive_success_threshold",
            "must be within [0, 1]",
        ));
    }
    if !(opt.adaptive_step > 0.0 && opt.adaptive_step < 1.0) {
        errors.push(ValidationError::new("rate_limit.optimization.adaptive_step", "must be within (0, 1)"));
    }
    if opt.adaptive_max_factor < 1.0 {
        errors.push(ValidationError::new("rate_limit.optimization.adaptive_max_factor", "must be >= 1"));
    }

    // Router
    let router = &config.router;
    let weights = router.weights;
    if weights.latency < 0.0 || weights.accuracy < 0.0 || weights.success_rate < 0.0 {
        errors.push(ValidationError::new("router.weights", "must not be negative"));
    } else if weights.latency + weights.accuracy + weights.success_rate <= 0.0 {
        errors.push(ValidationError::new("router.weights", "must not all be zero"));
    }
    if router.max_latency_threshold_ms == 0 {
        errors.push(ValidationError::new("router.max_latency_threshold_ms", "must be > 0"));
    }
    if router.latency_window == 0 {
        errors.push(ValidationError::new("router.latency_window", "must be > 0"));
    }
    let mut endpoint_names = HashSet::new();
    for endpoint in &router.endpoints {
        if !endpoint_names.insert(endpoint.name.as_str()) {
            errors.push(ValidationError::new(
                "router.endpoints.name",
                format!("duplicate endpoint '{}'", endpoint.name),
            ));
        }
    }
    if !router.endpoints.is_empty() && !endpoint_names.contains(router.default_endpoint.as_str()) {
        errors.push(ValidationError::new(
            "router.default_endpoint",
            format!("'{}' is not a configured endpoint", router.default_endpoint),
        ));
    }

    let flags = &config.feature_flags;
    if flags.rollout_percentage > 100 {
        errors.push(ValidationError::new("feature_flags.rollout_percentage", "must be <= 100"));
    }
    if flags.gradual_rollout_enabled && flags.rollout_model.is_none() {
        errors.push(ValidationError::new(
            "feature_flags.rollout_model",
            "required when gradual rollout is enabled",
        ));
    }

    if config.client.request_timeout_ms == 0 {
        errors.push(ValidationError::new("client.request_timeout_ms", "must be > 0"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_breaker(prefix: &str, config: &CircuitBreakerConfig, errors: &mut Vec<ValidationError>) {
    if config.failure_threshold == 0 {
        errors.push(ValidationError::new(format!("{}.failure_threshold", prefix), "must be > 0"));
    }
    if config.success_threshold == 0 {
        errors.push(ValidationError::new(format!("{}.success_threshold", prefix), "must be > 0"));
    }
    if config.half_open_max_calls < config.success_threshold {
        errors.push(ValidationError::new(
            format!("{}.half_open_max_calls", prefix),
            "must be >= success_threshold",
        ));
    }
}

fn validate_retry(prefix: &str, config: &RetryConfig, errors: &mut Vec<ValidationError>) {
    if config.backoff_multiplier < 1.0 {
        errors.push(ValidationError::new(format!("{}.backoff_multiplier", prefix), "must be >= 1"));
    }
    if !(0.0..=1.0).contains(&config.jitter_factor) {
        errors.push(ValidationError::new(format!("{}.jitter_factor", prefix), "must be within [0, 1]"));
    }
    if config.max_delay_ms < config.base_delay_ms {
        errors.push(ValidationError::new(format!("{}.max_delay_ms", prefix), "must be >= base_delay_ms"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::EndpointConfig;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&MeshConfig::default()).is_ok());
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = MeshConfig::default();
        config.rate_limit.window_secs = 0;
        config.rate_limit.retry.jitter_factor = 1.5;
        config.router.weights.latency = -1.0;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.field == "rate_limit.window_secs"));
        assert!(errors.iter().any(|e| e.field == "rate_limit.retry.jitter_factor"));
        assert!(errors.iter().any(|e| e.field == "router.weights"));
    }

    #[test]
    fn test_default_endpoint_must_exist() {
        let mut config = MeshConfig::default();
        config.router.endpoints.push(EndpointConfig {
            name: "bert_classification".into(),
            url: "http://bert:8000".parse().unwrap(),
            endpoint_type: "classification".into(),
            weight: 100,
        });

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "router.default_endpoint");
    }
}
