//! Retry logic.
//!
//! # Responsibilities
//! - Decide whether a failed attempt is retried locally
//! - Wait between attempts with exponential backoff + jitter
//! - Surface the final transient error wrapped with the attempt count
//!
//! # Design Decisions
//! - Only transient errors are retried; rate-limit and open-circuit
//!   rejections return immediately and consume no retry budget
//! - Backoff waits go through the caller's context so cancellation
//!   aborts them immediately

use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::{MeshError, MeshResult};
use crate::resilience::backoff::calculate_backoff;
use crate::resilience::context::Context;

/// Local retry policy for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self {
            config: RetryConfig {
                max_retries: 0,
                ..RetryConfig::default()
            },
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        calculate_backoff(attempt, &self.config)
    }

    /// Run `op` until it succeeds, fails terminally, or retries run out.
    ///
    /// `op` receives the 0-based attempt number.
    pub async fn run<F, Fut, T>(&self, ctx: &Context, target: &str, mut op: F) -> MeshResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = MeshResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            ctx.check()?;

            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !err.is_transient() {
                return Err(err);
            }
            if attempt >= self.config.max_retries {
                if attempt == 0 {
                    return Err(err);
                }
                tracing::warn!(target = %target, attempts = attempt + 1, error = %err, "Retries exhausted");
                return Err(MeshError::RetriesExhausted {
                    attempts: attempt + 1,
                    source: Box::new(err),
                });
            }

            let delay = self.delay_for(attempt);
            tracing::debug!(
                target = %target,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after transient failure"
            );
            ctx.sleep(delay).await?;
            attempt += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
