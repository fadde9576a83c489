//! Caller context: deadline and cancellation.
//!
//! # Responsibilities
//! - Carry the caller's deadline and cancellation signal through a call
//! - Fail fast on an already expired or cancelled context
//! - Make every wait (backoff, shaping) abort as soon as the context ends
//!
//! # Design Decisions
//! - Uses Tokio's clock so paused-time tests drive deadlines too
//! - Child contexts inherit cancellation and can only tighten the deadline
//! - Context errors are returned as-is, never swallowed into other errors

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{MeshError, MeshResult};

/// Deadline + cancellation for one logical operation.
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    token: CancellationToken,
}

impl Context {
    /// A context that never expires on its own.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            token: CancellationToken::new(),
        }
    }

    /// Derive a context cancelled with this one and bounded by `timeout`.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            deadline: Some(deadline),
            token: self.token.child_token(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The context's error, if it has already ended.
    pub fn err(&self) -> Option<MeshError> {
        if self.token.is_cancelled() {
            return Some(MeshError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(MeshError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Fail fast if the context has ended.
    pub fn check(&self) -> MeshResult<()> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resolve when the context ends, with the reason.
    pub async fn done(&self) -> MeshError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => MeshError::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => MeshError::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                MeshError::Cancelled
            }
        }
    }

    /// Sleep for `duration` unless the context ends first.
    pub async fn sleep(&self, duration: Duration) -> MeshResult<()> {
        self.check()?;
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            err = self.done() => Err(err),
        }
    }

    /// Run `fut` unless the context ends first.
    pub async fn run<F: Future>(&self, fut: F) -> MeshResult<F::Output> {
        self.check()?;
        tokio::select! {
            out = fut => Ok(out),
            err = self.done() => Err(err),
        }
    }
}
