//! Periodic background workers.
//!
//! # Design Decisions
//! - Each worker runs on its own interval and owns its shutdown receiver
//! - Missed ticks are skipped, never bunched
//! - `join_all` waits up to a grace period, then aborts what is left

use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::lifecycle::shutdown::Shutdown;

/// Run `tick` every `period` until shutdown is signalled.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tracing::info!(worker = name, period_ms = period.as_millis() as u64, "Worker starting");
        let mut ticker = time::interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tick().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!(worker = name, "Worker received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    })
}

/// Handles of every worker started for one mesh.
#[derive(Debug, Default)]
pub struct WorkerGroup {
    workers: Vec<(&'static str, JoinHandle<()>)>,
}

impl WorkerGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn_periodic<F, Fut>(&mut self, name: &'static str, period: Duration, shutdown: &Shutdown, tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = spawn_periodic(name, period, shutdown.subscribe(), tick);
        self.workers.push((name, handle));
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.workers.iter().map(|(name, _)| *name).collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wait for every worker to finish. Returns how many had to be aborted.
    pub async fn join_all(self, grace: Duration) -> usize {
        let deadline = Instant::now() + grace;
        let mut aborted = 0;
        for (name, mut handle) in self.workers {
            match time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(worker = name, error = %e, "Worker task failed"),
                Err(_) => {
                    tracing::warn!(worker = name, "Worker did not stop within grace period, aborting");
                    handle.abort();
                    aborted += 1;
                }
            }
        }
        aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_until_shutdown() {
        let shutdown = Shutdown::new();
        let ticks = Arc::new(AtomicU32::new(0));
        let mut group = WorkerGroup::new();

        let counter = ticks.clone();
        group.spawn_periodic("counter", Duration::from_secs(10), &shutdown, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        // immediate first tick, then at 10s and 20s
        time::sleep(Duration::from_secs(25)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        shutdown.trigger();
        assert_eq!(group.join_all(Duration::from_secs(1)).await, 0);

        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_worker_is_aborted() {
        let shutdown = Shutdown::new();
        let mut group = WorkerGroup::new();
        group.spawn_periodic("stuck", Duration::from_secs(1), &shutdown, || async {
            time::sleep(Duration::from_secs(3600)).await;
        });
        assert_eq!(group.names(), vec!["stuck"]);

        time::sleep(Duration::from_millis(10)).await;
        shutdown.trigger();
        assert_eq!(group.join_all(Duration::from_secs(5)).await, 1);
    }
}
