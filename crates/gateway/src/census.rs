//! Worker census via the shared heartbeat ledger
//!
//! The stock slice each process may draw depends on how many gateway
//! processes are cooperating on the same backing store. Rather than
//! configure that number, every process appends a heartbeat to the store
//! on a fixed cadence and estimates the population by counting ledger
//! entries inside the most recent cadence window.

use crate::store::{now_millis, CounterStore, StoreError};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Estimates the number of cooperating gateway processes
pub struct WorkerCensus {
    store: Option<Arc<dyn CounterStore>>,
    heartbeat_interval: Duration,
    estimate: AtomicU64,
}

impl WorkerCensus {
    /// Creates a census that maintains its estimate from the store ledger
    pub fn new(store: Arc<dyn CounterStore>, heartbeat_interval: Duration) -> Self {
        Self { store: Some(store), heartbeat_interval, estimate: AtomicU64::new(1) }
    }

    /// Creates a census pinned to a fixed worker count
    ///
    /// Used by single-process deployments and tests; no ledger traffic.
    pub fn fixed(workers: u64) -> Self {
        Self {
            store: None,
            heartbeat_interval: Duration::from_secs(10),
            estimate: AtomicU64::new(workers),
        }
    }

    /// The current worker estimate, never below one
    pub fn worker_count(&self) -> u64 {
        self.estimate.load(Ordering::Relaxed).max(1)
    }

    /// Appends our heartbeat, refreshes the estimate, prunes stale entries
    pub async fn beat(&self) -> Result<(), StoreError> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let now = now_millis();
        let window = self.heartbeat_interval.as_millis() as u64;

        store.record_heartbeat(now).await?;
        // The window start is exclusive so our own previous beat, one full
        // cadence ago, does not count this process twice.
        let seen = store.count_heartbeats(now.saturating_sub(window) + 1, now).await?;
        self.estimate.store(seen.max(1), Ordering::Relaxed);

        let retired = store.prune_heartbeats(now.saturating_sub(window * 3)).await?;
        if retired > 0 {
            debug!(retired, "pruned stale worker heartbeats");
        }

        Ok(())
    }

    /// Runs the heartbeat loop until the shutdown signal fires
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.heartbeat_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.beat().await {
                        warn!("worker heartbeat failed: {}", e);
                    }
                }
                _ = shutdown.recv() => {
                    debug!("worker census loop stopped");
                    break;
                }
            }
        }
    }
}
