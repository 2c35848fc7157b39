//! TTL-bounded block-number cache
//!
//! `eth_blockNumber` is by far the chattiest read against the upstream
//! node; all gateway processes share one cached value through the backing
//! store, refreshed when the TTL lapses. Staleness within the TTL is
//! acceptable by contract.

use crate::store::{now_millis, BlockNumberEntry, CounterStore, StoreError};
use std::sync::Arc;
use std::time::Duration;

const LATEST_KEY: &str = "latest";

/// Shared cache of the upstream's latest block number
pub struct BlockNumberCache {
    store: Arc<dyn CounterStore>,
    ttl: Duration,
}

impl BlockNumberCache {
    /// Creates a cache over the given store
    pub fn new(store: Arc<dyn CounterStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// The cached block number, if still within the TTL
    pub async fn get(&self) -> Result<Option<u64>, StoreError> {
        let now = now_millis();
        let ttl = self.ttl.as_millis() as u64;

        Ok(self
            .store
            .block_number(LATEST_KEY)
            .await?
            .filter(|entry| now.saturating_sub(entry.updated_at) < ttl)
            .map(|entry| entry.value))
    }

    /// Stores a freshly fetched block number; last write wins
    pub async fn put(&self, value: u64) -> Result<(), StoreError> {
        self.store
            .put_block_number(LATEST_KEY, BlockNumberEntry { value, updated_at: now_millis() })
            .await
    }
}
