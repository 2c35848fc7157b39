//! In-process counter store
//!
//! Backs single-process deployments and the test suites. Counter writes
//! go through the same insert/compare-and-swap contract as the shared
//! backends, so the limiter exercises identical code paths against it.

use super::{BlockNumberEntry, CounterRecord, CounterStore, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Counter store living entirely in this process
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: Mutex<HashMap<String, CounterRecord>>,
    block_numbers: Mutex<HashMap<String, BlockNumberEntry>>,
    heartbeats: Mutex<Vec<u64>>,
}

impl MemoryCounterStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn counter(&self, key: &str) -> Result<Option<CounterRecord>, StoreError> {
        Ok(self.counters.lock().get(key).copied())
    }

    async fn insert_counter(&self, key: &str, record: CounterRecord) -> Result<bool, StoreError> {
        let mut counters = self.counters.lock();
        if counters.contains_key(key) {
            return Ok(false);
        }
        counters.insert(key.to_string(), record);
        Ok(true)
    }

    async fn swap_counter(
        &self,
        key: &str,
        expected: CounterRecord,
        new: CounterRecord,
    ) -> Result<bool, StoreError> {
        let mut counters = self.counters.lock();
        match counters.get_mut(key) {
            Some(current) if *current == expected => {
                *current = new;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn block_number(&self, key: &str) -> Result<Option<BlockNumberEntry>, StoreError> {
        Ok(self.block_numbers.lock().get(key).copied())
    }

    async fn put_block_number(
        &self,
        key: &str,
        entry: BlockNumberEntry,
    ) -> Result<(), StoreError> {
        self.block_numbers.lock().insert(key.to_string(), entry);
        Ok(())
    }

    async fn record_heartbeat(&self, at: u64) -> Result<(), StoreError> {
        self.heartbeats.lock().push(at);
        Ok(())
    }

    async fn count_heartbeats(&self, start: u64, end: u64) -> Result<u64, StoreError> {
        Ok(self.heartbeats.lock().iter().filter(|&&at| at >= start && at <= end).count() as u64)
    }

    async fn prune_heartbeats(&self, before: u64) -> Result<u64, StoreError> {
        let mut heartbeats = self.heartbeats.lock();
        let len_before = heartbeats.len();
        heartbeats.retain(|&at| at >= before);
        Ok((len_before - heartbeats.len()) as u64)
    }
}
