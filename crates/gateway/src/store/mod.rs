//! Backing counter store contract
//!
//! The authoritative rate-limit counters are shared by every gateway
//! process through a backing store. The store exposes three counter
//! primitives (read, insert-if-absent, compare-and-swap) and every
//! mutation runs under optimistic concurrency: writers detect conflicts
//! and the retry loop in [`with_optimistic_retry`] re-reads and re-decides
//! up to a hard ceiling. No distributed lock is ever held across a
//! network round trip.
//!
//! The same store also carries two auxiliary records with far weaker
//! requirements: a TTL-bounded block-number cache and the append-only
//! worker heartbeat ledger.

mod memory;
mod redis;
mod sql;

pub use self::memory::MemoryCounterStore;
pub use self::redis::RedisCounterStore;
pub use self::sql::SqlCounterStore;

use async_trait::async_trait;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Current wall-clock time as epoch milliseconds
pub fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Authoritative counter state for one rate-limit bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterRecord {
    /// Units of quota handed out in the current interval
    pub count: u64,
    /// Interval start, epoch millis
    pub created_at: u64,
}

/// Cached latest block number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockNumberEntry {
    /// The cached block number
    pub value: u64,
    /// Last refresh time, epoch millis
    pub updated_at: u64,
}

/// Backing-store failures
#[derive(Debug, Error)]
pub enum StoreError {
    /// An optimistic write kept conflicting until the retry ceiling
    #[error("optimistic write on {key} conflicted {attempts} times")]
    Conflict {
        /// The contested counter key
        key: String,
        /// How many attempts were made
        attempts: u32,
    },

    /// Redis transport or protocol failure
    #[error("redis backend error: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// SQL backend failure
    #[error("sql backend error: {0}")]
    Sql(#[from] sqlx::Error),

    /// Malformed data found in the store
    #[error("corrupt store record for {key}: {reason}")]
    Corrupt {
        /// The offending key
        key: String,
        /// What was wrong with it
        reason: String,
    },
}

/// Distributed counter store shared by all gateway processes
///
/// Implementations must make `insert_counter` and `swap_counter` atomic
/// with respect to concurrent writers and report lost races as `Ok(false)`
/// rather than clobbering.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Reads the counter record for a key, if present
    async fn counter(&self, key: &str) -> Result<Option<CounterRecord>, StoreError>;

    /// Creates the record only when the key is absent; `Ok(false)` when a
    /// concurrent writer got there first
    async fn insert_counter(&self, key: &str, record: CounterRecord) -> Result<bool, StoreError>;

    /// Replaces `expected` with `new` atomically; `Ok(false)` when the
    /// stored record no longer equals `expected`
    async fn swap_counter(
        &self,
        key: &str,
        expected: CounterRecord,
        new: CounterRecord,
    ) -> Result<bool, StoreError>;

    /// Reads a cached block number entry
    async fn block_number(&self, key: &str) -> Result<Option<BlockNumberEntry>, StoreError>;

    /// Overwrites a cached block number entry; last write wins
    async fn put_block_number(&self, key: &str, entry: BlockNumberEntry)
        -> Result<(), StoreError>;

    /// Appends one heartbeat timestamp to the ledger
    async fn record_heartbeat(&self, at: u64) -> Result<(), StoreError>;

    /// Counts heartbeats with `created_at` in `[start, end]`
    async fn count_heartbeats(&self, start: u64, end: u64) -> Result<u64, StoreError>;

    /// Removes heartbeats older than `before`; returns how many
    async fn prune_heartbeats(&self, before: u64) -> Result<u64, StoreError>;
}

/// What a decision function wants done with the counter record
#[derive(Debug, Clone, Copy)]
pub enum CounterUpdate {
    /// Leave the record untouched
    Keep,
    /// Create the record; only valid when the current read was absent
    Insert(CounterRecord),
    /// Replace the record just read
    Swap(CounterRecord),
}

/// One decision of an optimistic read-modify-write step
#[derive(Debug)]
pub struct Decision<T> {
    /// The store mutation to attempt
    pub update: CounterUpdate,
    /// The value to hand back once the mutation sticks
    pub output: T,
}

/// Runs a read-decide-write cycle under optimistic concurrency
///
/// `decide` is a pure function from the freshly read record to a store
/// mutation plus an output value; it is re-invoked from a fresh read
/// after every lost race. Exceeding `max_retries` is a hard error - the
/// caller must treat it as "cannot currently admit", never as permission.
pub async fn with_optimistic_retry<T, F>(
    store: &dyn CounterStore,
    key: &str,
    max_retries: u32,
    mut decide: F,
) -> Result<T, StoreError>
where
    F: FnMut(Option<CounterRecord>) -> Decision<T>,
{
    for _ in 0..max_retries {
        let current = store.counter(key).await?;
        let Decision { update, output } = decide(current);

        let applied = match (current, update) {
            (_, CounterUpdate::Keep) => true,
            (None, CounterUpdate::Insert(record)) => store.insert_counter(key, record).await?,
            (Some(expected), CounterUpdate::Swap(new)) => {
                store.swap_counter(key, expected, new).await?
            }
            // An insert over an existing record or a swap of a missing one
            // means the record changed shape under us; re-read.
            _ => false,
        };

        if applied {
            return Ok(output);
        }
    }

    Err(StoreError::Conflict { key: key.to_string(), attempts: max_retries })
}
