//! Process-local stock reservoir
//!
//! Each gateway process holds a pre-allocated slice ("stock") of every
//! rate-limit bucket it has touched, so the hot admission path never does
//! store I/O. Records are replaced wholesale on refill decisions and are
//! owned exclusively by this process.

use parking_lot::Mutex;
use std::collections::HashMap;

/// Local bookkeeping for one rate-limit bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockRecord {
    /// Remaining locally usable credit
    pub stock: u64,
    /// Consumptions since `created_at`
    pub counter: u64,
    /// The backing store reported the bucket exhausted for this interval
    pub is_datastore_limit: bool,
    /// Creation time, epoch millis
    pub created_at: u64,
}

impl StockRecord {
    /// A freshly refilled record
    pub fn fresh(stock: u64, now: u64) -> Self {
        Self { stock, counter: 0, is_datastore_limit: false, created_at: now }
    }

    /// A record marking the interval-wide budget as exhausted
    pub fn exhausted(now: u64) -> Self {
        Self { stock: 0, counter: 0, is_datastore_limit: true, created_at: now }
    }

    /// Whether the record has outlived the bucket interval
    pub fn is_expired(&self, interval_millis: u64, now: u64) -> bool {
        now.saturating_sub(self.created_at) >= interval_millis
    }
}

/// Map of bucket key to local stock record
///
/// Mutated only by the owning process; never shared across processes.
#[derive(Debug, Default)]
pub struct StockReservoir {
    records: Mutex<HashMap<String, StockRecord>>,
}

impl StockReservoir {
    /// Creates an empty reservoir
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current record if it can answer an admission check
    /// without consulting the store: not expired, and either carrying
    /// stock or flagged as store-exhausted for the interval
    pub fn usable(&self, key: &str, interval_millis: u64, now: u64) -> Option<StockRecord> {
        let records = self.records.lock();
        let record = records.get(key)?;
        if record.is_expired(interval_millis, now) {
            return None;
        }
        if record.stock > 0 || record.is_datastore_limit {
            return Some(*record);
        }
        None
    }

    /// Replaces the record for a key wholesale; refills never merge
    pub fn replace(&self, key: &str, record: StockRecord) {
        self.records.lock().insert(key.to_string(), record);
    }

    /// Consumes one unit of stock; returns false when none remains
    pub fn consume(&self, key: &str) -> bool {
        let mut records = self.records.lock();
        match records.get_mut(key) {
            Some(record) if record.stock > 0 => {
                record.stock -= 1;
                record.counter += 1;
                true
            }
            _ => false,
        }
    }

    /// A copy of the current record, if any
    pub fn snapshot(&self, key: &str) -> Option<StockRecord> {
        self.records.lock().get(key).copied()
    }

    /// Shrinks the local stock after surplus has been returned to the store
    pub fn shrink(&self, key: &str, amount: u64) {
        if let Some(record) = self.records.lock().get_mut(key) {
            record.stock = record.stock.saturating_sub(amount);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usable_requires_stock_or_flag() {
        let reservoir = StockReservoir::new();
        reservoir.replace("k", StockRecord::fresh(2, 1_000));

        assert_eq!(reservoir.usable("k", 60_000, 2_000).unwrap().stock, 2);

        reservoir.replace("k", StockRecord { stock: 0, ..StockRecord::fresh(0, 1_000) });
        assert!(reservoir.usable("k", 60_000, 2_000).is_none());

        reservoir.replace("k", StockRecord::exhausted(1_000));
        let record = reservoir.usable("k", 60_000, 2_000).unwrap();
        assert_eq!(record.stock, 0);
        assert!(record.is_datastore_limit);
    }

    #[test]
    fn test_expired_record_not_usable() {
        let reservoir = StockReservoir::new();
        reservoir.replace("k", StockRecord::fresh(5, 1_000));
        assert!(reservoir.usable("k", 1_000, 2_000).is_none());
    }

    #[test]
    fn test_consume_decrements_and_counts() {
        let reservoir = StockReservoir::new();
        reservoir.replace("k", StockRecord::fresh(2, 0));

        assert!(reservoir.consume("k"));
        assert!(reservoir.consume("k"));
        assert!(!reservoir.consume("k"));

        let record = reservoir.snapshot("k").unwrap();
        assert_eq!(record.stock, 0);
        assert_eq!(record.counter, 2);
    }

    #[test]
    fn test_replace_overwrites_wholesale() {
        let reservoir = StockReservoir::new();
        reservoir.replace("k", StockRecord::fresh(5, 0));
        reservoir.consume("k");

        reservoir.replace("k", StockRecord::fresh(3, 10));
        let record = reservoir.snapshot("k").unwrap();
        assert_eq!(record.stock, 3);
        assert_eq!(record.counter, 0);
        assert_eq!(record.created_at, 10);
    }

    #[test]
    fn test_shrink_saturates() {
        let reservoir = StockReservoir::new();
        reservoir.replace("k", StockRecord::fresh(3, 0));
        reservoir.shrink("k", 10);
        assert_eq!(reservoir.snapshot("k").unwrap().stock, 0);
    }
}
