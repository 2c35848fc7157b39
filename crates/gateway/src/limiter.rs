//! Stock-based distributed rate limiter
//!
//! The limiter answers "may this transaction go through right now" without
//! a store round trip on the hot path. Each process draws a slice of the
//! shared quota ("stock") into its local reservoir and decrements it
//! locally; only refills and surplus returns touch the backing store, and
//! those run under optimistic concurrency with a hard retry ceiling.
//!
//! An exhausted retry ceiling is a rejection, never an admission: the
//! limiter fails closed when the store keeps conflicting.

use crate::census::WorkerCensus;
use crate::error::GatewayError;
use crate::rules::RateLimitRule;
use crate::stock::{StockRecord, StockReservoir};
use crate::store::{
    now_millis, with_optimistic_retry, CounterRecord, CounterStore, CounterUpdate, Decision,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Tuning knobs of the limiter
///
/// The surplus thresholds and slice divisors are empirical; they are kept
/// configurable rather than hard-coded.
#[derive(Debug, Clone)]
pub struct LimiterSettings {
    /// Optimistic-transaction attempts before giving up
    pub max_retries: u32,
    /// Fraction of a slice kept back when returning surplus stock
    pub surplus_stock_rate: f64,
    /// Fraction of the ideal TPS below which a process returns surplus
    pub surplus_tps_rate: f64,
    /// Divisor of the regular slice: `limit / (small_divisor * workers)`
    pub slice_small_divisor: u64,
    /// Fallback divisor when the regular slice rounds to zero
    pub slice_large_divisor: u64,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            surplus_stock_rate: 0.2,
            surplus_tps_rate: 0.2,
            slice_small_divisor: 10,
            slice_large_divisor: 3,
        }
    }
}

/// Distributed rate limiter over a shared counter store
///
/// Owns the process-local stock reservoir; constructed once at startup
/// and shared by handle.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    reservoir: StockReservoir,
    census: Arc<WorkerCensus>,
    settings: LimiterSettings,
}

impl RateLimiter {
    /// Creates a limiter over the given store and census
    pub fn new(
        store: Arc<dyn CounterStore>,
        census: Arc<WorkerCensus>,
        settings: LimiterSettings,
    ) -> Self {
        Self { store, reservoir: StockReservoir::new(), census, settings }
    }

    /// The stock slice one process may draw for a bucket
    ///
    /// `limit / (10 * workers)` normally; when that rounds to zero the
    /// process takes the larger `limit / (3 * workers)` fraction instead,
    /// and never less than one.
    fn stock_slice(&self, limit: u64, workers: u64) -> u64 {
        let small = limit / (self.settings.slice_small_divisor * workers);
        if small >= 1 {
            return small;
        }
        let large = limit / (self.settings.slice_large_divisor * workers);
        if large >= 1 {
            return large;
        }
        1
    }

    /// How many admissions this process may currently grant for a bucket
    ///
    /// Serves the local stock when the record is fresh and either carries
    /// stock or is flagged store-exhausted; refills from the backing store
    /// otherwise.
    pub async fn allowed_count(
        &self,
        key: &str,
        rule: &RateLimitRule,
    ) -> Result<u64, GatewayError> {
        let now = now_millis();

        if let Some(record) = self.reservoir.usable(key, rule.interval_millis(), now) {
            return Ok(record.stock);
        }

        self.refill(key, rule, now).await
    }

    /// Checks whether one admission is available, rejecting otherwise
    pub async fn check(&self, key: &str, rule: &RateLimitRule) -> Result<(), GatewayError> {
        if self.allowed_count(key, rule).await? == 0 {
            return Err(GatewayError::RateLimitExceeded { wait_secs: rule.interval });
        }
        Ok(())
    }

    /// Records one successful admission and opportunistically rebalances
    ///
    /// The decrement is purely local. A failed surplus return is logged
    /// and swallowed; the admission it follows has already happened.
    pub async fn record_usage(&self, key: &str, rule: &RateLimitRule) {
        if !self.reservoir.consume(key) {
            debug!(key, "usage recorded with no local stock");
        }

        if let Err(e) = self.return_surplus(key, rule).await {
            warn!(key, "surplus return failed: {}", e);
        }
    }

    /// Draws a fresh stock slice from the backing store
    ///
    /// Runs the read-decide-write cycle under optimistic concurrency; the
    /// local record is replaced wholesale with whatever the committed
    /// decision says.
    async fn refill(
        &self,
        key: &str,
        rule: &RateLimitRule,
        now: u64,
    ) -> Result<u64, GatewayError> {
        let workers = self.census.worker_count();
        let slice = self.stock_slice(rule.limit, workers);
        let interval = rule.interval_millis();
        let limit = rule.limit;

        let record = with_optimistic_retry(
            self.store.as_ref(),
            key,
            self.settings.max_retries,
            move |current| match current {
                // First access for this key: claim our slice.
                None => Decision {
                    update: CounterUpdate::Insert(CounterRecord { count: slice, created_at: now }),
                    output: StockRecord::fresh(slice, now),
                },
                // Interval still running.
                Some(cur) if now.saturating_sub(cur.created_at) < interval => {
                    if cur.count + slice > limit {
                        // The interval-wide budget is spoken for; remember
                        // that locally so we stop asking until it rolls over.
                        Decision {
                            update: CounterUpdate::Keep,
                            output: StockRecord::exhausted(now),
                        }
                    } else {
                        Decision {
                            update: CounterUpdate::Swap(CounterRecord {
                                count: cur.count + slice,
                                created_at: cur.created_at,
                            }),
                            output: StockRecord::fresh(slice, now),
                        }
                    }
                }
                // Interval elapsed: reset the shared counter to our slice.
                Some(_) => Decision {
                    update: CounterUpdate::Swap(CounterRecord { count: slice, created_at: now }),
                    output: StockRecord::fresh(slice, now),
                },
            },
        )
        .await?;

        self.reservoir.replace(key, record);
        debug!(
            key,
            stock = record.stock,
            datastore_limit = record.is_datastore_limit,
            workers,
            "refilled stock"
        );

        Ok(record.stock)
    }

    /// Returns surplus stock to the shared counter when this process is
    /// consuming well below its fair share
    ///
    /// The surplus goes back by decrementing the shared count, so busier
    /// processes can draw it; the local stock shrinks by the same amount.
    pub async fn return_surplus(
        &self,
        key: &str,
        rule: &RateLimitRule,
    ) -> Result<(), GatewayError> {
        let Some(record) = self.reservoir.snapshot(key) else {
            return Ok(());
        };
        if record.is_datastore_limit || record.stock == 0 {
            return Ok(());
        }

        let now = now_millis();
        let elapsed_secs = now.saturating_sub(record.created_at) as f64 / 1000.0;
        if elapsed_secs <= 0.0 {
            return Ok(());
        }

        let workers = self.census.worker_count();
        let slice = self.stock_slice(rule.limit, workers);
        let keep = (slice as f64 * self.settings.surplus_stock_rate).floor() as u64;

        let ideal_tps = rule.limit as f64 / rule.interval as f64;
        let current_tps = (record.counter + 1) as f64 / elapsed_secs;

        if current_tps >= ideal_tps * self.settings.surplus_tps_rate || record.stock <= keep {
            return Ok(());
        }

        let give_back = record.stock - keep;
        let interval = rule.interval_millis();

        let returned = with_optimistic_retry(
            self.store.as_ref(),
            key,
            self.settings.max_retries,
            move |current| match current {
                // Only return into the interval the stock was drawn from.
                Some(cur) if now.saturating_sub(cur.created_at) < interval => Decision {
                    update: CounterUpdate::Swap(CounterRecord {
                        count: cur.count.saturating_sub(give_back),
                        created_at: cur.created_at,
                    }),
                    output: true,
                },
                _ => Decision { update: CounterUpdate::Keep, output: false },
            },
        )
        .await?;

        if returned {
            self.reservoir.shrink(key, give_back);
            debug!(key, give_back, "returned surplus stock");
        }

        Ok(())
    }
}
