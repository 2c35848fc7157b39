//! End-to-end rate limiter behaviour over shared backing stores

use palisade_gateway::census::WorkerCensus;
use palisade_gateway::error::GatewayError;
use palisade_gateway::limiter::{LimiterSettings, RateLimiter};
use palisade_gateway::rules::RateLimitRule;
use palisade_gateway::store::{CounterStore, MemoryCounterStore, SqlCounterStore};
use std::sync::Arc;
use tempfile::TempDir;

fn rule(name: &str, interval: u64, limit: u64) -> RateLimitRule {
    RateLimitRule {
        name: name.into(),
        interval,
        limit,
        per_from: false,
        per_to: false,
        per_method: false,
    }
}

fn limiter(store: Arc<dyn CounterStore>, workers: u64) -> RateLimiter {
    RateLimiter::new(store, Arc::new(WorkerCensus::fixed(workers)), LimiterSettings::default())
}

/// Two limiters over separate connections to one SQLite file stand in
/// for two gateway processes sharing a counter database.
async fn sql_store_pair() -> (Arc<SqlCounterStore>, Arc<SqlCounterStore>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("counters.db").display());
    let a = Arc::new(SqlCounterStore::connect(&url).await.unwrap());
    let b = Arc::new(SqlCounterStore::connect(&url).await.unwrap());
    (a, b, dir)
}

#[tokio::test]
async fn test_single_process_limit_of_one() {
    // limit 1 / one process: the first transaction is admitted; the
    // second exhausts the interval-wide budget and is rejected with the
    // wait interval in the message.
    let store = Arc::new(MemoryCounterStore::new());
    let limiter = limiter(store, 1);
    let rule = rule("w", 60, 1);

    limiter.check("w:*:*:*", &rule).await.unwrap();
    limiter.record_usage("w:*:*:*", &rule).await;

    let err = limiter.check("w:*:*:*", &rule).await.unwrap_err();
    match err {
        GatewayError::RateLimitExceeded { wait_secs } => assert_eq!(wait_secs, 60),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_two_processes_never_exceed_shared_budget() {
    let (store_a, store_b, _dir) = sql_store_pair().await;
    let a = limiter(store_a.clone(), 2);
    let b = limiter(store_b, 2);
    let rule = rule("shared", 60, 10);

    let mut admitted = 0u64;
    for process in [&a, &b] {
        loop {
            if process.check("shared:*:*:*", &rule).await.is_err() {
                break;
            }
            process.record_usage("shared:*:*:*", &rule).await;
            admitted += 1;
            assert!(admitted <= 2 * rule.limit, "runaway admission");
        }
    }

    // Stock is pre-allocated in slices, so the logical total may overshoot
    // by at most one slice; the shared counter itself never passes the limit.
    assert!(admitted <= rule.limit + 1);
    let counter = store_a.counter("shared:*:*:*").await.unwrap().unwrap();
    assert!(counter.count <= rule.limit);
}

#[tokio::test]
async fn test_exhaustion_is_remembered_without_store_reads() {
    let (store_a, store_b, _dir) = sql_store_pair().await;
    let a = limiter(store_a, 2);
    let b = limiter(store_b.clone(), 2);
    let rule = rule("mem", 60, 2);

    // Process A drains the whole budget.
    while a.check("mem:*:*:*", &rule).await.is_ok() {
        a.record_usage("mem:*:*:*", &rule).await;
    }

    // Process B learns the interval is exhausted on its first refill...
    assert!(b.check("mem:*:*:*", &rule).await.is_err());

    // ...and keeps answering from its local flag even when the shared
    // record is tampered with afterwards.
    let record = store_b.counter("mem:*:*:*").await.unwrap().unwrap();
    store_b
        .swap_counter(
            "mem:*:*:*",
            record,
            palisade_gateway::store::CounterRecord { count: 0, created_at: record.created_at },
        )
        .await
        .unwrap();
    assert!(b.check("mem:*:*:*", &rule).await.is_err());
}

#[tokio::test]
async fn test_per_key_budgets_are_independent() {
    let store = Arc::new(MemoryCounterStore::new());
    let limiter = limiter(store, 1);
    let rule = rule("k", 60, 1);

    limiter.check("k:0xaa:*:*", &rule).await.unwrap();
    limiter.record_usage("k:0xaa:*:*", &rule).await;
    assert!(limiter.check("k:0xaa:*:*", &rule).await.is_err());

    // A different sender's bucket is untouched.
    limiter.check("k:0xbb:*:*", &rule).await.unwrap();
}
