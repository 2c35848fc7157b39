//! Relational counter store
//!
//! Counter records are rows `{id, name (unique), count, created_at}`.
//! Optimistic concurrency is a conditional UPDATE carrying the previously
//! read values in its WHERE clause; zero affected rows means another
//! writer got there first. Inserts rely on the unique name constraint the
//! same way.

use super::{BlockNumberEntry, CounterRecord, CounterStore, StoreError};
use async_trait::async_trait;
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};
use tracing::debug;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS rate_counters (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        count INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS block_numbers (
        name TEXT PRIMARY KEY,
        value INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS worker_heartbeats (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_worker_heartbeats_created_at
        ON worker_heartbeats (created_at)",
];

/// Counter store backed by a shared SQLite database
pub struct SqlCounterStore {
    pool: SqlitePool,
}

impl SqlCounterStore {
    /// Connects to the database and ensures the schema exists
    ///
    /// # Arguments
    /// * `url` - sqlx database URL, e.g. `sqlite:///var/lib/palisade.db?mode=rwc`
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new().max_connections(8).connect(url).await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        debug!("Connected counter store to sql database");
        Ok(Self { pool })
    }
}

#[async_trait]
impl CounterStore for SqlCounterStore {
    async fn counter(&self, key: &str) -> Result<Option<CounterRecord>, StoreError> {
        let row = sqlx::query("SELECT count, created_at FROM rate_counters WHERE name = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| CounterRecord {
            count: row.get::<i64, _>(0) as u64,
            created_at: row.get::<i64, _>(1) as u64,
        }))
    }

    async fn insert_counter(&self, key: &str, record: CounterRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO rate_counters (name, count, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(key)
        .bind(record.count as i64)
        .bind(record.created_at as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn swap_counter(
        &self,
        key: &str,
        expected: CounterRecord,
        new: CounterRecord,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE rate_counters SET count = ?1, created_at = ?2
             WHERE name = ?3 AND count = ?4 AND created_at = ?5",
        )
        .bind(new.count as i64)
        .bind(new.created_at as i64)
        .bind(key)
        .bind(expected.count as i64)
        .bind(expected.created_at as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn block_number(&self, key: &str) -> Result<Option<BlockNumberEntry>, StoreError> {
        let row = sqlx::query("SELECT value, updated_at FROM block_numbers WHERE name = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| BlockNumberEntry {
            value: row.get::<i64, _>(0) as u64,
            updated_at: row.get::<i64, _>(1) as u64,
        }))
    }

    async fn put_block_number(
        &self,
        key: &str,
        entry: BlockNumberEntry,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO block_numbers (name, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value,
                 updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(entry.value as i64)
        .bind(entry.updated_at as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_heartbeat(&self, at: u64) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO worker_heartbeats (created_at) VALUES (?1)")
            .bind(at as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_heartbeats(&self, start: u64, end: u64) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) FROM worker_heartbeats WHERE created_at BETWEEN ?1 AND ?2",
        )
        .bind(start as i64)
        .bind(end as i64)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<i64, _>(0) as u64)
    }

    async fn prune_heartbeats(&self, before: u64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM worker_heartbeats WHERE created_at < ?1")
            .bind(before as i64)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
