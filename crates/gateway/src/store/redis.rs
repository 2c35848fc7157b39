// Palisade - JSON-RPC admission gateway
// Copyright (C) 2026 Palisade Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Redis-backed counter store
//!
//! Counter records are one hash per bucket key with `count` and
//! `created_at` fields (integer strings). Optimistic concurrency uses
//! WATCH + MULTI/EXEC: a nil EXEC reply means another writer touched the
//! key between our read and our write, reported as a lost race.
//!
//! WATCH state is connection-scoped, so transactional writes run on a
//! dedicated connection serialized behind a mutex; plain reads and the
//! heartbeat ledger go through the shared connection manager.

use super::{BlockNumberEntry, CounterRecord, CounterStore, StoreError};
use async_trait::async_trait;
use rand::Rng;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

const HEARTBEATS_KEY: &str = "palisade:heartbeats";

/// Counter store backed by a shared Redis instance
pub struct RedisCounterStore {
    manager: ConnectionManager,
    txn_conn: Mutex<MultiplexedConnection>,
}

impl RedisCounterStore {
    /// Connects to Redis at the given URL
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        let txn_conn = client.get_multiplexed_async_connection().await?;

        debug!("Connected counter store to redis");
        Ok(Self { manager, txn_conn: Mutex::new(txn_conn) })
    }

    fn counter_key(key: &str) -> String {
        format!("palisade:rl:{key}")
    }

    fn block_key(key: &str) -> String {
        format!("palisade:block:{key}")
    }

    fn parse_counter(
        key: &str,
        map: &HashMap<String, String>,
    ) -> Result<Option<CounterRecord>, StoreError> {
        if map.is_empty() {
            return Ok(None);
        }

        let field = |name: &str| -> Result<u64, StoreError> {
            map.get(name)
                .and_then(|raw| raw.parse().ok())
                .ok_or_else(|| StoreError::Corrupt {
                    key: key.to_string(),
                    reason: format!("missing or non-integer field {name}"),
                })
        };

        Ok(Some(CounterRecord { count: field("count")?, created_at: field("created_at")? }))
    }

    /// Runs one WATCH-guarded hash write; `Ok(false)` reports a lost race
    async fn guarded_write(
        &self,
        storage_key: &str,
        expected: Option<CounterRecord>,
        new: CounterRecord,
    ) -> Result<bool, StoreError> {
        let mut conn = self.txn_conn.lock().await;

        let _: () = redis::cmd("WATCH").arg(storage_key).query_async(&mut *conn).await?;
        let map: HashMap<String, String> =
            redis::cmd("HGETALL").arg(storage_key).query_async(&mut *conn).await?;
        let current = Self::parse_counter(storage_key, &map)?;

        if current != expected {
            let _: () = redis::cmd("UNWATCH").query_async(&mut *conn).await?;
            return Ok(false);
        }

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(storage_key)
            .arg("count")
            .arg(new.count.to_string())
            .arg("created_at")
            .arg(new.created_at.to_string())
            .ignore()
            .cmd("HGET")
            .arg(storage_key)
            .arg("count");

        // A nil EXEC reply means the watched key changed under us.
        let response: Option<(String,)> = pipe.query_async(&mut *conn).await?;
        Ok(response.is_some())
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn counter(&self, key: &str) -> Result<Option<CounterRecord>, StoreError> {
        let storage_key = Self::counter_key(key);
        let mut conn = self.manager.clone();
        let map: HashMap<String, String> =
            redis::cmd("HGETALL").arg(&storage_key).query_async(&mut conn).await?;
        Self::parse_counter(&storage_key, &map)
    }

    async fn insert_counter(&self, key: &str, record: CounterRecord) -> Result<bool, StoreError> {
        self.guarded_write(&Self::counter_key(key), None, record).await
    }

    async fn swap_counter(
        &self,
        key: &str,
        expected: CounterRecord,
        new: CounterRecord,
    ) -> Result<bool, StoreError> {
        self.guarded_write(&Self::counter_key(key), Some(expected), new).await
    }

    async fn block_number(&self, key: &str) -> Result<Option<BlockNumberEntry>, StoreError> {
        let storage_key = Self::block_key(key);
        let mut conn = self.manager.clone();
        let map: HashMap<String, String> =
            redis::cmd("HGETALL").arg(&storage_key).query_async(&mut conn).await?;

        if map.is_empty() {
            return Ok(None);
        }

        let field = |name: &str| -> Result<u64, StoreError> {
            map.get(name)
                .and_then(|raw| raw.parse().ok())
                .ok_or_else(|| StoreError::Corrupt {
                    key: storage_key.clone(),
                    reason: format!("missing or non-integer field {name}"),
                })
        };

        Ok(Some(BlockNumberEntry { value: field("value")?, updated_at: field("updated_at")? }))
    }

    async fn put_block_number(
        &self,
        key: &str,
        entry: BlockNumberEntry,
    ) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("HSET")
            .arg(Self::block_key(key))
            .arg("value")
            .arg(entry.value.to_string())
            .arg("updated_at")
            .arg(entry.updated_at.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn record_heartbeat(&self, at: u64) -> Result<(), StoreError> {
        // Unique member so concurrent workers beating in the same
        // millisecond all land in the ledger.
        let member = format!("{at}-{:08x}", rand::rng().random::<u32>());
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("ZADD")
            .arg(HEARTBEATS_KEY)
            .arg(at)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn count_heartbeats(&self, start: u64, end: u64) -> Result<u64, StoreError> {
        let mut conn = self.manager.clone();
        let count: u64 = redis::cmd("ZCOUNT")
            .arg(HEARTBEATS_KEY)
            .arg(start)
            .arg(end)
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn prune_heartbeats(&self, before: u64) -> Result<u64, StoreError> {
        let mut conn = self.manager.clone();
        let removed: u64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(HEARTBEATS_KEY)
            .arg("-inf")
            .arg(format!("({before}"))
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }
}
