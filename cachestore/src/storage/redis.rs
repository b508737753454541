//! Redis storage backend.
//!
//! Uses a `ConnectionManager`, which multiplexes commands over one
//! connection and reconnects transparently after transport failures.
//!
//! # Configuration
//!
//! ```toml
//! [store]
//! engine = "redis"
//! host = "127.0.0.1"
//! port = 6379
//! db = 0
//! key_prefix = "registry:"
//! connect_timeout_ms = 2000
//! ```
//!
//! Credentials are read from `CACHESTORE_STORE_USERNAME` and
//! `CACHESTORE_STORE_PASSWORD`.

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::storage::KvStore;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;

/// Number of keys requested per SCAN round trip.
const SCAN_COUNT: usize = 500;

/// Deletes KEYS[1] only if it still holds ARGV[1].
const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// Redis-backed [`KvStore`].
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    compare_and_delete: redis::Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("conn", &"<ConnectionManager>")
            .finish()
    }
}

impl RedisStore {
    /// Connects to the store described by `config`, bounded by its connect timeout.
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        let client = redis::Client::open(config.redis_url())?;
        let timeout = Duration::from_millis(config.connect_timeout_ms);
        let conn = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                StoreError::Unavailable(format!(
                    "connecting to {}:{} timed out after {:?}",
                    config.host, config.port, timeout
                ))
            })??;

        Ok(Self {
            conn,
            compare_and_delete: redis::Script::new(COMPARE_AND_DELETE),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let value: Option<String> = self.conn().get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()> {
        let mut conn = self.conn();
        if ttl_secs > 0 {
            let _: () = conn.set_ex(key, value, ttl_secs).await?;
        } else {
            let _: () = conn.set(key, value).await?;
        }
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if ttl_secs > 0 {
            cmd.arg("EX").arg(ttl_secs);
        }
        // SET NX replies OK on success and nil when the key already exists.
        let reply: Option<String> = cmd.query_async(&mut self.conn()).await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let removed: u64 = self.conn().del(keys).await?;
        Ok(removed)
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let removed: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(removed == 1)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let exists: bool = self.conn().exists(key).await?;
        Ok(exists)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> StoreResult<bool> {
        let updated: bool = self.conn().expire(key, ttl_secs as i64).await?;
        Ok(updated)
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once across iterations.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let value: Option<String> = self.conn().hget(key, field).await?;
        Ok(value)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<bool> {
        let added: i64 = self.conn().hset(key, field, value).await?;
        Ok(added == 1)
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let map: HashMap<String, String> = self.conn().hgetall(key).await?;
        Ok(map)
    }

    async fn lpush(&self, key: &str, values: &[String]) -> StoreResult<u64> {
        if values.is_empty() {
            return Ok(0);
        }
        let len: u64 = self.conn().lpush(key, values).await?;
        Ok(len)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        let values: Vec<String> = self
            .conn()
            .lrange(key, start as isize, stop as isize)
            .await?;
        Ok(values)
    }

    async fn ping(&self) -> StoreResult<()> {
        let pong: String = redis::cmd("PING").query_async(&mut self.conn()).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!("unexpected PING reply: {}", pong)))
        }
    }
}
