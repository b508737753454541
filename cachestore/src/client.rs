//! Non-throwing cache client.
//!
//! `CacheClient` is what application code talks to. It namespaces keys with
//! the configured prefix and never surfaces a store failure: transport
//! errors are logged and converted to the operation's empty value (`None`,
//! `0`, `false`, an empty collection). Callers only ever lose the caching
//! benefit, never correctness.
//!
//! When the store is administratively disabled the client is built with the
//! `Disabled` backend and every operation short-circuits to the same empty
//! values without touching the network.

use crate::config::StoreConfig;
use crate::error::StoreResult;
use crate::storage::{KvStore, MemoryStore, RedisStore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
enum Backend {
    Live(Arc<dyn KvStore>),
    Disabled,
}

/// Namespaced, failure-swallowing view over a [`KvStore`].
#[derive(Clone)]
pub struct CacheClient {
    backend: Backend,
    prefix: String,
}

impl std::fmt::Debug for CacheClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheClient")
            .field("enabled", &self.is_enabled())
            .field("prefix", &self.prefix)
            .finish()
    }
}

/// Logs a store failure and substitutes the empty value.
fn recover<T>(op: &str, key: &str, result: StoreResult<T>, empty: T) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            warn!(operation = op, key, error = %e, "cache store operation failed");
            empty
        }
    }
}

impl CacheClient {
    /// Wraps an existing store.
    pub fn new(store: Arc<dyn KvStore>, prefix: impl Into<String>) -> Self {
        Self {
            backend: Backend::Live(store),
            prefix: prefix.into(),
        }
    }

    /// A client whose operations are all no-ops.
    pub fn disabled() -> Self {
        Self {
            backend: Backend::Disabled,
            prefix: String::new(),
        }
    }

    /// In-process client, convenient for tests and single-node deployments.
    pub fn in_memory(prefix: impl Into<String>) -> Self {
        Self::new(Arc::new(MemoryStore::new()), prefix)
    }

    /// Builds a client from configuration.
    ///
    /// A disabled configuration yields [`CacheClient::disabled`]. An
    /// unreachable Redis also yields a disabled client, so startup never
    /// fails because the cache is down.
    pub async fn connect(config: &StoreConfig) -> Self {
        if !config.enabled {
            debug!("cache store disabled by configuration");
            return Self::disabled();
        }

        match config.engine.as_str() {
            "memory" => Self::in_memory(config.key_prefix.clone()),
            "redis" => match RedisStore::connect(config).await {
                Ok(store) => Self::new(Arc::new(store), config.key_prefix.clone()),
                Err(e) => {
                    warn!(error = %e, "cache store unreachable, caching disabled");
                    Self::disabled()
                }
            },
            other => {
                warn!(engine = other, "unknown cache engine, caching disabled");
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.backend, Backend::Live(_))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn store(&self) -> Option<&Arc<dyn KvStore>> {
        match &self.backend {
            Backend::Live(store) => Some(store),
            Backend::Disabled => None,
        }
    }

    fn qualify(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn strip<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(self.prefix.as_str()).unwrap_or(key)
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let store = self.store()?;
        recover("get", key, store.get(&self.qualify(key)).await, None)
    }

    /// Writes a value. A TTL of 0 means "do not cache" and removes any existing entry.
    ///
    /// Returns true when the store accepted the write.
    pub async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> bool {
        let Some(store) = self.store() else { return false };
        let qualified = self.qualify(key);
        let result = if ttl_secs == 0 {
            store.delete(&[qualified]).await.map(|_| false)
        } else {
            store.set(&qualified, value, ttl_secs).await.map(|_| true)
        };
        recover("set", key, result, false)
    }

    pub async fn delete(&self, key: &str) -> u64 {
        let Some(store) = self.store() else { return 0 };
        recover("delete", key, store.delete(&[self.qualify(key)]).await, 0)
    }

    pub async fn exists(&self, key: &str) -> bool {
        let Some(store) = self.store() else { return false };
        recover("exists", key, store.exists(&self.qualify(key)).await, false)
    }

    pub async fn expire(&self, key: &str, ttl_secs: u64) -> bool {
        let Some(store) = self.store() else { return false };
        recover("expire", key, store.expire(&self.qualify(key), ttl_secs).await, false)
    }

    /// Keys matching a glob pattern, returned without the namespace prefix.
    pub async fn keys_matching(&self, pattern: &str) -> Vec<String> {
        let Some(store) = self.store() else { return Vec::new() };
        recover("keys", pattern, store.keys(&self.qualify(pattern)).await, Vec::new())
            .into_iter()
            .map(|k| self.strip(&k).to_string())
            .collect()
    }

    /// Deletes every key matching a glob pattern, returning the number removed.
    pub async fn delete_matching(&self, pattern: &str) -> u64 {
        let Some(store) = self.store() else { return 0 };
        let keys = recover("keys", pattern, store.keys(&self.qualify(pattern)).await, Vec::new());
        if keys.is_empty() {
            return 0;
        }
        recover("delete_matching", pattern, store.delete(&keys).await, 0)
    }

    pub async fn hash_get(&self, key: &str, field: &str) -> Option<String> {
        let store = self.store()?;
        recover("hget", key, store.hget(&self.qualify(key), field).await, None)
    }

    pub async fn hash_set(&self, key: &str, field: &str, value: &str) -> bool {
        let Some(store) = self.store() else { return false };
        recover("hset", key, store.hset(&self.qualify(key), field, value).await, false)
    }

    pub async fn hash_get_all(&self, key: &str) -> HashMap<String, String> {
        let Some(store) = self.store() else { return HashMap::new() };
        recover("hgetall", key, store.hgetall(&self.qualify(key)).await, HashMap::new())
    }

    pub async fn list_push(&self, key: &str, values: &[String]) -> u64 {
        let Some(store) = self.store() else { return 0 };
        recover("lpush", key, store.lpush(&self.qualify(key), values).await, 0)
    }

    pub async fn list_range(&self, key: &str, start: i64, stop: i64) -> Vec<String> {
        let Some(store) = self.store() else { return Vec::new() };
        recover("lrange", key, store.lrange(&self.qualify(key), start, stop).await, Vec::new())
    }

    /// Atomically creates `key` holding `token` if absent. Returns true when acquired.
    pub async fn acquire_lock(&self, key: &str, token: &str, ttl_secs: u64) -> bool {
        self.try_acquire_lock(key, token, ttl_secs).await == Some(true)
    }

    /// Like [`acquire_lock`](Self::acquire_lock), but tells contention apart
    /// from an unusable store: `Some(true)` acquired, `Some(false)` held by
    /// another owner, `None` when the store failed or is disabled.
    pub async fn try_acquire_lock(&self, key: &str, token: &str, ttl_secs: u64) -> Option<bool> {
        let store = self.store()?;
        let result = store.set_nx(&self.qualify(key), token, ttl_secs).await;
        recover("set_nx", key, result.map(Some), None)
    }

    /// Deletes `key` only while it still holds `token`.
    pub async fn release_lock(&self, key: &str, token: &str) -> bool {
        let Some(store) = self.store() else { return false };
        recover(
            "delete_if_eq",
            key,
            store.delete_if_eq(&self.qualify(key), token).await,
            false,
        )
    }

    /// Reads and decodes a JSON value. Undecodable payloads are treated as a miss.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "discarding undecodable cache entry");
                None
            }
        }
    }

    /// Encodes and writes a JSON value. Returns false if nothing was written.
    pub async fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl_secs: u64) -> bool {
        if !self.is_enabled() {
            return false;
        }
        match serde_json::to_string(value) {
            Ok(raw) => self.set(key, &raw, ttl_secs).await,
            Err(e) => {
                warn!(key, error = %e, "cache value could not be encoded");
                false
            }
        }
    }

    /// Liveness probe. Disabled clients report unhealthy.
    pub async fn health_check(&self) -> bool {
        let Some(store) = self.store() else { return false };
        match store.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "cache store health check failed");
                false
            }
        }
    }
}
