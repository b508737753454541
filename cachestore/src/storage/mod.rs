//! Key-value store backends.
//!
//! This module provides the store implementations behind the cache client:
//! - `redis`: shared remote store reached through a multiplexed connection manager
//! - `memory`: in-process store with TTL expiry, used for tests and single-node setups
//! - `cache`: expiry sweep pacing shared by in-process backends
//!
//! Each backend implements the `KvStore` trait. Backends are fallible; the
//! swallowing of transport errors happens one level up in
//! [`CacheClient`](crate::client::CacheClient).

pub mod cache;
pub mod memory;
pub mod pattern;
pub mod redis;

use crate::error::StoreResult;
use async_trait::async_trait;
use std::collections::HashMap;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Storage backend trait for namespaced key-value data.
///
/// Keys passed to a backend are already fully qualified (prefix applied).
/// TTLs are whole seconds; a TTL of 0 stores without expiry.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Read a string value.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write a string value with an optional expiry.
    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()>;

    /// Atomically write a value only if the key does not exist.
    /// Returns true when this call created the key.
    async fn set_nx(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<bool>;

    /// Delete keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> StoreResult<u64>;

    /// Atomically delete `key` only if it currently holds `expected`.
    async fn delete_if_eq(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// Check whether a key exists.
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Set a new expiry on an existing key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl_secs: u64) -> StoreResult<bool>;

    /// List keys matching a glob pattern (`*`, `?`, `[...]`).
    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Read one field of a hash.
    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    /// Write one field of a hash. Returns true if the field is new.
    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<bool>;

    /// Read every field of a hash.
    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Push values onto the head of a list, returning the new length.
    async fn lpush(&self, key: &str, values: &[String]) -> StoreResult<u64>;

    /// Read a list range; negative indices count from the tail.
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>>;

    /// Lightweight liveness probe.
    async fn ping(&self) -> StoreResult<()>;
}
