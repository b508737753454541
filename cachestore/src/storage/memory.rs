//! In-process storage backend.
//!
//! Mirrors the subset of Redis semantics the cache layer relies on:
//! - string values with per-key expiry
//! - atomic set-if-absent and compare-and-delete
//! - hashes and lists
//! - glob key scans
//!
//! Time is read from `tokio::time`, so tests running on a paused clock can
//! advance past TTLs deterministically.

use crate::error::{StoreError, StoreResult};
use crate::storage::cache::{EvictionManager, ExpirySweep};
use crate::storage::pattern::KeyPattern;
use crate::storage::KvStore;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Hash(_) => "hash",
            Value::List(_) => "list",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value, ttl_secs: u64) -> Self {
        Self {
            value,
            expires_at: expiry(Instant::now(), ttl_secs),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

fn expiry(now: Instant, ttl_secs: u64) -> Option<Instant> {
    (ttl_secs > 0).then(|| now + Duration::from_secs(ttl_secs))
}

fn wrong_type(key: &str, expected: &str, found: &Value) -> StoreError {
    StoreError::WrongType(format!("{} holds a {}, expected {}", key, found.kind(), expected))
}

/// Resolves Redis-style inclusive, possibly negative, range bounds.
fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// In-memory [`KvStore`] implementation.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    eviction: EvictionManager,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store sweeping expired entries at most once per `interval`.
    pub fn with_sweep_interval(interval: Duration) -> Self {
        Self {
            entries: Arc::default(),
            eviction: EvictionManager::new(interval),
        }
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        entries.values().filter(|e| !e.is_expired(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn maybe_sweep(&self) {
        if self.eviction.should_sweep().await {
            let dropped = self.sweep_expired().await;
            if dropped > 0 {
                tracing::debug!(dropped, "swept expired in-memory cache entries");
            }
        }
    }
}

#[async_trait]
impl ExpirySweep for MemoryStore {
    async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        before - entries.len()
    }
}

/// Removes the entry if it has expired, then returns the live entry.
fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    let now = Instant::now();
    if entries.get(key).is_some_and(|e| e.is_expired(now)) {
        entries.remove(key);
        return None;
    }
    entries.get_mut(key)
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key) {
            None => Ok(None),
            Some(Entry { value: Value::Str(s), .. }) => Ok(Some(s.clone())),
            Some(entry) => Err(wrong_type(key, "string", &entry.value)),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()> {
        {
            let mut entries = self.entries.lock().await;
            entries.insert(key.to_string(), Entry::new(Value::Str(value.to_string()), ttl_secs));
        }
        self.maybe_sweep().await;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<bool> {
        let mut entries = self.entries.lock().await;
        if live(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(key.to_string(), Entry::new(Value::Str(value.to_string()), ttl_secs));
        Ok(true)
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        let mut entries = self.entries.lock().await;
        let mut removed = 0;
        for key in keys {
            if live(&mut entries, key).is_some() {
                entries.remove(key);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut entries = self.entries.lock().await;
        let matches = matches!(
            live(&mut entries, key),
            Some(Entry { value: Value::Str(s), .. }) if s.as_str() == expected
        );
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut entries = self.entries.lock().await;
        Ok(live(&mut entries, key).is_some())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> StoreResult<bool> {
        let mut entries = self.entries.lock().await;
        if ttl_secs == 0 {
            // EXPIRE with a non-positive TTL deletes the key.
            return Ok(entries.remove(key).is_some_and(|e| !e.is_expired(Instant::now())));
        }
        match live(&mut entries, key) {
            Some(entry) => {
                entry.expires_at = expiry(Instant::now(), ttl_secs);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let matcher = KeyPattern::compile(pattern)?;
        let now = Instant::now();
        let entries = self.entries.lock().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(k, e)| !e.is_expired(now) && matcher.matches(k))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key) {
            None => Ok(None),
            Some(Entry { value: Value::Hash(h), .. }) => Ok(h.get(field).cloned()),
            Some(entry) => Err(wrong_type(key, "hash", &entry.value)),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<bool> {
        let mut entries = self.entries.lock().await;
        if live(&mut entries, key).is_none() {
            entries.insert(key.to_string(), Entry::new(Value::Hash(HashMap::new()), 0));
        }
        match entries.get_mut(key) {
            Some(Entry { value: Value::Hash(h), .. }) => {
                Ok(h.insert(field.to_string(), value.to_string()).is_none())
            }
            Some(entry) => Err(wrong_type(key, "hash", &entry.value)),
            None => Ok(false),
        }
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key) {
            None => Ok(HashMap::new()),
            Some(Entry { value: Value::Hash(h), .. }) => Ok(h.clone()),
            Some(entry) => Err(wrong_type(key, "hash", &entry.value)),
        }
    }

    async fn lpush(&self, key: &str, values: &[String]) -> StoreResult<u64> {
        let mut entries = self.entries.lock().await;
        if live(&mut entries, key).is_none() {
            entries.insert(key.to_string(), Entry::new(Value::List(VecDeque::new()), 0));
        }
        match entries.get_mut(key) {
            Some(Entry { value: Value::List(list), .. }) => {
                for value in values {
                    list.push_front(value.clone());
                }
                Ok(list.len() as u64)
            }
            Some(entry) => Err(wrong_type(key, "list", &entry.value)),
            None => Ok(0),
        }
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key) {
            None => Ok(Vec::new()),
            Some(Entry { value: Value::List(list), .. }) => Ok(resolve_range(list.len(), start, stop)
                .map(|(from, to)| list.range(from..=to).cloned().collect())
                .unwrap_or_default()),
            Some(entry) => Err(wrong_type(key, "list", &entry.value)),
        }
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
