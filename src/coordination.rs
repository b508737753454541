//! Read patterns layered over the cache client: single-flight recomputation
//! behind a distributed lock, tiered lookups, pattern invalidation and
//! best-effort warming.
//!
//! None of these operations surface a cache failure. The caller always gets
//! either data or the error of its own fetcher.

use crate::config::CoordinationSettings;
use crate::error::BoxError;
use crate::events::{EventBus, PerfEvent};
use async_trait::async_trait;
use cachestore_core::{CacheClient, DataCategory, TtlPolicy};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// An in-process cache tier owned by the caller.
///
/// The coordinator only reads from and writes to it through this trait.
#[async_trait]
pub trait MemoryTier<T>: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<T>, BoxError>;
    async fn put(&self, key: &str, value: T, ttl_secs: u64) -> Result<(), BoxError>;
}

/// Simple expiring map usable as a [`MemoryTier`].
pub struct LocalTier<T> {
    entries: Mutex<HashMap<String, (T, Instant)>>,
}

impl<T> LocalTier<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<T> Default for LocalTier<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> MemoryTier<T> for LocalTier<T> {
    async fn get(&self, key: &str) -> Result<Option<T>, BoxError> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: T, ttl_secs: u64) -> Result<(), BoxError> {
        let mut entries = self.entries.lock();
        if ttl_secs == 0 {
            entries.remove(key);
        } else {
            let expires_at = Instant::now() + Duration::from_secs(ttl_secs);
            entries.insert(key.to_string(), (value, expires_at));
        }
        Ok(())
    }
}

/// One entry to pre-populate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmEntry {
    pub key: String,
    pub value: String,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WarmReport {
    pub written: usize,
    /// Zero-TTL entries, which are never written
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate_percent: f64,
}

/// Releases a held lock. If the owning future is dropped before
/// [`release`](LockGuard::release) runs, the release is spawned instead.
struct LockGuard {
    client: CacheClient,
    key: String,
    token: String,
    released: bool,
}

impl LockGuard {
    async fn release(mut self) {
        self.released = true;
        if !self.client.release_lock(&self.key, &self.token).await {
            debug!(key = %self.key, "lock already expired or taken over");
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let client = self.client.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    client.release_lock(&key, &token).await;
                });
            }
            Err(_) => warn!(key = %key, "lock dropped outside a runtime, left to expire"),
        }
    }
}

pub struct CacheCoordinator {
    client: CacheClient,
    events: EventBus,
    ttl: TtlPolicy,
    settings: CoordinationSettings,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheCoordinator {
    pub fn new(
        client: CacheClient,
        events: EventBus,
        ttl: TtlPolicy,
        settings: CoordinationSettings,
    ) -> Self {
        Self {
            client,
            events,
            ttl,
            settings,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn client(&self) -> &CacheClient {
        &self.client
    }

    /// Default TTL in seconds for a data category.
    pub fn ttl_for(&self, category: DataCategory) -> u64 {
        self.ttl.ttl_for(category)
    }

    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads `key`, recomputing it with `fetcher` on a miss.
    ///
    /// Only the caller that wins `<key>:lock` runs the fetcher and writes
    /// the result; the others wait briefly, re-check the cache once and then
    /// fetch directly rather than block. A failing or disabled store skips
    /// the lock and the wait entirely. The lock is released on every exit
    /// path, and expires after `lock_ttl_secs` if the holder dies.
    pub async fn get_with_lock<T, E, F, Fut>(
        &self,
        key: &str,
        ttl_secs: u64,
        lock_ttl_secs: u64,
        fetcher: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.client.get_json::<T>(key).await {
            self.hit();
            return Ok(value);
        }
        self.miss();

        let lock_key = format!("{}:lock", key);
        let token = Uuid::new_v4().to_string();

        match self.client.try_acquire_lock(&lock_key, &token, lock_ttl_secs).await {
            Some(true) => {
                let guard = LockGuard {
                    client: self.client.clone(),
                    key: lock_key,
                    token,
                    released: false,
                };
                let result = fetcher().await;
                if let Ok(value) = &result {
                    self.client.set_json(key, value, ttl_secs).await;
                }
                guard.release().await;
                result
            }
            Some(false) => {
                tokio::time::sleep(self.settings.lock_retry_delay()).await;
                if let Some(value) = self.client.get_json::<T>(key).await {
                    return Ok(value);
                }
                debug!(key, "lock holder has not populated the cache, fetching directly");
                fetcher().await
            }
            // Store unusable: no lock to wait on.
            None => fetcher().await,
        }
    }

    /// [`get_with_lock`](Self::get_with_lock) with the configured lock TTL.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &str,
        ttl_secs: u64,
        fetcher: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.get_with_lock(key, ttl_secs, self.settings.lock_ttl_secs, fetcher)
            .await
    }

    /// Memory tier, then the store, then `db_fetcher`.
    ///
    /// A hit in a slower tier repopulates the faster ones. Tier failures fall
    /// through; only the `db_fetcher` error is returned.
    pub async fn get_multi_level<T, E, M, F, Fut>(
        &self,
        key: &str,
        memory: &M,
        ttl_secs: u64,
        db_fetcher: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Clone + Send,
        M: MemoryTier<T> + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match memory.get(key).await {
            Ok(Some(value)) => {
                self.hit();
                return Ok(value);
            }
            Ok(None) => {}
            Err(e) => warn!(key, error = %e, "memory tier read failed"),
        }

        if let Some(value) = self.client.get_json::<T>(key).await {
            self.hit();
            if let Err(e) = memory.put(key, value.clone(), ttl_secs).await {
                warn!(key, error = %e, "memory tier write failed");
            }
            return Ok(value);
        }

        self.miss();
        let value = db_fetcher().await?;
        self.client.set_json(key, &value, ttl_secs).await;
        if let Err(e) = memory.put(key, value.clone(), ttl_secs).await {
            warn!(key, error = %e, "memory tier write failed");
        }
        Ok(value)
    }

    /// Deletes every key matching a glob pattern.
    pub async fn invalidate(&self, pattern: &str) -> u64 {
        let removed = self.client.delete_matching(pattern).await;
        info!(pattern, removed, "cache invalidated");
        removed
    }

    /// Invalidates `base:relation:*` for every relation.
    pub async fn invalidate_related(&self, base: &str, relations: &[&str]) -> u64 {
        let mut removed = 0;
        for relation in relations {
            removed += self.invalidate(&format!("{}:{}:*", base, relation)).await;
        }
        removed
    }

    /// Writes all entries concurrently. Failures are logged and counted, never raised.
    ///
    /// Entries with a zero TTL are not cacheable and are reported as skipped.
    pub async fn warm_cache(&self, entries: Vec<WarmEntry>) -> WarmReport {
        let (entries, uncacheable): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|entry| entry.ttl_secs > 0);
        let total = entries.len();
        let client = &self.client;
        let written = stream::iter(entries)
            .map(|entry| async move {
                let ok = client.set(&entry.key, &entry.value, entry.ttl_secs).await;
                if !ok {
                    warn!(key = %entry.key, "cache warming write failed");
                }
                ok
            })
            .buffer_unordered(self.settings.warm_concurrency.max(1))
            .filter(|ok| futures::future::ready(*ok))
            .count()
            .await;

        let report = WarmReport {
            written,
            skipped: uncacheable.len(),
            failed: total - written,
        };
        info!(
            written = report.written,
            skipped = report.skipped,
            failed = report.failed,
            "cache warming finished"
        );
        report
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate_percent: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64 * 100.0
            },
        }
    }

    /// Publishes the current hit rate as a `cacheHitRate` event.
    pub fn report_hit_rate(&self) -> CacheStats {
        let stats = self.stats();
        info!(
            hits = stats.hits,
            misses = stats.misses,
            hit_rate_percent = stats.hit_rate_percent,
            "cache hit rate"
        );
        self.events.publish(PerfEvent::CacheHitRate {
            hits: stats.hits,
            misses: stats.misses,
            hit_rate_percent: stats.hit_rate_percent,
            timestamp: Utc::now(),
        });
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::drain;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn coordinator(client: CacheClient) -> CacheCoordinator {
        CacheCoordinator::new(
            client,
            EventBus::new(),
            TtlPolicy::default(),
            CoordinationSettings::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_fetch_once() {
        let coordinator = coordinator(CacheClient::in_memory("t:"));
        let calls = Arc::new(AtomicUsize::new(0));

        let callers = (0..5).map(|_| {
            let calls = calls.clone();
            coordinator.get_with_lock("report:monthly", 60, 10, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, BoxError>(vec![1u32, 2, 3])
            })
        });
        let results = futures::future::join_all(callers).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap(), vec![1, 2, 3]);
        }
        assert!(!coordinator.client().exists("report:monthly:lock").await);
    }

    #[tokio::test]
    async fn test_lock_released_when_fetcher_fails() {
        let coordinator = coordinator(CacheClient::in_memory("t:"));

        let result: Result<u32, String> = coordinator
            .get_with_lock("k", 60, 10, || async { Err("db down".to_string()) })
            .await;
        assert_eq!(result, Err("db down".to_string()));
        assert!(!coordinator.client().exists("k:lock").await);
        assert!(!coordinator.client().exists("k").await);

        let retry: Result<u32, String> = coordinator
            .get_with_lock("k", 60, 10, || async { Ok(7) })
            .await;
        assert_eq!(retry, Ok(7));
    }

    #[tokio::test]
    async fn test_lock_released_when_future_dropped() {
        let coordinator = coordinator(CacheClient::in_memory("t:"));
        let pending = coordinator.get_with_lock("slow", 60, 30, || async {
            futures::future::pending::<Result<u32, BoxError>>().await
        });
        let _ = tokio::time::timeout(Duration::from_millis(10), pending).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!coordinator.client().exists("slow:lock").await);
    }

    #[tokio::test]
    async fn test_disabled_cache_calls_fetcher() {
        let coordinator = coordinator(CacheClient::disabled());
        let value: Result<u32, BoxError> = coordinator.get_with_lock("k", 60, 10, || async { Ok(3) }).await;
        assert_eq!(value.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_multi_level_repopulates_faster_tiers() {
        let coordinator = coordinator(CacheClient::in_memory("t:"));
        let memory = LocalTier::<String>::new();

        let first: Result<String, BoxError> = coordinator
            .get_multi_level("patient:1", &memory, 60, || async { Ok("alice".to_string()) })
            .await;
        assert_eq!(first.unwrap(), "alice");
        assert_eq!(memory.len(), 1);
        assert!(coordinator.client().exists("patient:1").await);

        let fresh_memory = LocalTier::<String>::new();
        let second: Result<String, BoxError> = coordinator
            .get_multi_level("patient:1", &fresh_memory, 60, || async {
                Err("source should not be called".into())
            })
            .await;
        assert_eq!(second.unwrap(), "alice");
        assert_eq!(fresh_memory.len(), 1);

        let stats = coordinator.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[tokio::test]
    async fn test_invalidate_related() {
        let coordinator = coordinator(CacheClient::in_memory("t:"));
        let client = coordinator.client();
        client.set("patient:1:reports:a", "x", 60).await;
        client.set("patient:1:reports:b", "x", 60).await;
        client.set("patient:1:visits:a", "x", 60).await;
        client.set("patient:1:notes:a", "x", 60).await;

        let removed = coordinator
            .invalidate_related("patient:1", &["reports", "visits"])
            .await;
        assert_eq!(removed, 3);
        assert!(client.exists("patient:1:notes:a").await);
    }

    #[tokio::test]
    async fn test_warm_cache_skips_zero_ttl_entries() {
        let coordinator = coordinator(CacheClient::in_memory("t:"));
        let entries = vec![
            WarmEntry { key: "a".into(), value: "1".into(), ttl_secs: 60 },
            WarmEntry { key: "b".into(), value: "2".into(), ttl_secs: 60 },
            WarmEntry { key: "c".into(), value: "3".into(), ttl_secs: 0 },
        ];

        let report = coordinator.warm_cache(entries).await;
        assert_eq!(report, WarmReport { written: 2, skipped: 1, failed: 0 });
        assert_eq!(coordinator.client().get("b").await.as_deref(), Some("2"));
        assert!(!coordinator.client().exists("c").await);
    }

    #[tokio::test]
    async fn test_report_hit_rate_event() {
        let coordinator = coordinator(CacheClient::in_memory("t:"));
        let mut rx = coordinator.events.subscribe();
        let _: Result<u32, BoxError> = coordinator.get_or_compute("k", 60, || async { Ok(1) }).await;
        let _: Result<u32, BoxError> = coordinator.get_or_compute("k", 60, || async { Ok(1) }).await;

        let stats = coordinator.report_hit_rate();
        assert_eq!(stats.hit_rate_percent, 50.0);
        let events = drain(&mut rx);
        assert_eq!(events[0].name(), "cacheHitRate");
        assert_eq!(coordinator.ttl_for(DataCategory::Report), 1800);
    }
}
