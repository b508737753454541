use crate::config::{MonitorSettings, PerfSettings, StreamingSettings, RetrySettings};
use crate::coordination::{CacheCoordinator, MemoryTier, WarmEntry, WarmReport};
use crate::error::BoxError;
use crate::events::{drain, EventBus, PerfEvent};
use crate::monitor::PerformanceMonitor;
use crate::observer::{
    CachePerformanceStats, ConnectionPoolStats, DatabaseObserver, DatabaseStats, IndexUsageStats,
    QueryPerformanceStats, TableStats,
};
use crate::probe::{FixedProbe, MemoryUsage, ResourceProbe, ResourceSample};
use crate::service::PerformanceService;
use crate::streaming::{BatchSource, StreamOptions, StreamingEngine};
use async_trait::async_trait;
use cachestore_core::{CacheClient, KvStore, StoreError, StoreResult};
use mockall::predicate::*;
use mockall::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

mock! {
    pub Store {}
    #[async_trait]
    impl KvStore for Store {
        async fn get(&self, key: &str) -> StoreResult<Option<String>>;
        async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()>;
        async fn set_nx(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<bool>;
        async fn delete(&self, keys: &[String]) -> StoreResult<u64>;
        async fn delete_if_eq(&self, key: &str, expected: &str) -> StoreResult<bool>;
        async fn exists(&self, key: &str) -> StoreResult<bool>;
        async fn expire(&self, key: &str, ttl_secs: u64) -> StoreResult<bool>;
        async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>>;
        async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;
        async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<bool>;
        async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;
        async fn lpush(&self, key: &str, values: &[String]) -> StoreResult<u64>;
        async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>>;
        async fn ping(&self) -> StoreResult<()>;
    }
}

mock! {
    pub Stats {}
    #[async_trait]
    impl DatabaseStats for Stats {
        async fn connection_pool(&self) -> Result<ConnectionPoolStats, BoxError>;
        async fn query_performance(&self) -> Result<QueryPerformanceStats, BoxError>;
        async fn index_usage(&self) -> Result<IndexUsageStats, BoxError>;
        async fn table_stats(&self) -> Result<Vec<TableStats>, BoxError>;
        async fn cache_performance(&self) -> Result<CachePerformanceStats, BoxError>;
    }
}

mock! {
    pub Source {}
    #[async_trait]
    impl BatchSource<u32> for Source {
        async fn count(&self) -> Result<usize, BoxError>;
        async fn fetch(&self, offset: usize, limit: usize) -> Result<Vec<u32>, BoxError>;
    }
}

mock! {
    pub Probe {}
    impl ResourceProbe for Probe {
        fn sample(&self) -> ResourceSample;
    }
}

fn unavailable() -> StoreError {
    StoreError::Unavailable("connection reset".to_string())
}

fn monitor_with(probe: Arc<dyn ResourceProbe>) -> Arc<PerformanceMonitor> {
    Arc::new(PerformanceMonitor::with_probe(
        MonitorSettings::default(),
        EventBus::new(),
        probe,
    ))
}

#[tokio::test]
async fn test_client_swallows_store_failures() {
    let mut store = MockStore::new();
    store
        .expect_get()
        .with(eq("t:patient:1"))
        .times(1)
        .returning(|_| Err(unavailable()));
    store.expect_keys().returning(|_| Err(unavailable()));

    let client = CacheClient::new(Arc::new(store), "t:");
    assert_eq!(client.get("patient:1").await, None);
    assert_eq!(client.delete_matching("patient:*").await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_stampede_fetch_falls_back_when_store_is_down() {
    let mut store = MockStore::new();
    store.expect_get().returning(|_| Err(unavailable()));
    store.expect_set_nx().returning(|_, _, _| Err(unavailable()));
    store.expect_set().never();

    let coordinator = CacheCoordinator::new(
        CacheClient::new(Arc::new(store), "t:"),
        EventBus::new(),
        Default::default(),
        Default::default(),
    );

    let value = coordinator
        .get_with_lock("report:1", 60, 10, || async { Ok::<_, BoxError>(42u32) })
        .await;
    assert_eq!(assert_ok!(value), 42);

    let failing = coordinator
        .get_with_lock("report:2", 60, 10, || async { Err::<u32, _>("query failed".to_string()) })
        .await;
    assert_eq!(assert_err!(failing), "query failed");
}

#[tokio::test(start_paused = true)]
async fn test_store_outage_skips_the_lock_wait() {
    let mut store = MockStore::new();
    store.expect_get().returning(|_| Err(unavailable()));
    store
        .expect_set_nx()
        .times(5)
        .returning(|_, _, _| Err(unavailable()));
    store.expect_delete_if_eq().never();

    let coordinator = CacheCoordinator::new(
        CacheClient::new(Arc::new(store), "t:"),
        EventBus::new(),
        Default::default(),
        Default::default(),
    );

    let started = tokio::time::Instant::now();
    for i in 0..5u32 {
        let value = coordinator
            .get_with_lock(&format!("report:{}", i), 60, 10, || async move { Ok::<_, BoxError>(i) })
            .await;
        assert_eq!(assert_ok!(value), i);
    }
    assert_eq!(started.elapsed(), Duration::ZERO);
}

struct FailingTier;

#[async_trait]
impl MemoryTier<String> for FailingTier {
    async fn get(&self, _: &str) -> Result<Option<String>, BoxError> {
        Err("tier offline".into())
    }

    async fn put(&self, _: &str, _: String, _: u64) -> Result<(), BoxError> {
        Err("tier offline".into())
    }
}

#[tokio::test]
async fn test_failing_memory_tier_falls_through() {
    let coordinator = CacheCoordinator::new(
        CacheClient::in_memory("t:"),
        EventBus::new(),
        Default::default(),
        Default::default(),
    );
    coordinator.client().set_json("patient:1", "alice", 60).await;

    let from_store: Result<String, BoxError> = coordinator
        .get_multi_level("patient:1", &FailingTier, 60, || async {
            Err("source should not be called".into())
        })
        .await;
    assert_eq!(assert_ok!(from_store), "alice");

    let from_source: Result<String, BoxError> = coordinator
        .get_multi_level("patient:2", &FailingTier, 60, || async { Ok("bob".to_string()) })
        .await;
    assert_eq!(assert_ok!(from_source), "bob");
    let stored: Option<String> = coordinator.client().get_json("patient:2").await;
    assert_eq!(stored.as_deref(), Some("bob"));
}

#[tokio::test]
async fn test_warm_cache_counts_rejected_writes() {
    let mut store = MockStore::new();
    store.expect_set().times(3).returning(|key, _, _| {
        if key == "t:reference:stages" {
            Err(unavailable())
        } else {
            Ok(())
        }
    });

    let coordinator = CacheCoordinator::new(
        CacheClient::new(Arc::new(store), "t:"),
        EventBus::new(),
        Default::default(),
        Default::default(),
    );
    let entries = ["reference:sites", "reference:stages", "reference:grades", "session:x"]
        .iter()
        .map(|key| WarmEntry {
            key: key.to_string(),
            value: "[]".to_string(),
            ttl_secs: if key.starts_with("session") { 0 } else { 3600 },
        })
        .collect();

    let report = coordinator.warm_cache(entries).await;
    assert_eq!(report, WarmReport { written: 2, skipped: 1, failed: 1 });
}

#[tokio::test]
async fn test_lock_holder_writes_then_releases_with_its_token() {
    let mut store = MockStore::new();
    let mut seq = Sequence::new();
    store
        .expect_get()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Ok(None));
    store
        .expect_set_nx()
        .with(eq("t:report:1:lock"), always(), eq(10))
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _, _| Ok(true));
    store
        .expect_set()
        .with(eq("t:report:1"), eq("[1,2]"), eq(60))
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _, _| Ok(()));
    store
        .expect_delete_if_eq()
        .with(eq("t:report:1:lock"), always())
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Ok(true));

    let coordinator = CacheCoordinator::new(
        CacheClient::new(Arc::new(store), "t:"),
        EventBus::new(),
        Default::default(),
        Default::default(),
    );
    let value = coordinator
        .get_with_lock("report:1", 60, 10, || async { Ok::<_, BoxError>(vec![1u32, 2]) })
        .await;
    assert_eq!(assert_ok!(value), vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_round_trip_then_expiry() {
    let client = CacheClient::in_memory("t:");
    for (key, value) in [("a", "1"), ("b:c", "two"), ("report:2024", "{}")] {
        client.set(key, value, 30).await;
        assert_eq!(client.get(key).await.as_deref(), Some(value));
    }

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(client.get("a").await, None);
    assert_eq!(client.get("report:2024").await, None);
}

#[tokio::test]
async fn test_all_sections_failing_still_yields_a_snapshot() {
    let mut stats = MockStats::new();
    stats.expect_connection_pool().returning(|| Err("timeout".into()));
    stats.expect_query_performance().returning(|| Err("timeout".into()));
    stats.expect_index_usage().returning(|| Err("timeout".into()));
    stats.expect_table_stats().returning(|| Err("timeout".into()));
    stats.expect_cache_performance().returning(|| Err("timeout".into()));

    let events = EventBus::new();
    let mut rx = events.subscribe();
    let observer = DatabaseObserver::new(
        Arc::new(stats),
        monitor_with(Arc::new(FixedProbe::default())),
        events,
        Default::default(),
    );

    let snapshot = observer.collect_snapshot().await;
    assert!(snapshot.degraded);
    assert_eq!(snapshot.failed_sections.len(), 5);
    assert_eq!(snapshot.connection_pool, ConnectionPoolStats::default());
    assert!(drain(&mut rx).is_empty());
    assert_eq!(observer.performance_report().health_score, 90);
}

#[tokio::test]
async fn test_breached_thresholds_each_raise_an_alert() {
    let mut stats = MockStats::new();
    stats.expect_connection_pool().returning(|| {
        Ok(ConnectionPoolStats { total: 20, active: 20, idle: 0, waiting: 9, max_connections: 20 })
    });
    stats.expect_query_performance().returning(|| {
        Ok(QueryPerformanceStats { total_queries: 500, slow_queries: 40, average_query_ms: 90.0, slowest: vec![] })
    });
    stats.expect_index_usage().returning(|| {
        Ok(IndexUsageStats { index_hit_rate_percent: 99.5, unused_indexes: vec![] })
    });
    stats.expect_table_stats().returning(|| Ok(vec![]));
    stats.expect_cache_performance().returning(|| {
        Ok(CachePerformanceStats { buffer_hit_rate_percent: 99.0 })
    });

    let events = EventBus::new();
    let mut rx = events.subscribe();
    let observer = DatabaseObserver::new(
        Arc::new(stats),
        monitor_with(Arc::new(FixedProbe::default())),
        events,
        Default::default(),
    );
    observer.collect_snapshot().await;

    let checks: Vec<String> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            PerfEvent::DatabaseAlert { check, .. } => Some(check),
            _ => None,
        })
        .collect();
    assert_eq!(checks, vec!["connection_waiting", "slow_queries"]);
    assert!(!observer.performance_report().recommendations.is_empty());
}

#[tokio::test]
async fn test_stream_source_uses_count_and_pages_in_order() {
    let mut source = MockSource::new();
    source.expect_count().times(1).returning(|| Ok(2500));
    let mut seq = Sequence::new();
    for (offset, len) in [(0usize, 1000usize), (1000, 1000), (2000, 500), (2500, 0)] {
        source
            .expect_fetch()
            .with(eq(offset), eq(1000))
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |offset, _| Ok((offset as u32..(offset + len) as u32).collect()));
    }

    let events = EventBus::new();
    let engine = StreamingEngine::new(
        monitor_with(Arc::new(FixedProbe::default())),
        events,
        StreamingSettings::default(),
        RetrySettings::default(),
    );

    let mut sizes = Vec::new();
    let summary = engine
        .stream_source(
            "registry.export",
            &source,
            |batch: Vec<u32>, _| {
                sizes.push(batch.len());
                async { Ok(()) }
            },
            StreamOptions::default(),
        )
        .await;

    assert_eq!(assert_ok!(summary).total_processed, 2500);
    assert_eq!(sizes, vec![1000, 1000, 500]);
}

#[tokio::test(start_paused = true)]
async fn test_memory_pressure_pauses_each_fetch() {
    let mut probe = MockProbe::new();
    probe.expect_sample().returning(|| ResourceSample {
        memory: MemoryUsage {
            rss_bytes: 900 * 1024 * 1024,
            ..MemoryUsage::default()
        },
        cpu_percent: 1.0,
    });

    let engine = StreamingEngine::new(
        monitor_with(Arc::new(probe)),
        EventBus::new(),
        StreamingSettings {
            cleanup_pause_ms: 100,
            ..StreamingSettings::default()
        },
        RetrySettings::default(),
    );
    let started = tokio::time::Instant::now();
    let data: Vec<u32> = (0..1500).collect();

    let summary = engine
        .stream_dataset(
            "pressure",
            |offset, limit| {
                let batch: Vec<u32> = data.iter().skip(offset).take(limit).copied().collect();
                async move { Ok(batch) }
            },
            |_, _| async { Ok(()) },
            StreamOptions::default(),
        )
        .await;

    assert_ok!(summary);
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn test_service_alerts_reach_subscribers() {
    let service = PerformanceService::with_client(
        &PerfSettings::default(),
        CacheClient::in_memory("t:"),
        Arc::new(FixedProbe::with_rss_mb(100.0, 0.5)),
    )
    .unwrap();
    let mut rx = service.subscribe();

    service.record_operation("reports.generate", 2400.0, true, None);
    let slow = drain(&mut rx);
    assert_eq!(slow.len(), 1);
    assert_eq!(slow[0].name(), "slowOperation");

    for i in 0..11 {
        service.record_operation("patients.search", 15.0, i % 3 != 0, None);
    }
    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        PerfEvent::HighErrorRate { operation, .. } if operation == "patients.search"
    )));
    assert!(!service.is_healthy());
}

#[tokio::test]
async fn test_unhealthy_under_host_memory_pressure() {
    let service = PerformanceService::with_client(
        &PerfSettings::default(),
        CacheClient::disabled(),
        Arc::new(FixedProbe::with_rss_mb(100.0, 0.95)),
    )
    .unwrap();

    service.record_operation("patients.find", 10.0, true, None);
    assert!(!service.is_healthy());
    assert!(!service.health().await.cache_connected);
}
