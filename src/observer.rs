//! Periodic database health snapshots, threshold alerts and tuning
//! recommendations.
//!
//! The five statistics reads are independent: a failing read is replaced by
//! its zero default and named in `failed_sections`, and the snapshot is
//! marked `degraded`. Collection itself never fails. Threshold checks and
//! recommendation rules skip sections that failed, so a broken statistics
//! query does not masquerade as a 0% hit rate.

use crate::config::ObserverSettings;
use crate::error::BoxError;
use crate::events::{EventBus, PerfEvent, Severity};
use crate::history::{BoundedHistory, Timestamped};
use crate::monitor::{MonitorHandle, PerformanceMonitor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const SECTION_CONNECTION_POOL: &str = "connection_pool";
pub const SECTION_QUERY_PERFORMANCE: &str = "query_performance";
pub const SECTION_INDEX_USAGE: &str = "index_usage";
pub const SECTION_TABLE_STATS: &str = "table_stats";
pub const SECTION_CACHE_PERFORMANCE: &str = "cache_performance";

/// Rows above which a table scanned mostly sequentially is worth indexing.
const LARGE_TABLE_ROWS: u64 = 10_000;
/// Dead-row share above which a table should be vacuumed.
const DEAD_ROW_RATIO: f64 = 0.2;
/// Pool utilisation above which the pool is considered near capacity.
const POOL_UTILISATION: f64 = 0.8;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionPoolStats {
    pub total: u32,
    pub active: u32,
    pub idle: u32,
    pub waiting: u32,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlowQuery {
    pub query: String,
    pub calls: u64,
    pub mean_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryPerformanceStats {
    pub total_queries: u64,
    pub slow_queries: u64,
    pub average_query_ms: f64,
    pub slowest: Vec<SlowQuery>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexUsageStats {
    pub index_hit_rate_percent: f64,
    pub unused_indexes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableStats {
    pub name: String,
    pub row_count: u64,
    pub dead_rows: u64,
    pub size_bytes: u64,
    pub sequential_scans: u64,
    pub index_scans: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CachePerformanceStats {
    pub buffer_hit_rate_percent: f64,
}

/// Statistics reads against the database.
#[async_trait]
pub trait DatabaseStats: Send + Sync {
    async fn connection_pool(&self) -> Result<ConnectionPoolStats, BoxError>;
    async fn query_performance(&self) -> Result<QueryPerformanceStats, BoxError>;
    async fn index_usage(&self) -> Result<IndexUsageStats, BoxError>;
    async fn table_stats(&self) -> Result<Vec<TableStats>, BoxError>;
    async fn cache_performance(&self) -> Result<CachePerformanceStats, BoxError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseSnapshot {
    pub timestamp: DateTime<Utc>,
    pub connection_pool: ConnectionPoolStats,
    pub query_performance: QueryPerformanceStats,
    pub index_usage: IndexUsageStats,
    pub table_stats: Vec<TableStats>,
    pub cache_performance: CachePerformanceStats,
    pub degraded: bool,
    pub failed_sections: Vec<String>,
}

impl DatabaseSnapshot {
    pub fn section_ok(&self, section: &str) -> bool {
        !self.failed_sections.iter().any(|s| s == section)
    }
}

impl Timestamped for DatabaseSnapshot {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    fn weight(self) -> u32 {
        match self {
            Priority::Low => 3,
            Priority::Medium => 8,
            Priority::High => 15,
            Priority::Critical => 25,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub category: String,
    pub priority: Priority,
    pub impact: Impact,
    pub description: String,
    pub actions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub generated_at: DateTime<Utc>,
    pub snapshot: Option<DatabaseSnapshot>,
    pub recommendations: Vec<Recommendation>,
    /// 0 (unusable) to 100 (no findings)
    pub health_score: u8,
    pub history_size: usize,
}

fn actions(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Maps every breached condition in `snapshot` to a recommendation.
///
/// Rules are independent of each other. The result is ordered by priority,
/// then impact, highest first.
pub fn generate_recommendations(
    snapshot: &DatabaseSnapshot,
    thresholds: &ObserverSettings,
) -> Vec<Recommendation> {
    let mut recommendations = Vec::new();

    if snapshot.section_ok(SECTION_CONNECTION_POOL) {
        let pool = &snapshot.connection_pool;
        if pool.waiting > thresholds.max_waiting_connections {
            recommendations.push(Recommendation {
                category: "Connection Pool".to_string(),
                priority: Priority::High,
                impact: Impact::High,
                description: format!("{} connections waiting for the pool", pool.waiting),
                actions: actions(&[
                    "Increase the pool size",
                    "Shorten long-running transactions",
                    "Check for connection leaks",
                ]),
            });
        }
        if pool.max_connections > 0
            && pool.active as f64 / pool.max_connections as f64 > POOL_UTILISATION
        {
            recommendations.push(Recommendation {
                category: "Connection Pool".to_string(),
                priority: Priority::Medium,
                impact: Impact::Medium,
                description: format!(
                    "Pool near capacity: {}/{} connections active",
                    pool.active, pool.max_connections
                ),
                actions: actions(&[
                    "Raise max_connections or add a pooler",
                    "Move reporting workloads to a replica",
                ]),
            });
        }
    }

    if snapshot.section_ok(SECTION_QUERY_PERFORMANCE)
        && snapshot.query_performance.slow_queries > thresholds.max_slow_queries
    {
        recommendations.push(Recommendation {
            category: "Query Performance".to_string(),
            priority: Priority::High,
            impact: Impact::High,
            description: format!(
                "{} slow queries detected",
                snapshot.query_performance.slow_queries
            ),
            actions: actions(&[
                "Review query plans of the slowest statements",
                "Add indexes for frequent filters",
                "Cache expensive aggregate queries",
            ]),
        });
    }

    if snapshot.section_ok(SECTION_INDEX_USAGE) {
        let index = &snapshot.index_usage;
        if index.index_hit_rate_percent < thresholds.min_index_hit_rate_percent {
            recommendations.push(Recommendation {
                category: "Index Usage".to_string(),
                priority: Priority::High,
                impact: Impact::High,
                description: format!("Low index hit rate: {:.1}%", index.index_hit_rate_percent),
                actions: actions(&[
                    "Add indexes for sequentially scanned predicates",
                    "Refresh planner statistics",
                ]),
            });
        }
        if !index.unused_indexes.is_empty() {
            recommendations.push(Recommendation {
                category: "Index Usage".to_string(),
                priority: Priority::Low,
                impact: Impact::Low,
                description: format!("{} unused indexes", index.unused_indexes.len()),
                actions: actions(&["Drop unused indexes to speed up writes"]),
            });
        }
    }

    if snapshot.section_ok(SECTION_CACHE_PERFORMANCE)
        && snapshot.cache_performance.buffer_hit_rate_percent
            < thresholds.min_cache_hit_rate_percent
    {
        recommendations.push(Recommendation {
            category: "Buffer Cache".to_string(),
            priority: Priority::Medium,
            impact: Impact::High,
            description: format!(
                "Low buffer cache hit rate: {:.1}%",
                snapshot.cache_performance.buffer_hit_rate_percent
            ),
            actions: actions(&[
                "Increase shared buffers",
                "Reduce the working set of hot queries",
            ]),
        });
    }

    if snapshot.section_ok(SECTION_TABLE_STATS) {
        for table in &snapshot.table_stats {
            let live = table.row_count.max(1) as f64;
            if table.dead_rows as f64 / live > DEAD_ROW_RATIO {
                recommendations.push(Recommendation {
                    category: "Table Maintenance".to_string(),
                    priority: Priority::Medium,
                    impact: Impact::Medium,
                    description: format!("Table {} has {} dead rows", table.name, table.dead_rows),
                    actions: actions(&["Run VACUUM ANALYZE", "Tune autovacuum thresholds"]),
                });
            }
            if table.row_count > LARGE_TABLE_ROWS && table.sequential_scans > table.index_scans {
                recommendations.push(Recommendation {
                    category: "Table Access".to_string(),
                    priority: Priority::Medium,
                    impact: Impact::High,
                    description: format!(
                        "Table {} is mostly scanned sequentially ({} seq vs {} index scans)",
                        table.name, table.sequential_scans, table.index_scans
                    ),
                    actions: actions(&["Index the columns used in frequent filters"]),
                });
            }
        }
    }

    recommendations.sort_by(|a, b| b.priority.cmp(&a.priority).then(b.impact.cmp(&a.impact)));
    recommendations
}

/// 100 minus the weight of every finding, minus 10 for a degraded snapshot.
pub fn health_score(snapshot: &DatabaseSnapshot, recommendations: &[Recommendation]) -> u8 {
    let penalty: u32 = recommendations.iter().map(|r| r.priority.weight()).sum::<u32>()
        + if snapshot.degraded { 10 } else { 0 };
    100u32.saturating_sub(penalty) as u8
}

fn settle<T: Default>(section: &str, result: Result<T, BoxError>, failed: &mut Vec<String>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            warn!(section, error = %e, "database statistics read failed, using defaults");
            failed.push(section.to_string());
            T::default()
        }
    }
}

pub struct DatabaseObserver {
    stats: Arc<dyn DatabaseStats>,
    monitor: Arc<PerformanceMonitor>,
    events: EventBus,
    settings: ObserverSettings,
    history: RwLock<BoundedHistory<DatabaseSnapshot>>,
}

impl DatabaseObserver {
    pub fn new(
        stats: Arc<dyn DatabaseStats>,
        monitor: Arc<PerformanceMonitor>,
        events: EventBus,
        settings: ObserverSettings,
    ) -> Self {
        let history = BoundedHistory::new(settings.max_history_size, settings.retention());
        Self {
            stats,
            monitor,
            events,
            settings,
            history: RwLock::new(history),
        }
    }

    /// Reads all five statistics concurrently and records the snapshot.
    pub async fn collect_snapshot(&self) -> DatabaseSnapshot {
        let started = Instant::now();
        let (pool, queries, indexes, tables, cache) = tokio::join!(
            self.stats.connection_pool(),
            self.stats.query_performance(),
            self.stats.index_usage(),
            self.stats.table_stats(),
            self.stats.cache_performance(),
        );

        let mut failed = Vec::new();
        let snapshot = DatabaseSnapshot {
            timestamp: Utc::now(),
            connection_pool: settle(SECTION_CONNECTION_POOL, pool, &mut failed),
            query_performance: settle(SECTION_QUERY_PERFORMANCE, queries, &mut failed),
            index_usage: settle(SECTION_INDEX_USAGE, indexes, &mut failed),
            table_stats: settle(SECTION_TABLE_STATS, tables, &mut failed),
            cache_performance: settle(SECTION_CACHE_PERFORMANCE, cache, &mut failed),
            degraded: !failed.is_empty(),
            failed_sections: failed,
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let error = snapshot
            .degraded
            .then(|| format!("failed sections: {}", snapshot.failed_sections.join(", ")));
        self.monitor
            .record_operation("database.collect_snapshot", elapsed_ms, !snapshot.degraded, error);

        {
            let mut history = self.history.write();
            history.prune(snapshot.timestamp);
            history.push(snapshot.clone());
        }
        self.check_thresholds(&snapshot);
        snapshot
    }

    /// Publishes one `databaseAlert` per breached threshold. Returns how many fired.
    pub fn check_thresholds(&self, snapshot: &DatabaseSnapshot) -> usize {
        let s = &self.settings;
        let mut alerts = Vec::new();

        if snapshot.section_ok(SECTION_CONNECTION_POOL)
            && snapshot.connection_pool.waiting > s.max_waiting_connections
        {
            alerts.push((
                "connection_waiting",
                Severity::Warning,
                format!("{} connections waiting", snapshot.connection_pool.waiting),
                snapshot.connection_pool.waiting as f64,
                s.max_waiting_connections as f64,
            ));
        }
        if snapshot.section_ok(SECTION_QUERY_PERFORMANCE)
            && snapshot.query_performance.slow_queries > s.max_slow_queries
        {
            alerts.push((
                "slow_queries",
                Severity::Warning,
                format!("{} slow queries", snapshot.query_performance.slow_queries),
                snapshot.query_performance.slow_queries as f64,
                s.max_slow_queries as f64,
            ));
        }
        if snapshot.section_ok(SECTION_INDEX_USAGE)
            && snapshot.index_usage.index_hit_rate_percent < s.min_index_hit_rate_percent
        {
            alerts.push((
                "index_hit_rate",
                Severity::Critical,
                format!(
                    "index hit rate {:.1}%",
                    snapshot.index_usage.index_hit_rate_percent
                ),
                snapshot.index_usage.index_hit_rate_percent,
                s.min_index_hit_rate_percent,
            ));
        }
        if snapshot.section_ok(SECTION_CACHE_PERFORMANCE)
            && snapshot.cache_performance.buffer_hit_rate_percent < s.min_cache_hit_rate_percent
        {
            alerts.push((
                "cache_hit_rate",
                Severity::Warning,
                format!(
                    "buffer cache hit rate {:.1}%",
                    snapshot.cache_performance.buffer_hit_rate_percent
                ),
                snapshot.cache_performance.buffer_hit_rate_percent,
                s.min_cache_hit_rate_percent,
            ));
        }

        let fired = alerts.len();
        for (check, severity, message, value, threshold) in alerts {
            warn!(check, ?severity, value, threshold, "{}", message);
            self.events.publish(PerfEvent::DatabaseAlert {
                check: check.to_string(),
                severity,
                message,
                value,
                threshold,
                timestamp: snapshot.timestamp,
            });
        }
        fired
    }

    pub fn latest(&self) -> Option<DatabaseSnapshot> {
        self.history.read().latest().cloned()
    }

    pub fn history(&self) -> Vec<DatabaseSnapshot> {
        self.history.read().to_vec()
    }

    /// Recommendations and health score for the latest snapshot.
    pub fn performance_report(&self) -> PerformanceReport {
        let (snapshot, history_size) = {
            let history = self.history.read();
            (history.latest().cloned(), history.len())
        };
        let (recommendations, health_score) = match &snapshot {
            Some(s) => {
                let recommendations = generate_recommendations(s, &self.settings);
                let score = health_score(s, &recommendations);
                (recommendations, score)
            }
            None => (Vec::new(), 0),
        };
        PerformanceReport {
            generated_at: Utc::now(),
            snapshot,
            recommendations,
            health_score,
            history_size,
        }
    }

    /// Collects on the configured interval, starting immediately.
    pub fn start(self: &Arc<Self>) -> MonitorHandle {
        let every = Duration::from_secs(self.settings.interval_secs.max(1));
        let observer = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let snapshot = observer.collect_snapshot().await;
                info!(degraded = snapshot.degraded, "database snapshot collected");
            }
        });
        info!(interval = ?every, "database observer started");
        MonitorHandle::from_tasks(vec![task])
    }
}
