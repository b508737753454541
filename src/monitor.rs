//! Per-operation metrics, threshold alerts and the pull-based metrics export.
//!
//! Every measured operation is appended to a bounded history keyed by its
//! name. The slow-operation and high-error-rate checks run inside
//! [`PerformanceMonitor::record_operation`] itself, so an alert is published
//! before the call returns. Process resource sampling, rolling analysis and
//! retention cleanup run on timers started with [`PerformanceMonitor::start`].

use crate::config::MonitorSettings;
use crate::events::{EventBus, PerfEvent};
use crate::history::{BoundedHistory, Timestamped};
use crate::probe::{MemoryUsage, ResourceProbe, SystemProbe};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Snapshots returned by [`PerformanceMonitor::get_system_snapshots`].
const SNAPSHOT_READ_LIMIT: usize = 100;

/// Upper bounds, in milliseconds, of the exported duration histogram.
const DURATION_BUCKETS_MS: [f64; 11] = [
    5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

const METRIC_PREFIX: &str = "perfstream";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryMetricRecord {
    pub operation_name: String,
    pub execution_time_ms: f64,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
}

impl Timestamped for QueryMetricRecord {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemSnapshot {
    pub timestamp: DateTime<Utc>,
    pub memory: MemoryUsage,
    pub cpu_percent: f32,
}

impl Timestamped for SystemSnapshot {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Cumulative counters per operation; unaffected by history retention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct OperationCounters {
    pub total: u64,
    pub failures: u64,
    pub slow: u64,
    pub total_time_ms: f64,
}

/// Aggregate view over every retained record, computed on demand.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSummary {
    pub total_operations: usize,
    pub failed_operations: usize,
    pub slow_operations: usize,
    pub average_duration_ms: f64,
    pub error_rate_percent: f64,
    pub tracked_operations: usize,
    pub memory: Option<MemoryUsage>,
    pub generated_at: DateTime<Utc>,
}

/// Latency distribution of one operation over its retained history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationStats {
    pub operation: String,
    pub count: usize,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub error_rate_percent: f64,
}

/// Nearest-rank percentile.
///
/// Sorts ascending and picks index `ceil(p/100 * n) - 1`, clamped to the
/// valid range. Empty input yields 0.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = (p / 100.0 * sorted.len() as f64).ceil() as isize - 1;
    let index = rank.clamp(0, sorted.len() as isize - 1) as usize;
    sorted[index]
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Background timers of a started monitor. Dropping the handle stops them.
#[derive(Debug)]
pub struct MonitorHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl MonitorHandle {
    pub(crate) fn from_tasks(tasks: Vec<JoinHandle<()>>) -> Self {
        Self { tasks }
    }

    /// Joins another handle's timers into this one.
    pub fn merge(&mut self, mut other: MonitorHandle) {
        self.tasks.append(&mut other.tasks);
    }

    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct PerformanceMonitor {
    config: MonitorSettings,
    events: EventBus,
    probe: Arc<dyn ResourceProbe>,
    metrics: RwLock<HashMap<String, BoundedHistory<QueryMetricRecord>>>,
    counters: RwLock<HashMap<String, OperationCounters>>,
    snapshots: RwLock<BoundedHistory<SystemSnapshot>>,
}

impl PerformanceMonitor {
    pub fn new(config: MonitorSettings, events: EventBus) -> Self {
        Self::with_probe(config, events, Arc::new(SystemProbe::new()))
    }

    pub fn with_probe(
        config: MonitorSettings,
        events: EventBus,
        probe: Arc<dyn ResourceProbe>,
    ) -> Self {
        let snapshots = BoundedHistory::new(config.max_history_size, Self::retention(&config));
        Self {
            config,
            events,
            probe,
            metrics: RwLock::new(HashMap::new()),
            counters: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(snapshots),
        }
    }

    fn retention(config: &MonitorSettings) -> chrono::Duration {
        chrono::Duration::hours(config.retention_hours)
    }

    pub fn config(&self) -> &MonitorSettings {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Current resource reading from the configured probe.
    pub fn memory_usage(&self) -> MemoryUsage {
        self.probe.sample().memory
    }

    /// Records one measured operation and evaluates its alerts.
    pub fn record_operation(
        &self,
        name: &str,
        duration_ms: f64,
        success: bool,
        error: Option<String>,
    ) {
        let duration_ms = duration_ms.max(0.0);
        let slow = duration_ms > self.config.slow_operation_threshold_ms;
        let record = QueryMetricRecord {
            operation_name: name.to_string(),
            execution_time_ms: duration_ms,
            timestamp: Utc::now(),
            success,
            error,
        };
        let timestamp = record.timestamp;

        let window = {
            let mut metrics = self.metrics.write();
            let history = metrics.entry(name.to_string()).or_insert_with(|| {
                BoundedHistory::new(self.config.max_history_size, Self::retention(&self.config))
            });
            history.push(record);

            let window: Vec<bool> = history
                .last_n(self.config.error_window)
                .map(|r| r.success)
                .collect();
            window
        };

        {
            let mut counters = self.counters.write();
            let entry = counters.entry(name.to_string()).or_default();
            entry.total += 1;
            entry.total_time_ms += duration_ms;
            if !success {
                entry.failures += 1;
            }
            if slow {
                entry.slow += 1;
            }
        }

        if slow {
            warn!(
                operation = name,
                duration_ms,
                threshold_ms = self.config.slow_operation_threshold_ms,
                "slow operation"
            );
            self.events.publish(PerfEvent::SlowOperation {
                operation: name.to_string(),
                duration_ms,
                threshold_ms: self.config.slow_operation_threshold_ms,
                timestamp,
            });
        }

        if window.len() >= self.config.error_min_samples {
            let failures = window.iter().filter(|ok| !**ok).count();
            let error_rate_percent = failures as f64 / window.len() as f64 * 100.0;
            if error_rate_percent > self.config.error_rate_threshold_percent {
                warn!(operation = name, error_rate_percent, "high error rate");
                self.events.publish(PerfEvent::HighErrorRate {
                    operation: name.to_string(),
                    error_rate_percent,
                    window: window.len(),
                    timestamp,
                });
            }
        }
    }

    /// Awaits `operation`, recording its duration and outcome under `name`.
    pub async fn measure<T, E, F>(&self, name: &str, operation: F) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let result = operation.await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        match &result {
            Ok(_) => self.record_operation(name, elapsed_ms, true, None),
            Err(e) => self.record_operation(name, elapsed_ms, false, Some(e.to_string())),
        }
        result
    }

    /// Retained history of one operation, or of every operation when `name` is `None`.
    pub fn get_metrics(&self, name: Option<&str>) -> HashMap<String, Vec<QueryMetricRecord>> {
        let metrics = self.metrics.read();
        match name {
            Some(name) => metrics
                .get(name)
                .map(|h| HashMap::from([(name.to_string(), h.to_vec())]))
                .unwrap_or_default(),
            None => metrics
                .iter()
                .map(|(name, h)| (name.clone(), h.to_vec()))
                .collect(),
        }
    }

    pub fn counters(&self, name: &str) -> Option<OperationCounters> {
        self.counters.read().get(name).copied()
    }

    /// The most recent system snapshots, oldest first.
    pub fn get_system_snapshots(&self) -> Vec<SystemSnapshot> {
        self.snapshots
            .read()
            .last_n(SNAPSHOT_READ_LIMIT)
            .cloned()
            .collect()
    }

    pub fn get_summary(&self) -> PerformanceSummary {
        let metrics = self.metrics.read();
        let mut total = 0;
        let mut failed = 0;
        let mut slow = 0;
        let mut total_time_ms = 0.0;

        for record in metrics.values().flat_map(|h| h.iter()) {
            total += 1;
            total_time_ms += record.execution_time_ms;
            if !record.success {
                failed += 1;
            }
            if record.execution_time_ms > self.config.slow_operation_threshold_ms {
                slow += 1;
            }
        }

        let (average_duration_ms, error_rate_percent) = if total == 0 {
            (0.0, 0.0)
        } else {
            (
                total_time_ms / total as f64,
                failed as f64 / total as f64 * 100.0,
            )
        };

        PerformanceSummary {
            total_operations: total,
            failed_operations: failed,
            slow_operations: slow,
            average_duration_ms,
            error_rate_percent,
            tracked_operations: metrics.len(),
            memory: self.snapshots.read().latest().map(|s| s.memory),
            generated_at: Utc::now(),
        }
    }

    pub fn operation_stats(&self, name: &str) -> Option<OperationStats> {
        let metrics = self.metrics.read();
        let history = metrics.get(name)?;
        if history.is_empty() {
            return None;
        }

        let durations: Vec<f64> = history.iter().map(|r| r.execution_time_ms).collect();
        let failures = history.iter().filter(|r| !r.success).count();

        Some(OperationStats {
            operation: name.to_string(),
            count: durations.len(),
            avg_ms: mean(&durations),
            min_ms: durations.iter().copied().fold(f64::INFINITY, f64::min),
            max_ms: durations.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            p50_ms: percentile(&durations, 50.0),
            p95_ms: percentile(&durations, 95.0),
            p99_ms: percentile(&durations, 99.0),
            error_rate_percent: failures as f64 / durations.len() as f64 * 100.0,
        })
    }

    /// Error rate within threshold and host memory pressure within threshold.
    pub fn is_healthy(&self) -> bool {
        let summary = self.get_summary();
        let memory = self.memory_usage();
        summary.error_rate_percent <= self.config.error_rate_threshold_percent
            && memory.used_ratio() <= self.config.memory_used_ratio_threshold
    }

    /// Samples process resources into history and checks the memory ceiling.
    pub fn capture_system_snapshot(&self) -> SystemSnapshot {
        let sample = self.probe.sample();
        let snapshot = SystemSnapshot {
            timestamp: Utc::now(),
            memory: sample.memory,
            cpu_percent: sample.cpu_percent,
        };
        self.snapshots.write().push(snapshot.clone());

        let rss_mb = snapshot.memory.rss_mb();
        if rss_mb > self.config.memory_threshold_mb {
            warn!(rss_mb, threshold_mb = self.config.memory_threshold_mb, "high memory usage");
            self.events.publish(PerfEvent::HighMemoryUsage {
                rss_mb,
                threshold_mb: self.config.memory_threshold_mb,
                timestamp: snapshot.timestamp,
            });
        }
        snapshot
    }

    /// Publishes rolling average and p95 for every operation over its recent records.
    pub fn analyze(&self) {
        let windows: Vec<(String, Vec<f64>)> = self
            .metrics
            .read()
            .iter()
            .map(|(name, h)| {
                let durations = h
                    .last_n(self.config.analysis_window)
                    .map(|r| r.execution_time_ms)
                    .collect();
                (name.clone(), durations)
            })
            .collect();

        let now = Utc::now();
        for (operation, durations) in windows {
            if durations.is_empty() {
                continue;
            }
            let avg_ms = mean(&durations);
            let p95_ms = percentile(&durations, 95.0);
            debug!(operation = %operation, samples = durations.len(), avg_ms, p95_ms, "performance analysis");
            self.events.publish(PerfEvent::PerformanceAnalysis {
                operation,
                samples: durations.len(),
                avg_ms,
                p95_ms,
                timestamp: now,
            });
        }
    }

    /// Drops records older than the retention window. Returns how many were dropped.
    ///
    /// An operation whose whole history expired also loses its counters, so
    /// one-off operation names do not accumulate.
    pub fn cleanup(&self, now: DateTime<Utc>) -> usize {
        let mut dropped = 0;
        {
            let mut metrics = self.metrics.write();
            for history in metrics.values_mut() {
                dropped += history.prune(now);
            }
            metrics.retain(|_, h| !h.is_empty());
            self.counters
                .write()
                .retain(|name, _| metrics.contains_key(name));
        }
        dropped += self.snapshots.write().prune(now);

        if dropped > 0 {
            debug!(dropped, "pruned expired performance history");
        }
        dropped
    }

    /// Clears all history and counters.
    pub fn reset(&self) {
        self.metrics.write().clear();
        self.counters.write().clear();
        self.snapshots.write().clear();
    }

    /// Text exposition of counters, a duration histogram and latency quantiles.
    pub fn prometheus_export(&self) -> String {
        let mut output = String::new();
        let p = METRIC_PREFIX;

        let counters: BTreeMap<String, OperationCounters> = self
            .counters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        let durations: BTreeMap<String, Vec<f64>> = self
            .metrics
            .read()
            .iter()
            .map(|(k, h)| (k.clone(), h.iter().map(|r| r.execution_time_ms).collect()))
            .collect();

        let counter_families: [(&str, &str, fn(&OperationCounters) -> u64); 3] = [
            ("operations_total", "Total recorded operations", |c| c.total),
            ("operation_errors_total", "Total failed operations", |c| c.failures),
            ("slow_operations_total", "Operations slower than the slow threshold", |c| c.slow),
        ];
        for (name, help, value) in counter_families {
            let _ = writeln!(output, "# HELP {}_{} {}", p, name, help);
            let _ = writeln!(output, "# TYPE {}_{} counter", p, name);
            for (operation, c) in &counters {
                let _ = writeln!(
                    output,
                    "{}_{}{{operation=\"{}\"}} {}",
                    p,
                    name,
                    escape_label(operation),
                    value(c)
                );
            }
            output.push('\n');
        }

        let _ = writeln!(
            output,
            "# HELP {}_operation_duration_ms Operation duration over retained history",
            p
        );
        let _ = writeln!(output, "# TYPE {}_operation_duration_ms histogram", p);
        for (operation, values) in &durations {
            let label = escape_label(operation);
            for bound in DURATION_BUCKETS_MS {
                let count = values.iter().filter(|v| **v <= bound).count();
                let _ = writeln!(
                    output,
                    "{}_operation_duration_ms_bucket{{operation=\"{}\",le=\"{}\"}} {}",
                    p, label, bound, count
                );
            }
            let _ = writeln!(
                output,
                "{}_operation_duration_ms_bucket{{operation=\"{}\",le=\"+Inf\"}} {}",
                p,
                label,
                values.len()
            );
            let _ = writeln!(
                output,
                "{}_operation_duration_ms_sum{{operation=\"{}\"}} {}",
                p,
                label,
                values.iter().sum::<f64>()
            );
            let _ = writeln!(
                output,
                "{}_operation_duration_ms_count{{operation=\"{}\"}} {}",
                p,
                label,
                values.len()
            );
        }
        output.push('\n');

        let _ = writeln!(
            output,
            "# HELP {}_operation_latency_ms Nearest-rank latency quantiles",
            p
        );
        let _ = writeln!(output, "# TYPE {}_operation_latency_ms summary", p);
        for (operation, values) in &durations {
            let label = escape_label(operation);
            for (quantile, pct) in [("0.5", 50.0), ("0.95", 95.0), ("0.99", 99.0)] {
                let _ = writeln!(
                    output,
                    "{}_operation_latency_ms{{operation=\"{}\",quantile=\"{}\"}} {}",
                    p,
                    label,
                    quantile,
                    percentile(values, pct)
                );
            }
        }
        output.push('\n');

        let memory = self.memory_usage();
        let _ = writeln!(output, "# HELP {}_resident_memory_bytes Resident set size", p);
        let _ = writeln!(output, "# TYPE {}_resident_memory_bytes gauge", p);
        let _ = writeln!(output, "{}_resident_memory_bytes {}", p, memory.rss_bytes);

        output
    }

    /// Starts the snapshot, analysis and cleanup timers.
    pub fn start(self: &Arc<Self>) -> MonitorHandle {
        let system_every = Duration::from_secs(self.config.system_interval_secs.max(1));
        let analysis_every = Duration::from_secs(self.config.analysis_interval_secs.max(1));
        let cleanup_every = Duration::from_secs(self.config.cleanup_interval_secs.max(1));

        let monitor = Arc::clone(self);
        let system = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(system_every);
            loop {
                ticker.tick().await;
                monitor.capture_system_snapshot();
            }
        });

        let monitor = Arc::clone(self);
        let analysis = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(analysis_every);
            loop {
                ticker.tick().await;
                monitor.analyze();
            }
        });

        let monitor = Arc::clone(self);
        let cleanup = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_every);
            loop {
                ticker.tick().await;
                monitor.cleanup(Utc::now());
            }
        });

        info!(
            system_interval = ?system_every,
            analysis_interval = ?analysis_every,
            cleanup_interval = ?cleanup_every,
            "performance monitor started"
        );
        MonitorHandle {
            tasks: vec![system, analysis, cleanup],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::drain;
    use crate::probe::FixedProbe;

    fn monitor() -> PerformanceMonitor {
        PerformanceMonitor::with_probe(
            MonitorSettings::default(),
            EventBus::new(),
            Arc::new(FixedProbe::with_rss_mb(128.0, 0.4)),
        )
    }

    #[test]
    fn test_percentile_nearest_rank() {
        assert_eq!(percentile(&[], 50.0), 0.0);
        assert_eq!(percentile(&[], 99.0), 0.0);
        assert_eq!(percentile(&[1.0, 2.0, 3.0, 4.0, 5.0], 50.0), 3.0);
        assert_eq!(percentile(&[10.0, 20.0, 30.0, 40.0], 95.0), 40.0);
        assert_eq!(percentile(&[40.0, 10.0, 30.0, 20.0], 0.0), 10.0);
    }

    #[test]
    fn test_slow_operation_alert_is_synchronous() {
        let monitor = monitor();
        let mut rx = monitor.events().subscribe();

        monitor.record_operation("reports.generate", 2500.0, true, None);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "slowOperation");
    }

    #[test]
    fn test_high_error_rate_alert() {
        let monitor = monitor();
        let mut rx = monitor.events().subscribe();

        for i in 0..11 {
            let success = i % 4 != 0;
            monitor.record_operation("patients.find", 20.0, success, None);
        }

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| e.name() == "highErrorRate"));
    }

    #[test]
    fn test_no_error_rate_alert_below_min_samples() {
        let monitor = monitor();
        let mut rx = monitor.events().subscribe();

        for _ in 0..9 {
            monitor.record_operation("patients.find", 20.0, false, Some("boom".into()));
        }

        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_summary_and_counters() {
        let monitor = monitor();
        monitor.record_operation("a", 10.0, true, None);
        monitor.record_operation("a", 30.0, false, Some("err".into()));
        monitor.record_operation("b", 3000.0, true, None);

        let summary = monitor.get_summary();
        assert_eq!(summary.total_operations, 3);
        assert_eq!(summary.failed_operations, 1);
        assert_eq!(summary.slow_operations, 1);
        assert_eq!(summary.tracked_operations, 2);
        assert!((summary.average_duration_ms - 1013.333).abs() < 0.01);

        let counters = monitor.counters("a").unwrap();
        assert_eq!(counters.total, 2);
        assert_eq!(counters.failures, 1);

        let stats = monitor.operation_stats("a").unwrap();
        assert_eq!(stats.min_ms, 10.0);
        assert_eq!(stats.max_ms, 30.0);
        assert_eq!(stats.error_rate_percent, 50.0);
    }

    #[test]
    fn test_health_reflects_error_rate() {
        let monitor = monitor();
        monitor.record_operation("a", 10.0, true, None);
        assert!(monitor.is_healthy());

        monitor.record_operation("a", 10.0, false, None);
        assert!(!monitor.is_healthy());
    }

    #[test]
    fn test_memory_alert_on_snapshot() {
        let monitor = PerformanceMonitor::with_probe(
            MonitorSettings::default(),
            EventBus::new(),
            Arc::new(FixedProbe::with_rss_mb(4096.0, 0.5)),
        );
        let mut rx = monitor.events().subscribe();

        monitor.capture_system_snapshot();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "highMemoryUsage");
        assert_eq!(monitor.get_system_snapshots().len(), 1);
    }

    #[test]
    fn test_cleanup_prunes_old_records() {
        let monitor = monitor();
        monitor.record_operation("a", 10.0, true, None);

        assert_eq!(monitor.cleanup(Utc::now()), 0);
        assert_eq!(monitor.cleanup(Utc::now() + chrono::Duration::hours(25)), 1);
        assert!(monitor.get_metrics(None).is_empty());
    }

    #[test]
    fn test_cleanup_forgets_expired_operation_names() {
        let monitor = monitor();
        for i in 0..1000 {
            monitor.record_operation(&format!("http GET /patients/{}", i), 5.0, true, None);
        }
        assert_eq!(monitor.get_summary().tracked_operations, 1000);

        assert_eq!(monitor.cleanup(Utc::now() + chrono::Duration::hours(25)), 1000);
        assert!(monitor.counters("http GET /patients/0").is_none());
        assert_eq!(monitor.get_summary().tracked_operations, 0);
        assert!(!monitor.prometheus_export().contains("/patients/"));

        monitor.record_operation("patients.find", 5.0, true, None);
        assert_eq!(monitor.counters("patients.find").map(|c| c.total), Some(1));
    }

    #[test]
    fn test_prometheus_export() {
        let monitor = monitor();
        monitor.record_operation("patients.find", 12.0, true, None);
        monitor.record_operation("patients.find", 70.0, false, None);

        let text = monitor.prometheus_export();
        assert!(text.contains("# TYPE perfstream_operations_total counter"));
        assert!(text.contains("perfstream_operations_total{operation=\"patients.find\"} 2"));
        assert!(text.contains("perfstream_operation_errors_total{operation=\"patients.find\"} 1"));
        assert!(text.contains(
            "perfstream_operation_duration_ms_bucket{operation=\"patients.find\",le=\"25\"} 1"
        ));
        assert!(text.contains(
            "perfstream_operation_duration_ms_bucket{operation=\"patients.find\",le=\"+Inf\"} 2"
        ));
        assert!(text.contains(
            "perfstream_operation_latency_ms{operation=\"patients.find\",quantile=\"0.5\"} 12"
        ));
    }

    #[tokio::test]
    async fn test_measure_records_outcome() {
        let monitor = monitor();
        let ok: Result<u32, String> = monitor.measure("ok", async { Ok(1) }).await;
        let err: Result<u32, String> = monitor.measure("err", async { Err("nope".to_string()) }).await;

        assert_eq!(ok, Ok(1));
        assert!(err.is_err());
        let failed = monitor.get_metrics(Some("err"));
        assert_eq!(failed["err"][0].error.as_deref(), Some("nope"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_captures_snapshots() {
        let monitor = Arc::new(monitor());
        let handle = monitor.start();

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(monitor.get_system_snapshots().len() >= 3);

        drop(handle);
        monitor.reset();
        assert!(monitor.get_system_snapshots().is_empty());
    }
}
