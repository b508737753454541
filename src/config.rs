use cachestore_core::config::{StoreConfig, TtlPolicy};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Settings for the whole performance layer.
///
/// Every section falls back to its `Default`, so a missing file or a
/// partially populated one is valid.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PerfSettings {
    pub store: StoreConfig,
    pub ttl: TtlPolicy,
    pub coordination: CoordinationSettings,
    pub monitor: MonitorSettings,
    pub streaming: StreamingSettings,
    pub retry: RetrySettings,
    pub observer: ObserverSettings,
    pub ingress: IngressSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinationSettings {
    /// Lifetime of a recomputation lock
    pub lock_ttl_secs: u64,
    /// Wait before re-checking the cache when another caller holds the lock
    pub lock_retry_delay_ms: u64,
    /// Upper bound on concurrent writes during cache warming
    pub warm_concurrency: usize,
}

impl Default for CoordinationSettings {
    fn default() -> Self {
        Self {
            lock_ttl_secs: 10,
            lock_retry_delay_ms: 100,
            warm_concurrency: 16,
        }
    }
}

impl CoordinationSettings {
    pub fn lock_retry_delay(&self) -> Duration {
        Duration::from_millis(self.lock_retry_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub slow_operation_threshold_ms: f64,
    pub error_rate_threshold_percent: f64,
    /// Number of most recent records the error rate is computed over
    pub error_window: usize,
    /// Minimum records in the window before the error rate is evaluated
    pub error_min_samples: usize,
    pub memory_threshold_mb: f64,
    /// Host memory in-use ratio above which the service reports unhealthy
    pub memory_used_ratio_threshold: f64,
    pub max_history_size: usize,
    pub retention_hours: i64,
    pub analysis_window: usize,
    pub system_interval_secs: u64,
    pub analysis_interval_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            slow_operation_threshold_ms: 2000.0,
            error_rate_threshold_percent: 10.0,
            error_window: 100,
            error_min_samples: 10,
            memory_threshold_mb: 1024.0,
            memory_used_ratio_threshold: 0.9,
            max_history_size: 1000,
            retention_hours: 24,
            analysis_window: 100,
            system_interval_secs: 30,
            analysis_interval_secs: 60,
            cleanup_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamingSettings {
    pub batch_size: usize,
    pub memory_threshold_mb: f64,
    pub timeout_secs: u64,
    pub progress_every: usize,
    pub cleanup_every: usize,
    pub cleanup_pause_ms: u64,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            memory_threshold_mb: 512.0,
            timeout_secs: 300,
            progress_every: 10,
            cleanup_every: 50,
            cleanup_pause_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub parallel_batches: usize,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_retries: 3,
            retry_delay_ms: 1000,
            parallel_batches: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObserverSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Upper bound on retained snapshots
    pub max_history_size: usize,
    /// Snapshots older than this are dropped regardless of count
    pub retention_hours: i64,
    pub max_waiting_connections: u32,
    pub max_slow_queries: u64,
    pub min_index_hit_rate_percent: f64,
    pub min_cache_hit_rate_percent: f64,
}

impl Default for ObserverSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 86_400,
            max_history_size: 288,
            retention_hours: 24 * 30,
            max_waiting_connections: 5,
            max_slow_queries: 10,
            min_index_hit_rate_percent: 95.0,
            min_cache_hit_rate_percent: 90.0,
        }
    }
}

impl ObserverSettings {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours.max(1))
    }
}

/// TTL override for request paths containing `pattern`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EndpointTtl {
    pub pattern: String,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngressSettings {
    pub cache_enabled: bool,
    pub key_prefix: String,
    pub slow_request_threshold_ms: u64,
    pub default_ttl_secs: u64,
    pub cacheable_statuses: Vec<u16>,
    /// First matching pattern wins
    pub endpoint_ttls: Vec<EndpointTtl>,
}

impl Default for IngressSettings {
    fn default() -> Self {
        let ttl = |pattern: &str, ttl_secs| EndpointTtl {
            pattern: pattern.to_string(),
            ttl_secs,
        };
        Self {
            cache_enabled: true,
            key_prefix: "api:".to_string(),
            slow_request_threshold_ms: 5000,
            default_ttl_secs: 300,
            cacheable_statuses: vec![200, 203, 300, 301],
            endpoint_ttls: vec![
                ttl("/reports", 1800),
                ttl("/analytics", 900),
                ttl("/statistics", 900),
                ttl("/reference", 3600),
                ttl("/patients", 120),
            ],
        }
    }
}

impl PerfSettings {
    pub fn new() -> Result<Self, ConfigError> {
        let config_dir = Path::new("config");

        let builder = Config::builder()
            // Start with default settings
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local overrides
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            // Add environment variables with prefix PERFSTREAM_, sections split on `__`
            .add_source(
                Environment::with_prefix("PERFSTREAM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}
