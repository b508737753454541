//! Perfstream: caching, streaming and performance monitoring for the registry backend
//!
//! This library sits between the HTTP layer and persistence. It provides
//! stampede-protected and multi-level cache reads, memory-aware batch
//! streaming over large datasets, per-operation metrics with threshold
//! alerts, a periodic database health observer, and a response-caching
//! wrapper for HTTP handlers.
//!
//! # Example
//!
//! ```rust,no_run
//! use perfstream::{BoxError, PerfSettings, PerformanceService};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), BoxError> {
//!     // Initialize settings
//!     let settings = PerfSettings::new()?;
//!
//!     // Connect the cache and build every component
//!     let service = PerformanceService::from_settings(&settings).await?;
//!     let _background = service.start_background();
//!
//!     // Recompute an expensive value at most once across concurrent callers
//!     let report: Vec<u32> = service
//!         .coordinator()
//!         .get_or_compute("report:monthly", 1800, || async { Ok::<_, BoxError>(vec![1, 2, 3]) })
//!         .await?;
//!     println!("Report rows: {:?}", report);
//!
//!     // Stream a large dataset in batches
//!     let rows: Vec<u64> = (0..10_000).collect();
//!     let summary = service
//!         .stream_dataset(
//!             "patients.export",
//!             |offset, limit| {
//!                 let batch: Vec<u64> = rows.iter().skip(offset).take(limit).copied().collect();
//!                 async move { Ok(batch) }
//!             },
//!             |batch, _index| async move {
//!                 let _ = batch.len();
//!                 Ok(())
//!             },
//!         )
//!         .await?;
//!     println!("Streamed {} rows", summary.total_processed);
//!
//!     // Pull-based metrics
//!     println!("{}", service.prometheus_export());
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordination;
pub mod error;
pub mod events;
pub mod history;
pub mod ingress;
pub mod monitor;
pub mod observer;
pub mod probe;
pub mod service;
pub mod streaming;
#[cfg(test)]
mod tests;

pub use config::PerfSettings;
pub use coordination::{CacheCoordinator, CacheStats, LocalTier, MemoryTier, WarmEntry, WarmReport};
pub use error::{BoxError, PerfError, StreamError};
pub use events::{EventBus, PerfEvent, Severity};
pub use history::{BoundedHistory, Timestamped};
pub use ingress::{IngressRequest, IngressResponse, ResponseCache};
pub use monitor::{
    percentile,
    MonitorHandle,
    OperationStats,
    PerformanceMonitor,
    PerformanceSummary,
    QueryMetricRecord,
    SystemSnapshot,
};
pub use observer::{
    generate_recommendations,
    DatabaseObserver,
    DatabaseSnapshot,
    DatabaseStats,
    PerformanceReport,
    Recommendation,
};
pub use probe::{FixedProbe, MemoryUsage, ResourceProbe, SystemProbe};
pub use service::{PerformanceService, ServiceHealth};
pub use streaming::{
    batch_stream,
    BatchSource,
    RetryOptions,
    RetrySummary,
    StreamOptions,
    StreamSummary,
    StreamingEngine,
};
