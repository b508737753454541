//! Paginated fetch-process loops over datasets too large to hold in memory.
//!
//! [`StreamingEngine::stream_dataset`] walks a source strictly in offset
//! order under a wall-clock budget and aborts on the first failing batch.
//! [`StreamingEngine::process_with_retry`] works over an in-memory item list,
//! retries each batch with linear backoff and reports partial success.

use crate::config::{RetrySettings, StreamingSettings};
use crate::error::{BoxError, StreamError};
use crate::events::{EventBus, PerfEvent};
use crate::monitor::PerformanceMonitor;
use async_trait::async_trait;
use chrono::Utc;
use futures::Stream;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Paged access to a dataset whose size is known up front.
#[async_trait]
pub trait BatchSource<T>: Send + Sync {
    async fn count(&self) -> Result<usize, BoxError>;
    async fn fetch(&self, offset: usize, limit: usize) -> Result<Vec<T>, BoxError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamOptions {
    pub batch_size: usize,
    /// Above this resident size a cleanup pause runs before the next fetch
    pub memory_threshold_mb: f64,
    pub timeout: Duration,
    pub progress_every: usize,
    pub cleanup_every: usize,
    /// Known dataset size, used for the remaining-time estimate
    pub total_items: Option<usize>,
}

impl From<&StreamingSettings> for StreamOptions {
    fn from(settings: &StreamingSettings) -> Self {
        Self {
            batch_size: settings.batch_size.max(1),
            memory_threshold_mb: settings.memory_threshold_mb,
            timeout: Duration::from_secs(settings.timeout_secs),
            progress_every: settings.progress_every.max(1),
            cleanup_every: settings.cleanup_every.max(1),
            total_items: None,
        }
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::from(&StreamingSettings::default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryOptions {
    pub batch_size: usize,
    /// Total attempts per batch
    pub max_retries: u32,
    /// Base delay; attempt `n` waits `retry_delay * n` before the next one
    pub retry_delay: Duration,
    pub parallel_batches: usize,
}

impl From<&RetrySettings> for RetryOptions {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            batch_size: settings.batch_size.max(1),
            max_retries: settings.max_retries.max(1),
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
            parallel_batches: settings.parallel_batches.max(1),
        }
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamSummary {
    pub operation: String,
    pub total_processed: usize,
    pub batches: usize,
    pub duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrySummary {
    pub total_processed: usize,
    pub total_batches: usize,
    pub failed_batches: usize,
    pub failed_batch_indices: Vec<usize>,
    pub duration_ms: f64,
}

pub struct StreamingEngine {
    monitor: Arc<PerformanceMonitor>,
    events: EventBus,
    settings: StreamingSettings,
    retry: RetrySettings,
}

impl StreamingEngine {
    pub fn new(
        monitor: Arc<PerformanceMonitor>,
        events: EventBus,
        settings: StreamingSettings,
        retry: RetrySettings,
    ) -> Self {
        Self {
            monitor,
            events,
            settings,
            retry,
        }
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions::from(&self.settings)
    }

    pub fn retry_options(&self) -> RetryOptions {
        RetryOptions::from(&self.retry)
    }

    /// Yields to the scheduler and pauses briefly. Advisory only.
    pub async fn memory_cleanup(&self) {
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(self.settings.cleanup_pause_ms)).await;
    }

    fn memory_mb(&self) -> f64 {
        self.monitor.memory_usage().rss_mb()
    }

    fn elapsed_ms(started: Instant) -> f64 {
        started.elapsed().as_secs_f64() * 1000.0
    }

    fn emit_progress(
        &self,
        operation: &str,
        total_processed: usize,
        current_batch: usize,
        options: &StreamOptions,
        started: Instant,
        started_at: chrono::DateTime<Utc>,
    ) {
        let per_item_ms = Self::elapsed_ms(started) / total_processed.max(1) as f64;
        let remaining_items = match options.total_items {
            Some(total) => total.saturating_sub(total_processed),
            None => options.batch_size,
        };
        let estimated_remaining_ms = per_item_ms * remaining_items as f64;
        let memory_usage_mb = self.memory_mb();

        debug!(
            operation,
            total_processed, current_batch, estimated_remaining_ms, "stream progress"
        );
        self.events.publish(PerfEvent::StreamProgress {
            operation: operation.to_string(),
            total_processed,
            current_batch,
            total_items: options.total_items,
            estimated_remaining_ms,
            memory_usage_mb,
            started_at,
            timestamp: Utc::now(),
        });
    }

    /// Fetches and processes `name` batch by batch until `fetch_batch` returns
    /// an empty batch.
    ///
    /// The offset advances by the number of items actually returned. Any
    /// fetch or process error aborts the stream; exceeding `options.timeout`
    /// abandons the in-flight batch and returns [`StreamError::Timeout`].
    pub async fn stream_dataset<T, FF, FFut, PF, PFut>(
        &self,
        name: &str,
        mut fetch_batch: FF,
        mut process_batch: PF,
        options: StreamOptions,
    ) -> Result<StreamSummary, StreamError>
    where
        FF: FnMut(usize, usize) -> FFut,
        FFut: Future<Output = Result<Vec<T>, BoxError>>,
        PF: FnMut(Vec<T>, usize) -> PFut,
        PFut: Future<Output = Result<(), BoxError>>,
    {
        let metric = format!("stream.{}", name);
        let started = Instant::now();
        let started_at = Utc::now();
        let batch_size = options.batch_size.max(1);
        let progress_every = options.progress_every.max(1);
        let cleanup_every = options.cleanup_every.max(1);

        info!(operation = name, batch_size, timeout = ?options.timeout, "stream started");

        // Counters live inside the loop future, so a timeout discards them with it.
        let run = async {
            let mut offset = 0;
            let mut batch = 0;
            let mut processed = 0;
            loop {
                let memory_mb = self.memory_mb();
                if memory_mb > options.memory_threshold_mb {
                    debug!(operation = name, memory_mb, "memory above threshold, pausing");
                    self.memory_cleanup().await;
                }

                let items = fetch_batch(offset, batch_size)
                    .await
                    .map_err(|source| StreamError::Batch {
                        operation: name.to_string(),
                        batch,
                        source,
                    })?;
                if items.is_empty() {
                    break;
                }

                let len = items.len();
                process_batch(items, batch)
                    .await
                    .map_err(|source| StreamError::Batch {
                        operation: name.to_string(),
                        batch,
                        source,
                    })?;

                offset += len;
                processed += len;
                batch += 1;

                if batch % progress_every == 0 {
                    self.emit_progress(name, processed, batch, &options, started, started_at);
                }
                if batch % cleanup_every == 0 {
                    self.memory_cleanup().await;
                }
            }
            Ok::<_, StreamError>((processed, batch))
        };

        let outcome = match tokio::time::timeout(options.timeout, run).await {
            Ok(result) => result,
            Err(_) => Err(StreamError::Timeout {
                operation: name.to_string(),
                timeout: options.timeout,
            }),
        };
        let duration_ms = Self::elapsed_ms(started);

        match outcome {
            Ok((total_processed, batches)) => {
                self.monitor.record_operation(&metric, duration_ms, true, None);
                info!(operation = name, total_processed, batches, duration_ms, "stream completed");
                Ok(StreamSummary {
                    operation: name.to_string(),
                    total_processed,
                    batches,
                    duration_ms,
                })
            }
            Err(e) => {
                self.monitor
                    .record_operation(&metric, duration_ms, false, Some(e.to_string()));
                error!(operation = name, error = %e, "stream failed");
                Err(e)
            }
        }
    }

    /// Streams a [`BatchSource`], using its count for progress estimates.
    pub async fn stream_source<T, S, PF, PFut>(
        &self,
        name: &str,
        source: &S,
        process_batch: PF,
        mut options: StreamOptions,
    ) -> Result<StreamSummary, StreamError>
    where
        S: BatchSource<T> + ?Sized,
        PF: FnMut(Vec<T>, usize) -> PFut,
        PFut: Future<Output = Result<(), BoxError>>,
    {
        match source.count().await {
            Ok(total) => options.total_items = Some(total),
            Err(e) => warn!(operation = name, error = %e, "dataset count unavailable"),
        }
        self.stream_dataset(
            name,
            move |offset, limit| source.fetch(offset, limit),
            process_batch,
            options,
        )
        .await
    }

    /// Processes `items` in fixed-size batches, `parallel_batches` at a time.
    ///
    /// A failing batch is retried until `max_retries` attempts are used up
    /// and then counted as failed; the remaining batches still run.
    pub async fn process_with_retry<T, PF, PFut>(
        &self,
        items: Vec<T>,
        process_batch: PF,
        options: RetryOptions,
    ) -> RetrySummary
    where
        T: Clone,
        PF: Fn(Vec<T>, usize) -> PFut,
        PFut: Future<Output = Result<(), BoxError>>,
    {
        let started = Instant::now();
        let batch_size = options.batch_size.max(1);
        let parallel = options.parallel_batches.max(1);
        let batches: Vec<Vec<T>> = items.chunks(batch_size).map(|c| c.to_vec()).collect();
        let total_batches = batches.len();

        let mut total_processed = 0;
        let mut failed_batch_indices = Vec::new();

        let indexed: Vec<(usize, Vec<T>)> = batches.into_iter().enumerate().collect();
        let rounds: Vec<&[(usize, Vec<T>)]> = indexed.chunks(parallel).collect();
        let round_count = rounds.len();

        for (round, members) in rounds.into_iter().enumerate() {
            let attempts = members
                .iter()
                .map(|(index, batch)| self.run_batch(*index, batch, &process_batch, &options));
            let outcomes = futures::future::join_all(attempts).await;

            for ((index, batch), ok) in members.iter().zip(outcomes) {
                if ok {
                    total_processed += batch.len();
                } else {
                    failed_batch_indices.push(*index);
                }
            }

            if round + 1 < round_count {
                self.memory_cleanup().await;
            }
        }

        let duration_ms = Self::elapsed_ms(started);
        let failed_batches = failed_batch_indices.len();
        self.monitor.record_operation(
            "batch.process_with_retry",
            duration_ms,
            failed_batches == 0,
            (failed_batches > 0).then(|| format!("{} batches failed", failed_batches)),
        );
        info!(total_processed, total_batches, failed_batches, duration_ms, "batch processing finished");

        RetrySummary {
            total_processed,
            total_batches,
            failed_batches,
            failed_batch_indices,
            duration_ms,
        }
    }

    async fn run_batch<T, PF, PFut>(
        &self,
        index: usize,
        batch: &[T],
        process_batch: &PF,
        options: &RetryOptions,
    ) -> bool
    where
        T: Clone,
        PF: Fn(Vec<T>, usize) -> PFut,
        PFut: Future<Output = Result<(), BoxError>>,
    {
        let max_attempts = options.max_retries.max(1);
        for attempt in 1..=max_attempts {
            match process_batch(batch.to_vec(), index).await {
                Ok(()) => return true,
                Err(e) => {
                    warn!(batch = index, attempt, max_attempts, error = %e, "batch attempt failed");
                    if attempt < max_attempts {
                        tokio::time::sleep(options.retry_delay * attempt).await;
                    }
                }
            }
        }
        error!(batch = index, "batch failed after all retries");
        false
    }
}

/// Pages through `fetch` as a stream of batches, ending at the first empty
/// batch or after the first error.
pub fn batch_stream<T, F, Fut>(
    mut fetch: F,
    batch_size: usize,
) -> impl Stream<Item = Result<Vec<T>, BoxError>>
where
    F: FnMut(usize, usize) -> Fut,
    Fut: Future<Output = Result<Vec<T>, BoxError>>,
{
    let batch_size = batch_size.max(1);
    async_stream::stream! {
        let mut offset = 0;
        loop {
            match fetch(offset, batch_size).await {
                Ok(items) if items.is_empty() => break,
                Ok(items) => {
                    offset += items.len();
                    yield Ok(items);
                }
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorSettings;
    use crate::events::drain;
    use crate::probe::FixedProbe;
    use futures::StreamExt;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    fn engine() -> StreamingEngine {
        let events = EventBus::new();
        let monitor = Arc::new(PerformanceMonitor::with_probe(
            MonitorSettings::default(),
            events.clone(),
            Arc::new(FixedProbe::with_rss_mb(64.0, 0.3)),
        ));
        StreamingEngine::new(
            monitor,
            events,
            StreamingSettings {
                cleanup_pause_ms: 1,
                ..StreamingSettings::default()
            },
            RetrySettings::default(),
        )
    }

    fn page(data: &[u32], offset: usize, limit: usize) -> Vec<u32> {
        data.iter().skip(offset).take(limit).copied().collect()
    }

    #[tokio::test]
    async fn test_stream_processes_batches_in_offset_order() {
        let engine = engine();
        let data: Vec<u32> = (0..2500).collect();
        let seen = Mutex::new(Vec::new());

        let summary = engine
            .stream_dataset(
                "patients",
                |offset, limit| {
                    let batch = page(&data, offset, limit);
                    async move { Ok(batch) }
                },
                |items, index| {
                    seen.lock().push((index, items[0], items.len()));
                    async { Ok(()) }
                },
                StreamOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(summary.total_processed, 2500);
        assert_eq!(summary.batches, 3);
        assert_eq!(
            *seen.lock(),
            vec![(0, 0, 1000), (1, 1000, 1000), (2, 2000, 500)]
        );
        assert_eq!(engine.monitor.counters("stream.patients").unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_short_batches_advance_by_returned_length() {
        let engine = engine();
        let data: Vec<u32> = (0..10).collect();
        let offsets = Mutex::new(Vec::new());

        let summary = engine
            .stream_dataset(
                "short",
                |offset, _limit| {
                    offsets.lock().push(offset);
                    let batch = page(&data, offset, 3);
                    async move { Ok(batch) }
                },
                |_, _| async { Ok(()) },
                StreamOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(summary.total_processed, 10);
        assert_eq!(*offsets.lock(), vec![0, 3, 6, 9, 10]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_times_out_with_distinct_error() {
        let engine = engine();
        let options = StreamOptions {
            timeout: Duration::from_millis(50),
            ..StreamOptions::default()
        };
        let started = tokio::time::Instant::now();

        let result = engine
            .stream_dataset(
                "endless",
                |_, limit| async move {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    Ok(vec![0u8; limit])
                },
                |_, _| async { Ok(()) },
                options,
            )
            .await;

        let err = result.unwrap_err();
        assert!(err.is_timeout());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_batch_error_aborts_and_is_recorded() {
        let engine = engine();
        let data: Vec<u32> = (0..3000).collect();

        let result = engine
            .stream_dataset(
                "broken",
                |offset, limit| {
                    let batch = page(&data, offset, limit);
                    async move { Ok(batch) }
                },
                |_, index| async move {
                    if index == 1 {
                        Err::<(), BoxError>("constraint violation".into())
                    } else {
                        Ok(())
                    }
                },
                StreamOptions::default(),
            )
            .await;

        match result {
            Err(StreamError::Batch { batch, .. }) => assert_eq!(batch, 1),
            other => panic!("unexpected result: {:?}", other),
        }
        let counters = engine.monitor.counters("stream.broken").unwrap();
        assert_eq!(counters.failures, 1);
    }

    #[tokio::test]
    async fn test_progress_every_tenth_batch() {
        let engine = engine();
        let mut rx = engine.events.subscribe();
        let data: Vec<u32> = (0..25).collect();
        let options = StreamOptions {
            batch_size: 1,
            total_items: Some(25),
            ..StreamOptions::default()
        };

        engine
            .stream_dataset(
                "progress",
                |offset, limit| {
                    let batch = page(&data, offset, limit);
                    async move { Ok(batch) }
                },
                |_, _| async { Ok(()) },
                options,
            )
            .await
            .unwrap();

        let progress: Vec<usize> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                PerfEvent::StreamProgress { current_batch, .. } => Some(current_batch),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![10, 20]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_flaky_batch() {
        let engine = engine();
        let items: Vec<u32> = (0..500).collect();
        let attempts = Mutex::new(HashMap::<usize, u32>::new());

        let summary = engine
            .process_with_retry(
                items,
                |_, index| {
                    let attempt = {
                        let mut attempts = attempts.lock();
                        let n = attempts.entry(index).or_insert(0);
                        *n += 1;
                        *n
                    };
                    async move {
                        if index == 2 && attempt < 3 {
                            Err::<(), BoxError>("transient".into())
                        } else {
                            Ok(())
                        }
                    }
                },
                RetryOptions::default(),
            )
            .await;

        assert_eq!(summary.failed_batches, 0);
        assert_eq!(summary.total_processed, 500);
        assert_eq!(summary.total_batches, 5);
        assert_eq!(attempts.lock()[&2], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_batch_does_not_abort_run() {
        let engine = engine();
        let items: Vec<u32> = (0..400).collect();
        let options = RetryOptions {
            parallel_batches: 2,
            ..RetryOptions::default()
        };

        let summary = engine
            .process_with_retry(
                items,
                |_, index| async move {
                    if index == 1 {
                        Err::<(), BoxError>("poison batch".into())
                    } else {
                        Ok(())
                    }
                },
                options,
            )
            .await;

        assert_eq!(summary.failed_batches, 1);
        assert_eq!(summary.failed_batch_indices, vec![1]);
        assert_eq!(summary.total_processed, 300);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_backoff_is_linear() {
        let engine = engine();
        let started = Instant::now();

        engine
            .process_with_retry(
                vec![1u32],
                |_, _| async { Err::<(), BoxError>("always".into()) },
                RetryOptions::default(),
            )
            .await;

        // 1s after the first attempt, 2s after the second
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_millis(3100));
    }

    #[tokio::test]
    async fn test_batch_stream_pages_until_empty() {
        let data: Vec<u32> = (0..7).collect();
        let batches: Vec<Vec<u32>> = batch_stream(
            |offset, limit| {
                let batch = page(&data, offset, limit);
                async move { Ok(batch) }
            },
            3,
        )
        .map(|b| b.unwrap())
        .collect()
        .await;

        assert_eq!(batches, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
    }
}
