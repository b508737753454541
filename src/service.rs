use crate::config::PerfSettings;
use crate::coordination::CacheCoordinator;
use crate::error::{BoxError, PerfError, StreamError};
use crate::events::{EventBus, PerfEvent};
use crate::ingress::ResponseCache;
use crate::monitor::{MonitorHandle, PerformanceMonitor, PerformanceSummary, QueryMetricRecord};
use crate::observer::{DatabaseObserver, DatabaseStats};
use crate::probe::{ResourceProbe, SystemProbe};
use crate::streaming::{RetryOptions, RetrySummary, StreamOptions, StreamSummary, StreamingEngine};
use cachestore_core::CacheClient;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Liveness of the service's moving parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServiceHealth {
    pub cache_connected: bool,
    pub metrics_healthy: bool,
}

/// Everything the HTTP layer and background jobs need, wired from one
/// settings object.
pub struct PerformanceService {
    settings: PerfSettings,
    events: EventBus,
    client: CacheClient,
    monitor: Arc<PerformanceMonitor>,
    coordinator: Arc<CacheCoordinator>,
    streaming: Arc<StreamingEngine>,
    ingress: Arc<ResponseCache>,
    observer: Option<Arc<DatabaseObserver>>,
}

fn validate(settings: &PerfSettings) -> Result<(), PerfError> {
    if settings.streaming.batch_size == 0 {
        return Err(PerfError::InvalidSetting("streaming.batch_size must be positive".into()));
    }
    if settings.retry.batch_size == 0 {
        return Err(PerfError::InvalidSetting("retry.batch_size must be positive".into()));
    }
    if settings.monitor.max_history_size == 0 {
        return Err(PerfError::InvalidSetting("monitor.max_history_size must be positive".into()));
    }
    Ok(())
}

impl PerformanceService {
    /// Loads settings from files and environment, then connects.
    pub async fn load() -> Result<Self, PerfError> {
        let settings = PerfSettings::new()?;
        Self::from_settings(&settings).await
    }

    /// Connects to the configured store and builds every component.
    ///
    /// An unreachable store does not fail construction; caching is disabled instead.
    pub async fn from_settings(settings: &PerfSettings) -> Result<Self, PerfError> {
        validate(settings)?;
        let mut store = settings.store.clone();
        if store.credentials.is_none() {
            store.credentials = cachestore_core::Settings::load_credentials(&Default::default());
        }
        let client = CacheClient::connect(&store).await;
        Ok(Self::assemble(settings, client, Arc::new(SystemProbe::new())))
    }

    /// Builds every component around an existing client.
    pub fn with_client(
        settings: &PerfSettings,
        client: CacheClient,
        probe: Arc<dyn ResourceProbe>,
    ) -> Result<Self, PerfError> {
        validate(settings)?;
        Ok(Self::assemble(settings, client, probe))
    }

    fn assemble(settings: &PerfSettings, client: CacheClient, probe: Arc<dyn ResourceProbe>) -> Self {
        let events = EventBus::new();
        let monitor = Arc::new(PerformanceMonitor::with_probe(
            settings.monitor.clone(),
            events.clone(),
            probe,
        ));
        let coordinator = Arc::new(CacheCoordinator::new(
            client.clone(),
            events.clone(),
            settings.ttl.clone(),
            settings.coordination.clone(),
        ));
        let streaming = Arc::new(StreamingEngine::new(
            monitor.clone(),
            events.clone(),
            settings.streaming.clone(),
            settings.retry.clone(),
        ));
        let ingress = Arc::new(ResponseCache::new(
            client.clone(),
            monitor.clone(),
            events.clone(),
            settings.ingress.clone(),
        ));

        info!(cache_enabled = client.is_enabled(), "performance service ready");
        Self {
            settings: settings.clone(),
            events,
            client,
            monitor,
            coordinator,
            streaming,
            ingress,
            observer: None,
        }
    }

    /// Attaches a database observer backed by `stats`.
    pub fn with_database_stats(mut self, stats: Arc<dyn DatabaseStats>) -> Self {
        self.observer = Some(Arc::new(DatabaseObserver::new(
            stats,
            self.monitor.clone(),
            self.events.clone(),
            self.settings.observer.clone(),
        )));
        self
    }

    pub fn settings(&self) -> &PerfSettings {
        &self.settings
    }

    pub fn client(&self) -> &CacheClient {
        &self.client
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn coordinator(&self) -> &Arc<CacheCoordinator> {
        &self.coordinator
    }

    pub fn streaming(&self) -> &Arc<StreamingEngine> {
        &self.streaming
    }

    pub fn ingress(&self) -> &Arc<ResponseCache> {
        &self.ingress
    }

    pub fn observer(&self) -> Option<&Arc<DatabaseObserver>> {
        self.observer.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PerfEvent> {
        self.events.subscribe()
    }

    pub fn record_operation(&self, name: &str, duration_ms: f64, success: bool, error: Option<String>) {
        self.monitor.record_operation(name, duration_ms, success, error);
    }

    pub fn get_summary(&self) -> PerformanceSummary {
        self.monitor.get_summary()
    }

    pub fn get_metrics(&self, name: Option<&str>) -> HashMap<String, Vec<QueryMetricRecord>> {
        self.monitor.get_metrics(name)
    }

    pub fn is_healthy(&self) -> bool {
        self.monitor.is_healthy()
    }

    pub async fn health(&self) -> ServiceHealth {
        ServiceHealth {
            cache_connected: self.client.health_check().await,
            metrics_healthy: self.monitor.is_healthy(),
        }
    }

    pub fn prometheus_export(&self) -> String {
        self.monitor.prometheus_export()
    }

    /// [`StreamingEngine::stream_dataset`] with the configured stream options.
    pub async fn stream_dataset<T, FF, FFut, PF, PFut>(
        &self,
        name: &str,
        fetch_batch: FF,
        process_batch: PF,
    ) -> Result<StreamSummary, StreamError>
    where
        FF: FnMut(usize, usize) -> FFut,
        FFut: Future<Output = Result<Vec<T>, BoxError>>,
        PF: FnMut(Vec<T>, usize) -> PFut,
        PFut: Future<Output = Result<(), BoxError>>,
    {
        let options: StreamOptions = self.streaming.stream_options();
        self.streaming
            .stream_dataset(name, fetch_batch, process_batch, options)
            .await
    }

    /// [`StreamingEngine::process_with_retry`] with the configured retry options.
    pub async fn process_with_retry<T, PF, PFut>(&self, items: Vec<T>, process_batch: PF) -> RetrySummary
    where
        T: Clone,
        PF: Fn(Vec<T>, usize) -> PFut,
        PFut: Future<Output = Result<(), BoxError>>,
    {
        let options: RetryOptions = self.streaming.retry_options();
        self.streaming.process_with_retry(items, process_batch, options).await
    }

    /// Starts the monitor timers and, when attached and enabled, the database observer.
    pub fn start_background(&self) -> MonitorHandle {
        let mut handle = self.monitor.start();
        if let Some(observer) = &self.observer {
            if self.settings.observer.enabled {
                handle.merge(observer.start());
            }
        }
        handle
    }
}
