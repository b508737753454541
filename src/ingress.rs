//! Response caching and timing around HTTP handlers.
//!
//! [`ResponseCache::wrap`] composes around any async handler and returns a
//! new handler. GET responses with a cacheable status are stored under
//! `api:` + base64(`method:path:query`) with a TTL chosen by endpoint
//! pattern, and served from the cache on the next identical request without
//! calling the inner handler. Every request is timed into the monitor, and
//! a per-request timer reports requests still in flight past the
//! slow-request threshold.

use crate::config::{EndpointTtl, IngressSettings};
use crate::events::{EventBus, PerfEvent};
use crate::monitor::PerformanceMonitor;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use cachestore_core::CacheClient;
use chrono::Utc;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const HEADER_REQUEST_ID: &str = "x-request-id";
pub const HEADER_CACHE: &str = "x-cache";
pub const HEADER_RESPONSE_TIME: &str = "x-response-time";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngressRequest {
    pub method: String,
    pub path: String,
    /// Raw query string without the leading `?`
    pub query: String,
    pub headers: Vec<(String, String)>,
}

impl IngressRequest {
    pub fn get(path: &str, query: &str) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.to_string(),
            query: query.to_string(),
            headers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngressResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl IngressResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn set_header(&mut self, name: &str, value: String) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value));
    }
}

/// What is stored for a cached response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CachedResponse {
    status: u16,
    body: String,
    content_type: Option<String>,
}

/// Aborts the slow-request timer when the request finishes or is dropped.
struct SlowRequestTimer(JoinHandle<()>);

impl Drop for SlowRequestTimer {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct ResponseCache {
    client: CacheClient,
    monitor: Arc<PerformanceMonitor>,
    events: EventBus,
    settings: IngressSettings,
}

impl ResponseCache {
    pub fn new(
        client: CacheClient,
        monitor: Arc<PerformanceMonitor>,
        events: EventBus,
        settings: IngressSettings,
    ) -> Self {
        Self {
            client,
            monitor,
            events,
            settings,
        }
    }

    /// Cache key for a request: prefix plus base64 of `method:path:query`.
    pub fn cache_key(&self, request: &IngressRequest) -> String {
        let raw = format!("{}:{}:{}", request.method, request.path, request.query);
        format!("{}{}", self.settings.key_prefix, STANDARD.encode(raw))
    }

    /// TTL of the first endpoint pattern contained in `path`, else the default.
    pub fn ttl_for_path(&self, path: &str) -> u64 {
        self.endpoint_rule(path)
            .map(|rule| rule.ttl_secs)
            .unwrap_or(self.settings.default_ttl_secs)
    }

    fn endpoint_rule(&self, path: &str) -> Option<&EndpointTtl> {
        self.settings
            .endpoint_ttls
            .iter()
            .find(|rule| path.contains(rule.pattern.as_str()))
    }

    /// Metric name for a request: the matched endpoint pattern when there is
    /// one, so per-record paths share a single series.
    pub fn operation_name(&self, request: &IngressRequest) -> String {
        let route = self
            .endpoint_rule(&request.path)
            .map(|rule| rule.pattern.as_str())
            .unwrap_or(request.path.as_str());
        format!("http {} {}", request.method, route)
    }

    fn is_cacheable(&self, request: &IngressRequest, status: u16) -> bool {
        self.settings.cache_enabled
            && request.method.eq_ignore_ascii_case("GET")
            && self.settings.cacheable_statuses.contains(&status)
    }

    /// Decorates `handler` with caching, timing and slow-request reporting.
    pub fn wrap<H, Fut>(
        self: &Arc<Self>,
        handler: H,
    ) -> impl Fn(IngressRequest) -> BoxFuture<'static, IngressResponse> + Clone + Send + Sync
    where
        H: Fn(IngressRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = IngressResponse> + Send + 'static,
    {
        let cache = Arc::clone(self);
        let handler = Arc::new(handler);
        move |request: IngressRequest| {
            let cache = Arc::clone(&cache);
            let handler = Arc::clone(&handler);
            Box::pin(async move { cache.handle(request, handler.as_ref()).await })
                as BoxFuture<'static, IngressResponse>
        }
    }

    /// Serves one request through the cache and `handler`.
    pub async fn handle<H, Fut>(&self, request: IngressRequest, handler: &H) -> IngressResponse
    where
        H: Fn(IngressRequest) -> Fut,
        Fut: Future<Output = IngressResponse>,
    {
        let request_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let _timer = self.arm_slow_timer(&request_id, &request);
        let operation = self.operation_name(&request);
        let cacheable_method = self.settings.cache_enabled && request.method.eq_ignore_ascii_case("GET");
        let key = self.cache_key(&request);

        if cacheable_method {
            if let Some(cached) = self.client.get_json::<CachedResponse>(&key).await {
                let mut response = IngressResponse::new(cached.status, cached.body);
                if let Some(content_type) = cached.content_type {
                    response.set_header("content-type", content_type);
                }
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                self.finish(&mut response, &request_id, "HIT", elapsed_ms);
                self.monitor.record_operation(&operation, elapsed_ms, true, None);
                debug!(request_id = %request_id, path = %request.path, "served from response cache");
                return response;
            }
        }

        let mut response = handler(request.clone()).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let success = response.status < 500;
        self.monitor.record_operation(
            &operation,
            elapsed_ms,
            success,
            (!success).then(|| format!("status {}", response.status)),
        );
        debug!(
            request_id = %request_id,
            method = %request.method,
            path = %request.path,
            status = response.status,
            size = response.body.len(),
            elapsed_ms,
            "request handled"
        );

        if self.is_cacheable(&request, response.status) {
            let cached = CachedResponse {
                status: response.status,
                body: response.body.clone(),
                content_type: response.header("content-type").map(str::to_string),
            };
            self.client
                .set_json(&key, &cached, self.ttl_for_path(&request.path))
                .await;
        }

        let cache_state = if cacheable_method { "MISS" } else { "BYPASS" };
        self.finish(&mut response, &request_id, cache_state, elapsed_ms);
        response
    }

    fn finish(&self, response: &mut IngressResponse, request_id: &str, cache: &str, elapsed_ms: f64) {
        response.set_header(HEADER_REQUEST_ID, request_id.to_string());
        response.set_header(HEADER_CACHE, cache.to_string());
        response.set_header(HEADER_RESPONSE_TIME, format!("{:.2}ms", elapsed_ms));
    }

    fn arm_slow_timer(&self, request_id: &str, request: &IngressRequest) -> SlowRequestTimer {
        let threshold = Duration::from_millis(self.settings.slow_request_threshold_ms);
        let events = self.events.clone();
        let request_id = request_id.to_string();
        let method = request.method.clone();
        let path = request.path.clone();
        SlowRequestTimer(tokio::spawn(async move {
            tokio::time::sleep(threshold).await;
            let elapsed_ms = threshold.as_secs_f64() * 1000.0;
            warn!(request_id = %request_id, method = %method, path = %path, elapsed_ms, "slow request still in flight");
            events.publish(PerfEvent::SlowRequest {
                request_id,
                method,
                path,
                elapsed_ms,
                timestamp: Utc::now(),
            });
        }))
    }

    /// Drops every cached response. Returns the number removed.
    pub async fn clear_response_cache(&self) -> u64 {
        let removed = self
            .client
            .delete_matching(&format!("{}*", self.settings.key_prefix))
            .await;
        info!(removed, "response cache cleared");
        removed
    }
}
