//! Alert and progress events.
//!
//! Events are plain records published on a broadcast channel. Publishing is
//! synchronous and never blocks the emitting call; delivery is best-effort
//! (a slow subscriber that falls behind the channel capacity loses the
//! oldest events) and there is no ordering guarantee across event kinds.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Default number of events buffered per subscriber.
const DEFAULT_CAPACITY: usize = 1024;

/// Severity attached to database alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PerfEvent {
    /// An operation took longer than the slow-operation threshold
    SlowOperation {
        operation: String,
        duration_ms: f64,
        threshold_ms: f64,
        timestamp: DateTime<Utc>,
    },
    /// An operation's recent error ratio exceeded the alert threshold
    HighErrorRate {
        operation: String,
        error_rate_percent: f64,
        window: usize,
        timestamp: DateTime<Utc>,
    },
    /// Process memory crossed the configured ceiling
    HighMemoryUsage {
        rss_mb: f64,
        threshold_mb: f64,
        timestamp: DateTime<Utc>,
    },
    /// Periodic rolling statistics for one operation
    PerformanceAnalysis {
        operation: String,
        samples: usize,
        avg_ms: f64,
        p95_ms: f64,
        timestamp: DateTime<Utc>,
    },
    /// Progress of a long-running stream
    StreamProgress {
        operation: String,
        total_processed: usize,
        current_batch: usize,
        total_items: Option<usize>,
        estimated_remaining_ms: f64,
        memory_usage_mb: f64,
        started_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
    /// A database health threshold was breached
    DatabaseAlert {
        check: String,
        severity: Severity,
        message: String,
        value: f64,
        threshold: f64,
        timestamp: DateTime<Utc>,
    },
    /// Cache effectiveness report
    CacheHitRate {
        hits: u64,
        misses: u64,
        hit_rate_percent: f64,
        timestamp: DateTime<Utc>,
    },
    /// A request is still in flight past the slow-request threshold
    SlowRequest {
        request_id: String,
        method: String,
        path: String,
        elapsed_ms: f64,
        timestamp: DateTime<Utc>,
    },
}

impl PerfEvent {
    /// Stable event name as exposed to alert consumers.
    pub fn name(&self) -> &'static str {
        match self {
            PerfEvent::SlowOperation { .. } => "slowOperation",
            PerfEvent::HighErrorRate { .. } => "highErrorRate",
            PerfEvent::HighMemoryUsage { .. } => "highMemoryUsage",
            PerfEvent::PerformanceAnalysis { .. } => "performanceAnalysis",
            PerfEvent::StreamProgress { .. } => "streamProgress",
            PerfEvent::DatabaseAlert { .. } => "databaseAlert",
            PerfEvent::CacheHitRate { .. } => "cacheHitRate",
            PerfEvent::SlowRequest { .. } => "slowRequest",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            PerfEvent::SlowOperation { timestamp, .. }
            | PerfEvent::HighErrorRate { timestamp, .. }
            | PerfEvent::HighMemoryUsage { timestamp, .. }
            | PerfEvent::PerformanceAnalysis { timestamp, .. }
            | PerfEvent::StreamProgress { timestamp, .. }
            | PerfEvent::DatabaseAlert { timestamp, .. }
            | PerfEvent::CacheHitRate { timestamp, .. }
            | PerfEvent::SlowRequest { timestamp, .. } => *timestamp,
        }
    }
}

/// Fan-out of [`PerfEvent`]s to any number of subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PerfEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn publish(&self, event: PerfEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PerfEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Drains every event currently buffered for `rx`.
pub fn drain(rx: &mut broadcast::Receiver<PerfEvent>) -> Vec<PerfEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        bus.publish(PerfEvent::CacheHitRate {
            hits: 1,
            misses: 0,
            hit_rate_percent: 100.0,
            timestamp: Utc::now(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(PerfEvent::SlowOperation {
            operation: "patients.find".to_string(),
            duration_ms: 2500.0,
            threshold_ms: 2000.0,
            timestamp: Utc::now(),
        });

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "slowOperation");
    }

    #[test]
    fn test_events_serialize_with_type_tag() {
        let event = PerfEvent::HighMemoryUsage {
            rss_mb: 900.0,
            threshold_mb: 512.0,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "highMemoryUsage");
        assert!(json.get("timestamp").is_some());
    }
}
