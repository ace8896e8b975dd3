//! Per-source metrics.
//!
//! Emitted through the `metrics` facade; without an installed recorder
//! every call is a no-op.

use std::time::Duration;

/// Metrics handle bound to one source.
#[derive(Debug, Clone)]
pub struct ConnectorMetrics {
    source: String,
    topic: String,
}

impl ConnectorMetrics {
    pub fn new(source: &str, topic: &str) -> Self {
        Self {
            source: source.to_string(),
            topic: topic.to_string(),
        }
    }

    /// Record a successful execution that published `records` records
    pub fn record_success(&self, records: usize, duration: Duration) {
        metrics::counter!("poller_executions_total", "source" => self.source.clone(), "outcome" => "success")
            .increment(1);
        metrics::counter!("poller_records_total", "source" => self.source.clone(), "topic" => self.topic.clone())
            .increment(records as u64);
        self.record_duration(duration);
    }

    /// Record an execution that found nothing to publish
    pub fn record_empty(&self, duration: Duration) {
        metrics::counter!("poller_executions_total", "source" => self.source.clone(), "outcome" => "empty")
            .increment(1);
        self.record_duration(duration);
    }

    pub fn record_failure(&self, kind: &str, duration: Duration) {
        metrics::counter!(
            "poller_executions_total",
            "source" => self.source.clone(),
            "outcome" => "failure",
            "kind" => kind.to_string()
        )
        .increment(1);
        self.record_duration(duration);
    }

    /// Record a tick dropped because an execution was still in flight
    pub fn record_skipped(&self) {
        metrics::counter!("poller_executions_total", "source" => self.source.clone(), "outcome" => "skipped")
            .increment(1);
    }

    pub fn set_health(&self, healthy: bool) {
        metrics::gauge!("poller_source_healthy", "source" => self.source.clone())
            .set(if healthy { 1.0 } else { 0.0 });
    }

    fn record_duration(&self, duration: Duration) {
        metrics::histogram!("poller_execution_duration_seconds", "source" => self.source.clone())
            .record(duration.as_secs_f64());
    }
}
