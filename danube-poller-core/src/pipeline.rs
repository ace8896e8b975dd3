//! Template execution of a source pipeline.

use crate::classifier::{ErrorClassifier, ErrorInfo};
use crate::config::SourceConfig;
use crate::message::PublishMetadata;
use crate::metrics::ConnectorMetrics;
use crate::publisher::BrokerPublisher;
use crate::traits::{PipelineContext, SourcePipeline};
use crate::transport::RetryingTransport;
use crate::{ConnectorError, ConnectorResult};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Result of one `execute()` call.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// A previous execution was still in flight; nothing was done.
    Skipped,
    Success {
        records_processed: usize,
        duration: Duration,
    },
    Failed {
        error: ErrorInfo,
        duration: Duration,
    },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }

    pub fn records_processed(&self) -> usize {
        match self {
            ExecutionOutcome::Success {
                records_processed, ..
            } => *records_processed,
            _ => 0,
        }
    }
}

/// Point-in-time snapshot of a pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub name: String,
    #[serde(rename = "type")]
    pub source_type: String,
    pub topic: String,
    pub interval_ms: u64,
    pub is_running: bool,
    pub last_execution: Option<DateTime<Utc>>,
    pub last_error: Option<ErrorInfo>,
    pub execution_count: u64,
}

#[derive(Debug, Default)]
struct RunState {
    last_execution: Option<DateTime<Utc>>,
    last_error: Option<ErrorInfo>,
    execution_count: u64,
}

/// Clears the single-flight flag on every exit path.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs a [`SourcePipeline`] as extract, transform, publish.
///
/// At most one execution per runner is in flight; overlapping calls return
/// [`ExecutionOutcome::Skipped`]. Failures never escape `execute`.
pub struct PipelineRunner {
    config: Arc<SourceConfig>,
    pipeline: Box<dyn SourcePipeline>,
    transport: RetryingTransport,
    classifier: ErrorClassifier,
    metrics: ConnectorMetrics,
    topic: String,
    interval: Duration,
    running: AtomicBool,
    state: Mutex<RunState>,
}

impl PipelineRunner {
    pub fn new(
        config: SourceConfig,
        pipeline: Box<dyn SourcePipeline>,
        transport: RetryingTransport,
        classifier: ErrorClassifier,
        default_interval_ms: u64,
    ) -> Self {
        let topic = config.topic();
        let interval = config.interval(default_interval_ms);
        let metrics = ConnectorMetrics::new(&config.name, &topic);

        Self {
            config: Arc::new(config),
            pipeline,
            transport,
            classifier,
            metrics,
            topic,
            interval,
            running: AtomicBool::new(false),
            state: Mutex::new(RunState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn source_type(&self) -> &str {
        &self.config.source_type
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn execution_count(&self) -> u64 {
        self.lock_state().execution_count
    }

    pub fn last_error(&self) -> Option<ErrorInfo> {
        self.lock_state().last_error.clone()
    }

    pub fn status(&self) -> PipelineStatus {
        let state = self.lock_state();
        PipelineStatus {
            name: self.config.name.clone(),
            source_type: self.config.source_type.clone(),
            topic: self.topic.clone(),
            interval_ms: self.interval.as_millis() as u64,
            is_running: self.is_running(),
            last_execution: state.last_execution,
            last_error: state.last_error.clone(),
            execution_count: state.execution_count,
        }
    }

    /// Run one extract, transform, publish cycle.
    pub async fn execute(&self, publisher: &BrokerPublisher) -> ExecutionOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(source = %self.name(), "Previous execution still running, skipping");
            self.metrics.record_skipped();
            return ExecutionOutcome::Skipped;
        }
        let _guard = RunningGuard(&self.running);

        let start = Instant::now();
        let result = AssertUnwindSafe(self.run_once(publisher))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(ConnectorError::fatal(format!(
                    "pipeline '{}' panicked during execution",
                    self.name()
                )))
            });
        let duration = start.elapsed();

        match result {
            Ok(None) => {
                debug!(source = %self.name(), "No new data");
                self.metrics.record_empty(duration);
                ExecutionOutcome::Success {
                    records_processed: 0,
                    duration,
                }
            }
            Ok(Some(records_processed)) => {
                {
                    let mut state = self.lock_state();
                    state.last_execution = Some(Utc::now());
                    state.last_error = None;
                    state.execution_count += 1;
                }
                self.metrics.record_success(records_processed, duration);
                self.metrics.set_health(true);
                info!(
                    source = %self.name(),
                    topic = %self.topic,
                    records = records_processed,
                    duration_ms = duration.as_millis() as u64,
                    "Execution completed"
                );
                ExecutionOutcome::Success {
                    records_processed,
                    duration,
                }
            }
            Err(e) => {
                let info = self.classifier.handle_strategy_error(
                    &e,
                    &self.config.source_type,
                    &self.config.name,
                );
                self.lock_state().last_error = Some(info.clone());
                self.metrics.record_failure(e.kind(), duration);
                self.metrics.set_health(false);
                ExecutionOutcome::Failed {
                    error: info,
                    duration,
                }
            }
        }
    }

    /// `Ok(None)` when the source had nothing new.
    async fn run_once(&self, publisher: &BrokerPublisher) -> ConnectorResult<Option<usize>> {
        let ctx = self.context();

        let raw = match self.pipeline.extract(&ctx).await? {
            Some(raw) if !is_empty(&raw) => raw,
            _ => return Ok(None),
        };

        let records = self.pipeline.transform(raw, &ctx).await?;

        let mut metadata = PublishMetadata::new(&self.config.name, &self.config.source_type);
        if let Some(subject) = &self.config.subject {
            metadata = metadata.with_subject(subject);
        }

        let published = publisher.publish(&self.topic, records, &metadata).await?;
        Ok(Some(published))
    }

    fn context(&self) -> PipelineContext {
        PipelineContext::new(
            Arc::clone(&self.config),
            self.transport.clone(),
            self.pipeline.auth_headers(&self.config),
        )
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Null and empty arrays mean "nothing new". Empty objects are real records.
fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}
