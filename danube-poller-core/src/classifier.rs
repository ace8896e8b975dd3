//! Error classification and failure reporting.
//!
//! [`classify`] is the single place that decides whether a failure is
//! transient. [`ErrorClassifier`] turns failures into [`ErrorInfo`] records,
//! logs them once, counts them and forwards them to an optional reporter.

use crate::error::{BoxError, ConnectorError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::error::Error as _;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Outcome of classifying an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub recoverable: bool,
}

/// Decide whether an error is transient.
///
/// Recoverable iff the error carries a transient network code, an HTTP
/// status in 500..=599, or HTTP 429.
pub fn classify(error: &ConnectorError) -> Classification {
    let by_code = error.error_code().is_some_and(|code| code.is_transient());
    let by_status = error
        .status_code()
        .is_some_and(|status| (500..=599).contains(&status) || status == 429);

    Classification {
        recoverable: by_code || by_status,
    }
}

/// Immutable record describing one failure.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorInfo {
    pub context: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub recoverable: bool,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

/// External error-reporting sink.
///
/// Reporting is best-effort: a returned error or a panic inside the sink is
/// logged at debug level and otherwise ignored.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &ConnectorError, info: &ErrorInfo) -> Result<(), BoxError>;
}

/// Builds, logs and reports [`ErrorInfo`] records.
#[derive(Clone, Default)]
pub struct ErrorClassifier {
    reporter: Option<Arc<dyn ErrorReporter>>,
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an external reporting sink
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn classify(&self, error: &ConnectorError) -> Classification {
        classify(error)
    }

    /// Build the HTTP error shape used by the transport.
    pub fn create_http_error(&self, status: u16, message: impl Into<String>) -> ConnectorError {
        ConnectorError::http(status, message)
    }

    /// Record a failure under `context` and log it.
    pub fn handle(
        &self,
        error: &ConnectorError,
        context: &str,
        extra: Map<String, Value>,
    ) -> ErrorInfo {
        let info = self.record(error, context, extra);

        if info.recoverable {
            warn!(
                context = %info.context,
                kind = %info.kind,
                recoverable = true,
                "{}",
                info.message
            );
        } else {
            error!(
                context = %info.context,
                kind = %info.kind,
                recoverable = false,
                "{}",
                info.message
            );
        }

        info
    }

    /// Record a failure raised by a source pipeline.
    ///
    /// The context is fixed to `<type>/<source>`.
    pub fn handle_strategy_error(
        &self,
        error: &ConnectorError,
        pipeline_type: &str,
        source_name: &str,
    ) -> ErrorInfo {
        let mut extra = Map::new();
        extra.insert("strategy".into(), Value::String(pipeline_type.to_string()));
        extra.insert("source".into(), Value::String(source_name.to_string()));

        let context = format!("{pipeline_type}/{source_name}");
        let info = self.record(error, &context, extra);

        if info.recoverable {
            warn!(
                source = %source_name,
                context = %info.context,
                kind = %info.kind,
                recoverable = true,
                "Recoverable failure, will retry next cycle: {}",
                info.message
            );
        } else {
            error!(
                source = %source_name,
                context = %info.context,
                kind = %info.kind,
                recoverable = false,
                "Non-recoverable failure, needs attention: {}",
                info.message
            );
        }

        info
    }

    fn record(&self, error: &ConnectorError, context: &str, extra: Map<String, Value>) -> ErrorInfo {
        let classification = classify(error);
        let info = ErrorInfo {
            context: context.to_string(),
            message: error.to_string(),
            trace: source_chain(error),
            timestamp: Utc::now(),
            kind: error.kind().to_string(),
            status_code: error.status_code(),
            recoverable: classification.recoverable,
            extra,
        };

        metrics::counter!(
            "poller_errors_total",
            "context" => info.context.clone(),
            "kind" => info.kind.clone(),
            "recoverable" => info.recoverable.to_string()
        )
        .increment(1);

        self.forward(error, &info);
        info
    }

    fn forward(&self, error: &ConnectorError, info: &ErrorInfo) {
        let Some(reporter) = &self.reporter else {
            return;
        };

        match catch_unwind(AssertUnwindSafe(|| reporter.report(error, info))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Error reporter failed: {}", e),
            Err(_) => debug!("Error reporter panicked"),
        }
    }
}

/// Render the `source()` chain below the top-level message.
fn source_chain(error: &ConnectorError) -> Option<String> {
    let mut causes = Vec::new();
    let mut current = error.source();
    while let Some(cause) = current {
        causes.push(cause.to_string());
        current = cause.source();
    }

    if causes.is_empty() {
        None
    } else {
        Some(causes.join("\ncaused by: "))
    }
}
