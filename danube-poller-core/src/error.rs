//! Error types shared by every component of the poller.

use std::fmt;
use thiserror::Error;

/// Result alias used across the crate.
pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// Boxed source error carried by broker and fatal failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Low-level network failure codes.
///
/// The first five are the transient set: a failure carrying one of them is
/// worth retrying. Anything else lands in [`ErrorCode::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConnectionReset,
    TimedOut,
    HostNotFound,
    DnsRetry,
    ConnectionRefused,
    Other(String),
}

impl ErrorCode {
    /// Conventional errno-style name, used in logs and metric labels.
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::ConnectionReset => "ECONNRESET",
            ErrorCode::TimedOut => "ETIMEDOUT",
            ErrorCode::HostNotFound => "ENOTFOUND",
            ErrorCode::DnsRetry => "EAI_AGAIN",
            ErrorCode::ConnectionRefused => "ECONNREFUSED",
            ErrorCode::Other(code) => code,
        }
    }

    /// Whether this code belongs to the transient network set.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ErrorCode::Other(_))
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the poller core and its collaborators.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Network-level failure before any HTTP response was received
    #[error("Transport error ({code}): {message}")]
    Transport { code: ErrorCode, message: String },

    /// Normalized HTTP failure; the only shape the transport surfaces to callers
    #[error("HTTP error {status}: {message}")]
    Http {
        status: u16,
        message: String,
        #[source]
        source: Option<Box<ConnectorError>>,
    },

    /// Payload could not be interpreted
    #[error("Invalid data: {message}")]
    InvalidData { message: String, payload: Vec<u8> },

    /// Serialization failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Schema registry lookup, validation or framing failure
    #[error("Schema encoding failed for subject '{subject}': {message}")]
    SchemaEncoding { subject: String, message: String },

    /// Publish attempted while the broker connection is not established
    #[error("Broker is not connected")]
    NotConnected,

    /// Broker client failure while creating producers or sending
    #[error("Broker error: {message}")]
    Broker {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Source configuration names a type with no registered pipeline
    #[error("Unknown source type '{source_type}' for source '{source_name}'")]
    UnknownSourceType {
        source_type: String,
        source_name: String,
    },

    /// Lookup by source name failed
    #[error("Source not found: {0}")]
    SourceNotFound(String),

    /// Unrecoverable failure; the process cannot continue
    #[error("Fatal error: {message}")]
    Fatal {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl ConnectorError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a fatal error
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a fatal error with a source error
    pub fn fatal_with_source<E>(msg: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Fatal {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a broker error with a source error
    pub fn broker_with_source<E>(msg: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Broker {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a transport error carrying a low-level network code
    pub fn transport(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self::Transport {
            code,
            message: msg.into(),
        }
    }

    /// Create an HTTP error with the given status
    pub fn http(status: u16, msg: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: msg.into(),
            source: None,
        }
    }

    /// Wrap an error as an HTTP error, keeping its status or defaulting to 500.
    pub fn into_http(self) -> Self {
        match self {
            http @ ConnectorError::Http { .. } => http,
            other => ConnectorError::Http {
                status: other.status_code().unwrap_or(500),
                message: other.to_string(),
                source: Some(Box::new(other)),
            },
        }
    }

    /// Create an invalid data error
    pub fn invalid_data(msg: impl Into<String>, payload: Vec<u8>) -> Self {
        Self::InvalidData {
            message: msg.into(),
            payload,
        }
    }

    /// HTTP status carried by this error, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ConnectorError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Low-level network code carried by this error, if any
    pub fn error_code(&self) -> Option<&ErrorCode> {
        match self {
            ConnectorError::Transport { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Whether this error was produced by `http()` / `into_http()`
    pub fn is_http_error(&self) -> bool {
        matches!(self, ConnectorError::Http { .. })
    }

    /// Check if this error is transient and worth retrying
    pub fn is_retryable(&self) -> bool {
        crate::classifier::classify(self).recoverable
    }

    /// Check if this error is due to invalid data
    pub fn is_invalid_data(&self) -> bool {
        matches!(self, ConnectorError::InvalidData { .. })
    }

    /// Short tag naming the error kind, used in logs and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectorError::Configuration(_) => "configuration",
            ConnectorError::Transport { .. } => "transport",
            ConnectorError::Http { .. } => "http",
            ConnectorError::InvalidData { .. } => "invalid_data",
            ConnectorError::Serialization(_) => "serialization",
            ConnectorError::SchemaEncoding { .. } => "schema_encoding",
            ConnectorError::NotConnected => "not_connected",
            ConnectorError::Broker { .. } => "broker",
            ConnectorError::UnknownSourceType { .. } => "unknown_source_type",
            ConnectorError::SourceNotFound(_) => "source_not_found",
            ConnectorError::Fatal { .. } => "fatal",
        }
    }
}

impl From<serde_json::Error> for ConnectorError {
    fn from(err: serde_json::Error) -> Self {
        ConnectorError::Serialization(err.to_string())
    }
}
