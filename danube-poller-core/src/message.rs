//! Outbound message framing.
//!
//! Every payload item is wrapped in an [`Envelope`] and turned into an
//! [`OutboundRecord`] just before it is handed to the broker.

use crate::{ConnectorError, ConnectorResult};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Envelope format version stamped into every message.
pub const ENVELOPE_VERSION: &str = "1.0";

/// Header names attached to every outbound record.
pub const HEADER_SOURCE: &str = "source";
pub const HEADER_TYPE: &str = "type";
pub const HEADER_TIMESTAMP: &str = "timestamp";
/// Attribute carrying the derived partition key
pub const HEADER_KEY: &str = "key";
/// Attribute naming the content encoding of the payload
pub const HEADER_CONTENT_TYPE: &str = "content-type";

/// Caller-supplied metadata for one publish call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishMetadata {
    pub source: Option<String>,
    #[serde(rename = "type")]
    pub source_type: Option<String>,
    /// Overrides the default `<source>-<type>-value` schema subject
    pub subject: Option<String>,
}

impl PublishMetadata {
    pub fn new(source: impl Into<String>, source_type: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            source_type: Some(source_type.into()),
            subject: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Schema subject used for registry encoding
    pub fn subject(&self) -> String {
        self.subject.clone().unwrap_or_else(|| {
            format!(
                "{}-{}-value",
                self.source.as_deref().unwrap_or("unknown"),
                self.source_type.as_deref().unwrap_or("unknown")
            )
        })
    }
}

/// Envelope metadata block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    pub source: Option<String>,
    #[serde(rename = "type")]
    pub source_type: Option<String>,
    pub timestamp: String,
    pub version: String,
}

/// `{metadata, payload}` wrapper applied to every outbound item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub metadata: EnvelopeMetadata,
    pub payload: Value,
}

impl Envelope {
    pub fn wrap(payload: Value, metadata: &PublishMetadata, timestamp: DateTime<Utc>) -> Self {
        Self {
            metadata: EnvelopeMetadata {
                source: metadata.source.clone(),
                source_type: metadata.source_type.clone(),
                timestamp: iso_timestamp(timestamp),
                version: ENVELOPE_VERSION.to_string(),
            },
            payload,
        }
    }

    pub fn to_value(&self) -> ConnectorResult<Value> {
        serde_json::to_value(self).map_err(ConnectorError::from)
    }

    pub fn to_bytes(&self) -> ConnectorResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(ConnectorError::from)
    }
}

/// ISO-8601 with millisecond precision, e.g. `2024-05-01T12:00:00.000Z`.
pub fn iso_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Derive the partition key for one payload item.
///
/// Uses `id`, then `_id`, then the publishing source, then `"default"`.
pub fn derive_key(item: &Value, metadata: &PublishMetadata) -> String {
    ["id", "_id"]
        .iter()
        .find_map(|field| item.get(field).and_then(key_string))
        .or_else(|| metadata.source.clone())
        .unwrap_or_else(|| "default".to_string())
}

fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Record handed to the broker client. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRecord {
    /// The topic to publish to
    pub topic: String,
    /// Partition key
    pub key: String,
    /// Serialized value
    pub payload: Vec<u8>,
    /// Message attributes/headers
    pub attributes: HashMap<String, String>,
}

impl OutboundRecord {
    pub fn new(topic: impl Into<String>, key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            payload,
            attributes: HashMap::new(),
        }
    }

    /// Add an attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Get the payload size in bytes
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}
