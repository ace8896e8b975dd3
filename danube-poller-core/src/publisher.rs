//! Broker publishing: connection lifecycle, framing, keys and schema encoding.

use crate::broker::BrokerClient;
use crate::message::{
    derive_key, iso_timestamp, Envelope, OutboundRecord, PublishMetadata, HEADER_CONTENT_TYPE,
    HEADER_KEY, HEADER_SOURCE, HEADER_TIMESTAMP, HEADER_TYPE,
};
use crate::schema::SchemaEncoder;
use crate::{ConnectorError, ConnectorResult};
use chrono::Utc;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

const CONTENT_TYPE_JSON: &str = "application/json";
const CONTENT_TYPE_REGISTRY: &str = "application/vnd.schemaregistry.v1+json";

/// Connection lifecycle of the publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// One group of a multi-topic batch publish.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub topic: String,
    pub payload: Value,
    pub metadata: PublishMetadata,
}

/// Shared publisher used by every pipeline.
///
/// Only the connection state is mutable, and it changes at the edges of the
/// process lifetime. Concurrent `publish` calls go straight to the broker
/// client.
pub struct BrokerPublisher {
    client: Arc<dyn BrokerClient>,
    encoder: Option<Arc<dyn SchemaEncoder>>,
    state: Mutex<ConnectionState>,
}

impl BrokerPublisher {
    pub fn new(client: Arc<dyn BrokerClient>) -> Self {
        Self {
            client,
            encoder: None,
            state: Mutex::new(ConnectionState::Disconnected),
        }
    }

    /// Encode envelopes through a schema registry before sending
    pub fn with_schema_encoder(mut self, encoder: Arc<dyn SchemaEncoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connect the broker client. A no-op when already connected.
    ///
    /// Failures are fatal: the connector cannot run without a broker.
    pub async fn connect(&self) -> ConnectorResult<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                ConnectionState::Connected | ConnectionState::Connecting => {
                    warn!("Broker publisher already {}, ignoring connect", *state);
                    return Ok(());
                }
                _ => *state = ConnectionState::Connecting,
            }
        }

        match self.client.connect().await {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                info!("Broker publisher connected");
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                error!("Failed to connect to broker: {}", e);
                Err(match e {
                    fatal @ ConnectorError::Fatal { .. } => fatal,
                    other => ConnectorError::fatal_with_source("Failed to connect to broker", other),
                })
            }
        }
    }

    /// Disconnect the broker client. Safe to call in any state.
    pub async fn disconnect(&self) -> ConnectorResult<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                ConnectionState::Disconnected | ConnectionState::Disconnecting => return Ok(()),
                _ => *state = ConnectionState::Disconnecting,
            }
        }

        let result = self.client.disconnect().await;
        self.set_state(ConnectionState::Disconnected);

        match &result {
            Ok(()) => info!("Broker publisher disconnected"),
            Err(e) => error!("Broker disconnect failed: {}", e),
        }
        result
    }

    /// Publish one payload or a list of payloads to `topic` in a single send.
    ///
    /// Returns the number of records sent.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Value,
        metadata: &PublishMetadata,
    ) -> ConnectorResult<usize> {
        self.ensure_connected()?;

        let records = self.prepare(topic, payload, metadata).await?;
        let count = records.len();
        if count == 0 {
            return Ok(0);
        }

        self.client.send(records).await?;

        metrics::counter!("poller_records_published_total", "topic" => topic.to_string())
            .increment(count as u64);
        debug!("Published {} records to {}", count, topic);
        Ok(count)
    }

    /// Prepare every group independently and send them all in one call.
    pub async fn publish_batch(&self, batch: Vec<PublishRequest>) -> ConnectorResult<usize> {
        self.ensure_connected()?;

        let mut records = Vec::new();
        for request in batch {
            let prepared = self
                .prepare(&request.topic, request.payload, &request.metadata)
                .await?;
            records.extend(prepared);
        }

        let count = records.len();
        if count == 0 {
            return Ok(0);
        }

        self.client.send(records).await?;
        metrics::counter!("poller_records_published_total", "topic" => "batch")
            .increment(count as u64);
        debug!("Published batch of {} records", count);
        Ok(count)
    }

    fn ensure_connected(&self) -> ConnectorResult<()> {
        if self.is_healthy() {
            Ok(())
        } else {
            Err(ConnectorError::NotConnected)
        }
    }

    async fn prepare(
        &self,
        topic: &str,
        payload: Value,
        metadata: &PublishMetadata,
    ) -> ConnectorResult<Vec<OutboundRecord>> {
        let items = match payload {
            Value::Array(items) => items,
            single => vec![single],
        };

        let timestamp = Utc::now();
        let iso = iso_timestamp(timestamp);
        let subject = metadata.subject();

        let mut records = Vec::with_capacity(items.len());
        for item in items {
            let key = derive_key(&item, metadata);
            let envelope = Envelope::wrap(item, metadata, timestamp);
            let (value, content_type) = self.encode(&envelope, &subject).await?;

            let record = OutboundRecord::new(topic, key.clone(), value)
                .with_attribute(HEADER_SOURCE, metadata.source.clone().unwrap_or_default())
                .with_attribute(HEADER_TYPE, metadata.source_type.clone().unwrap_or_default())
                .with_attribute(HEADER_TIMESTAMP, iso.clone())
                .with_attribute(HEADER_KEY, key)
                .with_attribute(HEADER_CONTENT_TYPE, content_type);
            records.push(record);
        }

        Ok(records)
    }

    /// Schema-encode the envelope, falling back to plain JSON on failure.
    async fn encode(
        &self,
        envelope: &Envelope,
        subject: &str,
    ) -> ConnectorResult<(Vec<u8>, &'static str)> {
        if let Some(encoder) = &self.encoder {
            let value = envelope.to_value()?;
            match encoder.encode(subject, &value).await {
                Ok(bytes) => return Ok((bytes, CONTENT_TYPE_REGISTRY)),
                Err(e) => warn!(
                    subject,
                    "Schema encoding failed, sending plain envelope: {}", e
                ),
            }
        }

        Ok((envelope.to_bytes()?, CONTENT_TYPE_JSON))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingEncoder;

    #[async_trait]
    impl SchemaEncoder for FailingEncoder {
        async fn encode(&self, subject: &str, _envelope: &Value) -> ConnectorResult<Vec<u8>> {
            Err(ConnectorError::SchemaEncoding {
                subject: subject.to_string(),
                message: "registry down".into(),
            })
        }
    }

    struct PrefixEncoder(std::sync::Mutex<Vec<String>>);

    #[async_trait]
    impl SchemaEncoder for PrefixEncoder {
        async fn encode(&self, subject: &str, envelope: &Value) -> ConnectorResult<Vec<u8>> {
            self.0.lock().unwrap().push(subject.to_string());
            Ok(crate::schema::frame(9, &serde_json::to_vec(envelope)?))
        }
    }

    struct CountingClient {
        connects: AtomicUsize,
        inner: MemoryBroker,
    }

    #[async_trait]
    impl BrokerClient for CountingClient {
        async fn connect(&self) -> ConnectorResult<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.inner.connect().await
        }

        async fn send(&self, records: Vec<OutboundRecord>) -> ConnectorResult<()> {
            self.inner.send(records).await
        }

        async fn disconnect(&self) -> ConnectorResult<()> {
            self.inner.disconnect().await
        }
    }

    async fn connected(broker: Arc<MemoryBroker>) -> BrokerPublisher {
        let publisher = BrokerPublisher::new(broker);
        publisher.connect().await.unwrap();
        publisher
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let publisher = BrokerPublisher::new(Arc::new(MemoryBroker::new()));
        let err = publisher
            .publish("/default/t", json!({"id": 1}), &PublishMetadata::new("crm", "rest"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::NotConnected));
    }

    #[tokio::test]
    async fn test_publish_list_in_one_send_with_keys_and_headers() {
        let broker = Arc::new(MemoryBroker::new());
        let publisher = connected(broker.clone()).await;
        let metadata = PublishMetadata::new("crm", "rest");

        let sent = publisher
            .publish(
                "/default/rest-crm",
                json!([{"id": 42}, {"_id": "abc"}, {"name": "anon"}]),
                &metadata,
            )
            .await
            .unwrap();

        assert_eq!(sent, 3);
        assert_eq!(broker.send_calls(), 1);

        let records = broker.records();
        let keys: Vec<&str> = records.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["42", "abc", "crm"]);

        let first = &records[0];
        assert_eq!(first.topic, "/default/rest-crm");
        assert_eq!(first.attributes["source"], "crm");
        assert_eq!(first.attributes["type"], "rest");
        assert!(first.attributes["timestamp"].ends_with('Z'));

        let envelope: Value = serde_json::from_slice(&first.payload).unwrap();
        assert_eq!(envelope["payload"], json!({"id": 42}));
        assert_eq!(envelope["metadata"]["source"], "crm");
        assert_eq!(envelope["metadata"]["version"], "1.0");
    }

    #[tokio::test]
    async fn test_single_payload_is_normalized_to_list() {
        let broker = Arc::new(MemoryBroker::new());
        let publisher = connected(broker.clone()).await;

        let sent = publisher
            .publish("/default/t", json!({"id": 1}), &PublishMetadata::default())
            .await
            .unwrap();
        assert_eq!(sent, 1);
    }

    #[tokio::test]
    async fn test_encoding_failure_falls_back_to_plain_envelope() {
        let broker = Arc::new(MemoryBroker::new());
        let publisher =
            BrokerPublisher::new(broker.clone()).with_schema_encoder(Arc::new(FailingEncoder));
        publisher.connect().await.unwrap();

        publisher
            .publish("/default/t", json!({"id": 1}), &PublishMetadata::new("crm", "rest"))
            .await
            .unwrap();

        let records = broker.records();
        assert_eq!(records.len(), 1);
        let envelope: Value = serde_json::from_slice(&records[0].payload).unwrap();
        assert_eq!(envelope["payload"]["id"], 1);
        assert_eq!(records[0].attributes["content-type"], CONTENT_TYPE_JSON);
    }

    #[tokio::test]
    async fn test_encoder_uses_default_and_overridden_subject() {
        let broker = Arc::new(MemoryBroker::new());
        let encoder = Arc::new(PrefixEncoder(std::sync::Mutex::new(Vec::new())));
        let publisher = BrokerPublisher::new(broker.clone()).with_schema_encoder(encoder.clone());
        publisher.connect().await.unwrap();

        let metadata = PublishMetadata::new("crm", "rest");
        publisher
            .publish("/default/t", json!({"id": 1}), &metadata)
            .await
            .unwrap();
        publisher
            .publish("/default/t", json!({"id": 2}), &metadata.with_subject("contacts"))
            .await
            .unwrap();

        assert_eq!(
            *encoder.0.lock().unwrap(),
            vec!["crm-rest-value".to_string(), "contacts".to_string()]
        );
        assert_eq!(broker.records()[0].payload[0], crate::schema::MAGIC_BYTE);
    }

    #[tokio::test]
    async fn test_publish_batch_single_multi_topic_send() {
        let broker = Arc::new(MemoryBroker::new());
        let publisher = connected(broker.clone()).await;

        let sent = publisher
            .publish_batch(vec![
                PublishRequest {
                    topic: "/default/a".into(),
                    payload: json!([{"id": 1}, {"id": 2}]),
                    metadata: PublishMetadata::new("a", "rest"),
                },
                PublishRequest {
                    topic: "/default/b".into(),
                    payload: json!({"id": 3}),
                    metadata: PublishMetadata::new("b", "rest"),
                },
            ])
            .await
            .unwrap();

        assert_eq!(sent, 3);
        assert_eq!(broker.send_calls(), 1);
        let topics: Vec<String> = broker.records().into_iter().map(|r| r.topic).collect();
        assert_eq!(topics, vec!["/default/a", "/default/a", "/default/b"]);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent_and_disconnect_safe() {
        let client = Arc::new(CountingClient {
            connects: AtomicUsize::new(0),
            inner: MemoryBroker::new(),
        });
        let publisher = BrokerPublisher::new(client.clone());

        publisher.disconnect().await.unwrap();
        assert_eq!(publisher.state(), ConnectionState::Disconnected);

        publisher.connect().await.unwrap();
        publisher.connect().await.unwrap();
        assert_eq!(client.connects.load(Ordering::SeqCst), 1);
        assert!(publisher.is_healthy());

        publisher.disconnect().await.unwrap();
        publisher.disconnect().await.unwrap();
        assert!(!publisher.is_healthy());
    }

    #[tokio::test]
    async fn test_connect_failure_is_fatal() {
        let broker = Arc::new(MemoryBroker::new());
        broker.fail_connect(true);
        let publisher = BrokerPublisher::new(broker);

        let err = publisher.connect().await.unwrap_err();
        assert_eq!(err.kind(), "fatal");
        assert_eq!(publisher.state(), ConnectionState::Disconnected);
    }
}
