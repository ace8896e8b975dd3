//! Broker clients.
//!
//! [`BrokerClient`] is the seam between the publisher and the wire.
//! [`DanubeBroker`] publishes to Danube; [`MemoryBroker`] keeps records in
//! process and backs dry runs and tests.

use crate::config::{BrokerConfig, BrokerKind};
use crate::message::OutboundRecord;
use crate::retry::RetryStrategy;
use crate::{ConnectorError, ConnectorResult};
use async_trait::async_trait;
use danube_client::{DanubeClient, Producer};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use tokio::sync::{Mutex, OnceCell, RwLock, Semaphore};
use tracing::{debug, info, warn};

/// Connection and send primitives of a broker.
///
/// `send` must be safe to call concurrently; implementations multiplex
/// internally.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn connect(&self) -> ConnectorResult<()>;

    /// Send every record in one call. Records may target several topics.
    async fn send(&self, records: Vec<OutboundRecord>) -> ConnectorResult<()>;

    async fn disconnect(&self) -> ConnectorResult<()>;
}

/// Build the broker client selected by `config.kind`.
pub fn from_config(config: &BrokerConfig) -> Arc<dyn BrokerClient> {
    match config.kind {
        BrokerKind::Danube => Arc::new(DanubeBroker::new(config.clone())),
        BrokerKind::Memory => Arc::new(MemoryBroker::new()),
    }
}

type ProducerSlot = Arc<OnceCell<Arc<Mutex<Producer>>>>;

/// Danube-backed broker client with one lazily created producer per topic.
pub struct DanubeBroker {
    config: BrokerConfig,
    client: RwLock<Option<Arc<DanubeClient>>>,
    producers: std::sync::Mutex<HashMap<String, ProducerSlot>>,
    in_flight: Semaphore,
    retry: RetryStrategy,
}

impl DanubeBroker {
    pub fn new(config: BrokerConfig) -> Self {
        let in_flight = Semaphore::new(config.producer.max_in_flight_requests);
        let retry = RetryStrategy::new(config.retry.retry_config());
        Self {
            config,
            client: RwLock::new(None),
            producers: std::sync::Mutex::new(HashMap::new()),
            in_flight,
            retry,
        }
    }

    fn producer_name(&self, topic: &str) -> String {
        let prefix = self
            .config
            .producer
            .transactional_id
            .as_deref()
            .unwrap_or(&self.config.client_id);
        // Generate producer name: prefix-topic_name
        format!("{}{}", prefix, topic.replace('/', "-"))
    }

    /// Per-topic producer slot. The map lock is only held for the lookup.
    fn producer_slot(&self, topic: &str) -> ProducerSlot {
        let mut producers = self
            .producers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(producers.entry(topic.to_string()).or_default())
    }

    /// Get the producer for `topic`, creating it on first use.
    ///
    /// Concurrent callers for the same topic wait on one creation; other
    /// topics are not blocked by it. A failed creation leaves the slot empty.
    async fn producer_for(&self, topic: &str) -> ConnectorResult<Arc<Mutex<Producer>>> {
        let slot = self.producer_slot(topic);
        slot.get_or_try_init(|| self.create_producer(topic))
            .await
            .map(Arc::clone)
    }

    async fn create_producer(&self, topic: &str) -> ConnectorResult<Arc<Mutex<Producer>>> {
        let client = self
            .client
            .read()
            .await
            .clone()
            .ok_or(ConnectorError::NotConnected)?;

        let producer_name = self.producer_name(topic);
        let settings = &self.config.producer;
        info!(
            "Creating producer {} for topic: {} (partitions: {}, reliable: {})",
            producer_name, topic, settings.partitions, settings.idempotent
        );

        let mut attempt = 0;
        loop {
            let mut producer_builder = client
                .new_producer()
                .with_topic(topic)
                .with_name(&producer_name);

            // Add partitions if specified
            if settings.partitions > 0 {
                producer_builder = producer_builder.with_partitions(settings.partitions);
            }

            // Add reliable dispatch if requested
            if settings.idempotent {
                producer_builder = producer_builder.with_reliable_dispatch();
            }

            let mut producer = producer_builder.build();
            match producer.create().await {
                Ok(_) => return Ok(Arc::new(Mutex::new(producer))),
                Err(e) if self.retry.should_retry(attempt) => {
                    let backoff = self.retry.calculate_backoff(attempt);
                    warn!(
                        "Producer creation for {} failed, retrying in {:?}: {}",
                        topic, backoff, e
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(ConnectorError::broker_with_source(
                        format!("Failed to create producer for topic {}", topic),
                        e,
                    ))
                }
            }
        }
    }

    async fn send_one(&self, record: OutboundRecord) -> ConnectorResult<()> {
        let producer = self.producer_for(&record.topic).await?;
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| ConnectorError::NotConnected)?;

        let mut attempt = 0;
        loop {
            let result = producer
                .lock()
                .await
                .send(record.payload.clone(), Some(record.attributes.clone()))
                .await;

            match result {
                Ok(message_id) => {
                    debug!(
                        "Message sent to {} with key {}: {}",
                        record.topic, record.key, message_id
                    );
                    return Ok(());
                }
                Err(e) if self.retry.should_retry(attempt) => {
                    let backoff = self.retry.calculate_backoff(attempt);
                    warn!(
                        "Send to {} failed, retrying in {:?}: {}",
                        record.topic, backoff, e
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(ConnectorError::broker_with_source(
                        format!("Failed to publish message to {}", record.topic),
                        e,
                    ))
                }
            }
        }
    }
}

#[async_trait]
impl BrokerClient for DanubeBroker {
    async fn connect(&self) -> ConnectorResult<()> {
        let service_url = self
            .config
            .brokers
            .first()
            .ok_or_else(|| ConnectorError::config("broker.brokers cannot be empty"))?;

        info!("Connecting to Danube broker at {}", service_url);
        debug!(
            client_id = %self.config.client_id,
            partitioner = ?self.config.producer.partitioner,
            max_in_flight = self.config.producer.max_in_flight_requests,
            log_level = ?self.config.log_level,
            "Broker client settings"
        );

        let client = DanubeClient::builder()
            .service_url(service_url)
            .build()
            .await
            .map_err(|e| ConnectorError::fatal_with_source("Failed to create Danube client", e))?;

        *self.client.write().await = Some(Arc::new(client));
        Ok(())
    }

    async fn send(&self, records: Vec<OutboundRecord>) -> ConnectorResult<()> {
        for record in records {
            self.send_one(record).await?;
        }
        Ok(())
    }

    async fn disconnect(&self) -> ConnectorResult<()> {
        let dropped = {
            let mut producers = self
                .producers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let count = producers.values().filter(|slot| slot.initialized()).count();
            producers.clear();
            count
        };
        self.client.write().await.take();
        info!("Disconnected from Danube broker ({} producers released)", dropped);
        Ok(())
    }
}

/// In-process broker that keeps every sent record.
#[derive(Default)]
pub struct MemoryBroker {
    connected: AtomicBool,
    fail_connect: AtomicBool,
    sends: std::sync::Mutex<Vec<Vec<OutboundRecord>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `connect()` calls fail
    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Every record sent so far, in order
    pub fn records(&self) -> Vec<OutboundRecord> {
        self.lock_sends().iter().flatten().cloned().collect()
    }

    /// Number of `send()` calls made so far
    pub fn send_calls(&self) -> usize {
        self.lock_sends().len()
    }

    fn lock_sends(&self) -> std::sync::MutexGuard<'_, Vec<Vec<OutboundRecord>>> {
        self.sends
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn connect(&self) -> ConnectorResult<()> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(ConnectorError::fatal("memory broker refused connection"));
        }
        self.connected.store(true, Ordering::SeqCst);
        info!("Memory broker connected (records are kept in process)");
        Ok(())
    }

    async fn send(&self, records: Vec<OutboundRecord>) -> ConnectorResult<()> {
        if !self.is_connected() {
            return Err(ConnectorError::NotConnected);
        }
        for record in &records {
            info!(
                topic = %record.topic,
                key = %record.key,
                bytes = record.size(),
                "Dry-run publish"
            );
        }
        self.lock_sends().push(records);
        Ok(())
    }

    async fn disconnect(&self) -> ConnectorResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_broker_requires_connection() {
        let broker = MemoryBroker::new();
        let record = OutboundRecord::new("/default/t", "k", b"{}".to_vec());

        assert!(matches!(
            broker.send(vec![record.clone()]).await,
            Err(ConnectorError::NotConnected)
        ));

        broker.connect().await.unwrap();
        broker.send(vec![record.clone(), record]).await.unwrap();
        assert_eq!(broker.send_calls(), 1);
        assert_eq!(broker.records().len(), 2);

        broker.disconnect().await.unwrap();
        assert!(!broker.is_connected());
    }

    #[tokio::test]
    async fn test_memory_broker_connect_failure() {
        let broker = MemoryBroker::new();
        broker.fail_connect(true);
        tokio_test::assert_err!(broker.connect().await);
        assert!(!broker.is_connected());

        broker.fail_connect(false);
        tokio_test::assert_ok!(broker.connect().await);
        assert!(broker.is_connected());
    }

    #[test]
    fn test_producer_name_prefix() {
        let mut config = BrokerConfig::default();
        let broker = DanubeBroker::new(config.clone());
        assert_eq!(
            broker.producer_name("/default/rest-crm"),
            "danube-http-poller-default-rest-crm"
        );

        config.producer.transactional_id = Some("tx".into());
        let broker = DanubeBroker::new(config);
        assert_eq!(broker.producer_name("/default/rest-crm"), "tx-default-rest-crm");
    }

    #[tokio::test]
    async fn test_danube_send_requires_connection() {
        let broker = DanubeBroker::new(BrokerConfig::default());
        let record = OutboundRecord::new("/default/t", "k", Vec::new());
        assert!(matches!(
            broker.send(vec![record.clone()]).await,
            Err(ConnectorError::NotConnected)
        ));

        // failed creation leaves the topic retryable
        assert!(!broker.producer_slot("/default/t").initialized());
        assert!(matches!(
            broker.send(vec![record]).await,
            Err(ConnectorError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_producer_slots_are_per_topic() {
        let broker = DanubeBroker::new(BrokerConfig::default());
        let orders = broker.producer_slot("/default/rest-orders");

        assert!(Arc::ptr_eq(&orders, &broker.producer_slot("/default/rest-orders")));
        assert!(!Arc::ptr_eq(&orders, &broker.producer_slot("/default/rest-crm")));

        // a creation pending on one topic does not block other topics
        {
            let creating = orders.get_or_try_init(|| {
                futures::future::pending::<ConnectorResult<Arc<Mutex<Producer>>>>()
            });
            tokio::pin!(creating);
            assert!(futures::poll!(creating.as_mut()).is_pending());

            let crm = broker.producer_slot("/default/rest-crm");
            assert!(!crm.initialized());
        }

        broker.disconnect().await.unwrap();
        assert!(!Arc::ptr_eq(&orders, &broker.producer_slot("/default/rest-orders")));
    }
}
