//! Simple polling source example
//!
//! A pipeline that generates a small batch of counter records on every tick
//! and publishes them to the in-process memory broker, so it runs without a
//! Danube cluster.
//!
//! Usage:
//!   RUST_LOG=info,danube_poller_core=debug cargo run --example simple_source

use async_trait::async_trait;
use danube_poller_core::{
    init_tracing, BrokerPublisher, ConnectorResult, MemoryBroker, PipelineContext,
    PipelineRegistry, PollerRuntime, ReqwestHttpClient, RetryingTransport, Scheduler,
    SchedulerSettings, SourceConfig, SourcePipeline, TransportOptions,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Generates `batch_size` records per tick
struct CounterPipeline {
    counter: AtomicU64,
    batch_size: u64,
}

#[async_trait]
impl SourcePipeline for CounterPipeline {
    async fn extract(&self, ctx: &PipelineContext) -> ConnectorResult<Option<Value>> {
        let start = self.counter.fetch_add(self.batch_size, Ordering::SeqCst);
        let records: Vec<Value> = (start..start + self.batch_size)
            .map(|n| json!({ "id": n, "source": ctx.config().name }))
            .collect();
        Ok(Some(Value::Array(records)))
    }

    async fn transform(&self, raw: Value, ctx: &PipelineContext) -> ConnectorResult<Value> {
        ctx.normalize(&raw)
    }
}

#[tokio::main]
async fn main() {
    init_tracing("info");

    let mut registry = PipelineRegistry::new();
    registry.register("counter", |config| {
        let batch_size = config.option_u64("batch_size").unwrap_or(5);
        Ok(Box::new(CounterPipeline {
            counter: AtomicU64::new(0),
            batch_size,
        }) as Box<dyn SourcePipeline>)
    });

    let mut source = SourceConfig::new("demo", "counter", "http://localhost");
    source.interval_ms = Some(2_000);

    let publisher = Arc::new(BrokerPublisher::new(Arc::new(MemoryBroker::new())));
    let http = match ReqwestHttpClient::new("simple-source-example") {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("Failed to build HTTP client: {e}");
            std::process::exit(1);
        }
    };
    let transport = RetryingTransport::new(http, TransportOptions::default());

    let scheduler = Scheduler::new(
        vec![source],
        SchedulerSettings::default(),
        registry,
        publisher,
        transport,
    );

    let result = PollerRuntime::new(Arc::new(scheduler)).run().await;
    std::process::exit(PollerRuntime::exit_code(&result));
}
