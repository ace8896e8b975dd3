//! HTTP Polling Source Connector for Danube Connect
//!
//! Polls REST APIs on a per-source interval and publishes every returned
//! record to Danube, wrapped in a metadata envelope and keyed by its id.

mod config;
mod pipelines;

use anyhow::Context;
use danube_poller_core::{
    broker, init_tracing, BrokerPublisher, PollerConfig, PollerRuntime, ReqwestHttpClient,
    RetryingTransport, Scheduler, SchemaRegistryEncoder,
};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = match config::load() {
        Ok(config) => config,
        Err(e) => {
            init_tracing("info");
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    init_tracing(&config.log_level);

    info!("Starting HTTP Poller Source Connector");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Connector: {}", config.connector_name);
    info!("Broker: {:?} {:?}", config.broker.kind, config.broker.brokers);
    info!("Sources: {}", config.sources.len());

    let runtime = match build_runtime(&config) {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to initialize connector: {:#}", e);
            std::process::exit(1);
        }
    };

    let result = runtime.run().await;
    let code = PollerRuntime::exit_code(&result);
    info!("HTTP Poller Source Connector stopped");
    std::process::exit(code);
}

/// Wire the broker, transport, registry and scheduler from `config`
fn build_runtime(config: &PollerConfig) -> anyhow::Result<PollerRuntime> {
    let mut publisher = BrokerPublisher::new(broker::from_config(&config.broker));
    if let Some(registry) = &config.schema_registry {
        let encoder = SchemaRegistryEncoder::new(registry)
            .with_context(|| format!("Failed to set up schema registry at {}", registry.url))?;
        publisher = publisher.with_schema_encoder(Arc::new(encoder));
        info!("Schema registry enabled: {}", registry.url);
    }

    let http = ReqwestHttpClient::new(&config.transport.user_agent)
        .context("Failed to build HTTP client")?;
    let transport = RetryingTransport::new(Arc::new(http), config.transport.options());

    let registry = pipelines::registry();
    info!("Registered source types: {:?}", registry.registered_types());

    let scheduler = Scheduler::new(
        config.sources.clone(),
        config.scheduler.clone(),
        registry,
        Arc::new(publisher),
        transport,
    );

    Ok(PollerRuntime::new(Arc::new(scheduler)))
}
