//! # Danube Poller Core
//!
//! Core SDK for building HTTP polling source connectors for Danube.
//!
//! Each configured source is polled on its own interval by a
//! [`SourcePipeline`]: `extract` fetches raw data (usually through the
//! retrying HTTP transport), `transform` shapes it into records, and the
//! shared [`BrokerPublisher`] wraps every record in a metadata envelope and
//! sends it to the source's Danube topic.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use danube_poller_core::{
//!     broker, BrokerPublisher, ConnectorResult, PipelineContext, PipelineRegistry, PollerConfig,
//!     PollerRuntime, RequestOptions, ReqwestHttpClient, RetryingTransport, Scheduler,
//!     SourcePipeline,
//! };
//! use serde_json::Value;
//! use std::sync::Arc;
//!
//! struct Tickets;
//!
//! #[async_trait]
//! impl SourcePipeline for Tickets {
//!     async fn extract(&self, ctx: &PipelineContext) -> ConnectorResult<Option<Value>> {
//!         Ok(Some(ctx.make_request("/tickets", RequestOptions::default()).await?))
//!     }
//!
//!     async fn transform(&self, raw: Value, ctx: &PipelineContext) -> ConnectorResult<Value> {
//!         ctx.normalize(&raw)
//!     }
//! }
//!
//! # async fn run() -> ConnectorResult<()> {
//! let config = PollerConfig::from_file("config/connector.toml")?;
//!
//! let mut registry = PipelineRegistry::new();
//! registry.register("tickets", |_| Ok(Box::new(Tickets) as Box<dyn SourcePipeline>));
//!
//! let publisher = Arc::new(BrokerPublisher::new(broker::from_config(&config.broker)));
//! let http = Arc::new(ReqwestHttpClient::new(&config.transport.user_agent)?);
//! let transport = RetryingTransport::new(http, config.transport.options());
//!
//! let scheduler = Scheduler::new(
//!     config.sources.clone(),
//!     config.scheduler.clone(),
//!     registry,
//!     publisher,
//!     transport,
//! );
//! PollerRuntime::new(Arc::new(scheduler)).run().await
//! # }
//! ```
//!
//! ## Features
//!
//! - **Per-source scheduling**: independent intervals, overlapping ticks are skipped
//! - **Retrying transport**: exponential backoff for transient HTTP failures
//! - **Error classification**: one structured log entry per failure, optional reporter sink
//! - **Envelopes and keys**: every record carries source metadata and a stable partition key
//! - **Schema registry**: optional JSON Schema encoding with plain-JSON fallback

pub mod auth;
pub mod broker;
mod classifier;
mod config;
mod error;
mod mapping;
mod message;
mod metrics;
mod pipeline;
mod publisher;
mod registry;
mod retry;
mod runtime;
mod scheduler;
pub mod schema;
mod traits;
mod transport;

// Re-export public API
pub use broker::{BrokerClient, DanubeBroker, MemoryBroker};
pub use classifier::{classify, Classification, ErrorClassifier, ErrorInfo, ErrorReporter};
pub use config::{
    AuthConfig, BrokerConfig, BrokerKind, BrokerRetrySettings, Partitioner, PollerConfig,
    ProducerSettings, SchedulerSettings, SchemaRegistrySettings, SourceConfig, TransportSettings,
};
pub use error::{BoxError, ConnectorError, ConnectorResult, ErrorCode};
pub use mapping::{
    get_path, DetailedRule, FieldMapper, FieldRule, MappingSchema, Transform, ValidationReport,
};
pub use message::{derive_key, Envelope, OutboundRecord, PublishMetadata};
pub use self::metrics::ConnectorMetrics;
pub use pipeline::{ExecutionOutcome, PipelineRunner, PipelineStatus};
pub use publisher::{BrokerPublisher, ConnectionState, PublishRequest};
pub use registry::{PipelineFactory, PipelineRegistry};
pub use retry::{RetryConfig, RetryStrategy};
pub use runtime::{init_tracing, wait_for_shutdown, PollerRuntime};
pub use scheduler::{ScheduleState, Scheduler, SchedulerState, SchedulerStatus, SourceStatus};
pub use schema::{SchemaEncoder, SchemaRegistryEncoder};
pub use traits::{PipelineContext, RequestOptions, SourcePipeline};
pub use transport::{
    HttpClient, HttpMethod, HttpRequest, HttpResponse, ReqwestHttpClient, RetryingTransport,
    TransportOptions,
};

// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
