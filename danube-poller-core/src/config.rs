//! Configuration management for the poller.

use crate::mapping::MappingSchema;
use crate::retry::RetryConfig;
use crate::transport::TransportOptions;
use crate::{ConnectorError, ConnectorResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::env;
use std::path::Path;
use std::time::Duration;

/// Main configuration for the poller process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Connector name, used as the default producer name prefix
    pub connector_name: String,

    /// Log level used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Broker connection settings
    pub broker: BrokerConfig,

    /// Outbound HTTP settings shared by all sources
    #[serde(default)]
    pub transport: TransportSettings,

    /// Schema registry; envelopes are sent as plain JSON when absent
    #[serde(default)]
    pub schema_registry: Option<SchemaRegistrySettings>,

    /// Scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerSettings,

    /// Ordered list of polled sources
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl PollerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> ConnectorResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConnectorError::config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_toml(&content).map_err(|e| {
            ConnectorError::config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> ConnectorResult<Self> {
        toml::from_str(content).map_err(|e| ConnectorError::config(e.to_string()))
    }

    /// Apply environment variable overrides
    ///
    /// Environment variables:
    /// - `DANUBE_SERVICE_URL`: replaces the broker list with a single URL
    /// - `CONNECTOR_NAME`: connector name
    /// - `LOG_LEVEL`: log level
    /// - `HTTP_TIMEOUT_MS`: default request timeout
    /// - `HTTP_MAX_RETRIES`: retry cap for outbound requests
    /// - `HTTP_RETRY_BASE_DELAY_MS`: backoff base delay
    /// - `SCHEMA_REGISTRY_URL`: enables or relocates the schema registry
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("DANUBE_SERVICE_URL") {
            self.broker.brokers = vec![val];
        }
        if let Ok(val) = env::var("CONNECTOR_NAME") {
            self.connector_name = val;
        }
        if let Ok(val) = env::var("LOG_LEVEL") {
            self.log_level = val;
        }
        if let Ok(val) = env::var("HTTP_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                self.transport.timeout_ms = n;
            }
        }
        if let Ok(val) = env::var("HTTP_MAX_RETRIES") {
            if let Ok(n) = val.parse() {
                self.transport.max_retries = n;
            }
        }
        if let Ok(val) = env::var("HTTP_RETRY_BASE_DELAY_MS") {
            if let Ok(n) = val.parse() {
                self.transport.base_delay_ms = n;
            }
        }
        if let Ok(val) = env::var("SCHEMA_REGISTRY_URL") {
            match self.schema_registry.as_mut() {
                Some(registry) => registry.url = val,
                None => {
                    self.schema_registry = Some(SchemaRegistrySettings {
                        url: val,
                        ..SchemaRegistrySettings::default()
                    })
                }
            }
        }
    }

    /// Validate process-wide settings.
    ///
    /// Per-source problems are not reported here; they drop only the
    /// offending source when pipelines are created.
    pub fn validate(&self) -> ConnectorResult<()> {
        if self.connector_name.is_empty() {
            return Err(ConnectorError::config("connector_name cannot be empty"));
        }

        self.broker.validate()?;

        if self.transport.max_retries > 100 {
            return Err(ConnectorError::config("max_retries too high (max 100)"));
        }

        if let Some(registry) = &self.schema_registry {
            if registry.url.is_empty() {
                return Err(ConnectorError::config("schema_registry.url cannot be empty"));
            }
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.name.as_str()) {
                return Err(ConnectorError::config(format!(
                    "Duplicate source name: {}",
                    source.name
                )));
            }
        }

        Ok(())
    }
}

/// Broker backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    #[default]
    Danube,
    /// In-process broker that keeps and logs records (dry run)
    Memory,
}

/// Broker connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub kind: BrokerKind,

    /// Broker service URLs; the first one is used to connect
    #[serde(default)]
    pub brokers: Vec<String>,

    /// Client id, used as the producer name prefix
    pub client_id: String,

    /// Broker client log level
    #[serde(default)]
    pub log_level: Option<String>,

    #[serde(default)]
    pub retry: BrokerRetrySettings,

    #[serde(default)]
    pub producer: ProducerSettings,
}

impl BrokerConfig {
    pub fn validate(&self) -> ConnectorResult<()> {
        if self.kind == BrokerKind::Danube && self.brokers.is_empty() {
            return Err(ConnectorError::config("broker.brokers cannot be empty"));
        }

        if self.client_id.is_empty() {
            return Err(ConnectorError::config("broker.client_id cannot be empty"));
        }

        if self.producer.max_in_flight_requests == 0 {
            return Err(ConnectorError::config(
                "broker.producer.max_in_flight_requests must be > 0",
            ));
        }

        Ok(())
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Danube,
            brokers: vec!["http://localhost:6650".to_string()],
            client_id: "danube-http-poller".to_string(),
            log_level: None,
            retry: BrokerRetrySettings::default(),
            producer: ProducerSettings::default(),
        }
    }
}

/// Retry policy for broker operations
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BrokerRetrySettings {
    #[serde(default = "default_initial_retry_time_ms")]
    pub initial_retry_time_ms: u64,
    #[serde(default = "default_broker_retries")]
    pub retries: u32,
}

fn default_initial_retry_time_ms() -> u64 {
    300
}

fn default_broker_retries() -> u32 {
    5
}

impl BrokerRetrySettings {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.retries, self.initial_retry_time_ms)
    }
}

impl Default for BrokerRetrySettings {
    fn default() -> Self {
        Self {
            initial_retry_time_ms: default_initial_retry_time_ms(),
            retries: default_broker_retries(),
        }
    }
}

/// Partitioner selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partitioner {
    #[default]
    Default,
    Legacy,
}

/// Producer options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerSettings {
    #[serde(default)]
    pub partitioner: Partitioner,

    /// Upper bound on concurrent sends through the shared connection
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_requests: usize,

    /// Use reliable dispatch (WAL + cloud persistence) for every producer
    #[serde(default)]
    pub idempotent: bool,

    /// Prefix for producer names; falls back to `client_id`
    #[serde(default)]
    pub transactional_id: Option<String>,

    /// Number of partitions for created topics (0 = non-partitioned)
    #[serde(default)]
    pub partitions: usize,
}

fn default_max_in_flight() -> usize {
    5
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            partitioner: Partitioner::Default,
            max_in_flight_requests: default_max_in_flight(),
            idempotent: false,
            transactional_id: None,
            partitions: 0,
        }
    }
}

/// Outbound HTTP settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_user_agent() -> String {
    format!("danube-http-poller/{}", crate::VERSION)
}

impl TransportSettings {
    pub fn options(&self) -> TransportOptions {
        TransportOptions {
            timeout: Duration::from_millis(self.timeout_ms),
            retry: RetryConfig::new(self.max_retries, self.base_delay_ms),
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            user_agent: default_user_agent(),
        }
    }
}

/// Schema registry connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaRegistrySettings {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default = "default_registry_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_registry_timeout_ms() -> u64 {
    5000
}

impl Default for SchemaRegistrySettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:8081".to_string(),
            username: None,
            password: None,
            timeout_ms: default_registry_timeout_ms(),
        }
    }
}

/// Scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Interval for sources that do not set one
    #[serde(default = "default_interval_ms")]
    pub default_interval_ms: u64,
    /// How long `stop()` waits for in-flight executions before disconnecting
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_interval_ms() -> u64 {
    60_000
}

fn default_shutdown_grace_ms() -> u64 {
    30_000
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            default_interval_ms: default_interval_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// Authentication descriptor for a source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AuthConfig {
    Bearer {
        token: String,
    },
    #[serde(rename = "apikey")]
    ApiKey {
        key: String,
        #[serde(default = "default_api_key_header")]
        header: String,
    },
    Basic {
        username: String,
        password: String,
    },
    #[serde(other)]
    Unknown,
}

fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}

/// One polled source. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Unique source name
    pub name: String,

    /// Selects the pipeline implementation
    #[serde(rename = "type")]
    pub source_type: String,

    pub base_url: String,

    #[serde(default)]
    pub auth: Option<AuthConfig>,

    /// Poll interval; the scheduler default applies when unset
    #[serde(default)]
    pub interval_ms: Option<u64>,

    /// Fixed delay before the first poll
    #[serde(default)]
    pub startup_delay_ms: Option<u64>,

    /// Target topic; defaults to `/default/<type>-<name>`
    #[serde(default)]
    pub topic: Option<String>,

    /// Schema subject override for registry encoding
    #[serde(default)]
    pub subject: Option<String>,

    /// Field-mapping schema applied by `normalize`
    #[serde(default)]
    pub mapping: Option<MappingSchema>,

    /// Type-specific settings
    #[serde(default)]
    pub options: Map<String, Value>,
}

impl SourceConfig {
    pub fn new(
        name: impl Into<String>,
        source_type: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source_type: source_type.into(),
            base_url: base_url.into(),
            auth: None,
            interval_ms: None,
            startup_delay_ms: None,
            topic: None,
            subject: None,
            mapping: None,
            options: Map::new(),
        }
    }

    /// Target topic for this source
    pub fn topic(&self) -> String {
        self.topic
            .clone()
            .unwrap_or_else(|| format!("/default/{}-{}", self.source_type, self.name))
    }

    /// Effective poll interval
    pub fn interval(&self, default_ms: u64) -> Duration {
        Duration::from_millis(self.interval_ms.unwrap_or(default_ms))
    }

    pub fn startup_delay(&self) -> Option<Duration> {
        self.startup_delay_ms.map(Duration::from_millis)
    }

    /// Look up a type-specific option as a string
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }

    /// Look up a type-specific option as an unsigned integer
    pub fn option_u64(&self, key: &str) -> Option<u64> {
        self.options.get(key).and_then(Value::as_u64)
    }

    /// Validate fields every pipeline relies on
    pub fn validate(&self) -> ConnectorResult<()> {
        if self.name.is_empty() {
            return Err(ConnectorError::config("source name cannot be empty"));
        }
        if self.source_type.is_empty() {
            return Err(ConnectorError::config(format!(
                "source '{}' has an empty type",
                self.name
            )));
        }
        if self.base_url.is_empty() {
            return Err(ConnectorError::config(format!(
                "source '{}' has an empty base_url",
                self.name
            )));
        }
        if self.interval_ms == Some(0) {
            return Err(ConnectorError::config(format!(
                "source '{}' has a zero interval",
                self.name
            )));
        }
        Ok(())
    }
}
