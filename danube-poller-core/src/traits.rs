//! Source pipeline contract.

use crate::auth;
use crate::config::SourceConfig;
use crate::mapping::{FieldMapper, ValidationReport};
use crate::transport::{HttpMethod, HttpRequest, RetryingTransport};
use crate::ConnectorResult;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Extraction and transformation logic for one kind of source.
///
/// Implementations supply `extract` and `transform`; scheduling, the
/// single-flight guard, error handling and publishing are provided by
/// [`PipelineRunner`](crate::PipelineRunner).
///
/// # Example
///
/// ```rust,no_run
/// use async_trait::async_trait;
/// use danube_poller_core::{ConnectorResult, PipelineContext, RequestOptions, SourcePipeline};
/// use serde_json::Value;
///
/// struct Contacts;
///
/// #[async_trait]
/// impl SourcePipeline for Contacts {
///     async fn extract(&self, ctx: &PipelineContext) -> ConnectorResult<Option<Value>> {
///         let body = ctx.make_request("/contacts", RequestOptions::default()).await?;
///         Ok(body.get("results").cloned())
///     }
///
///     async fn transform(&self, raw: Value, ctx: &PipelineContext) -> ConnectorResult<Value> {
///         ctx.normalize(&raw)
///     }
/// }
/// ```
#[async_trait]
pub trait SourcePipeline: Send + Sync {
    /// Fetch raw data from the source.
    ///
    /// Signal "nothing new" with `Ok(None)`, `null` or an empty array rather
    /// than an error.
    async fn extract(&self, ctx: &PipelineContext) -> ConnectorResult<Option<Value>>;

    /// Turn raw data into the records to publish.
    async fn transform(&self, raw: Value, ctx: &PipelineContext) -> ConnectorResult<Value>;

    /// Headers attached to every request made through the context.
    ///
    /// Override for vendor-specific auth schemes.
    fn auth_headers(&self, config: &SourceConfig) -> BTreeMap<String, String> {
        auth::auth_headers(config.auth.as_ref(), &config.name)
    }
}

/// Per-request options for [`PipelineContext::make_request`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub method: HttpMethod,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub timeout_ms: Option<u64>,
}

impl RequestOptions {
    pub fn method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Everything a pipeline may use during one execution.
#[derive(Clone)]
pub struct PipelineContext {
    config: Arc<SourceConfig>,
    transport: RetryingTransport,
    auth_headers: BTreeMap<String, String>,
    mapper: FieldMapper,
}

impl PipelineContext {
    pub fn new(
        config: Arc<SourceConfig>,
        transport: RetryingTransport,
        auth_headers: BTreeMap<String, String>,
    ) -> Self {
        Self {
            config,
            transport,
            auth_headers,
            mapper: FieldMapper,
        }
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub fn auth_headers(&self) -> &BTreeMap<String, String> {
        &self.auth_headers
    }

    /// Join `endpoint` onto the base URL. Absolute URLs are used as-is.
    pub fn url_for(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return endpoint.to_string();
        }

        let base = self.config.base_url.trim_end_matches('/');
        let path = endpoint.trim_start_matches('/');
        if path.is_empty() {
            base.to_string()
        } else {
            format!("{base}/{path}")
        }
    }

    /// Send a request to the source through the retrying transport.
    ///
    /// Caller headers win over auth headers with the same name.
    pub async fn make_request(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> ConnectorResult<Value> {
        let mut request = HttpRequest::new(options.method, self.url_for(endpoint))
            .with_headers(self.auth_headers.clone())
            .with_headers(options.headers);
        request.query = options.query;
        request.body = options.body;
        request.timeout_ms = options.timeout_ms;

        self.transport.request(request).await
    }

    /// Apply the configured mapping schema; pass data through without one.
    pub fn normalize(&self, data: &Value) -> ConnectorResult<Value> {
        match &self.config.mapping {
            Some(schema) if !schema.is_empty() => self.mapper.normalize(data, schema),
            _ => Ok(data.clone()),
        }
    }

    pub fn validate(&self, data: &Value, required_fields: &[String]) -> ValidationReport {
        self.mapper.validate(data, required_fields)
    }
}
