//! Single-request REST pipeline

use super::{parse_options, select_records};
use async_trait::async_trait;
use danube_poller_core::{
    ConnectorError, ConnectorResult, HttpMethod, PipelineContext, RequestOptions, SourceConfig,
    SourcePipeline,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Options of a `rest` source
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RestOptions {
    /// Path appended to the source's base URL
    pub endpoint: String,
    pub method: HttpMethod,
    /// Dotted path to the records inside the response body
    pub data_path: Option<String>,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    /// Per-request timeout override
    pub timeout_ms: Option<u64>,
    /// Fields every normalized record must carry
    pub required_fields: Vec<String>,
}

/// Polls one endpoint per tick and publishes the records it returns.
pub struct RestPipeline {
    options: RestOptions,
}

impl RestPipeline {
    pub fn new(options: RestOptions) -> Self {
        Self { options }
    }

    pub fn from_config(config: &SourceConfig) -> ConnectorResult<Self> {
        Ok(Self::new(parse_options(config)?))
    }

    fn request_options(&self) -> RequestOptions {
        RequestOptions {
            method: self.options.method,
            headers: self.options.headers.clone(),
            query: self.options.query.clone(),
            body: self.options.body.clone(),
            timeout_ms: self.options.timeout_ms,
        }
    }
}

#[async_trait]
impl SourcePipeline for RestPipeline {
    async fn extract(&self, ctx: &PipelineContext) -> ConnectorResult<Option<Value>> {
        let body = ctx
            .make_request(&self.options.endpoint, self.request_options())
            .await?;

        let records = select_records(body, self.options.data_path.as_deref());
        if records.is_none() {
            debug!(
                source = %ctx.config().name,
                data_path = ?self.options.data_path,
                "Response has no records at data path"
            );
        }
        Ok(records)
    }

    async fn transform(&self, raw: Value, ctx: &PipelineContext) -> ConnectorResult<Value> {
        let normalized = ctx.normalize(&raw)?;

        if !self.options.required_fields.is_empty() {
            let report = ctx.validate(&normalized, &self.options.required_fields);
            if !report.valid {
                return Err(ConnectorError::invalid_data(
                    format!("records missing required fields: {}", report.missing.join(", ")),
                    Vec::new(),
                ));
            }
        }

        Ok(normalized)
    }
}
