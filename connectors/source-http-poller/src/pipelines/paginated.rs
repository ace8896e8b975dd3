//! Page-number pagination pipeline

use super::{parse_options, select_records};
use async_trait::async_trait;
use danube_poller_core::{
    ConnectorError, ConnectorResult, PipelineContext, RequestOptions, SourceConfig,
    SourcePipeline,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Options of a `paginated` source
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PaginatedOptions {
    pub endpoint: String,
    /// Dotted path to the page's records; the body itself when unset
    pub data_path: Option<String>,
    pub page_param: String,
    pub page_size_param: String,
    pub page_size: u64,
    pub start_page: u64,
    /// Upper bound on pages fetched per execution
    pub max_pages: u64,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
}

impl Default for PaginatedOptions {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            data_path: None,
            page_param: "page".to_string(),
            page_size_param: "per_page".to_string(),
            page_size: 100,
            start_page: 1,
            max_pages: 10,
            query: BTreeMap::new(),
            headers: BTreeMap::new(),
        }
    }
}

/// Walks numbered pages until an empty or short page, or `max_pages`.
pub struct PaginatedPipeline {
    options: PaginatedOptions,
    last_page: u64,
}

impl PaginatedPipeline {
    pub fn new(options: PaginatedOptions) -> ConnectorResult<Self> {
        if options.page_size == 0 || options.max_pages == 0 {
            return Err(ConnectorError::config(
                "page_size and max_pages must be greater than zero",
            ));
        }
        let last_page = options
            .start_page
            .checked_add(options.max_pages - 1)
            .ok_or_else(|| {
                ConnectorError::config(format!(
                    "start_page {} plus max_pages {} overflows the page counter",
                    options.start_page, options.max_pages
                ))
            })?;
        Ok(Self { options, last_page })
    }

    pub fn from_config(config: &SourceConfig) -> ConnectorResult<Self> {
        Self::new(parse_options(config)?)
    }

    fn page_request(&self, page: u64) -> RequestOptions {
        let mut query = self.options.query.clone();
        query.insert(self.options.page_param.clone(), page.to_string());
        query.insert(
            self.options.page_size_param.clone(),
            self.options.page_size.to_string(),
        );

        RequestOptions {
            headers: self.options.headers.clone(),
            query,
            ..RequestOptions::default()
        }
    }
}

#[async_trait]
impl SourcePipeline for PaginatedPipeline {
    async fn extract(&self, ctx: &PipelineContext) -> ConnectorResult<Option<Value>> {
        let mut records = Vec::new();

        for page in self.options.start_page..=self.last_page {
            let body = ctx
                .make_request(&self.options.endpoint, self.page_request(page))
                .await?;

            let items = match select_records(body, self.options.data_path.as_deref()) {
                Some(Value::Array(items)) => items,
                Some(Value::Null) | None => Vec::new(),
                Some(other) => {
                    return Err(ConnectorError::invalid_data(
                        format!("page {page} did not contain a record array"),
                        other.to_string().into_bytes(),
                    ))
                }
            };

            let fetched = items.len() as u64;
            records.extend(items);
            debug!(source = %ctx.config().name, page, fetched, "Fetched page");

            if fetched < self.options.page_size {
                break;
            }
        }

        Ok(Some(Value::Array(records)))
    }

    async fn transform(&self, raw: Value, ctx: &PipelineContext) -> ConnectorResult<Value> {
        ctx.normalize(&raw)
    }
}
