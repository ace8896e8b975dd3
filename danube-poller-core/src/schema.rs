//! Optional schema-registry encoding of outgoing envelopes.
//!
//! [`SchemaRegistryEncoder`] talks to a Confluent-compatible registry,
//! validates envelopes against the latest JSON Schema of a subject and frames
//! them in the registry wire format:
//!
//! ```text
//! | 0x00 | schema id (u32, big endian) | JSON bytes |
//! ```

use crate::config::SchemaRegistrySettings;
use crate::{ConnectorError, ConnectorResult};
use async_trait::async_trait;
use jsonschema::JSONSchema;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Magic byte opening every registry-framed message.
pub const MAGIC_BYTE: u8 = 0;

/// Encodes an envelope against a schema subject.
#[async_trait]
pub trait SchemaEncoder: Send + Sync {
    async fn encode(&self, subject: &str, envelope: &Value) -> ConnectorResult<Vec<u8>>;
}

/// A compiled schema version.
struct RegisteredSchema {
    id: u32,
    version: i32,
    validator: JSONSchema,
}

#[derive(Deserialize)]
struct SchemaVersionResponse {
    id: u32,
    version: i32,
    schema: String,
    #[serde(rename = "schemaType", default = "default_schema_type")]
    schema_type: String,
}

fn default_schema_type() -> String {
    "AVRO".to_string()
}

/// Registry-backed JSON Schema encoder with a per-subject cache.
pub struct SchemaRegistryEncoder {
    client: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    cache: RwLock<HashMap<String, Arc<RegisteredSchema>>>,
}

impl SchemaRegistryEncoder {
    pub fn new(settings: &SchemaRegistrySettings) -> ConnectorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .map_err(|e| {
                ConnectorError::fatal_with_source("Failed to build schema registry client", e)
            })?;

        Ok(Self {
            client,
            base_url: settings.url.trim_end_matches('/').to_string(),
            username: settings.username.clone(),
            password: settings.password.clone(),
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Register a schema without contacting the registry.
    pub async fn register_local(
        &self,
        subject: impl Into<String>,
        id: u32,
        schema: &Value,
    ) -> ConnectorResult<()> {
        let subject = subject.into();
        let validator = compile(&subject, schema)?;
        self.cache.write().await.insert(
            subject,
            Arc::new(RegisteredSchema {
                id,
                version: 0,
                validator,
            }),
        );
        Ok(())
    }

    async fn schema_for(&self, subject: &str) -> ConnectorResult<Arc<RegisteredSchema>> {
        if let Some(schema) = self.cache.read().await.get(subject) {
            return Ok(Arc::clone(schema));
        }

        let fetched = Arc::new(self.fetch_latest(subject).await?);
        info!(
            subject,
            schema_id = fetched.id,
            version = fetched.version,
            "Loaded schema from registry"
        );

        self.cache
            .write()
            .await
            .insert(subject.to_string(), Arc::clone(&fetched));
        Ok(fetched)
    }

    async fn fetch_latest(&self, subject: &str) -> ConnectorResult<RegisteredSchema> {
        let url = format!("{}/subjects/{}/versions/latest", self.base_url, subject);
        debug!(url = %url, "Fetching latest schema version");

        let mut request = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.schemaregistry.v1+json");
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_ref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| encoding_error(subject, format!("registry request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(encoding_error(
                subject,
                format!("registry returned status {}", response.status()),
            ));
        }

        let body: SchemaVersionResponse = response
            .json()
            .await
            .map_err(|e| encoding_error(subject, format!("invalid registry response: {e}")))?;

        if !body.schema_type.eq_ignore_ascii_case("JSON") {
            return Err(encoding_error(
                subject,
                format!("unsupported schema type {}", body.schema_type),
            ));
        }

        let schema: Value = serde_json::from_str(&body.schema)
            .map_err(|e| encoding_error(subject, format!("schema is not valid JSON: {e}")))?;

        Ok(RegisteredSchema {
            id: body.id,
            version: body.version,
            validator: compile(subject, &schema)?,
        })
    }
}

#[async_trait]
impl SchemaEncoder for SchemaRegistryEncoder {
    async fn encode(&self, subject: &str, envelope: &Value) -> ConnectorResult<Vec<u8>> {
        let schema = self.schema_for(subject).await?;

        if let Err(errors) = schema.validator.validate(envelope) {
            let reasons: Vec<String> = errors.map(|e| e.to_string()).collect();
            return Err(encoding_error(
                subject,
                format!("envelope does not match schema: {}", reasons.join("; ")),
            ));
        }

        let body = serde_json::to_vec(envelope)?;
        Ok(frame(schema.id, &body))
    }
}

fn compile(subject: &str, schema: &Value) -> ConnectorResult<JSONSchema> {
    JSONSchema::compile(schema)
        .map_err(|e| encoding_error(subject, format!("schema does not compile: {e}")))
}

fn encoding_error(subject: &str, message: impl Into<String>) -> ConnectorError {
    ConnectorError::SchemaEncoding {
        subject: subject.to_string(),
        message: message.into(),
    }
}

/// Prefix `body` with the registry wire header.
pub fn frame(schema_id: u32, body: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(body.len() + 5);
    framed.push(MAGIC_BYTE);
    framed.extend_from_slice(&schema_id.to_be_bytes());
    framed.extend_from_slice(body);
    framed
}
