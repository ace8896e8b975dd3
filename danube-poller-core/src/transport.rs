//! Outbound HTTP with timeout, exponential-backoff retry and error normalization.
//!
//! [`HttpClient`] is the seam to the wire; [`ReqwestHttpClient`] is the
//! production implementation. [`RetryingTransport`] wraps any client and is
//! what pipelines call.

use crate::classifier::classify;
use crate::error::{ConnectorError, ConnectorResult, ErrorCode};
use crate::retry::{RetryConfig, RetryStrategy};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error as _;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// HTTP methods used by source pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// A single outbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: Option<Value>,
    /// Overrides the transport default when set
    pub timeout_ms: Option<u64>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: None,
            timeout_ms: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Raw response as seen on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Wire-level HTTP client.
///
/// Implementations report network failures as [`ConnectorError::Transport`]
/// and return every received response, whatever its status.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, request: HttpRequest, timeout: Duration)
        -> ConnectorResult<HttpResponse>;
}

/// Production client backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new(user_agent: &str) -> ConnectorResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| ConnectorError::fatal_with_source("Failed to build HTTP client", e))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn execute(
        &self,
        request: HttpRequest,
        timeout: Duration,
    ) -> ConnectorResult<HttpResponse> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.client.request(method, &request.url).timeout(timeout);

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            ConnectorError::transport(code_for(&e), format!("request failed: {e}"))
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            ConnectorError::transport(code_for(&e), format!("failed to read response body: {e}"))
        })?;

        Ok(HttpResponse { status, body })
    }
}

/// Map a reqwest failure onto a low-level network code.
fn code_for(err: &reqwest::Error) -> ErrorCode {
    if err.is_timeout() {
        return ErrorCode::TimedOut;
    }

    let mut current = err.source();
    while let Some(cause) = current {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::ConnectionRefused => return ErrorCode::ConnectionRefused,
                io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                    return ErrorCode::ConnectionReset
                }
                io::ErrorKind::TimedOut => return ErrorCode::TimedOut,
                _ => {}
            }
        }

        let text = cause.to_string().to_lowercase();
        if text.contains("temporary failure in name resolution") || text.contains("try again") {
            return ErrorCode::DnsRetry;
        }
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return ErrorCode::HostNotFound;
        }
        current = cause.source();
    }

    if err.is_connect() {
        ErrorCode::ConnectionRefused
    } else {
        ErrorCode::Other("EREQUEST".to_string())
    }
}

/// Transport tuning shared by every pipeline.
#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    pub timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(30_000),
            retry: RetryConfig::default(),
        }
    }
}

/// Issues requests with timeout and retry, returning decoded JSON bodies.
///
/// Callers only ever see [`ConnectorError::Http`] failures.
#[derive(Clone)]
pub struct RetryingTransport {
    client: Arc<dyn HttpClient>,
    timeout: Duration,
    retry: RetryStrategy,
}

impl RetryingTransport {
    pub fn new(client: Arc<dyn HttpClient>, options: TransportOptions) -> Self {
        Self {
            client,
            timeout: options.timeout,
            retry: RetryStrategy::new(options.retry),
        }
    }

    /// Send `request`, retrying recoverable failures with exponential backoff.
    pub async fn request(&self, request: HttpRequest) -> ConnectorResult<Value> {
        let timeout = request
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.timeout);
        let mut attempt = 0;

        loop {
            debug!(
                method = request.method.as_str(),
                url = %request.url,
                attempt,
                "Sending request"
            );

            let result = self
                .client
                .execute(request.clone(), timeout)
                .await
                .and_then(decode);

            match result {
                Ok(body) => {
                    if attempt > 0 {
                        info!(
                            url = %request.url,
                            retries = attempt,
                            "Request succeeded after retries"
                        );
                    }
                    return Ok(body);
                }
                Err(e) if classify(&e).recoverable && self.retry.should_retry(attempt) => {
                    let backoff = self.retry.calculate_backoff(attempt);
                    warn!(
                        url = %request.url,
                        attempt = attempt + 1,
                        max_retries = self.retry.config().max_retries,
                        "Retrying request after {:?}: {}",
                        backoff,
                        e
                    );
                    metrics::counter!("poller_http_retries_total").increment(1);

                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into_http()),
            }
        }
    }
}

/// Strip the response envelope, keeping only the decoded body.
fn decode(response: HttpResponse) -> ConnectorResult<Value> {
    if !response.is_success() {
        return Err(ConnectorError::http(
            response.status,
            format!(
                "request returned status {}: {}",
                response.status,
                snippet(&response.body)
            ),
        ));
    }

    if response.body.trim().is_empty() {
        return Ok(Value::Null);
    }

    serde_json::from_str(&response.body).map_err(|e| ConnectorError::Http {
        status: response.status,
        message: format!("malformed response body: {e}"),
        source: Some(Box::new(ConnectorError::invalid_data(
            e.to_string(),
            response.body.into_bytes(),
        ))),
    })
}

fn snippet(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Client replaying a fixed script of results.
    pub(crate) struct ScriptedClient {
        script: Mutex<VecDeque<ConnectorResult<HttpResponse>>>,
        pub calls: Mutex<Vec<(Instant, HttpRequest, Duration)>>,
    }

    impl ScriptedClient {
        pub(crate) fn new(script: Vec<ConnectorResult<HttpResponse>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl HttpClient for ScriptedClient {
        async fn execute(
            &self,
            request: HttpRequest,
            timeout: Duration,
        ) -> ConnectorResult<HttpResponse> {
            self.calls
                .lock()
                .unwrap()
                .push((Instant::now(), request, timeout));
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(HttpResponse::new(200, "null")))
        }
    }

    fn transport(client: Arc<ScriptedClient>, max_retries: u32) -> RetryingTransport {
        RetryingTransport::new(
            client,
            TransportOptions {
                timeout: Duration::from_secs(30),
                retry: RetryConfig::new(max_retries, 1000),
            },
        )
    }

    #[tokio::test]
    async fn test_success_returns_decoded_body() {
        let client = ScriptedClient::new(vec![Ok(HttpResponse::new(200, r#"{"items":[1,2]}"#))]);
        let body = transport(client.clone(), 3)
            .request(HttpRequest::get("http://api.test/items"))
            .await
            .unwrap();

        assert_eq!(body, json!({"items": [1, 2]}));
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn test_timeout_override_is_passed_down() {
        let client = ScriptedClient::new(vec![]);
        transport(client.clone(), 0)
            .request(HttpRequest::get("http://api.test").with_timeout_ms(250))
            .await
            .unwrap();

        let calls = client.calls.lock().unwrap();
        assert_eq!(calls[0].2, Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_exact_exponential_delays() {
        let client = ScriptedClient::new(vec![
            Err(ConnectorError::transport(ErrorCode::ConnectionReset, "reset")),
            Ok(HttpResponse::new(503, "busy")),
            Ok(HttpResponse::new(429, "slow down")),
            Ok(HttpResponse::new(200, "[1]")),
        ]);

        let body = transport(client.clone(), 3)
            .request(HttpRequest::get("http://api.test"))
            .await
            .unwrap();
        assert_eq!(body, json!([1]));

        let calls = client.calls.lock().unwrap();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[1].0 - calls[0].0, Duration::from_millis(1000));
        assert_eq!(calls[2].0 - calls[1].0, Duration::from_millis(2000));
        assert_eq!(calls[3].0 - calls[2].0, Duration::from_millis(4000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_cap_and_wraps_as_http() {
        let client = ScriptedClient::new(
            (0..10)
                .map(|_| Err(ConnectorError::transport(ErrorCode::TimedOut, "deadline")))
                .collect(),
        );

        let err = transport(client.clone(), 3)
            .request(HttpRequest::get("http://api.test"))
            .await
            .unwrap_err();

        assert_eq!(client.call_count(), 4);
        assert!(err.is_http_error());
        assert_eq!(err.status_code(), Some(500));
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let client = ScriptedClient::new(vec![Ok(HttpResponse::new(404, "nope"))]);

        let err = transport(client.clone(), 3)
            .request(HttpRequest::get("http://api.test"))
            .await
            .unwrap_err();

        assert_eq!(client.call_count(), 1);
        assert_eq!(err.status_code(), Some(404));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_malformed_body_is_permanent() {
        let client = ScriptedClient::new(vec![Ok(HttpResponse::new(200, "{not json"))]);

        let err = transport(client.clone(), 3)
            .request(HttpRequest::get("http://api.test"))
            .await
            .unwrap_err();

        assert_eq!(client.call_count(), 1);
        assert!(err.is_http_error());
        assert!(!err.is_retryable());
    }

    /// Real reqwest client that counts attempts.
    struct CountingClient {
        inner: ReqwestHttpClient,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl HttpClient for CountingClient {
        async fn execute(
            &self,
            request: HttpRequest,
            timeout: Duration,
        ) -> ConnectorResult<HttpResponse> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.execute(request, timeout).await
        }
    }

    // Port 1 is reserved and nothing listens on it locally.
    const REFUSING_URL: &str = "http://127.0.0.1:1/items";

    #[tokio::test]
    async fn test_reqwest_maps_refused_connection() {
        let client = ReqwestHttpClient::new("poller-test").unwrap();
        let err = client
            .execute(HttpRequest::get(REFUSING_URL), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), Some(&ErrorCode::ConnectionRefused));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_refused_connection_is_retried() {
        let client = Arc::new(CountingClient {
            inner: ReqwestHttpClient::new("poller-test").unwrap(),
            calls: Default::default(),
        });
        let transport = RetryingTransport::new(
            client.clone(),
            TransportOptions {
                timeout: Duration::from_secs(5),
                retry: RetryConfig::new(2, 10),
            },
        );

        let err = transport
            .request(HttpRequest::get(REFUSING_URL))
            .await
            .unwrap_err();

        assert_eq!(client.calls.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(err.status_code(), Some(500));

        match &err {
            ConnectorError::Http {
                source: Some(cause),
                ..
            } => assert_eq!(cause.error_code(), Some(&ErrorCode::ConnectionRefused)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_empty_body_decodes_to_null() {
        let client = ScriptedClient::new(vec![Ok(HttpResponse::new(204, ""))]);
        let body = transport(client, 0)
            .request(HttpRequest::get("http://api.test"))
            .await
            .unwrap();
        assert_eq!(body, Value::Null);
    }
}
