//! Source interface: one opaque `fetch` per external data provider
//!
//! Only the collector for a provider knows the payload shape; a source just
//! moves JSON over the wire and classifies what went wrong.

use async_trait::async_trait;
use ethoscope_resilience::{cache_key, TripsBreaker};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

/// A request to a data provider
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRequest {
    /// JSON-RPC 2.0 call against the endpoint
    JsonRpc { method: String, params: Value },
    /// HTTP GET of a path (and query) relative to the endpoint
    Get { path: String },
}

impl SourceRequest {
    pub fn rpc(method: impl Into<String>, params: Value) -> Self {
        Self::JsonRpc {
            method: method.into(),
            params,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::Get { path: path.into() }
    }

    /// Stable human-readable form, e.g. `eth_getBlockByNumber ["latest",false]`
    pub fn describe(&self) -> String {
        match self {
            Self::JsonRpc { method, params } => match params {
                Value::Null => method.clone(),
                Value::Array(items) if items.is_empty() => method.clone(),
                _ => format!("{} {}", method, params),
            },
            Self::Get { path } => path.clone(),
        }
    }

    pub fn cache_key(&self, namespace: &str) -> String {
        let params = match self {
            Self::JsonRpc { method, params } => json!({ "method": method, "params": params }),
            Self::Get { path } => json!({ "get": path }),
        };
        cache_key(namespace, &params)
    }
}

/// Why a fetch failed
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SourceFault {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The endpoint answered with a JSON-RPC error object
    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl TripsBreaker for SourceFault {
    fn trips_breaker(&self) -> bool {
        matches!(
            self,
            SourceFault::Network(_) | SourceFault::Timeout(_) | SourceFault::Status { .. }
        )
    }
}

/// Trait for fetching from an external provider (allows mocking in tests)
#[async_trait]
pub trait Source: Send + Sync {
    /// Endpoint this source talks to (for logs)
    fn endpoint(&self) -> &str;

    async fn fetch(&self, request: &SourceRequest) -> Result<Value, SourceFault>;
}

/// HTTP source backed by a shared, injected `reqwest::Client`
#[derive(Debug)]
pub struct HttpSource {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    next_id: AtomicU64,
}

impl HttpSource {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            next_id: AtomicU64::new(1),
        }
    }

    fn classify(&self, err: reqwest::Error) -> SourceFault {
        if err.is_timeout() {
            SourceFault::Timeout(self.timeout)
        } else if err.is_decode() {
            SourceFault::Malformed(err.to_string())
        } else {
            SourceFault::Network(err.to_string())
        }
    }

    async fn read_json(&self, response: reqwest::Response) -> Result<Value, SourceFault> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown".to_string());
            return Err(SourceFault::Status {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let bytes = response.bytes().await.map_err(|e| self.classify(e))?;
        serde_json::from_slice(&bytes).map_err(|e| SourceFault::Malformed(e.to_string()))
    }
}

#[async_trait]
impl Source for HttpSource {
    fn endpoint(&self) -> &str {
        &self.base_url
    }

    #[instrument(skip(self, request), fields(endpoint = %self.base_url, request = %request.describe()))]
    async fn fetch(&self, request: &SourceRequest) -> Result<Value, SourceFault> {
        match request {
            SourceRequest::JsonRpc { method, params } => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let body = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "method": method,
                    "params": params,
                });

                let response = self
                    .client
                    .post(&self.base_url)
                    .timeout(self.timeout)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| self.classify(e))?;

                let payload = self.read_json(response).await?;
                unwrap_rpc_result(payload)
            }
            SourceRequest::Get { path } => {
                let url = format!("{}{}", self.base_url, path);
                debug!("GET {}", url);

                let response = self
                    .client
                    .get(&url)
                    .timeout(self.timeout)
                    .header("accept", "application/json")
                    .send()
                    .await
                    .map_err(|e| self.classify(e))?;

                self.read_json(response).await
            }
        }
    }
}

/// Extract `result` from a JSON-RPC response envelope
pub fn unwrap_rpc_result(mut payload: Value) -> Result<Value, SourceFault> {
    if let Some(error) = payload.get("error").filter(|e| !e.is_null()) {
        return Err(SourceFault::Rpc {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }

    match payload.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(SourceFault::Malformed(
            "JSON-RPC response has neither result nor error".to_string(),
        )),
    }
}

/// Mock source for testing
///
/// Responses are keyed by [`SourceRequest::describe`]. Clones share state, so a
/// test can keep a handle after handing the source to a collector.
#[derive(Clone)]
pub struct MockSource {
    endpoint: String,
    responses: Arc<Mutex<HashMap<String, Result<Value, SourceFault>>>>,
    delay: Arc<Mutex<Duration>>,
    calls: Arc<AtomicUsize>,
    log: Arc<Mutex<Vec<String>>>,
}

impl Default for MockSource {
    fn default() -> Self {
        Self::new("mock://source")
    }
}

impl MockSource {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            responses: Arc::new(Mutex::new(HashMap::new())),
            delay: Arc::new(Mutex::new(Duration::ZERO)),
            calls: Arc::new(AtomicUsize::new(0)),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_response(self, request: &str, value: Value) -> Self {
        self.set_response(request, value);
        self
    }

    pub fn with_fault(self, request: &str, fault: SourceFault) -> Self {
        self.set_fault(request, fault);
        self
    }

    /// Every fetch sleeps this long before answering
    pub fn with_delay(self, delay: Duration) -> Self {
        self.set_delay(delay);
        self
    }

    pub fn set_response(&self, request: &str, value: Value) {
        self.responses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(request.to_string(), Ok(value));
    }

    pub fn set_fault(&self, request: &str, fault: SourceFault) {
        self.responses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(request.to_string(), Err(fault));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(|p| p.into_inner()) = delay;
    }

    /// Total number of fetches that reached the source
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of fetches for one request key
    pub fn calls_for(&self, request: &str) -> usize {
        self.log
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|r| r.as_str() == request)
            .count()
    }
}

#[async_trait]
impl Source for MockSource {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn fetch(&self, request: &SourceRequest) -> Result<Value, SourceFault> {
        let key = request.describe();
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(key.clone());

        let delay = *self.delay.lock().unwrap_or_else(|p| p.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let response = self
            .responses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&key)
            .cloned();

        response.unwrap_or_else(|| {
            Err(SourceFault::Network(format!("No mock response for: {}", key)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_is_stable() {
        let latest = SourceRequest::rpc("eth_getBlockByNumber", json!(["latest", false]));
        assert_eq!(latest.describe(), r#"eth_getBlockByNumber ["latest",false]"#);

        let gas = SourceRequest::rpc("eth_gasPrice", json!([]));
        assert_eq!(gas.describe(), "eth_gasPrice");

        let get = SourceRequest::get("/relay/v1/data/bidtraces/proposer_payload_delivered?limit=100");
        assert!(get.describe().starts_with("/relay/v1"));
    }

    #[test]
    fn test_fault_classification() {
        assert!(SourceFault::Network("reset".into()).trips_breaker());
        assert!(SourceFault::Timeout(Duration::from_secs(5)).trips_breaker());
        assert!(SourceFault::Status { status: 503, body: String::new() }.trips_breaker());
        assert!(!SourceFault::Malformed("missing number".into()).trips_breaker());
        assert!(!SourceFault::Rpc { code: -32601, message: "method not found".into() }.trips_breaker());
    }

    #[test]
    fn test_unwrap_rpc_result() {
        let ok = unwrap_rpc_result(json!({"jsonrpc": "2.0", "id": 1, "result": "0x10"})).unwrap();
        assert_eq!(ok, json!("0x10"));

        let err = unwrap_rpc_result(json!({
            "jsonrpc": "2.0", "id": 1,
            "error": {"code": -32601, "message": "method not found"}
        }))
        .unwrap_err();
        assert_eq!(
            err,
            SourceFault::Rpc { code: -32601, message: "method not found".to_string() }
        );

        assert!(matches!(
            unwrap_rpc_result(json!({"id": 1})),
            Err(SourceFault::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_mock_source() {
        let source = MockSource::new("mock://mainnet")
            .with_response("eth_gasPrice", json!("0x4a817c800"))
            .with_fault("eth_chainId", SourceFault::Status { status: 500, body: "boom".into() });

        let gas = source
            .fetch(&SourceRequest::rpc("eth_gasPrice", json!([])))
            .await
            .unwrap();
        assert_eq!(gas, json!("0x4a817c800"));

        let chain = source.fetch(&SourceRequest::rpc("eth_chainId", json!([]))).await;
        assert!(matches!(chain, Err(SourceFault::Status { status: 500, .. })));

        let missing = source.fetch(&SourceRequest::rpc("eth_syncing", json!([]))).await;
        assert!(matches!(missing, Err(SourceFault::Network(_))));

        assert_eq!(source.call_count(), 3);
        assert_eq!(source.calls_for("eth_gasPrice"), 1);
    }
}
