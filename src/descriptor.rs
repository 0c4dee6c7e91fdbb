//! Data model: request/function descriptors, items, attempt records, and
//! item/gateway results.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol for a request descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    /// Default port for this protocol (80/443).
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Http => 80,
            Protocol::Https => 443,
        }
    }
}

/// HTTP method for a request descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

/// An immutable-once-dispatched HTTP request descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub protocol: Protocol,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
    pub method: Method,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub query: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

impl RequestDescriptor {
    pub fn builder(host: impl Into<String>, path: impl Into<String>) -> RequestDescriptorBuilder {
        RequestDescriptorBuilder::new(host, path)
    }

    /// `<protocol>://<hostname>:<port>`, port defaulted per
    /// protocol when absent.
    pub fn base_url(&self) -> String {
        let scheme = match self.protocol {
            Protocol::Http => "http",
            Protocol::Https => "https",
        };
        let port = self.port.unwrap_or_else(|| self.protocol.default_port());
        format!("{scheme}://{}:{port}", self.host)
    }

    /// Full URL including path and normalized (sorted) query string.
    pub fn full_url(&self) -> String {
        let mut url = format!("{}{}", self.base_url(), self.path);
        if !self.query.is_empty() {
            let mut pairs: Vec<(&String, &String)> = self.query.iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(b.0));
            let qs = pairs
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("&");
            url.push('?');
            url.push_str(&qs);
        }
        url
    }
}

/// Staged builder for [`RequestDescriptor`] (spec §3.1 builder ergonomics).
pub struct RequestDescriptorBuilder {
    protocol: Protocol,
    host: String,
    port: Option<u16>,
    path: String,
    method: Method,
    headers: HashMap<String, String>,
    query: HashMap<String, String>,
    body: Option<Value>,
}

impl RequestDescriptorBuilder {
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            protocol: Protocol::Https,
            host: host.into(),
            port: None,
            path: path.into(),
            method: Method::Get,
            headers: HashMap::new(),
            query: HashMap::new(),
            body: None,
        }
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn method(mut self, method: Method) -> Self {
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

    pub fn build(self) -> RequestDescriptor {
        RequestDescriptor {
            protocol: self.protocol,
            host: self.host,
            port: self.port,
            path: self.path,
            method: self.method,
            headers: self.headers,
            query: self.query,
            body: self.body,
        }
    }
}

/// An opaque callable handle treated as a black box by the attempt loop.
/// The function body lives behind the `call` closure; `identity` is used
/// for cache fingerprinting and `cacheable` opts functions into the cache
/// policy (disabled by default, step 2).
#[derive(Clone)]
pub struct FunctionDescriptor {
    pub identity: String,
    pub args: Value,
    pub cacheable: bool,
    pub call: std::sync::Arc<
        dyn Fn(Value) -> futures::future::BoxFuture<'static, crate::error::StableResult<Value>>
            + Send
            + Sync,
    >,
}

impl std::fmt::Debug for FunctionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionDescriptor")
            .field("identity", &self.identity)
            .field("args", &self.args)
            .field("cacheable", &self.cacheable)
            .finish()
    }
}

/// Tagged variant distinguishing a request item from a function item.
#[derive(Debug, Clone)]
pub enum ItemKind {
    Request(RequestDescriptor),
    Function(FunctionDescriptor),
}

impl ItemKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ItemKind::Request(_) => "REQUEST",
            ItemKind::Function(_) => "FUNCTION",
        }
    }
}

/// One entry in a gateway batch.
#[derive(Debug, Clone)]
pub struct Item {
    pub id: String,
    pub group_id: Option<String>,
    pub kind: ItemKind,
}

impl Item {
    pub fn request(id: impl Into<String>, descriptor: RequestDescriptor) -> Self {
        Self { id: id.into(), group_id: None, kind: ItemKind::Request(descriptor) }
    }

    pub fn function(id: impl Into<String>, descriptor: FunctionDescriptor) -> Self {
        Self { id: id.into(), group_id: None, kind: ItemKind::Function(descriptor) }
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }
}

/// Attempt classification (spec §3 Attempt record).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    Success,
    FailHttp,
    FailNetwork,
    FailValidation,
    FailTimeout,
    FailCircuitOpen,
}

/// A single recorded attempt. Ordinal `k` is 1-based; `of` is the
/// configured attempt budget `N`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub ordinal: u32,
    pub of: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub execution_time_ms: u64,
    pub classification: Classification,
    pub http_status: Option<u16>,
    pub error: Option<String>,
    pub retryable: bool,
}

/// Infrastructure metrics surfaced on an [`ItemResult`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InfrastructureMetrics {
    pub circuit_breaker: Option<Value>,
    pub cache: Option<Value>,
    pub rate_limiter: Option<Value>,
    pub concurrency_limiter: Option<Value>,
}

/// Aggregate metrics for a single item's attempts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemMetrics {
    pub total_attempts: u32,
    pub successful_attempts: u32,
    pub failed_attempts: u32,
    pub total_execution_time_ms: u64,
    pub average_attempt_time_ms: f64,
    pub infrastructure_metrics: InfrastructureMetrics,
}

/// The outcome of running the attempt loop for one item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemResult {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub attempts: Vec<AttemptRecord>,
    pub metrics: ItemMetrics,
}

impl ItemResult {
    /// `successfulAttempts + failedAttempts == totalAttempts` invariant,
    /// checked by tests exercising the attempt loop.
    pub fn metrics_are_consistent(&self) -> bool {
        self.metrics.successful_attempts + self.metrics.failed_attempts
            == self.metrics.total_attempts
    }
}

/// One entry in a [`crate::gateway::GatewayResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemResponse {
    pub request_id: String,
    pub group_id: Option<String>,
    #[serde(rename = "type")]
    pub item_type: String,
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
}
