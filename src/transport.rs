//! HTTP client contract consumed by the attempt loop. Only the contract
//! is defined here; the transport itself is an external collaborator.
//! [`ReqwestTransport`] is the default implementation.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::descriptor::RequestDescriptor;

/// A successful transport response.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub data: Value,
    pub status_text: String,
    pub headers: HashMap<String, String>,
}

/// A transport-level failure. `code`, when present, is checked against
/// [`crate::error::RETRYABLE_NETWORK_CODES`].
#[derive(Debug, Clone)]
pub struct TransportError {
    pub message: String,
    pub response: Option<(u16, Value)>,
    pub code: Option<String>,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TransportError {}

/// The contract the attempt loop dispatches through. Implementations may
/// be swapped freely (real HTTP client, test double, recorded fixture).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dispatch(
        &self,
        request: &RequestDescriptor,
        timeout: Option<Duration>,
    ) -> Result<TransportResponse, TransportError>;
}

/// Default [`Transport`] backed by `reqwest` (feature `http`).
#[cfg(feature = "http")]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl ReqwestTransport {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

#[cfg(feature = "http")]
impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl Transport for ReqwestTransport {
    async fn dispatch(
        &self,
        request: &RequestDescriptor,
        timeout: Option<Duration>,
    ) -> Result<TransportResponse, TransportError> {
        use crate::descriptor::Method;

        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.client.request(method, request.full_url());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(t) = timeout {
            builder = builder.timeout(t);
        }

        let response = builder.send().await.map_err(|e| TransportError {
            code: classify_reqwest_error(&e),
            message: e.to_string(),
            response: None,
        })?;

        let status = response.status().as_u16();
        let status_text = response.status().canonical_reason().unwrap_or("").to_string();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let data = response.json::<Value>().await.unwrap_or(Value::Null);

        if status >= 400 {
            return Err(TransportError {
                message: format!("HTTP {status}"),
                response: Some((status, data)),
                code: None,
            });
        }

        Ok(TransportResponse { status, data, status_text, headers })
    }
}

#[cfg(feature = "http")]
fn classify_reqwest_error(error: &reqwest::Error) -> Option<String> {
    if error.is_timeout() {
        Some("ETIMEDOUT".to_string())
    } else if error.is_connect() {
        Some("ECONNREFUSED".to_string())
    } else {
        None
    }
}
