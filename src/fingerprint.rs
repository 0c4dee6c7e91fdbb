//! Deterministic cache-key fingerprinting.

use sha2::{Digest, Sha256};

use crate::descriptor::{FunctionDescriptor, RequestDescriptor};

/// Header names that are allowed to participate in a request fingerprint.
/// Caching on arbitrary headers (auth tokens, request ids) would make the
/// cache key non-reusable across otherwise-identical requests.
pub fn fingerprint_request(request: &RequestDescriptor, cacheable_headers: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.method.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(request.full_url().as_bytes());

    let mut header_names: Vec<&&str> = cacheable_headers.iter().collect();
    header_names.sort();
    for name in header_names {
        if let Some(value) = request.headers.get(*name) {
            hasher.update(b"|");
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }
    }

    if let Some(body) = &request.body {
        hasher.update(b"|body=");
        hasher.update(canonical_json(body).as_bytes());
    }

    hex::encode(hasher.finalize())
}

/// Function identity + canonical encoding of arguments.
pub fn fingerprint_function(function: &FunctionDescriptor) -> String {
    let mut hasher = Sha256::new();
    hasher.update(function.identity.as_bytes());
    hasher.update(b"|");
    hasher.update(canonical_json(&function.args).as_bytes());
    hex::encode(hasher.finalize())
}

/// Canonical (key-sorted) JSON encoding, so semantically identical
/// payloads with different key orders fingerprint identically.
fn canonical_json(value: &serde_json::Value) -> String {
    fn sort(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                let mut sorted = serde_json::Map::new();
                for (k, v) in entries {
                    sorted.insert(k.clone(), sort(v));
                }
                serde_json::Value::Object(sorted)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sort).collect())
            }
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Method, Protocol, RequestDescriptor};
    use std::collections::HashMap;

    #[test]
    fn identical_requests_fingerprint_identically() {
        let a = RequestDescriptor {
            protocol: Protocol::Https,
            host: "api.example.com".into(),
            port: None,
            path: "/v1/widgets".into(),
            method: Method::Get,
            headers: HashMap::new(),
            query: HashMap::new(),
            body: None,
        };
        let b = a.clone();
        assert_eq!(fingerprint_request(&a, &[]), fingerprint_request(&b, &[]));
    }

    #[test]
    fn query_order_does_not_affect_fingerprint() {
        let mut a = RequestDescriptor {
            protocol: Protocol::Https,
            host: "api.example.com".into(),
            port: None,
            path: "/v1/widgets".into(),
            method: Method::Get,
            headers: HashMap::new(),
            query: HashMap::new(),
            body: None,
        };
        a.query.insert("b".into(), "2".into());
        a.query.insert("a".into(), "1".into());
        let mut b = a.clone();
        b.query.clear();
        b.query.insert("a".into(), "1".into());
        b.query.insert("b".into(), "2".into());
        assert_eq!(fingerprint_request(&a, &[]), fingerprint_request(&b, &[]));
    }

    #[test]
    fn uncacheable_header_does_not_affect_fingerprint() {
        let mut a = RequestDescriptor {
            protocol: Protocol::Https,
            host: "api.example.com".into(),
            port: None,
            path: "/v1/widgets".into(),
            method: Method::Get,
            headers: HashMap::new(),
            query: HashMap::new(),
            body: None,
        };
        let mut b = a.clone();
        a.headers.insert("X-Request-Id".into(), "1".into());
        b.headers.insert("X-Request-Id".into(), "2".into());
        assert_eq!(fingerprint_request(&a, &[]), fingerprint_request(&b, &[]));
    }
}
