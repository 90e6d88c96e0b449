//! Outbound HTTP for the `HTTP` syscall and the LLM proxy.
//!
//! Requests run on worker threads (or the blocking dispatch thread for
//! explicit synchronous calls), so the blocking client is the right
//! tool; the timeout is carried by the client itself.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;

/// Default outbound request timeout.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// One outbound request, decoded from an `HTTP` payload.
#[derive(Debug, Clone)]
pub struct HttpRequestSpec {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub timeout: Duration,
}

impl HttpRequestSpec {
    /// Parse the wire shape
    /// `{url, method?, headers?, body?, timeout?}`.
    #[must_use]
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let url = payload.get("url")?.as_str()?.to_string();
        let method = payload
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_ascii_uppercase();
        let mut headers = HashMap::new();
        if let Some(map) = payload.get("headers").and_then(Value::as_object) {
            for (k, v) in map {
                if let Some(v) = v.as_str() {
                    headers.insert(k.clone(), v.to_string());
                }
            }
        }
        let body = payload
            .get("body")
            .map(|b| match b {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .filter(|b| !b.is_empty());
        let timeout = payload
            .get("timeout")
            .and_then(Value::as_u64)
            .map_or(DEFAULT_HTTP_TIMEOUT, Duration::from_secs);

        Some(Self {
            url,
            method,
            headers,
            body,
            timeout,
        })
    }
}

/// A completed outbound request.
#[derive(Debug)]
pub struct HttpOutcome {
    pub status: u16,
    pub body: String,
    pub headers: HashMap<String, String>,
}

/// Perform the request. Must be called from a thread that may block.
///
/// # Errors
///
/// Returns a human-readable error string; the timeout surfaces as
/// `"timeout"` so callers produce the canonical timeout response.
pub fn perform(spec: &HttpRequestSpec) -> Result<HttpOutcome, String> {
    let client = reqwest::blocking::Client::builder()
        .timeout(spec.timeout)
        .build()
        .map_err(|e| format!("failed to build HTTP client: {e}"))?;

    let method: reqwest::Method = spec
        .method
        .parse()
        .map_err(|_| format!("invalid HTTP method '{}'", spec.method))?;

    let mut request = client.request(method, &spec.url);
    for (k, v) in &spec.headers {
        request = request.header(k, v);
    }
    if let Some(body) = &spec.body {
        request = request.body(body.clone());
    }

    let response = request.send().map_err(|e| {
        if e.is_timeout() {
            "timeout".to_string()
        } else {
            format!("request failed: {e}")
        }
    })?;

    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(k, v)| {
            v.to_str()
                .ok()
                .map(|v| (k.as_str().to_string(), v.to_string()))
        })
        .collect();
    let body = response
        .text()
        .map_err(|e| format!("failed to read response body: {e}"))?;

    Ok(HttpOutcome {
        status,
        body,
        headers,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn payload_parsing_defaults() {
        let spec = HttpRequestSpec::from_payload(&json!({"url": "https://x/"})).unwrap();
        assert_eq!(spec.method, "GET");
        assert!(spec.headers.is_empty());
        assert!(spec.body.is_none());
        assert_eq!(spec.timeout, DEFAULT_HTTP_TIMEOUT);
    }

    #[test]
    fn payload_parsing_full() {
        let spec = HttpRequestSpec::from_payload(&json!({
            "url": "https://x/",
            "method": "post",
            "headers": {"content-type": "application/json"},
            "body": {"k": 1},
            "timeout": 5
        }))
        .unwrap();
        assert_eq!(spec.method, "POST");
        assert_eq!(spec.headers["content-type"], "application/json");
        assert_eq!(spec.body.as_deref(), Some(r#"{"k":1}"#));
        assert_eq!(spec.timeout, Duration::from_secs(5));
    }

    #[test]
    fn missing_url_is_none() {
        assert!(HttpRequestSpec::from_payload(&json!({"method": "GET"})).is_none());
    }
}
