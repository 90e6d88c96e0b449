//! Pattern-matched HTTP response table for worlds.
//!
//! Three modes:
//!
//! - `passthrough`: never intercept.
//! - `mock`: always consult the table; URLs under an allowed domain
//!   fall through to the real network, everything else is answered
//!   from the table (or fails when `fail_unmatched` is set).
//! - `record`: consult the table; on a miss the real call proceeds and
//!   its response is captured for later export.
//!
//! Exact URL matches win over pattern matches; patterns are tried in
//! configuration order.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::glob::Glob;
use crate::permissions::extract_host;

/// Mocking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MockMode {
    #[default]
    Passthrough,
    Mock,
    Record,
}

/// One canned response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MockResponse {
    pub status: u16,
    pub body: String,
    pub headers: HashMap<String, String>,
    pub latency_ms: u64,
}

impl Default for MockResponse {
    fn default() -> Self {
        Self {
            status: 200,
            body: String::new(),
            headers: HashMap::new(),
            latency_ms: 0,
        }
    }
}

/// Decision for one outbound request.
#[derive(Debug, Clone)]
pub enum MockLookup {
    /// Answer with this canned response.
    Intercept(MockResponse),
    /// Let the real call happen.
    Passthrough,
    /// Let the real call happen and capture its response.
    PassthroughAndRecord,
}

/// Usage counters reported in world state.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NetworkMetrics {
    pub requests_intercepted: u64,
    pub requests_passed_through: u64,
    pub requests_failed: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct NetworkSnapshot {
    mode: MockMode,
    mocks: Vec<(String, MockResponse)>,
    default_response: Option<MockResponse>,
    allowed_domains: Vec<String>,
    fail_unmatched: bool,
    recorded: Vec<Value>,
}

/// The network mock table of one world.
#[derive(Debug, Default)]
pub struct NetworkMock {
    mode: MockMode,
    mocks: Vec<(String, MockResponse)>,
    globs: Vec<Glob>,
    default_response: Option<MockResponse>,
    allowed_domains: Vec<String>,
    fail_unmatched: bool,
    recorded: Vec<Value>,
    metrics: NetworkMetrics,
}

impl NetworkMock {
    /// Apply a world configuration fragment:
    ///
    /// ```json
    /// {
    ///   "mode": "mock",
    ///   "mock_responses": {
    ///     "https://api.example.com/*": {"status": 200, "body": "...", "latency_ms": 50}
    ///   },
    ///   "default_response": {"status": 404, "body": "Not Found"},
    ///   "allowed_domains": ["localhost"],
    ///   "fail_unmatched": true
    /// }
    /// ```
    ///
    /// Mock values may be bare strings (body with status 200).
    pub fn configure(&mut self, config: &Value) {
        if let Some(mode) = config.get("mode").and_then(Value::as_str) {
            self.mode = match mode {
                "mock" => MockMode::Mock,
                "record" => MockMode::Record,
                _ => MockMode::Passthrough,
            };
        }

        if let Some(responses) = config.get("mock_responses").and_then(Value::as_object) {
            for (pattern, spec) in responses {
                let response = match spec {
                    Value::String(body) => MockResponse {
                        body: body.clone(),
                        ..MockResponse::default()
                    },
                    other => parse_response(other),
                };
                self.mocks.push((pattern.clone(), response));
            }
        }

        if let Some(default) = config.get("default_response").filter(|v| v.is_object()) {
            let mut response = parse_response(default);
            if !default.get("status").is_some_and(Value::is_number) {
                response.status = 404;
            }
            self.default_response = Some(response);
        }

        if let Some(domains) = config.get("allowed_domains").and_then(Value::as_array) {
            self.allowed_domains = domains
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
        }

        self.fail_unmatched = config
            .get("fail_unmatched")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        self.recompile();
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.mode != MockMode::Passthrough
    }

    #[must_use]
    pub const fn mode(&self) -> MockMode {
        self.mode
    }

    /// Decide how to answer a request for `url`.
    pub fn lookup(&mut self, url: &str) -> MockLookup {
        if self.mode == MockMode::Passthrough {
            self.metrics.requests_passed_through += 1;
            return MockLookup::Passthrough;
        }

        // Exact match beats patterns.
        if let Some((_, response)) = self.mocks.iter().find(|(pattern, _)| pattern == url) {
            self.metrics.requests_intercepted += 1;
            return MockLookup::Intercept(response.clone());
        }

        for ((_, response), glob) in self.mocks.iter().zip(&self.globs) {
            if glob.is_match(url) {
                self.metrics.requests_intercepted += 1;
                return MockLookup::Intercept(response.clone());
            }
        }

        let host = extract_host(url);
        if self
            .allowed_domains
            .iter()
            .any(|d| d.eq_ignore_ascii_case(&host) || Glob::url(d).is_match(&host))
        {
            self.metrics.requests_passed_through += 1;
            return MockLookup::Passthrough;
        }

        if self.fail_unmatched {
            self.metrics.requests_failed += 1;
            return MockLookup::Intercept(MockResponse {
                status: 503,
                body: "network mock: URL not configured and fail_unmatched is set".to_string(),
                ..MockResponse::default()
            });
        }

        if let Some(default) = &self.default_response {
            self.metrics.requests_intercepted += 1;
            return MockLookup::Intercept(default.clone());
        }

        self.metrics.requests_passed_through += 1;
        if self.mode == MockMode::Record {
            MockLookup::PassthroughAndRecord
        } else {
            MockLookup::Passthrough
        }
    }

    /// Add or replace a canned response at runtime.
    pub fn add_mock(&mut self, pattern: &str, response: MockResponse) {
        if let Some(entry) = self.mocks.iter_mut().find(|(p, _)| p == pattern) {
            entry.1 = response;
        } else {
            self.mocks.push((pattern.to_string(), response));
        }
        self.recompile();
    }

    /// Capture a real response observed in record mode.
    pub fn record(&mut self, url: &str, method: &str, status: u16, body: &str) {
        self.recorded.push(serde_json::json!({
            "url": url,
            "method": method,
            "status": status,
            "body": body,
            "timestamp_ms": Utc::now().timestamp_millis(),
        }));
    }

    #[must_use]
    pub fn recorded(&self) -> &[Value] {
        &self.recorded
    }

    #[must_use]
    pub fn metrics(&self) -> NetworkMetrics {
        self.metrics
    }

    #[must_use]
    pub fn mock_count(&self) -> usize {
        self.mocks.len()
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        serde_json::to_value(NetworkSnapshot {
            mode: self.mode,
            mocks: self.mocks.clone(),
            default_response: self.default_response.clone(),
            allowed_domains: self.allowed_domains.clone(),
            fail_unmatched: self.fail_unmatched,
            recorded: self.recorded.clone(),
        })
        .unwrap_or_default()
    }

    pub fn from_json(&mut self, value: &Value) {
        let Ok(snapshot) = serde_json::from_value::<NetworkSnapshot>(value.clone()) else {
            return;
        };
        self.mode = snapshot.mode;
        self.mocks = snapshot.mocks;
        self.default_response = snapshot.default_response;
        self.allowed_domains = snapshot.allowed_domains;
        self.fail_unmatched = snapshot.fail_unmatched;
        self.recorded = snapshot.recorded;
        self.metrics = NetworkMetrics::default();
        self.recompile();
    }

    fn recompile(&mut self) {
        self.globs = self.mocks.iter().map(|(p, _)| Glob::url(p)).collect();
    }
}

fn parse_response(spec: &Value) -> MockResponse {
    let mut response = MockResponse::default();
    if let Some(status) = spec.get("status").and_then(Value::as_u64) {
        response.status = status as u16;
    }
    if let Some(body) = spec.get("body").and_then(Value::as_str) {
        response.body = body.to_string();
    }
    if let Some(latency) = spec.get("latency_ms").and_then(Value::as_u64) {
        response.latency_ms = latency;
    }
    if let Some(headers) = spec.get("headers").and_then(Value::as_object) {
        for (k, v) in headers {
            if let Some(v) = v.as_str() {
                response.headers.insert(k.clone(), v.to_string());
            }
        }
    }
    response
}
