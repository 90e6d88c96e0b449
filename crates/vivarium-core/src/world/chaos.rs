//! Probabilistic failure and latency injection for worlds.
//!
//! Evaluation order for every operation, first hit wins:
//!
//! 1. Active injected events (`disk_fail`, `disk_full`,
//!    `network_partition`, `slow_io`) force the outcome.
//! 2. Rules are walked in configuration order; a rule whose type and
//!    pattern match rolls its own probability.
//! 3. The base failure rate is rolled last.
//!
//! Probabilities are evaluated independently per call; the RNG lives
//! inside the engine so chaos decisions are safe under the world lock.

use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::glob::Glob;

/// One chaos rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaosRule {
    #[serde(rename = "type")]
    pub rule_type: String,
    pub pattern: String,
    pub probability: f64,
}

/// Usage counters reported in world state.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ChaosMetrics {
    pub failures_injected: u64,
    pub latency_injected: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChaosSnapshot {
    enabled: bool,
    failure_rate: f64,
    latency_min_ms: u64,
    latency_max_ms: u64,
    rules: Vec<ChaosRule>,
    active_events: BTreeSet<String>,
    event_params: BTreeMap<String, Value>,
}

/// The chaos engine of one world.
#[derive(Debug)]
pub struct ChaosEngine {
    enabled: bool,
    failure_rate: f64,
    latency_min_ms: u64,
    latency_max_ms: u64,
    rules: Vec<ChaosRule>,
    globs: Vec<Glob>,
    active_events: BTreeSet<String>,
    event_params: BTreeMap<String, Value>,
    rng: StdRng,
    metrics: ChaosMetrics,
}

impl Default for ChaosEngine {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_rate: 0.0,
            latency_min_ms: 0,
            latency_max_ms: 0,
            rules: Vec::new(),
            globs: Vec::new(),
            active_events: BTreeSet::new(),
            event_params: BTreeMap::new(),
            rng: StdRng::from_entropy(),
            metrics: ChaosMetrics::default(),
        }
    }
}

impl ChaosEngine {
    /// Apply a world configuration fragment:
    ///
    /// ```json
    /// {
    ///   "enabled": true,
    ///   "failure_rate": 0.1,
    ///   "latency": {"min_ms": 10, "max_ms": 500},
    ///   "rules": [
    ///     {"type": "file_read_fail", "path_pattern": "/critical/**", "probability": 0.5}
    ///   ]
    /// }
    /// ```
    pub fn configure(&mut self, config: &Value) {
        self.enabled = config.get("enabled").and_then(Value::as_bool).unwrap_or(false);
        self.failure_rate = config
            .get("failure_rate")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        if let Some(latency) = config.get("latency") {
            self.latency_min_ms = latency.get("min_ms").and_then(Value::as_u64).unwrap_or(0);
            self.latency_max_ms = latency.get("max_ms").and_then(Value::as_u64).unwrap_or(0);
        }

        self.rules.clear();
        if let Some(rules) = config.get("rules").and_then(Value::as_array) {
            for rule in rules {
                let rule_type = rule
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let pattern = rule
                    .get("path_pattern")
                    .or_else(|| rule.get("url_pattern"))
                    .or_else(|| rule.get("pattern"))
                    .and_then(Value::as_str)
                    .unwrap_or("*")
                    .to_string();
                let probability = rule
                    .get("probability")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0);
                self.rules.push(ChaosRule {
                    rule_type,
                    pattern,
                    probability,
                });
            }
        }
        self.recompile();
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Should this file read fail?
    pub fn should_fail_read(&mut self, path: &str) -> bool {
        if !self.enabled {
            return false;
        }
        if self.active_events.contains("disk_fail") {
            self.metrics.failures_injected += 1;
            return true;
        }
        self.roll(path, "file_read_fail")
    }

    /// Should this file write fail?
    pub fn should_fail_write(&mut self, path: &str) -> bool {
        if !self.enabled {
            return false;
        }
        if self.active_events.contains("disk_full") || self.active_events.contains("disk_fail") {
            self.metrics.failures_injected += 1;
            return true;
        }
        self.roll(path, "file_write_fail")
    }

    /// Should this outbound request fail?
    pub fn should_fail_network(&mut self, url: &str) -> bool {
        if !self.enabled {
            return false;
        }
        if self.active_events.contains("network_partition") {
            self.metrics.failures_injected += 1;
            return true;
        }
        self.roll2(url, "network_timeout", "network_fail")
    }

    /// Latency to inject, in milliseconds.
    pub fn latency_ms(&mut self) -> u64 {
        if !self.enabled {
            return 0;
        }
        if self.active_events.contains("slow_io") {
            let latency = self
                .event_params
                .get("slow_io")
                .and_then(|p| p.get("latency_ms"))
                .and_then(Value::as_u64)
                .unwrap_or(1000);
            self.metrics.latency_injected += 1;
            return latency;
        }
        if self.latency_max_ms == 0 {
            return 0;
        }
        if self.latency_min_ms >= self.latency_max_ms {
            return self.latency_min_ms;
        }
        let latency = self.rng.gen_range(self.latency_min_ms..=self.latency_max_ms);
        if latency > 0 {
            self.metrics.latency_injected += 1;
        }
        latency
    }

    /// Activate a named chaos event (`disk_fail`, `disk_full`,
    /// `network_partition`, `slow_io`, or anything a rule matches on).
    pub fn inject_event(&mut self, event_type: &str, params: Value) {
        self.active_events.insert(event_type.to_string());
        self.event_params.insert(event_type.to_string(), params);
    }

    /// Deactivate every injected event.
    pub fn clear_events(&mut self) {
        self.active_events.clear();
        self.event_params.clear();
    }

    #[must_use]
    pub fn active_events(&self) -> &BTreeSet<String> {
        &self.active_events
    }

    #[must_use]
    pub fn metrics(&self) -> ChaosMetrics {
        self.metrics
    }

    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        serde_json::to_value(ChaosSnapshot {
            enabled: self.enabled,
            failure_rate: self.failure_rate,
            latency_min_ms: self.latency_min_ms,
            latency_max_ms: self.latency_max_ms,
            rules: self.rules.clone(),
            active_events: self.active_events.clone(),
            event_params: self.event_params.clone(),
        })
        .unwrap_or_default()
    }

    pub fn from_json(&mut self, value: &Value) {
        let Ok(snapshot) = serde_json::from_value::<ChaosSnapshot>(value.clone()) else {
            return;
        };
        self.enabled = snapshot.enabled;
        self.failure_rate = snapshot.failure_rate;
        self.latency_min_ms = snapshot.latency_min_ms;
        self.latency_max_ms = snapshot.latency_max_ms;
        self.rules = snapshot.rules;
        self.active_events = snapshot.active_events;
        self.event_params = snapshot.event_params;
        self.metrics = ChaosMetrics::default();
        self.recompile();
    }

    fn recompile(&mut self) {
        self.globs = self.rules.iter().map(|r| Glob::path(&r.pattern)).collect();
    }

    /// First matching rule wins; the base rate is rolled last.
    fn roll(&mut self, candidate: &str, rule_type: &str) -> bool {
        self.roll2(candidate, rule_type, rule_type)
    }

    fn roll2(&mut self, candidate: &str, type_a: &str, type_b: &str) -> bool {
        for i in 0..self.rules.len() {
            let matches_type =
                self.rules[i].rule_type == type_a || self.rules[i].rule_type == type_b;
            if matches_type && self.globs[i].is_match(candidate) {
                let probability = self.rules[i].probability;
                if self.chance(probability) {
                    self.metrics.failures_injected += 1;
                    return true;
                }
                // Only the first matching rule is rolled; the base rate
                // still applies below.
                break;
            }
        }
        if self.chance(self.failure_rate) {
            self.metrics.failures_injected += 1;
            return true;
        }
        false
    }

    fn chance(&mut self, probability: f64) -> bool {
        if probability <= 0.0 {
            return false;
        }
        if probability >= 1.0 {
            return true;
        }
        self.rng.gen_bool(probability)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn disabled_engine_never_fails() {
        let mut chaos = ChaosEngine::default();
        chaos.configure(&json!({"enabled": false, "failure_rate": 1.0}));
        assert!(!chaos.should_fail_read("/x"));
        assert_eq!(chaos.latency_ms(), 0);
    }

    #[test]
    fn certain_rule_always_fires() {
        let mut chaos = ChaosEngine::default();
        chaos.configure(&json!({
            "enabled": true,
            "rules": [
                {"type": "file_read_fail", "path_pattern": "/critical/**", "probability": 1.0}
            ]
        }));
        assert!(chaos.should_fail_read("/critical/db"));
        assert!(!chaos.should_fail_read("/tmp/safe"));
        assert!(!chaos.should_fail_write("/critical/db"));
        assert_eq!(chaos.metrics().failures_injected, 1);
    }

    #[test]
    fn first_matching_rule_wins() {
        let mut chaos = ChaosEngine::default();
        chaos.configure(&json!({
            "enabled": true,
            "rules": [
                {"type": "file_read_fail", "path_pattern": "/a/**", "probability": 0.0},
                {"type": "file_read_fail", "path_pattern": "/a/b", "probability": 1.0}
            ]
        }));
        // The zero-probability rule matches first and settles the roll.
        assert!(!chaos.should_fail_read("/a/b"));
    }

    #[test]
    fn base_rate_of_one_fails_everything() {
        let mut chaos = ChaosEngine::default();
        chaos.configure(&json!({"enabled": true, "failure_rate": 1.0}));
        assert!(chaos.should_fail_read("/any"));
        assert!(chaos.should_fail_write("/any"));
        assert!(chaos.should_fail_network("https://any/"));
    }

    #[test]
    fn injected_events_force_failures() {
        let mut chaos = ChaosEngine::default();
        chaos.configure(&json!({"enabled": true}));

        chaos.inject_event("network_partition", json!({}));
        assert!(chaos.should_fail_network("https://api/"));
        assert!(!chaos.should_fail_read("/x"));

        chaos.inject_event("disk_fail", json!({}));
        assert!(chaos.should_fail_read("/x"));
        assert!(chaos.should_fail_write("/x"));

        chaos.clear_events();
        assert!(!chaos.should_fail_read("/x"));
        assert!(!chaos.should_fail_network("https://api/"));
    }

    #[test]
    fn slow_io_event_overrides_latency_range() {
        let mut chaos = ChaosEngine::default();
        chaos.configure(&json!({"enabled": true}));
        chaos.inject_event("slow_io", json!({"latency_ms": 250}));
        assert_eq!(chaos.latency_ms(), 250);
    }

    #[test]
    fn latency_sampled_from_range() {
        let mut chaos = ChaosEngine::default();
        chaos.configure(&json!({"enabled": true, "latency": {"min_ms": 10, "max_ms": 20}}));
        for _ in 0..50 {
            let latency = chaos.latency_ms();
            assert!((10..=20).contains(&latency));
        }
    }

    #[test]
    fn snapshot_round_trip_keeps_rules_and_events() {
        let mut chaos = ChaosEngine::default();
        chaos.configure(&json!({
            "enabled": true,
            "failure_rate": 0.5,
            "rules": [{"type": "file_read_fail", "path_pattern": "/c/**", "probability": 1.0}]
        }));
        chaos.inject_event("disk_full", json!({"free_bytes": 0}));

        let mut restored = ChaosEngine::default();
        restored.from_json(&chaos.to_json());
        assert!(restored.is_enabled());
        assert_eq!(restored.rule_count(), 1);
        assert!(restored.active_events().contains("disk_full"));
        assert!(restored.should_fail_read("/c/x"));
        assert!(restored.should_fail_write("/anywhere"));
    }
}
