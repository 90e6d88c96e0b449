//! Agent lifecycle: configuration, the process wrapper, and the
//! manager that supervises every agent.

pub mod manager;
pub mod process;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use vivarium_core::restart::RestartConfig;

/// Resource limits applied on the full-isolation sandbox path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Memory ceiling in bytes; `None` means unlimited.
    pub memory_bytes: Option<u64>,
    /// CPU bandwidth quota in microseconds per period.
    pub cpu_quota_us: Option<u64>,
    /// CPU bandwidth period in microseconds.
    pub cpu_period_us: u64,
    /// PID count cap.
    pub max_pids: Option<u64>,
}

impl ResourceLimits {
    /// Default CPU period (100 ms), matching the cgroup v2 default.
    pub const DEFAULT_CPU_PERIOD_US: u64 = 100_000;

    /// Parse the wire shape used by `SPAWN`:
    /// `{"memory_mb": 512, "memory_bytes": ..., "cpu_percent": 50, "max_pids": 64}`.
    #[must_use]
    pub fn from_payload(value: &Value) -> Self {
        let memory_bytes = value
            .get("memory_bytes")
            .and_then(Value::as_u64)
            .or_else(|| {
                value
                    .get("memory_mb")
                    .and_then(Value::as_u64)
                    .map(|mb| mb * 1024 * 1024)
            });
        let cpu_quota_us = value
            .get("cpu_percent")
            .and_then(Value::as_u64)
            .map(|pct| pct.min(100) * Self::DEFAULT_CPU_PERIOD_US / 100);

        Self {
            memory_bytes,
            cpu_quota_us,
            cpu_period_us: Self::DEFAULT_CPU_PERIOD_US,
            max_pids: value.get("max_pids").and_then(Value::as_u64),
        }
    }
}

/// Everything needed to start (and restart) one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    /// Script handed to the interpreter.
    pub script: PathBuf,
    /// Interpreter binary; defaults to `python3`.
    pub interpreter: String,
    /// Kernel socket the agent dials back to, exported as
    /// `VIVARIUM_SOCKET`.
    pub socket_path: PathBuf,
    pub sandboxed: bool,
    /// Keep the host network namespace on the isolation path.
    pub network: bool,
    pub limits: ResourceLimits,
    pub restart: RestartConfig,
}

impl AgentConfig {
    #[must_use]
    pub fn new(name: &str, script: PathBuf, socket_path: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            script,
            interpreter: "python3".to_string(),
            socket_path,
            sandboxed: true,
            network: false,
            limits: ResourceLimits::default(),
            restart: RestartConfig::default(),
        }
    }
}

/// Agent lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Created,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Failed,
}

impl AgentState {
    /// Wire string, upper-case as reported by `LIST`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
        }
    }
}

/// Selector used by `KILL`, `PAUSE`, `RESUME`, and `METRICS_AGENT`
/// payloads: either `{"name": ...}` or `{"id": ...}`.
#[derive(Debug, Clone)]
pub enum AgentSelector {
    Name(String),
    Id(u32),
}

impl AgentSelector {
    /// Parse from a request payload. Name wins when both are present.
    #[must_use]
    pub fn from_payload(value: &Value) -> Option<Self> {
        if let Some(name) = value.get("name").and_then(Value::as_str) {
            if !name.is_empty() {
                return Some(Self::Name(name.to_string()));
            }
        }
        value
            .get("id")
            .or_else(|| value.get("agent_id"))
            .and_then(Value::as_u64)
            .map(|id| Self::Id(id as u32))
    }
}

impl std::fmt::Display for AgentSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Name(name) => write!(f, "'{name}'"),
            Self::Id(id) => write!(f, "#{id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn limits_accept_mb_and_percent() {
        let limits = ResourceLimits::from_payload(&json!({
            "memory_mb": 512,
            "cpu_percent": 50,
            "max_pids": 64
        }));
        assert_eq!(limits.memory_bytes, Some(512 * 1024 * 1024));
        assert_eq!(limits.cpu_quota_us, Some(50_000));
        assert_eq!(limits.cpu_period_us, 100_000);
        assert_eq!(limits.max_pids, Some(64));
    }

    #[test]
    fn explicit_bytes_win_over_mb() {
        let limits = ResourceLimits::from_payload(&json!({
            "memory_bytes": 1000,
            "memory_mb": 512
        }));
        assert_eq!(limits.memory_bytes, Some(1000));
    }

    #[test]
    fn cpu_percent_is_capped() {
        let limits = ResourceLimits::from_payload(&json!({"cpu_percent": 400}));
        assert_eq!(limits.cpu_quota_us, Some(100_000));
    }

    #[test]
    fn selector_prefers_name() {
        let sel = AgentSelector::from_payload(&json!({"name": "w", "id": 4})).unwrap();
        assert!(matches!(sel, AgentSelector::Name(ref n) if n == "w"));

        let sel = AgentSelector::from_payload(&json!({"id": 4})).unwrap();
        assert!(matches!(sel, AgentSelector::Id(4)));

        assert!(AgentSelector::from_payload(&json!({})).is_none());
        assert!(AgentSelector::from_payload(&json!({"name": ""})).is_none());
    }
}
