//! Kernel configuration.
//!
//! Defaults are built in; a TOML file may override them and CLI flags
//! override the file. The `VIVARIUM_SOCKET` environment variable
//! overrides the socket path specifically, so agents and operators can
//! agree on a rendezvous point without touching configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use vivarium_core::protocol::{DEFAULT_SOCKET_PATH, SOCKET_ENV_VAR};

/// LLM proxy settings. The THINK syscall is disabled unless an
/// endpoint is configured.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    /// HTTP endpoint accepting `{model, prompt, ...}` POSTs.
    pub endpoint: String,
    /// Bearer token sent with each request.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Model identifier forwarded verbatim.
    #[serde(default)]
    pub model: Option<String>,
}

/// Relay tunnel settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// `host:port` of the relay. Unset means the tunnel is not
    /// configured.
    pub relay_addr: Option<String>,
    pub machine_id: Option<String>,
    pub token: Option<String>,
    pub reconnect_interval_secs: Option<u64>,
    pub auto_connect: bool,
}

/// Top-level kernel configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub socket_path: PathBuf,
    pub enable_sandboxing: bool,
    pub worker_count: usize,
    pub mailbox_capacity: usize,
    pub event_capacity: usize,
    pub audit_max_entries: usize,
    pub llm: Option<LlmConfig>,
    pub tunnel: TunnelConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            enable_sandboxing: true,
            worker_count: vivarium_core::tasks::DEFAULT_WORKER_COUNT,
            mailbox_capacity: vivarium_core::mailbox::DEFAULT_MAILBOX_CAPACITY,
            event_capacity: vivarium_core::events::DEFAULT_EVENT_CAPACITY,
            audit_max_entries: vivarium_core::audit::DEFAULT_AUDIT_CAPACITY,
            llm: None,
            tunnel: TunnelConfig::default(),
        }
    }
}

impl KernelConfig {
    /// Load from a TOML file.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Apply the socket-path environment override.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var(SOCKET_ENV_VAR) {
            if !path.is_empty() {
                self.socket_path = PathBuf::from(path);
            }
        }
    }
}
