//! Append-only audit log.
//!
//! A bounded ring of categorized entries with monotonically increasing
//! ids. Categories can be switched on and off at runtime; queries
//! filter by category and agent and return the most recent entries
//! first.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Default ring capacity.
pub const DEFAULT_AUDIT_CAPACITY: usize = 10_000;

/// Audit entry categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditCategory {
    Syscall,
    Security,
    Lifecycle,
    Ipc,
    State,
    Resource,
    Network,
    World,
}

impl AuditCategory {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Syscall => "syscall",
            Self::Security => "security",
            Self::Lifecycle => "lifecycle",
            Self::Ipc => "ipc",
            Self::State => "state",
            Self::Resource => "resource",
            Self::Network => "network",
            Self::World => "world",
        }
    }
}

impl FromStr for AuditCategory {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "syscall" => Ok(Self::Syscall),
            "security" => Ok(Self::Security),
            "lifecycle" => Ok(Self::Lifecycle),
            "ipc" => Ok(Self::Ipc),
            "state" => Ok(Self::State),
            "resource" => Ok(Self::Resource),
            "network" => Ok(Self::Network),
            "world" => Ok(Self::World),
            _ => Err(()),
        }
    }
}

/// One audit record.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub category: AuditCategory,
    /// `None` for kernel-originated actions.
    pub agent_id: Option<u32>,
    pub action: String,
    pub detail: Value,
    pub success: bool,
}

impl AuditEntry {
    #[must_use]
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "timestamp_ms": self.timestamp.timestamp_millis(),
            "category": self.category.as_str(),
            "agent_id": self.agent_id,
            "action": self.action,
            "detail": self.detail,
            "success": self.success,
        })
    }
}

/// Per-category switches plus ring capacity.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub max_entries: usize,
    pub log_syscalls: bool,
    pub log_security: bool,
    pub log_lifecycle: bool,
    pub log_ipc: bool,
    /// State writes are noisy; off unless debugging.
    pub log_state: bool,
    pub log_resource: bool,
    pub log_network: bool,
    pub log_world: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_AUDIT_CAPACITY,
            log_syscalls: true,
            log_security: true,
            log_lifecycle: true,
            log_ipc: true,
            log_state: false,
            log_resource: true,
            log_network: true,
            log_world: true,
        }
    }
}

impl AuditConfig {
    #[must_use]
    pub const fn enabled_for(&self, category: AuditCategory) -> bool {
        match category {
            AuditCategory::Syscall => self.log_syscalls,
            AuditCategory::Security => self.log_security,
            AuditCategory::Lifecycle => self.log_lifecycle,
            AuditCategory::Ipc => self.log_ipc,
            AuditCategory::State => self.log_state,
            AuditCategory::Resource => self.log_resource,
            AuditCategory::Network => self.log_network,
            AuditCategory::World => self.log_world,
        }
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "max_entries": self.max_entries,
            "log_syscalls": self.log_syscalls,
            "log_security": self.log_security,
            "log_lifecycle": self.log_lifecycle,
            "log_ipc": self.log_ipc,
            "log_state": self.log_state,
            "log_resource": self.log_resource,
            "log_network": self.log_network,
            "log_world": self.log_world,
        })
    }
}

#[derive(Debug)]
struct Inner {
    entries: VecDeque<AuditEntry>,
    next_id: u64,
    config: AuditConfig,
}

/// The audit log service.
#[derive(Debug)]
pub struct AuditLog {
    inner: Mutex<Inner>,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(AuditConfig::default())
    }
}

impl AuditLog {
    #[must_use]
    pub fn new(config: AuditConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                next_id: 1,
                config,
            }),
        }
    }

    /// Append an entry if its category is enabled. Returns the entry id
    /// when recorded.
    pub fn log(
        &self,
        category: AuditCategory,
        action: &str,
        agent_id: Option<u32>,
        detail: Value,
        success: bool,
    ) -> Option<u64> {
        let mut inner = self.inner.lock().expect("audit lock poisoned");
        if !inner.config.enabled_for(category) {
            return None;
        }

        let id = inner.next_id;
        inner.next_id += 1;

        while inner.entries.len() >= inner.config.max_entries {
            inner.entries.pop_front();
        }
        inner.entries.push_back(AuditEntry {
            id,
            timestamp: Utc::now(),
            category,
            agent_id,
            action: action.to_string(),
            detail,
            success,
        });
        Some(id)
    }

    /// Query entries, most recent first.
    pub fn query(
        &self,
        category: Option<AuditCategory>,
        agent_id: Option<u32>,
        since_id: u64,
        limit: usize,
    ) -> Vec<AuditEntry> {
        let inner = self.inner.lock().expect("audit lock poisoned");
        inner
            .entries
            .iter()
            .rev()
            .filter(|e| e.id > since_id)
            .filter(|e| category.map_or(true, |c| e.category == c))
            .filter(|e| agent_id.map_or(true, |a| e.agent_id == Some(a)))
            .take(limit)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn config(&self) -> AuditConfig {
        self.inner.lock().expect("audit lock poisoned").config.clone()
    }

    pub fn set_config(&self, config: AuditConfig) {
        let mut inner = self.inner.lock().expect("audit lock poisoned");
        while inner.entries.len() > config.max_entries {
            inner.entries.pop_front();
        }
        inner.config = config;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("audit lock poisoned").entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
