//! Scoped key/value state store with TTL.
//!
//! Three scopes share one keyspace:
//!
//! - `global`: bare key, readable by everyone, deletable by the owner.
//! - `agent`: stored as `agent:<id>:<key>` so two agents can own the
//!   same logical key; only the owner can read or delete it.
//! - `session`: access rules of `global`; the whole scope is dropped on
//!   kernel shutdown.
//!
//! Expired entries are discarded lazily on the next access and never
//! appear in listings.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

/// Storage scope of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Global,
    Agent,
    Session,
}

impl Scope {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Agent => "agent",
            Self::Session => "session",
        }
    }
}

impl FromStr for Scope {
    type Err = ();

    /// Unknown scope strings fall back to `global`, matching the wire
    /// contract where `scope` is optional.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "agent" => Self::Agent,
            "session" => Self::Session,
            _ => Self::Global,
        })
    }
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Value,
    owner: u32,
    scope: Scope,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Result of a successful store.
#[derive(Debug)]
pub struct StoreOutcome {
    pub key: String,
    pub scope: Scope,
}

/// Result of a fetch; `exists == false` is not an error.
#[derive(Debug)]
pub struct FetchOutcome {
    pub exists: bool,
    pub value: Value,
    pub scope: Option<Scope>,
}

/// In-memory scoped key/value store.
#[derive(Debug, Default)]
pub struct StateStore {
    inner: Mutex<HashMap<String, StoredValue>>,
}

impl StateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a key. Empty keys are rejected by the handler
    /// layer, not here.
    pub fn store(
        &self,
        agent_id: u32,
        key: &str,
        value: Value,
        scope: Scope,
        ttl: Option<Duration>,
    ) -> StoreOutcome {
        let storage_key = match scope {
            Scope::Agent => agent_key(agent_id, key),
            _ => key.to_string(),
        };

        let entry = StoredValue {
            value,
            owner: agent_id,
            scope,
            expires_at: ttl.map(|t| Instant::now() + t),
        };

        let mut inner = self.inner.lock().expect("state lock poisoned");
        inner.insert(storage_key, entry);

        StoreOutcome {
            key: key.to_string(),
            scope,
        }
    }

    /// Look up a key, trying the bare key first and then the caller's
    /// namespaced variant. Non-owners never see agent-scoped entries.
    pub fn fetch(&self, agent_id: u32, key: &str) -> FetchOutcome {
        let mut inner = self.inner.lock().expect("state lock poisoned");
        let now = Instant::now();

        for candidate in [key.to_string(), agent_key(agent_id, key)] {
            let Some(entry) = inner.get(&candidate) else {
                continue;
            };
            if entry.is_expired(now) {
                inner.remove(&candidate);
                continue;
            }
            if !can_access(agent_id, entry) {
                continue;
            }
            return FetchOutcome {
                exists: true,
                value: entry.value.clone(),
                scope: Some(entry.scope),
            };
        }

        FetchOutcome {
            exists: false,
            value: Value::Null,
            scope: None,
        }
    }

    /// Delete a key the caller owns. Returns whether anything was
    /// removed.
    pub fn erase(&self, agent_id: u32, key: &str) -> bool {
        let mut inner = self.inner.lock().expect("state lock poisoned");

        for candidate in [key.to_string(), agent_key(agent_id, key)] {
            let Some(entry) = inner.get(&candidate) else {
                continue;
            };
            if entry.owner == agent_id {
                inner.remove(&candidate);
                return true;
            }
        }
        false
    }

    /// List keys visible to the caller, optionally filtered by prefix.
    /// Agent-scoped keys are reported without their namespace.
    pub fn keys(&self, agent_id: u32, prefix: &str) -> Vec<String> {
        let mut inner = self.inner.lock().expect("state lock poisoned");
        let now = Instant::now();

        inner.retain(|_, entry| !entry.is_expired(now));

        let mut keys: Vec<String> = inner
            .iter()
            .filter(|(_, entry)| can_access(agent_id, entry))
            .map(|(storage_key, entry)| display_key(storage_key, entry.scope))
            .filter(|key| prefix.is_empty() || key.starts_with(prefix))
            .collect();
        keys.sort();
        keys
    }

    /// Drop every `session`-scoped entry. Called on kernel shutdown.
    pub fn clear_session(&self) {
        let mut inner = self.inner.lock().expect("state lock poisoned");
        inner.retain(|_, entry| entry.scope != Scope::Session);
    }

    /// Number of live entries (tests and metrics).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("state lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn agent_key(agent_id: u32, key: &str) -> String {
    format!("agent:{agent_id}:{key}")
}

fn display_key(storage_key: &str, scope: Scope) -> String {
    if scope == Scope::Agent {
        storage_key
            .splitn(3, ':')
            .nth(2)
            .unwrap_or(storage_key)
            .to_string()
    } else {
        storage_key.to_string()
    }
}

fn can_access(agent_id: u32, entry: &StoredValue) -> bool {
    match entry.scope {
        // Session keys share global's access rules; they differ only in
        // lifetime.
        Scope::Global | Scope::Session => true,
        Scope::Agent => entry.owner == agent_id,
    }
}
