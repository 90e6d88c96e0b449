//! World simulation layer.
//!
//! A world is an isolated environment bundling a virtual filesystem, a
//! network mock table, and a chaos engine, plus the set of agents that
//! joined it. The [`WorldEngine`] owns every world and the agent→world
//! mapping behind one lock; filesystem and HTTP handlers consult it
//! before touching anything real.

pub mod chaos;
pub mod netmock;
pub mod vfs;

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use chrono::Utc;
use serde_json::Value;

use crate::KernelError;
pub use chaos::ChaosEngine;
pub use netmock::{MockLookup, MockMode, MockResponse, NetworkMock};
pub use vfs::VirtualFs;

/// One simulated environment.
#[derive(Debug)]
pub struct World {
    id: String,
    name: String,
    description: String,
    config: Value,
    pub vfs: VirtualFs,
    pub network: NetworkMock,
    pub chaos: ChaosEngine,
    agents: BTreeSet<u32>,
    syscall_count: u64,
    created_at_ms: i64,
    last_activity_ms: i64,
}

impl World {
    fn new(id: String) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            config: Value::Null,
            vfs: VirtualFs::default(),
            network: NetworkMock::default(),
            chaos: ChaosEngine::default(),
            agents: BTreeSet::new(),
            syscall_count: 0,
            created_at_ms: now,
            last_activity_ms: now,
        }
    }

    /// Apply a world configuration document with optional
    /// `virtual_filesystem`, `network`, and `chaos` sections.
    pub fn configure(&mut self, config: &Value) {
        self.config = config.clone();
        if let Some(name) = config.get("name").and_then(Value::as_str) {
            self.name = name.to_string();
        }
        if let Some(description) = config.get("description").and_then(Value::as_str) {
            self.description = description.to_string();
        }
        if let Some(vfs) = config.get("virtual_filesystem") {
            self.vfs.configure(vfs);
        }
        if let Some(network) = config.get("network") {
            self.network.configure(network);
        }
        if let Some(chaos) = config.get("chaos") {
            self.chaos.configure(chaos);
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn agents(&self) -> &BTreeSet<u32> {
        &self.agents
    }

    /// Bump the per-world syscall counter.
    pub fn record_syscall(&mut self) {
        self.syscall_count += 1;
        self.last_activity_ms = Utc::now().timestamp_millis();
    }

    /// Summary row for `WORLD_LIST`.
    #[must_use]
    pub fn summary(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "description": self.description,
            "agent_count": self.agents.len(),
            "syscall_count": self.syscall_count,
            "vfs_enabled": self.vfs.is_enabled(),
            "network_mock_enabled": self.network.is_enabled(),
            "chaos_enabled": self.chaos.is_enabled(),
        })
    }

    /// Full state document for `WORLD_STATE`.
    #[must_use]
    pub fn state(&self) -> Value {
        serde_json::json!({
            "world_id": self.id,
            "name": self.name,
            "agent_count": self.agents.len(),
            "agents": self.agents,
            "syscall_count": self.syscall_count,
            "created_at_ms": self.created_at_ms,
            "last_activity_ms": self.last_activity_ms,
            "vfs_metrics": {
                "file_count": self.vfs.file_count(),
                "read_count": self.vfs.metrics().read_count,
                "write_count": self.vfs.metrics().write_count,
                "bytes_read": self.vfs.metrics().bytes_read,
                "bytes_written": self.vfs.metrics().bytes_written,
            },
            "network_metrics": {
                "mock_count": self.network.mock_count(),
                "requests_intercepted": self.network.metrics().requests_intercepted,
                "requests_passed_through": self.network.metrics().requests_passed_through,
                "requests_failed": self.network.metrics().requests_failed,
            },
            "chaos_metrics": {
                "rule_count": self.chaos.rule_count(),
                "active_events": self.chaos.active_events(),
                "failures_injected": self.chaos.metrics().failures_injected,
                "latency_injected": self.chaos.metrics().latency_injected,
            },
        })
    }

    /// Self-contained snapshot document consumed by restore.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "description": self.description,
            "config": self.config,
            "vfs": self.vfs.to_json(),
            "network": self.network.to_json(),
            "chaos": self.chaos.to_json(),
            "agents": self.agents,
            "snapshot_time_ms": Utc::now().timestamp_millis(),
        })
    }

    fn restore_from(&mut self, snapshot: &Value) {
        if let Some(name) = snapshot.get("name").and_then(Value::as_str) {
            self.name = name.to_string();
        }
        if let Some(description) = snapshot.get("description").and_then(Value::as_str) {
            self.description = description.to_string();
        }
        if let Some(config) = snapshot.get("config") {
            self.config = config.clone();
        }
        if let Some(vfs) = snapshot.get("vfs") {
            self.vfs.from_json(vfs);
        }
        if let Some(network) = snapshot.get("network") {
            self.network.from_json(network);
        }
        if let Some(chaos) = snapshot.get("chaos") {
            self.chaos.from_json(chaos);
        }
        if let Some(agents) = snapshot.get("agents").and_then(Value::as_array) {
            self.agents = agents
                .iter()
                .filter_map(Value::as_u64)
                .map(|a| a as u32)
                .collect();
        }
    }
}

#[derive(Debug, Default)]
struct EngineInner {
    worlds: HashMap<String, World>,
    agent_world: HashMap<u32, String>,
    next_num: u64,
}

/// Registry of worlds and agent membership.
#[derive(Debug)]
pub struct WorldEngine {
    inner: Mutex<EngineInner>,
}

impl Default for WorldEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl WorldEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(EngineInner {
                next_num: 1,
                ..EngineInner::default()
            }),
        }
    }

    /// Create a world and return its generated id.
    pub fn create(&self, name: &str, config: &Value) -> String {
        let mut inner = self.inner.lock().expect("world lock poisoned");
        let id = generate_world_id(name, &mut inner.next_num);
        let mut world = World::new(id.clone());
        world.configure(config);
        inner.worlds.insert(id.clone(), world);
        id
    }

    /// Destroy a world.
    ///
    /// # Errors
    ///
    /// [`KernelError::NotFound`] if the id is unknown;
    /// [`KernelError::Conflict`] if agents are inside and `force` is
    /// not set.
    pub fn destroy(&self, world_id: &str, force: bool) -> Result<(), KernelError> {
        let mut inner = self.inner.lock().expect("world lock poisoned");
        let Some(world) = inner.worlds.get(world_id) else {
            return Err(KernelError::NotFound(format!("world '{world_id}'")));
        };
        if !force && !world.agents.is_empty() {
            return Err(KernelError::Conflict(format!(
                "world '{world_id}' has {} active agents",
                world.agents.len()
            )));
        }

        let members: Vec<u32> = world.agents.iter().copied().collect();
        for agent in members {
            inner.agent_world.remove(&agent);
        }
        inner.worlds.remove(world_id);
        Ok(())
    }

    /// Summaries of all worlds.
    #[must_use]
    pub fn list(&self) -> Vec<Value> {
        let inner = self.inner.lock().expect("world lock poisoned");
        let mut rows: Vec<(String, Value)> = inner
            .worlds
            .iter()
            .map(|(id, w)| (id.clone(), w.summary()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows.into_iter().map(|(_, v)| v).collect()
    }

    /// Join an agent to a world.
    ///
    /// # Errors
    ///
    /// [`KernelError::Conflict`] if the agent is already in a world;
    /// [`KernelError::NotFound`] if the world does not exist.
    pub fn join(&self, agent_id: u32, world_id: &str) -> Result<(), KernelError> {
        let mut inner = self.inner.lock().expect("world lock poisoned");
        if let Some(current) = inner.agent_world.get(&agent_id) {
            return Err(KernelError::Conflict(format!(
                "agent {agent_id} is already in world '{current}'"
            )));
        }
        let Some(world) = inner.worlds.get_mut(world_id) else {
            return Err(KernelError::NotFound(format!("world '{world_id}'")));
        };
        world.agents.insert(agent_id);
        world.last_activity_ms = Utc::now().timestamp_millis();
        inner.agent_world.insert(agent_id, world_id.to_string());
        Ok(())
    }

    /// Remove an agent from its world, returning the world id it left.
    ///
    /// # Errors
    ///
    /// [`KernelError::NotFound`] if the agent is in no world.
    pub fn leave(&self, agent_id: u32) -> Result<String, KernelError> {
        let mut inner = self.inner.lock().expect("world lock poisoned");
        let Some(world_id) = inner.agent_world.remove(&agent_id) else {
            return Err(KernelError::NotFound(format!(
                "agent {agent_id} world membership"
            )));
        };
        if let Some(world) = inner.worlds.get_mut(&world_id) {
            world.agents.remove(&agent_id);
        }
        Ok(world_id)
    }

    /// The world an agent is in, if any.
    #[must_use]
    pub fn world_of(&self, agent_id: u32) -> Option<String> {
        let inner = self.inner.lock().expect("world lock poisoned");
        inner.agent_world.get(&agent_id).cloned()
    }

    /// Run `f` against the caller's world, if it is in one.
    ///
    /// The world lock is held for the duration of `f`; callers must not
    /// block inside it.
    pub fn with_agent_world<R>(&self, agent_id: u32, f: impl FnOnce(&mut World) -> R) -> Option<R> {
        let mut inner = self.inner.lock().expect("world lock poisoned");
        let world_id = inner.agent_world.get(&agent_id)?.clone();
        inner.worlds.get_mut(&world_id).map(f)
    }

    /// Run `f` against a world by id.
    pub fn with_world<R>(&self, world_id: &str, f: impl FnOnce(&mut World) -> R) -> Option<R> {
        let mut inner = self.inner.lock().expect("world lock poisoned");
        inner.worlds.get_mut(world_id).map(f)
    }

    /// Inject a chaos event into a world.
    ///
    /// # Errors
    ///
    /// [`KernelError::NotFound`] if the world does not exist.
    pub fn inject_event(
        &self,
        world_id: &str,
        event_type: &str,
        params: Value,
    ) -> Result<(), KernelError> {
        self.with_world(world_id, |world| {
            world.chaos.inject_event(event_type, params);
        })
        .ok_or_else(|| KernelError::NotFound(format!("world '{world_id}'")))
    }

    /// Full state document for one world.
    #[must_use]
    pub fn state(&self, world_id: &str) -> Option<Value> {
        let inner = self.inner.lock().expect("world lock poisoned");
        inner.worlds.get(world_id).map(World::state)
    }

    /// Snapshot one world.
    #[must_use]
    pub fn snapshot(&self, world_id: &str) -> Option<Value> {
        let inner = self.inner.lock().expect("world lock poisoned");
        inner.worlds.get(world_id).map(World::snapshot)
    }

    /// Recreate a world from a snapshot document. The member agent set
    /// is preserved as data, but no processes are attached.
    ///
    /// # Errors
    ///
    /// [`KernelError::Conflict`] if the requested id already exists;
    /// [`KernelError::Parse`] if the snapshot is not an object.
    pub fn restore(
        &self,
        snapshot: &Value,
        new_world_id: Option<&str>,
    ) -> Result<String, KernelError> {
        if !snapshot.is_object() {
            return Err(KernelError::Parse("snapshot must be an object".into()));
        }

        let mut inner = self.inner.lock().expect("world lock poisoned");
        let id = match new_world_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                let base = snapshot
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("restored");
                generate_world_id(base, &mut inner.next_num)
            }
        };

        if inner.worlds.contains_key(&id) {
            return Err(KernelError::Conflict(format!("world '{id}' already exists")));
        }

        let mut world = World::new(id.clone());
        world.restore_from(snapshot);
        inner.worlds.insert(id.clone(), world);
        Ok(id)
    }

    /// Engine-wide counters.
    #[must_use]
    pub fn metrics(&self) -> Value {
        let inner = self.inner.lock().expect("world lock poisoned");
        let total_syscalls: u64 = inner.worlds.values().map(|w| w.syscall_count).sum();
        serde_json::json!({
            "world_count": inner.worlds.len(),
            "agents_in_worlds": inner.agent_world.len(),
            "total_syscalls": total_syscalls,
        })
    }

    #[must_use]
    pub fn world_count(&self) -> usize {
        self.inner.lock().expect("world lock poisoned").worlds.len()
    }

    /// Drop a reaped agent's membership.
    pub fn purge_agent(&self, agent_id: u32) {
        let _ = self.leave(agent_id);
    }
}

/// `<slug>-NNNN` from a display name: lower-cased, restricted to
/// `[a-z0-9-_]`, spaces become dashes, truncated to 32 characters.
fn generate_world_id(name: &str, next_num: &mut u64) -> String {
    let mut slug: String = name
        .chars()
        .filter_map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                Some(c.to_ascii_lowercase())
            } else if c == ' ' {
                Some('-')
            } else {
                None
            }
        })
        .collect();
    if slug.is_empty() {
        slug = "world".to_string();
    }
    slug.truncate(32);

    let id = format!("{slug}-{:04}", *next_num);
    *next_num += 1;
    id
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn engine_with_world() -> (WorldEngine, String) {
        let engine = WorldEngine::new();
        let id = engine.create(
            "Test World",
            &json!({
                "virtual_filesystem": {"initial_files": {"/data/x": "hello"}},
                "network": {"mode": "mock", "fail_unmatched": true},
                "chaos": {"enabled": true}
            }),
        );
        (engine, id)
    }

    #[test]
    fn world_ids_are_slugged_and_numbered() {
        let engine = WorldEngine::new();
        let a = engine.create("Test World", &json!({}));
        let b = engine.create("Test World", &json!({}));
        assert_eq!(a, "test-world-0001");
        assert_eq!(b, "test-world-0002");

        let odd = engine.create("!!!", &json!({}));
        assert!(odd.starts_with("world-"));
    }

    #[test]
    fn join_is_exclusive() {
        let (engine, id) = engine_with_world();
        let second = engine.create("other", &json!({}));

        engine.join(1, &id).unwrap();
        let err = engine.join(1, &second).unwrap_err();
        assert!(matches!(err, KernelError::Conflict(_)));

        engine.leave(1).unwrap();
        engine.join(1, &second).unwrap();
    }

    #[test]
    fn join_unknown_world_fails() {
        let engine = WorldEngine::new();
        assert!(matches!(
            engine.join(1, "nope"),
            Err(KernelError::NotFound(_))
        ));
    }

    #[test]
    fn leave_without_membership_fails() {
        let engine = WorldEngine::new();
        assert!(matches!(engine.leave(1), Err(KernelError::NotFound(_))));
    }

    #[test]
    fn destroy_refuses_occupied_world_without_force() {
        let (engine, id) = engine_with_world();
        engine.join(1, &id).unwrap();

        assert!(matches!(
            engine.destroy(&id, false),
            Err(KernelError::Conflict(_))
        ));
        engine.destroy(&id, true).unwrap();
        assert_eq!(engine.world_count(), 0);
        // Membership mapping is gone too.
        assert_eq!(engine.world_of(1), None);
    }

    #[test]
    fn with_agent_world_scopes_to_membership() {
        let (engine, id) = engine_with_world();
        engine.join(7, &id).unwrap();

        let content = engine.with_agent_world(7, |w| w.vfs.read("/data/x"));
        assert_eq!(content.unwrap().as_deref(), Some("hello"));
        assert!(engine.with_agent_world(8, |_| ()).is_none());
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let (engine, id) = engine_with_world();
        engine.join(3, &id).unwrap();
        engine
            .with_world(&id, |w| {
                w.vfs.write("/data/x", "changed", false);
                w.record_syscall();
            })
            .unwrap();

        let snapshot = engine.snapshot(&id).unwrap();
        let restored_id = engine.restore(&snapshot, Some("copy-1")).unwrap();
        assert_eq!(restored_id, "copy-1");

        let state = engine.state("copy-1").unwrap();
        assert_eq!(state["agent_count"], 1);
        let content = engine.with_world("copy-1", |w| w.vfs.read("/data/x"));
        assert_eq!(content.unwrap().as_deref(), Some("changed"));
        // Chaos and network configs survive.
        let survives = engine
            .with_world("copy-1", |w| (w.chaos.is_enabled(), w.network.is_enabled()))
            .unwrap();
        assert_eq!(survives, (true, true));
    }

    #[test]
    fn restore_refuses_existing_id() {
        let (engine, id) = engine_with_world();
        let snapshot = engine.snapshot(&id).unwrap();
        assert!(matches!(
            engine.restore(&snapshot, Some(&id)),
            Err(KernelError::Conflict(_))
        ));
    }

    #[test]
    fn inject_event_reaches_chaos() {
        let (engine, id) = engine_with_world();
        engine.inject_event(&id, "disk_fail", json!({})).unwrap();
        let fails = engine.with_world(&id, |w| w.chaos.should_fail_read("/any"));
        assert_eq!(fails, Some(true));

        assert!(matches!(
            engine.inject_event("missing", "disk_fail", json!({})),
            Err(KernelError::NotFound(_))
        ));
    }

    #[test]
    fn two_worlds_have_independent_filesystems() {
        let engine = WorldEngine::new();
        let a = engine.create(
            "a",
            &json!({"virtual_filesystem": {"initial_files": {"/data/x": "A"}}}),
        );
        let b = engine.create(
            "b",
            &json!({"virtual_filesystem": {"initial_files": {"/data/x": "B"}}}),
        );

        engine.join(1, &a).unwrap();
        engine.join(2, &b).unwrap();

        engine.with_agent_world(1, |w| w.vfs.write("/data/x", "A2", false));
        let b_content = engine.with_agent_world(2, |w| w.vfs.read("/data/x"));
        assert_eq!(b_content.unwrap().as_deref(), Some("B"));
    }
}
