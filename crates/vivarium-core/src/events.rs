//! Typed pub/sub event bus.
//!
//! Agents subscribe to event types; emission pushes a copy onto the
//! queue of every interested subscriber. Queues are bounded and drop
//! their oldest event under overload — event consumers tolerate loss,
//! but relative order of what survives is preserved.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Default per-subscriber queue capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Kernel event types. Names are stable wire strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelEventType {
    AgentSpawned,
    AgentExited,
    AgentPaused,
    AgentResumed,
    AgentRestarting,
    AgentEscalated,
    MessageReceived,
    StateChanged,
    SyscallBlocked,
    ResourceWarning,
    Custom,
}

impl KernelEventType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AgentSpawned => "AGENT_SPAWNED",
            Self::AgentExited => "AGENT_EXITED",
            Self::AgentPaused => "AGENT_PAUSED",
            Self::AgentResumed => "AGENT_RESUMED",
            Self::AgentRestarting => "AGENT_RESTARTING",
            Self::AgentEscalated => "AGENT_ESCALATED",
            Self::MessageReceived => "MESSAGE_RECEIVED",
            Self::StateChanged => "STATE_CHANGED",
            Self::SyscallBlocked => "SYSCALL_BLOCKED",
            Self::ResourceWarning => "RESOURCE_WARNING",
            Self::Custom => "CUSTOM",
        }
    }

    /// Parse a wire string; unknown names are `Custom`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "AGENT_SPAWNED" => Self::AgentSpawned,
            "AGENT_EXITED" => Self::AgentExited,
            "AGENT_PAUSED" => Self::AgentPaused,
            "AGENT_RESUMED" => Self::AgentResumed,
            "AGENT_RESTARTING" => Self::AgentRestarting,
            "AGENT_ESCALATED" => Self::AgentEscalated,
            "MESSAGE_RECEIVED" => Self::MessageReceived,
            "STATE_CHANGED" => Self::StateChanged,
            "SYSCALL_BLOCKED" => Self::SyscallBlocked,
            "RESOURCE_WARNING" => Self::ResourceWarning,
            _ => Self::Custom,
        }
    }
}

/// One event as delivered to subscribers.
#[derive(Debug, Clone)]
pub struct KernelEvent {
    pub event_type: KernelEventType,
    pub data: Value,
    /// 0 means the kernel itself.
    pub source_agent_id: u32,
    pub timestamp: DateTime<Utc>,
}

impl KernelEvent {
    /// Wire representation used by `POLL_EVENTS`.
    #[must_use]
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "type": self.event_type.as_str(),
            "data": self.data,
            "source_agent_id": self.source_agent_id,
            "timestamp_ms": self.timestamp.timestamp_millis(),
        })
    }
}

#[derive(Debug, Default)]
struct Inner {
    subscriptions: HashMap<u32, HashSet<KernelEventType>>,
    queues: HashMap<u32, VecDeque<KernelEvent>>,
}

/// The pub/sub service.
#[derive(Debug)]
pub struct EventBus {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
        }
    }

    /// Deliver an event to every subscriber of its type.
    pub fn emit(&self, event_type: KernelEventType, data: Value, source_agent_id: u32) {
        let event = KernelEvent {
            event_type,
            data,
            source_agent_id,
            timestamp: Utc::now(),
        };

        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        let interested: Vec<u32> = inner
            .subscriptions
            .iter()
            .filter(|(_, types)| types.contains(&event_type))
            .map(|(&id, _)| id)
            .collect();

        for id in interested {
            let queue = inner.queues.entry(id).or_default();
            if queue.len() >= self.capacity {
                queue.pop_front();
            }
            queue.push_back(event.clone());
        }
    }

    /// Add event types to an agent's subscription set.
    pub fn subscribe(&self, agent_id: u32, types: &[KernelEventType]) {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        inner
            .subscriptions
            .entry(agent_id)
            .or_default()
            .extend(types.iter().copied());
    }

    /// Remove specific types, or everything when `all` is set.
    pub fn unsubscribe(&self, agent_id: u32, types: &[KernelEventType], all: bool) {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        if all {
            inner.subscriptions.remove(&agent_id);
            return;
        }
        if let Some(set) = inner.subscriptions.get_mut(&agent_id) {
            for t in types {
                set.remove(t);
            }
        }
    }

    /// Drain up to `max` pending events in delivery order.
    pub fn poll(&self, agent_id: u32, max: usize) -> Vec<KernelEvent> {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        let Some(queue) = inner.queues.get_mut(&agent_id) else {
            return Vec::new();
        };
        let count = max.min(queue.len());
        queue.drain(..count).collect()
    }

    /// Remove a reaped agent's subscriptions and queue.
    pub fn purge(&self, agent_id: u32) {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        inner.subscriptions.remove(&agent_id);
        inner.queues.remove(&agent_id);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn only_subscribers_of_the_type_receive() {
        let bus = EventBus::default();
        bus.subscribe(1, &[KernelEventType::AgentSpawned]);
        bus.subscribe(2, &[KernelEventType::StateChanged]);

        bus.emit(KernelEventType::AgentSpawned, json!({"name": "w"}), 0);

        assert_eq!(bus.poll(1, 10).len(), 1);
        assert!(bus.poll(2, 10).is_empty());
    }

    #[test]
    fn relative_order_is_preserved() {
        let bus = EventBus::default();
        bus.subscribe(
            1,
            &[KernelEventType::StateChanged, KernelEventType::Custom],
        );

        bus.emit(KernelEventType::StateChanged, json!(1), 0);
        bus.emit(KernelEventType::Custom, json!(2), 0);
        bus.emit(KernelEventType::StateChanged, json!(3), 0);

        let events: Vec<Value> = bus.poll(1, 10).into_iter().map(|e| e.data).collect();
        assert_eq!(events, vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn poll_is_batched() {
        let bus = EventBus::default();
        bus.subscribe(1, &[KernelEventType::Custom]);
        for i in 0..5 {
            bus.emit(KernelEventType::Custom, json!(i), 0);
        }

        assert_eq!(bus.poll(1, 2).len(), 2);
        assert_eq!(bus.poll(1, 10).len(), 3);
        assert!(bus.poll(1, 10).is_empty());
    }

    #[test]
    fn overload_drops_oldest() {
        let bus = EventBus::new(3);
        bus.subscribe(1, &[KernelEventType::Custom]);
        for i in 0..5 {
            bus.emit(KernelEventType::Custom, json!(i), 0);
        }

        let data: Vec<Value> = bus.poll(1, 10).into_iter().map(|e| e.data).collect();
        assert_eq!(data, vec![json!(2), json!(3), json!(4)]);
    }

    #[test]
    fn unsubscribe_specific_and_all() {
        let bus = EventBus::default();
        bus.subscribe(
            1,
            &[KernelEventType::Custom, KernelEventType::StateChanged],
        );

        bus.unsubscribe(1, &[KernelEventType::Custom], false);
        bus.emit(KernelEventType::Custom, json!(1), 0);
        bus.emit(KernelEventType::StateChanged, json!(2), 0);
        assert_eq!(bus.poll(1, 10).len(), 1);

        bus.unsubscribe(1, &[], true);
        bus.emit(KernelEventType::StateChanged, json!(3), 0);
        assert!(bus.poll(1, 10).is_empty());
    }

    #[test]
    fn unknown_wire_names_parse_as_custom() {
        assert_eq!(KernelEventType::parse("NOT_A_THING"), KernelEventType::Custom);
        assert_eq!(
            KernelEventType::parse("AGENT_ESCALATED"),
            KernelEventType::AgentEscalated
        );
    }
}
