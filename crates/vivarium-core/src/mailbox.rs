//! Named-agent registry and per-agent IPC mailboxes.
//!
//! Names are unique: a second `REGISTER` for a taken name fails and
//! leaves the earlier binding intact. Each recipient has one FIFO
//! queue; ordering is guaranteed within a queue, never across queues.
//!
//! Queues are bounded. A send to a full mailbox fails with an overflow
//! error so a hostile sender cannot exhaust kernel memory.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

use serde_json::Value;

use crate::KernelError;

/// Default per-mailbox capacity.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 1024;

/// One queued inter-agent message.
#[derive(Debug, Clone)]
pub struct IpcMessage {
    pub from_id: u32,
    /// Sender's registered name at send time; empty if unregistered.
    pub from_name: String,
    pub body: Value,
    pub enqueued_at: Instant,
}

#[derive(Debug)]
struct Inner {
    names: HashMap<String, u32>,
    ids_to_names: HashMap<u32, String>,
    queues: HashMap<u32, VecDeque<IpcMessage>>,
}

/// Name registry plus mailbox queues.
#[derive(Debug)]
pub struct MailboxRegistry {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl Default for MailboxRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAILBOX_CAPACITY)
    }
}

impl MailboxRegistry {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                names: HashMap::new(),
                ids_to_names: HashMap::new(),
                queues: HashMap::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    /// Claim `name` for `agent_id`.
    ///
    /// An agent re-registering under a new name releases its old one.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Conflict`] if another agent holds the
    /// name.
    pub fn register(&self, agent_id: u32, name: &str) -> Result<(), KernelError> {
        let mut inner = self.inner.lock().expect("mailbox lock poisoned");

        if let Some(&holder) = inner.names.get(name) {
            if holder == agent_id {
                return Ok(());
            }
            return Err(KernelError::Conflict(format!(
                "name '{name}' already registered"
            )));
        }

        if let Some(old) = inner.ids_to_names.insert(agent_id, name.to_string()) {
            inner.names.remove(&old);
        }
        inner.names.insert(name.to_string(), agent_id);
        inner.queues.entry(agent_id).or_default();
        Ok(())
    }

    /// Resolve a name to an agent id.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<u32> {
        let inner = self.inner.lock().expect("mailbox lock poisoned");
        inner.names.get(name).copied()
    }

    /// The registered name of an agent, if any.
    #[must_use]
    pub fn name_of(&self, agent_id: u32) -> Option<String> {
        let inner = self.inner.lock().expect("mailbox lock poisoned");
        inner.ids_to_names.get(&agent_id).cloned()
    }

    /// Enqueue a message for one recipient.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Overflow`] when the recipient's queue is
    /// at capacity.
    pub fn enqueue(&self, target_id: u32, msg: IpcMessage) -> Result<(), KernelError> {
        let mut inner = self.inner.lock().expect("mailbox lock poisoned");
        let queue = inner.queues.entry(target_id).or_default();
        if queue.len() >= self.capacity {
            return Err(KernelError::Overflow(format!(
                "mailbox for agent {target_id} is full ({} messages)",
                self.capacity
            )));
        }
        queue.push_back(msg);
        Ok(())
    }

    /// Drain up to `max` messages in enqueue order. Non-blocking.
    pub fn dequeue(&self, agent_id: u32, max: usize) -> Vec<IpcMessage> {
        let mut inner = self.inner.lock().expect("mailbox lock poisoned");
        let Some(queue) = inner.queues.get_mut(&agent_id) else {
            return Vec::new();
        };
        let count = max.min(queue.len());
        queue.drain(..count).collect()
    }

    /// Deliver a message to every registered agent, skipping full
    /// mailboxes. Returns the number of recipients reached.
    pub fn broadcast(&self, msg: &IpcMessage, include_self: bool) -> usize {
        let mut inner = self.inner.lock().expect("mailbox lock poisoned");
        let targets: Vec<u32> = inner
            .ids_to_names
            .keys()
            .copied()
            .filter(|&id| include_self || id != msg.from_id)
            .collect();

        let mut delivered = 0;
        for id in targets {
            let queue = inner.queues.entry(id).or_default();
            if queue.len() < self.capacity {
                queue.push_back(msg.clone());
                delivered += 1;
            }
        }
        delivered
    }

    /// Number of messages waiting for an agent.
    #[must_use]
    pub fn pending(&self, agent_id: u32) -> usize {
        let inner = self.inner.lock().expect("mailbox lock poisoned");
        inner.queues.get(&agent_id).map_or(0, VecDeque::len)
    }

    /// Remove a reaped agent's name binding and queue.
    pub fn purge(&self, agent_id: u32) {
        let mut inner = self.inner.lock().expect("mailbox lock poisoned");
        if let Some(name) = inner.ids_to_names.remove(&agent_id) {
            inner.names.remove(&name);
        }
        inner.queues.remove(&agent_id);
    }
}
