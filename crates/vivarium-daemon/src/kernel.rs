//! The kernel context: one value owning every service.
//!
//! Handlers receive a shared reference for the duration of one syscall
//! and take per-service locks only inside single operations. No
//! service holds a pointer back to the kernel, and no lock is held
//! across a call into another service.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::json;
use tracing::info;
use vivarium_core::audit::{AuditCategory, AuditConfig, AuditLog};
use vivarium_core::events::{EventBus, KernelEventType};
use vivarium_core::execution::ExecutionLog;
use vivarium_core::mailbox::MailboxRegistry;
use vivarium_core::permissions::PermissionsStore;
use vivarium_core::protocol::Message;
use vivarium_core::state::StateStore;
use vivarium_core::tasks::AsyncTaskManager;
use vivarium_core::world::WorldEngine;

use crate::agent::manager::{AgentManager, ReapEvent, RestartOutcome};
use crate::config::KernelConfig;
use crate::handlers;
use crate::router::SyscallRouter;
use crate::sandbox::Sandbox;
use crate::tunnel::TunnelState;

/// Per-agent LLM usage accounting, fed by `LLM_REPORT` and the THINK
/// proxy and consulted by the per-minute rate cap.
#[derive(Debug, Default)]
pub struct LlmUsage {
    inner: Mutex<HashMap<u32, AgentLlmUsage>>,
}

#[derive(Debug, Default)]
struct AgentLlmUsage {
    recent: VecDeque<Instant>,
    requests: u64,
    tokens: u64,
}

impl LlmUsage {
    /// Record one call and its token count.
    pub fn record(&self, agent_id: u32, tokens: u64) {
        let mut inner = self.inner.lock().expect("llm usage lock poisoned");
        let usage = inner.entry(agent_id).or_default();
        usage.recent.push_back(Instant::now());
        usage.requests += 1;
        usage.tokens += tokens;
    }

    /// Calls made within the trailing minute.
    #[must_use]
    pub fn calls_in_last_minute(&self, agent_id: u32) -> u32 {
        let mut inner = self.inner.lock().expect("llm usage lock poisoned");
        let Some(usage) = inner.get_mut(&agent_id) else {
            return 0;
        };
        if let Some(cutoff) = Instant::now().checked_sub(std::time::Duration::from_secs(60)) {
            while usage.recent.front().is_some_and(|t| *t < cutoff) {
                usage.recent.pop_front();
            }
        }
        usage.recent.len() as u32
    }

    /// Lifetime `(requests, tokens)` totals for one agent.
    #[must_use]
    pub fn totals(&self, agent_id: u32) -> (u64, u64) {
        let inner = self.inner.lock().expect("llm usage lock poisoned");
        inner
            .get(&agent_id)
            .map_or((0, 0), |u| (u.requests, u.tokens))
    }

    pub fn purge(&self, agent_id: u32) {
        let mut inner = self.inner.lock().expect("llm usage lock poisoned");
        inner.remove(&agent_id);
    }
}

/// The kernel: owns every service singleton.
#[derive(Debug)]
pub struct Kernel {
    config: KernelConfig,
    started_at: Instant,
    ids: Arc<AtomicU32>,
    syscalls_handled: AtomicU64,
    router: SyscallRouter,
    /// Present when constructed inside a tokio runtime; the tunnel
    /// needs it to spawn its relay task.
    runtime: Option<tokio::runtime::Handle>,

    pub permissions: PermissionsStore,
    pub state: StateStore,
    pub mailboxes: MailboxRegistry,
    pub events: EventBus,
    pub audit: AuditLog,
    pub execution: ExecutionLog,
    pub tasks: AsyncTaskManager,
    pub worlds: WorldEngine,
    pub agents: AgentManager,
    pub tunnel: TunnelState,
    pub llm_usage: LlmUsage,
}

impl Kernel {
    /// Build a kernel from configuration and register every syscall
    /// module.
    #[must_use]
    pub fn new(config: KernelConfig) -> Arc<Self> {
        let ids = Arc::new(AtomicU32::new(1));
        let sandbox = Sandbox::new(config.enable_sandboxing);

        let mut router = SyscallRouter::new();
        handlers::register_all(&mut router);

        let kernel = Self {
            permissions: PermissionsStore::new(),
            state: StateStore::new(),
            mailboxes: MailboxRegistry::new(config.mailbox_capacity),
            events: EventBus::new(config.event_capacity),
            audit: AuditLog::new(AuditConfig {
                max_entries: config.audit_max_entries,
                ..AuditConfig::default()
            }),
            execution: ExecutionLog::new(),
            tasks: AsyncTaskManager::new(config.worker_count),
            worlds: WorldEngine::new(),
            agents: AgentManager::new(sandbox, Arc::clone(&ids)),
            tunnel: TunnelState::new(&config.tunnel),
            llm_usage: LlmUsage::default(),
            started_at: Instant::now(),
            syscalls_handled: AtomicU64::new(0),
            router,
            runtime: tokio::runtime::Handle::try_current().ok(),
            ids,
            config,
        };
        Arc::new(kernel)
    }

    #[must_use]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    #[must_use]
    pub fn runtime(&self) -> Option<&tokio::runtime::Handle> {
        self.runtime.as_ref()
    }

    /// Assign the next process-wide agent id. Shared between
    /// connections and spawned agents; never reused within one kernel
    /// lifetime.
    #[must_use]
    pub fn allocate_agent_id(&self) -> u32 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }

    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    #[must_use]
    pub fn syscalls_handled(&self) -> u64 {
        self.syscalls_handled.load(Ordering::Relaxed)
    }

    /// Handle one decoded syscall.
    ///
    /// Replay interception happens before routing: while a replay is
    /// running, side-effecting opcodes are answered from the recorded
    /// transcript and never reach their handlers. While recording,
    /// every handled syscall is appended afterwards.
    #[must_use]
    pub fn dispatch(self: &Arc<Self>, msg: &Message) -> Message {
        self.syscalls_handled.fetch_add(1, Ordering::Relaxed);

        if let Some(op) = msg.op() {
            if op.has_side_effects() && self.execution.replay_active() {
                return match self.execution.next_response(msg.agent_id, op) {
                    Some(payload) => Message::new(msg.agent_id, op, payload),
                    None => Message::json(
                        msg.agent_id,
                        op,
                        &json!({
                            "success": false,
                            "error": format!("replay: no recorded response for {}", op.name()),
                        }),
                    ),
                };
            }
        }

        let response = self.router.handle(self, msg);

        if let Some(op) = msg.op() {
            if self.execution.is_recording() {
                self.execution.record(
                    msg.agent_id,
                    op,
                    &msg.payload_str(),
                    &response.payload_str(),
                );
            }
        }
        response
    }

    /// One supervision tick: reap dead agents, apply restart policy,
    /// respawn due restarts, and translate the outcomes into events
    /// and audit entries.
    pub fn tick(&self) {
        for event in self.agents.reap_and_restart() {
            match event {
                ReapEvent::Exited {
                    id,
                    name,
                    exit_code,
                    will_restart,
                } => {
                    self.events.emit(
                        KernelEventType::AgentExited,
                        json!({
                            "agent": name,
                            "agent_id": id,
                            "exit_code": exit_code,
                            "will_restart": will_restart,
                        }),
                        0,
                    );
                    self.audit.log(
                        AuditCategory::Lifecycle,
                        "AGENT_EXITED",
                        Some(id),
                        json!({"agent": name, "exit_code": exit_code}),
                        exit_code == 0,
                    );
                    self.purge_agent(id);
                }
                ReapEvent::Restarting {
                    name,
                    restart_count,
                    exit_code,
                    delay_ms,
                } => {
                    self.events.emit(
                        KernelEventType::AgentRestarting,
                        json!({
                            "agent": name,
                            "restart_count": restart_count,
                            "exit_code": exit_code,
                            "delay_ms": delay_ms,
                        }),
                        0,
                    );
                    self.audit.log(
                        AuditCategory::Lifecycle,
                        "AGENT_RESTARTING",
                        None,
                        json!({"agent": name, "restart_count": restart_count, "delay_ms": delay_ms}),
                        true,
                    );
                }
                ReapEvent::Escalated {
                    name,
                    restart_count,
                    exit_code,
                } => {
                    self.events.emit(
                        KernelEventType::AgentEscalated,
                        json!({
                            "agent": name,
                            "restart_count": restart_count,
                            "exit_code": exit_code,
                        }),
                        0,
                    );
                    self.audit.log(
                        AuditCategory::Lifecycle,
                        "AGENT_ESCALATED",
                        None,
                        json!({"agent": name, "restart_count": restart_count}),
                        false,
                    );
                }
            }
        }

        for outcome in self.agents.process_pending_restarts() {
            match outcome {
                RestartOutcome::Respawned { name, id, pid } => {
                    self.events.emit(
                        KernelEventType::AgentSpawned,
                        json!({"agent": name, "agent_id": id, "pid": pid, "restarted": true}),
                        0,
                    );
                    self.audit.log(
                        AuditCategory::Lifecycle,
                        "AGENT_RESTARTED",
                        Some(id),
                        json!({"agent": name, "pid": pid}),
                        true,
                    );
                }
                RestartOutcome::Failed { name, error } => {
                    self.audit.log(
                        AuditCategory::Resource,
                        "AGENT_RESTART_FAILED",
                        None,
                        json!({"agent": name, "error": error}),
                        false,
                    );
                }
            }
        }
    }

    /// Drop every per-agent service entry for a reaped id.
    pub fn purge_agent(&self, agent_id: u32) {
        self.mailboxes.purge(agent_id);
        self.events.purge(agent_id);
        self.permissions.purge(agent_id);
        self.tasks.purge(agent_id);
        self.worlds.purge_agent(agent_id);
        self.llm_usage.purge(agent_id);
    }

    /// Shutdown path: stop agents, clear session-scoped state.
    pub fn shutdown(&self) {
        info!("kernel shutting down");
        self.agents.stop_all();
        self.state.clear_session();
    }

    /// Capability strings reported by `HELLO`.
    #[must_use]
    pub fn capabilities(&self) -> Vec<&'static str> {
        let mut caps = vec![
            "exec", "fs", "ipc", "state", "events", "permissions", "http", "audit",
            "recording", "replay", "async", "worlds", "tunnel", "metrics",
        ];
        if self.config.llm.is_some() {
            caps.push("llm");
        }
        caps
    }
}
