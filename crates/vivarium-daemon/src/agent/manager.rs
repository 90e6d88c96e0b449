//! The agent manager: owns every agent process and drives the restart
//! protocol.
//!
//! Two entry points are driven by the kernel tick:
//!
//! - [`AgentManager::reap_and_restart`] notices children that died
//!   while recorded as running, consults the saved restart policy, and
//!   queues pending restarts with exponential backoff.
//! - [`AgentManager::process_pending_restarts`] respawns entries whose
//!   backoff has elapsed.
//!
//! Restart accounting lives per agent name in a window:
//! `(restart_count, window_start, consecutive_failures, escalated)`.
//! Hitting `max_restarts` inside one window escalates exactly once and
//! stops further attempts. `consecutive_failures` is not reset by a
//! successful spawn — only an expired window resets it — so repeated
//! crashes converge on the maximum backoff.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, info, warn};
use vivarium_core::restart::RestartPolicy;
use vivarium_core::KernelError;

use super::process::AgentProcess;
use super::{AgentConfig, AgentSelector, AgentState};
use crate::sandbox::Sandbox;

/// Restart accounting for one agent name.
#[derive(Debug, Clone)]
struct RestartState {
    restart_count: u32,
    window_start: Instant,
    consecutive_failures: u32,
    escalated: bool,
}

impl RestartState {
    fn new() -> Self {
        Self {
            restart_count: 0,
            window_start: Instant::now(),
            consecutive_failures: 0,
            escalated: false,
        }
    }
}

/// A restart waiting for its backoff to elapse.
#[derive(Debug)]
struct PendingRestart {
    name: String,
    due_at: Instant,
    config: AgentConfig,
    parent_id: u32,
}

/// What a reap cycle observed; the kernel translates these into bus
/// events and audit entries.
#[derive(Debug)]
pub enum ReapEvent {
    Exited {
        id: u32,
        name: String,
        exit_code: i32,
        will_restart: bool,
    },
    Restarting {
        name: String,
        restart_count: u32,
        exit_code: i32,
        delay_ms: u64,
    },
    Escalated {
        name: String,
        restart_count: u32,
        exit_code: i32,
    },
}

/// Outcome of one attempted scheduled restart.
#[derive(Debug)]
pub enum RestartOutcome {
    Respawned { name: String, id: u32, pid: i32 },
    Failed { name: String, error: String },
}

/// Successful spawn result.
#[derive(Debug, Clone, Copy)]
pub struct SpawnInfo {
    pub id: u32,
    pub pid: i32,
}

#[derive(Default)]
struct Inner {
    agents: HashMap<u32, AgentProcess>,
    by_name: HashMap<String, u32>,
    saved_configs: HashMap<String, (AgentConfig, u32)>,
    restart_states: HashMap<String, RestartState>,
    pending: Vec<PendingRestart>,
}

/// Owns every agent process.
pub struct AgentManager {
    inner: Mutex<Inner>,
    sandbox: Sandbox,
    ids: Arc<AtomicU32>,
}

impl std::fmt::Debug for AgentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentManager")
            .field("agents", &self.count())
            .finish_non_exhaustive()
    }
}

impl AgentManager {
    #[must_use]
    pub fn new(sandbox: Sandbox, ids: Arc<AtomicU32>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            sandbox,
            ids,
        }
    }

    /// Spawn a new agent.
    ///
    /// # Errors
    ///
    /// [`KernelError::Conflict`] for a duplicate name,
    /// [`KernelError::Resource`] when the process cannot be started.
    pub fn spawn(&self, config: AgentConfig, parent_id: u32) -> Result<SpawnInfo, KernelError> {
        let mut inner = self.inner.lock().expect("agent manager lock poisoned");

        if inner.by_name.contains_key(&config.name) {
            return Err(KernelError::Conflict(format!(
                "agent '{}' already exists",
                config.name
            )));
        }

        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        let mut agent = AgentProcess::new(id, config.clone(), parent_id);
        agent.start(&self.sandbox)?;
        let pid = agent.pid().unwrap_or(0);

        inner.by_name.insert(config.name.clone(), id);
        inner.agents.insert(id, agent);

        if config.restart.policy != RestartPolicy::Never {
            inner
                .saved_configs
                .insert(config.name.clone(), (config.clone(), parent_id));
            inner
                .restart_states
                .entry(config.name.clone())
                .or_insert_with(RestartState::new);
        }

        info!(agent = %config.name, id, pid, "agent spawned");
        Ok(SpawnInfo { id, pid })
    }

    /// Stop and remove an agent. Cancels any restart bookkeeping.
    ///
    /// # Errors
    ///
    /// [`KernelError::NotFound`] for an unknown selector.
    pub fn kill(&self, selector: &AgentSelector) -> Result<(u32, String), KernelError> {
        let mut inner = self.inner.lock().expect("agent manager lock poisoned");
        let id = resolve(&inner, selector)?;

        let mut agent = inner.agents.remove(&id).expect("index out of sync");
        let name = agent.name().to_string();
        inner.by_name.remove(&name);
        inner.saved_configs.remove(&name);
        inner.restart_states.remove(&name);
        inner.pending.retain(|p| p.name != name);
        drop(inner);

        agent.stop(true);
        info!(agent = %name, id, "agent killed");
        Ok((id, name))
    }

    /// Pause an agent.
    ///
    /// # Errors
    ///
    /// Not-found or invalid-state errors from the process wrapper.
    pub fn pause(&self, selector: &AgentSelector) -> Result<(u32, String), KernelError> {
        let mut inner = self.inner.lock().expect("agent manager lock poisoned");
        let id = resolve(&inner, selector)?;
        let agent = inner.agents.get_mut(&id).expect("index out of sync");
        agent.pause()?;
        Ok((id, agent.name().to_string()))
    }

    /// Resume a paused agent.
    ///
    /// # Errors
    ///
    /// Not-found or invalid-state errors from the process wrapper.
    pub fn resume(&self, selector: &AgentSelector) -> Result<(u32, String), KernelError> {
        let mut inner = self.inner.lock().expect("agent manager lock poisoned");
        let id = resolve(&inner, selector)?;
        let agent = inner.agents.get_mut(&id).expect("index out of sync");
        agent.resume()?;
        Ok((id, agent.name().to_string()))
    }

    /// Summary rows for `LIST`, ordered by id.
    #[must_use]
    pub fn list(&self) -> Vec<Value> {
        let inner = self.inner.lock().expect("agent manager lock poisoned");
        let mut ids: Vec<u32> = inner.agents.keys().copied().collect();
        ids.sort_unstable();
        ids.iter()
            .map(|id| inner.agents[id].summary())
            .collect()
    }

    /// Extended metrics for one agent.
    #[must_use]
    pub fn metrics(
        &self,
        selector: &AgentSelector,
        llm_requests: u64,
        llm_tokens: u64,
    ) -> Option<Value> {
        let inner = self.inner.lock().expect("agent manager lock poisoned");
        let id = resolve(&inner, selector).ok()?;
        let children: Vec<u32> = inner
            .agents
            .values()
            .filter(|a| a.parent_id() == id)
            .map(AgentProcess::id)
            .collect();
        inner
            .agents
            .get(&id)
            .map(|a| a.metrics_snapshot(&children, llm_requests, llm_tokens))
    }

    /// Resolve a selector to an agent id without touching the agent.
    #[must_use]
    pub fn resolve_id(&self, selector: &AgentSelector) -> Option<u32> {
        let inner = self.inner.lock().expect("agent manager lock poisoned");
        resolve(&inner, selector).ok()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.lock().expect("agent manager lock poisoned").agents.len()
    }

    /// Detect dead agents, apply restart policy, queue backoffs.
    pub fn reap_and_restart(&self) -> Vec<ReapEvent> {
        let mut inner = self.inner.lock().expect("agent manager lock poisoned");
        let mut events = Vec::new();

        let dead: Vec<u32> = inner
            .agents
            .iter_mut()
            .filter_map(|(&id, agent)| {
                let was_supervised =
                    matches!(agent.state(), AgentState::Running | AgentState::Paused);
                if was_supervised && !agent.poll_alive() {
                    Some(id)
                } else {
                    None
                }
            })
            .collect();

        for id in dead {
            let agent = inner.agents.remove(&id).expect("index out of sync");
            let name = agent.name().to_string();
            let exit_code = agent.exit_code().unwrap_or(-1);
            inner.by_name.remove(&name);
            warn!(agent = %name, id, exit_code, "agent died unexpectedly");

            let Some((config, parent_id)) = inner.saved_configs.get(&name).cloned() else {
                events.push(ReapEvent::Exited {
                    id,
                    name,
                    exit_code,
                    will_restart: false,
                });
                continue;
            };

            if !config.restart.policy.applies_to(exit_code) {
                inner.saved_configs.remove(&name);
                inner.restart_states.remove(&name);
                events.push(ReapEvent::Exited {
                    id,
                    name,
                    exit_code,
                    will_restart: false,
                });
                continue;
            }

            let state = inner
                .restart_states
                .entry(name.clone())
                .or_insert_with(RestartState::new);

            // An expired window resets all accounting, including the
            // escalation latch.
            if state.window_start.elapsed().as_secs() >= config.restart.window_secs {
                *state = RestartState::new();
                debug!(agent = %name, "restart window reset");
            }

            if state.restart_count >= config.restart.max_restarts {
                let already_escalated = state.escalated;
                state.escalated = true;
                let restart_count = state.restart_count;
                events.push(ReapEvent::Exited {
                    id,
                    name: name.clone(),
                    exit_code,
                    will_restart: false,
                });
                if !already_escalated {
                    warn!(
                        agent = %name,
                        max_restarts = config.restart.max_restarts,
                        "restart limit reached, escalating"
                    );
                    events.push(ReapEvent::Escalated {
                        name,
                        restart_count,
                        exit_code,
                    });
                }
                continue;
            }

            let delay = config.restart.backoff_delay(state.consecutive_failures);
            state.restart_count += 1;
            state.consecutive_failures += 1;
            let restart_count = state.restart_count;

            info!(
                agent = %name,
                attempt = restart_count,
                max = config.restart.max_restarts,
                delay_ms = delay.as_millis() as u64,
                "scheduling restart"
            );
            inner.pending.push(PendingRestart {
                name: name.clone(),
                due_at: Instant::now() + delay,
                config,
                parent_id,
            });

            events.push(ReapEvent::Exited {
                id,
                name: name.clone(),
                exit_code,
                will_restart: true,
            });
            events.push(ReapEvent::Restarting {
                name,
                restart_count,
                exit_code,
                delay_ms: delay.as_millis() as u64,
            });
        }

        events
    }

    /// Respawn every pending restart whose backoff has elapsed.
    pub fn process_pending_restarts(&self) -> Vec<RestartOutcome> {
        let due: Vec<PendingRestart> = {
            let mut inner = self.inner.lock().expect("agent manager lock poisoned");
            let now = Instant::now();
            let mut due = Vec::new();
            let mut remaining = Vec::new();
            for pending in inner.pending.drain(..) {
                if pending.due_at <= now {
                    due.push(pending);
                } else {
                    remaining.push(pending);
                }
            }
            inner.pending = remaining;
            due
        };

        let mut outcomes = Vec::new();
        for pending in due {
            match self.spawn(pending.config, pending.parent_id) {
                Ok(info) => {
                    info!(agent = %pending.name, id = info.id, pid = info.pid, "agent restarted");
                    outcomes.push(RestartOutcome::Respawned {
                        name: pending.name,
                        id: info.id,
                        pid: info.pid,
                    });
                }
                Err(e) => {
                    // The next reap cycle observes nothing for this
                    // name; the failure is terminal for this attempt.
                    warn!(agent = %pending.name, "restart failed: {e}");
                    outcomes.push(RestartOutcome::Failed {
                        name: pending.name,
                        error: e.wire_message(),
                    });
                }
            }
        }
        outcomes
    }

    /// Stop every agent; used at kernel shutdown.
    pub fn stop_all(&self) {
        let mut inner = self.inner.lock().expect("agent manager lock poisoned");
        let mut agents: Vec<AgentProcess> = inner.agents.drain().map(|(_, a)| a).collect();
        inner.by_name.clear();
        inner.saved_configs.clear();
        inner.restart_states.clear();
        inner.pending.clear();
        drop(inner);

        for agent in &mut agents {
            agent.stop(true);
        }
        if !agents.is_empty() {
            info!(count = agents.len(), "stopped all agents");
        }
    }
}

fn resolve(inner: &Inner, selector: &AgentSelector) -> Result<u32, KernelError> {
    match selector {
        AgentSelector::Name(name) => inner
            .by_name
            .get(name)
            .copied()
            .ok_or_else(|| KernelError::NotFound(format!("agent '{name}'"))),
        AgentSelector::Id(id) => {
            if inner.agents.contains_key(id) {
                Ok(*id)
            } else {
                Err(KernelError::NotFound(format!("agent #{id}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use vivarium_core::restart::RestartConfig;

    use super::*;

    fn manager() -> AgentManager {
        AgentManager::new(Sandbox::new(false), Arc::new(AtomicU32::new(1)))
    }

    fn shell_config(dir: &tempfile::TempDir, name: &str, body: &str) -> AgentConfig {
        let path = dir.path().join(format!("{name}.sh"));
        write!(std::fs::File::create(&path).unwrap(), "{body}").unwrap();
        let mut config = AgentConfig::new(name, path, dir.path().join("k.sock"));
        config.interpreter = "sh".to_string();
        config.sandboxed = false;
        config
    }

    #[test]
    fn spawn_list_kill() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager();
        let info = mgr.spawn(shell_config(&dir, "w", "sleep 30"), 0).unwrap();
        assert!(info.pid > 0);

        let list = mgr.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["name"], "w");
        assert_eq!(list[0]["state"], "RUNNING");

        let (id, name) = mgr.kill(&AgentSelector::Name("w".into())).unwrap();
        assert_eq!(id, info.id);
        assert_eq!(name, "w");
        assert!(mgr.list().is_empty());
    }

    #[test]
    fn duplicate_name_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager();
        mgr.spawn(shell_config(&dir, "w", "sleep 30"), 0).unwrap();
        let err = mgr.spawn(shell_config(&dir, "w", "sleep 30"), 0).unwrap_err();
        assert!(matches!(err, KernelError::Conflict(_)));
        mgr.stop_all();
    }

    #[test]
    fn kill_unknown_is_not_found() {
        let mgr = manager();
        assert!(matches!(
            mgr.kill(&AgentSelector::Name("ghost".into())),
            Err(KernelError::NotFound(_))
        ));
        assert!(matches!(
            mgr.kill(&AgentSelector::Id(99)),
            Err(KernelError::NotFound(_))
        ));
    }

    fn wait_for_events(mgr: &AgentManager, mut pred: impl FnMut(&[ReapEvent]) -> bool) -> Vec<ReapEvent> {
        let mut all = Vec::new();
        for _ in 0..400 {
            all.extend(mgr.reap_and_restart());
            mgr.process_pending_restarts();
            if pred(&all) {
                return all;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("expected reap events did not arrive; saw {all:?}");
    }

    #[test]
    fn no_policy_means_no_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager();
        mgr.spawn(shell_config(&dir, "once", "exit 1"), 0).unwrap();

        let events = wait_for_events(&mgr, |events| {
            events
                .iter()
                .any(|e| matches!(e, ReapEvent::Exited { .. }))
        });
        assert!(events
            .iter()
            .any(|e| matches!(e, ReapEvent::Exited { will_restart: false, exit_code: 1, .. })));
        assert_eq!(mgr.count(), 0);
    }

    #[test]
    fn on_failure_restarts_until_escalation() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager();

        let mut config = shell_config(&dir, "crasher", "exit 1");
        config.restart = RestartConfig {
            policy: RestartPolicy::OnFailure,
            max_restarts: 3,
            window_secs: 60,
            backoff_initial_ms: 10,
            backoff_max_ms: 50,
            backoff_multiplier: 2.0,
        };
        mgr.spawn(config, 0).unwrap();

        let events = wait_for_events(&mgr, |events| {
            events
                .iter()
                .any(|e| matches!(e, ReapEvent::Escalated { .. }))
        });

        let restarts: Vec<&ReapEvent> = events
            .iter()
            .filter(|e| matches!(e, ReapEvent::Restarting { .. }))
            .collect();
        assert_eq!(restarts.len(), 3);

        // Delays follow initial * multiplier^k, capped.
        let delays: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                ReapEvent::Restarting { delay_ms, .. } => Some(*delay_ms),
                _ => None,
            })
            .collect();
        assert_eq!(delays, vec![10, 20, 40]);

        let escalations = events
            .iter()
            .filter(|e| matches!(e, ReapEvent::Escalated { .. }))
            .count();
        assert_eq!(escalations, 1);

        // No further attempts after escalation.
        std::thread::sleep(Duration::from_millis(100));
        let more = mgr.reap_and_restart();
        assert!(more.is_empty());
        assert_eq!(mgr.count(), 0);
    }

    #[test]
    fn on_failure_ignores_clean_exit() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager();

        let mut config = shell_config(&dir, "clean", "exit 0");
        config.restart = RestartConfig {
            policy: RestartPolicy::OnFailure,
            backoff_initial_ms: 10,
            ..RestartConfig::default()
        };
        mgr.spawn(config, 0).unwrap();

        let events = wait_for_events(&mgr, |events| !events.is_empty());
        assert!(events
            .iter()
            .all(|e| matches!(e, ReapEvent::Exited { will_restart: false, .. })));
    }

    #[test]
    fn kill_cancels_pending_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager();

        let mut config = shell_config(&dir, "flappy", "exit 1");
        config.restart = RestartConfig {
            policy: RestartPolicy::Always,
            backoff_initial_ms: 5_000,
            ..RestartConfig::default()
        };
        mgr.spawn(config, 0).unwrap();

        wait_for_events(&mgr, |events| {
            events
                .iter()
                .any(|e| matches!(e, ReapEvent::Restarting { .. }))
        });

        // The agent is gone but a restart is pending; kill by name no
        // longer resolves, so cancel via the pending queue directly.
        assert!(mgr.kill(&AgentSelector::Name("flappy".into())).is_err());
        {
            let mut inner = mgr.inner.lock().unwrap();
            inner.pending.clear();
            inner.saved_configs.remove("flappy");
        }
        std::thread::sleep(Duration::from_millis(30));
        assert!(mgr.process_pending_restarts().is_empty());
    }
}
