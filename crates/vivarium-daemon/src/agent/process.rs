//! Wrapper around one supervised agent process.
//!
//! Owns the child handle, maintains the lifecycle state machine, and
//! captures the exit code when the child dies. Pause and resume are
//! stop/continue signals; stop is a term signal with a grace period
//! followed by a kill.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use serde_json::Value;
use tracing::{debug, warn};
use vivarium_core::KernelError;

use super::{AgentConfig, AgentState};
use crate::sandbox::{cleanup_cgroup, read_memory_current, ChildHandle, Sandbox, SpawnedAgent};

/// How long `stop` waits for a graceful exit before killing.
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// One supervised agent.
#[derive(Debug)]
pub struct AgentProcess {
    id: u32,
    config: AgentConfig,
    state: AgentState,
    handle: Option<ChildHandle>,
    pid: Option<i32>,
    exit_code: Option<i32>,
    cgroup_dir: Option<PathBuf>,
    /// Id of the agent whose syscall spawned this one; 0 for the
    /// operator or kernel.
    parent_id: u32,
    created_at: DateTime<Utc>,
    started_at: Option<Instant>,
}

impl AgentProcess {
    #[must_use]
    pub fn new(id: u32, config: AgentConfig, parent_id: u32) -> Self {
        Self {
            id,
            config,
            state: AgentState::Created,
            handle: None,
            pid: None,
            exit_code: None,
            cgroup_dir: None,
            parent_id,
            created_at: Utc::now(),
            started_at: None,
        }
    }

    /// Start the child via the sandbox.
    ///
    /// # Errors
    ///
    /// Propagates the spawn failure; the state becomes `Failed`.
    pub fn start(&mut self, sandbox: &Sandbox) -> Result<(), KernelError> {
        self.state = AgentState::Starting;
        match sandbox.spawn(&self.config, self.id) {
            Ok(SpawnedAgent {
                pid,
                handle,
                cgroup_dir,
            }) => {
                self.pid = Some(pid);
                self.handle = Some(handle);
                self.cgroup_dir = cgroup_dir;
                self.started_at = Some(Instant::now());
                self.state = AgentState::Running;
                Ok(())
            }
            Err(e) => {
                self.state = AgentState::Failed;
                Err(e)
            }
        }
    }

    /// Non-blocking liveness check; captures the exit code on death.
    ///
    /// Returns `true` while the child is alive (or paused).
    pub fn poll_alive(&mut self) -> bool {
        let exited = match &mut self.handle {
            Some(ChildHandle::Spawned(child)) => match child.try_wait() {
                Ok(Some(status)) => Some(exit_code_of_status(status)),
                Ok(None) => None,
                Err(e) => {
                    warn!(agent = %self.config.name, "try_wait failed: {e}");
                    Some(-1)
                }
            },
            Some(ChildHandle::Forked(pid)) => {
                match waitpid(*pid, Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::StillAlive) => None,
                    Ok(WaitStatus::Exited(_, code)) => Some(code),
                    Ok(WaitStatus::Signaled(_, signal, _)) => Some(128 + signal as i32),
                    Ok(_) => None,
                    // ECHILD: someone else reaped it; treat as gone.
                    Err(_) => Some(-1),
                }
            }
            None => return false,
        };

        if let Some(code) = exited {
            self.mark_exited(code);
            return false;
        }
        true
    }

    fn mark_exited(&mut self, code: i32) {
        self.exit_code = Some(code);
        self.handle = None;
        self.state = if code == 0 {
            AgentState::Stopped
        } else {
            AgentState::Failed
        };
        if let Some(dir) = self.cgroup_dir.take() {
            cleanup_cgroup(&dir);
        }
        debug!(agent = %self.config.name, id = self.id, code, "agent exited");
    }

    /// Stop the child: term signal, grace period, then kill.
    pub fn stop(&mut self, graceful: bool) {
        let Some(pid) = self.pid else {
            return;
        };
        if self.handle.is_none() {
            return;
        }
        self.state = AgentState::Stopping;
        let pid = Pid::from_raw(pid);

        if graceful {
            let _ = kill(pid, Signal::SIGTERM);
            let deadline = Instant::now() + STOP_GRACE_PERIOD;
            while Instant::now() < deadline {
                if !self.poll_alive() {
                    return;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }

        let _ = kill(pid, Signal::SIGKILL);
        // Reap; a killed child exits promptly.
        let deadline = Instant::now() + Duration::from_secs(1);
        while Instant::now() < deadline {
            if !self.poll_alive() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        warn!(agent = %self.config.name, "child did not exit after SIGKILL");
    }

    /// Stop signal; `Running → Paused`.
    ///
    /// # Errors
    ///
    /// [`KernelError::Conflict`] when the agent is not running.
    pub fn pause(&mut self) -> Result<(), KernelError> {
        if self.state != AgentState::Running {
            return Err(KernelError::Conflict(format!(
                "agent '{}' is {}, not RUNNING",
                self.config.name,
                self.state.as_str()
            )));
        }
        let pid = self.pid.ok_or_else(|| {
            KernelError::Internal(format!("running agent '{}' has no pid", self.config.name))
        })?;
        kill(Pid::from_raw(pid), Signal::SIGSTOP)
            .map_err(|e| KernelError::Resource(format!("failed to pause: {e}")))?;
        self.state = AgentState::Paused;
        Ok(())
    }

    /// Continue signal; `Paused → Running`.
    ///
    /// # Errors
    ///
    /// [`KernelError::Conflict`] when the agent is not paused.
    pub fn resume(&mut self) -> Result<(), KernelError> {
        if self.state != AgentState::Paused {
            return Err(KernelError::Conflict(format!(
                "agent '{}' is {}, not PAUSED",
                self.config.name,
                self.state.as_str()
            )));
        }
        let pid = self.pid.ok_or_else(|| {
            KernelError::Internal(format!("paused agent '{}' has no pid", self.config.name))
        })?;
        kill(Pid::from_raw(pid), Signal::SIGCONT)
            .map_err(|e| KernelError::Resource(format!("failed to resume: {e}")))?;
        self.state = AgentState::Running;
        Ok(())
    }

    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub const fn state(&self) -> AgentState {
        self.state
    }

    #[must_use]
    pub const fn pid(&self) -> Option<i32> {
        self.pid
    }

    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    #[must_use]
    pub const fn parent_id(&self) -> u32 {
        self.parent_id
    }

    #[must_use]
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.map_or(0, |t| t.elapsed().as_secs())
    }

    /// Summary row for `LIST`.
    #[must_use]
    pub fn summary(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "name": self.config.name,
            "pid": self.pid.unwrap_or(0),
            "state": self.state.as_str(),
            "uptime": self.uptime_secs(),
            "parent_id": self.parent_id,
        })
    }

    /// Extended snapshot for `METRICS_AGENT`.
    #[must_use]
    pub fn metrics_snapshot(&self, children: &[u32], llm_requests: u64, llm_tokens: u64) -> Value {
        let memory_bytes = self.cgroup_dir.as_deref().and_then(read_memory_current);
        serde_json::json!({
            "id": self.id,
            "name": self.config.name,
            "pid": self.pid.unwrap_or(0),
            "state": self.state.as_str(),
            "uptime_seconds": self.uptime_secs(),
            "created_at_ms": self.created_at.timestamp_millis(),
            "memory_bytes": memory_bytes,
            "sandboxed": self.config.sandboxed,
            "llm_requests": llm_requests,
            "llm_tokens": llm_tokens,
            "parent_id": self.parent_id,
            "children": children,
        })
    }
}

fn exit_code_of_status(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn shell_agent(id: u32, body: &str) -> (tempfile::TempDir, AgentProcess) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.sh");
        write!(std::fs::File::create(&path).unwrap(), "{body}").unwrap();

        let mut config = AgentConfig::new("t", path, dir.path().join("k.sock"));
        config.interpreter = "sh".to_string();
        config.sandboxed = false;
        (dir, AgentProcess::new(id, config, 0))
    }

    fn wait_dead(agent: &mut AgentProcess) {
        for _ in 0..300 {
            if !agent.poll_alive() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("agent did not exit");
    }

    #[test]
    fn clean_exit_becomes_stopped() {
        let (_dir, mut agent) = shell_agent(1, "exit 0");
        agent.start(&Sandbox::new(false)).unwrap();
        assert_eq!(agent.state(), AgentState::Running);

        wait_dead(&mut agent);
        assert_eq!(agent.state(), AgentState::Stopped);
        assert_eq!(agent.exit_code(), Some(0));
    }

    #[test]
    fn failure_exit_becomes_failed() {
        let (_dir, mut agent) = shell_agent(2, "exit 3");
        agent.start(&Sandbox::new(false)).unwrap();
        wait_dead(&mut agent);
        assert_eq!(agent.state(), AgentState::Failed);
        assert_eq!(agent.exit_code(), Some(3));
    }

    #[test]
    fn stop_terminates_a_sleeper() {
        let (_dir, mut agent) = shell_agent(3, "sleep 30");
        agent.start(&Sandbox::new(false)).unwrap();
        assert!(agent.poll_alive());

        agent.stop(true);
        assert!(!agent.poll_alive());
        assert_ne!(agent.state(), AgentState::Running);
    }

    #[test]
    fn pause_and_resume_transition_states() {
        let (_dir, mut agent) = shell_agent(4, "sleep 30");
        agent.start(&Sandbox::new(false)).unwrap();

        agent.pause().unwrap();
        assert_eq!(agent.state(), AgentState::Paused);
        // Pausing twice is a conflict.
        assert!(agent.pause().is_err());

        agent.resume().unwrap();
        assert_eq!(agent.state(), AgentState::Running);
        assert!(agent.resume().is_err());

        agent.stop(false);
    }

    #[test]
    fn summary_shape() {
        let (_dir, mut agent) = shell_agent(5, "sleep 30");
        agent.start(&Sandbox::new(false)).unwrap();
        let summary = agent.summary();
        assert_eq!(summary["id"], 5);
        assert_eq!(summary["name"], "t");
        assert_eq!(summary["state"], "RUNNING");
        assert!(summary["pid"].as_i64().unwrap() > 0);
        agent.stop(false);
    }
}
