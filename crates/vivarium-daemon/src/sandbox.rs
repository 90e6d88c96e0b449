//! Agent sandboxing.
//!
//! On a host with root privileges and a cgroup v2 mount, agents are
//! started on the full-isolation path: a fresh control group under
//! `vivarium/<name>_<id>` with the configured memory, CPU-bandwidth,
//! and PID limits, then a fork whose child unshares PID, mount, and
//! UTS namespaces (network too unless the agent is granted network)
//! and execs the agent's interpreter.
//!
//! Without those capabilities the kernel degrades to a plain
//! `Command` spawn with no isolation and logs a one-time warning.
//! Resource limits are only enforced on the isolation path.

use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Once;

use nix::sched::{unshare, CloneFlags};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{debug, warn};
use vivarium_core::protocol::SOCKET_ENV_VAR;
use vivarium_core::KernelError;

use crate::agent::AgentConfig;

/// Parent directory for agent control groups, relative to the cgroup
/// v2 mount root.
const CGROUP_PARENT: &str = "vivarium";

static FALLBACK_WARNING: Once = Once::new();

/// Handle to a started child, depending on how it was spawned.
#[derive(Debug)]
pub enum ChildHandle {
    /// Plain `Command` spawn (fallback path).
    Spawned(std::process::Child),
    /// Raw forked child (isolation path).
    Forked(Pid),
}

/// A successfully started agent process.
#[derive(Debug)]
pub struct SpawnedAgent {
    pub pid: i32,
    pub handle: ChildHandle,
    /// Control group directory, present only on the isolation path.
    pub cgroup_dir: Option<PathBuf>,
}

/// Spawner choosing between full isolation and plain fork/exec.
#[derive(Debug)]
pub struct Sandbox {
    enabled: bool,
    cgroup_root: PathBuf,
}

impl Sandbox {
    #[must_use]
    pub fn new(enable_sandboxing: bool) -> Self {
        Self {
            enabled: enable_sandboxing,
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
        }
    }

    /// Whether the host lets us take the full-isolation path.
    #[must_use]
    pub fn isolation_available(&self) -> bool {
        self.enabled
            && nix::unistd::Uid::effective().is_root()
            && self.cgroup_root.join("cgroup.controllers").exists()
    }

    /// Start an agent process.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Resource`] when the spawn fails on either
    /// path.
    pub fn spawn(&self, config: &AgentConfig, agent_id: u32) -> Result<SpawnedAgent, KernelError> {
        if config.sandboxed && self.isolation_available() {
            self.spawn_isolated(config, agent_id)
        } else {
            if config.sandboxed && self.enabled {
                FALLBACK_WARNING.call_once(|| {
                    warn!(
                        "sandbox capabilities unavailable (need root and a cgroup v2 mount); \
                         falling back to plain fork/exec without isolation"
                    );
                });
            }
            self.spawn_plain(config)
        }
    }

    fn spawn_plain(&self, config: &AgentConfig) -> Result<SpawnedAgent, KernelError> {
        let child = Command::new(&config.interpreter)
            .arg(&config.script)
            .env(SOCKET_ENV_VAR, &config.socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                KernelError::Resource(format!("failed to spawn agent '{}': {e}", config.name))
            })?;

        let pid = child.id() as i32;
        debug!(agent = %config.name, pid, "spawned agent without isolation");
        Ok(SpawnedAgent {
            pid,
            handle: ChildHandle::Spawned(child),
            cgroup_dir: None,
        })
    }

    fn spawn_isolated(
        &self,
        config: &AgentConfig,
        agent_id: u32,
    ) -> Result<SpawnedAgent, KernelError> {
        let cgroup_dir = self.create_cgroup(config, agent_id)?;

        // Everything the child needs is prepared before the fork; the
        // child itself only issues raw syscalls until exec.
        let argv = build_argv(config)?;
        let envp = build_envp(config)?;
        let hostname = CString::new(config.name.as_str())
            .map_err(|_| KernelError::Resource("agent name contains NUL".into()))?;

        let mut clone_flags =
            CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWUTS;
        if !config.network {
            clone_flags |= CloneFlags::CLONE_NEWNET;
        }

        // SAFETY: the child calls only async-signal-safe interfaces
        // (unshare, mount, sethostname, execvpe, _exit); all
        // allocations happened before the fork.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                if let Err(e) =
                    std::fs::write(cgroup_dir.join("cgroup.procs"), child.as_raw().to_string())
                {
                    warn!(agent = %config.name, "failed to place child in cgroup: {e}");
                }
                debug!(
                    agent = %config.name,
                    pid = child.as_raw(),
                    cgroup = %cgroup_dir.display(),
                    "spawned agent with namespace isolation"
                );
                Ok(SpawnedAgent {
                    pid: child.as_raw(),
                    handle: ChildHandle::Forked(child),
                    cgroup_dir: Some(cgroup_dir),
                })
            }
            Ok(ForkResult::Child) => {
                let _ = unshare(clone_flags);
                // Re-mount the root privately so mount changes cannot
                // leak back to the host view.
                let _ = nix::mount::mount(
                    None::<&str>,
                    "/",
                    None::<&str>,
                    nix::mount::MsFlags::MS_REC | nix::mount::MsFlags::MS_PRIVATE,
                    None::<&str>,
                );
                let _ = nix::unistd::sethostname(
                    <std::ffi::OsStr as std::os::unix::ffi::OsStrExt>::from_bytes(
                        hostname.as_bytes(),
                    ),
                );
                let _ = nix::unistd::execvpe(&argv[0], &argv, &envp);
                // Exec failed; nothing sane left to do in this child.
                unsafe { nix::libc::_exit(127) }
            }
            Err(e) => {
                let _ = std::fs::remove_dir(&cgroup_dir);
                Err(KernelError::Resource(format!(
                    "fork failed for agent '{}': {e}",
                    config.name
                )))
            }
        }
    }

    fn create_cgroup(&self, config: &AgentConfig, agent_id: u32) -> Result<PathBuf, KernelError> {
        let dir = self
            .cgroup_root
            .join(CGROUP_PARENT)
            .join(format!("{}_{agent_id}", config.name));
        std::fs::create_dir_all(&dir).map_err(|e| {
            KernelError::Resource(format!(
                "failed to create cgroup {}: {e}",
                dir.display()
            ))
        })?;

        if let Some(memory) = config.limits.memory_bytes {
            write_limit(&dir, "memory.max", &memory.to_string());
        }
        if let Some(quota) = config.limits.cpu_quota_us {
            write_limit(
                &dir,
                "cpu.max",
                &format!("{quota} {}", config.limits.cpu_period_us),
            );
        }
        if let Some(pids) = config.limits.max_pids {
            write_limit(&dir, "pids.max", &pids.to_string());
        }

        Ok(dir)
    }
}

/// Best-effort removal of an agent's control group after exit.
pub fn cleanup_cgroup(dir: &Path) {
    if let Err(e) = std::fs::remove_dir(dir) {
        debug!(cgroup = %dir.display(), "cgroup not removed: {e}");
    }
}

/// Read current memory usage from an agent's cgroup.
#[must_use]
pub fn read_memory_current(dir: &Path) -> Option<u64> {
    let text = std::fs::read_to_string(dir.join("memory.current")).ok()?;
    text.trim().parse().ok()
}

fn write_limit(dir: &Path, file: &str, value: &str) {
    if let Err(e) = std::fs::write(dir.join(file), value) {
        warn!(file, value, "failed to write cgroup limit: {e}");
    }
}

fn build_argv(config: &AgentConfig) -> Result<Vec<CString>, KernelError> {
    let nul = |_| KernelError::Resource("agent command contains NUL".into());
    Ok(vec![
        CString::new(config.interpreter.as_str()).map_err(nul)?,
        CString::new(config.script.to_string_lossy().into_owned()).map_err(nul)?,
    ])
}

fn build_envp(config: &AgentConfig) -> Result<Vec<CString>, KernelError> {
    let mut envp = Vec::new();
    for (key, value) in std::env::vars() {
        if key != SOCKET_ENV_VAR {
            if let Ok(entry) = CString::new(format!("{key}={value}")) {
                envp.push(entry);
            }
        }
    }
    envp.push(
        CString::new(format!(
            "{SOCKET_ENV_VAR}={}",
            config.socket_path.to_string_lossy()
        ))
        .map_err(|_| KernelError::Resource("socket path contains NUL".into()))?,
    );
    Ok(envp)
}
