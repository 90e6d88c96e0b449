//! Relay tunnel: bridges remote agents onto the local router.
//!
//! The kernel dials out to a relay over TCP and authenticates with a
//! machine token. The relay speaks the same 17-byte frame protocol as
//! local agents; frames arriving from it carry the relay-side agent id
//! and are dispatched through the router with that id offset into a
//! reserved high range, so remote agents can never collide with local
//! ones. Responses are shipped back with the original id so the relay
//! can route them.
//!
//! From the router's perspective a tunneled syscall is
//! indistinguishable from a local one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use vivarium_core::events::KernelEventType;
use vivarium_core::protocol::{FrameCodec, Message, SyscallOp};

use crate::config::TunnelConfig;
use crate::kernel::Kernel;

/// Remote agent ids live at and above this offset.
pub const REMOTE_ID_BASE: u32 = 0x8000_0000;

/// Default delay between reconnect attempts.
const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// How long `TUNNEL_CONNECT` waits for the first connection attempt.
const CONNECT_WAIT: Duration = Duration::from_secs(3);

/// One remote agent visible through the tunnel.
#[derive(Debug, Clone)]
pub struct RemoteAgentInfo {
    pub agent_id: u32,
    pub name: String,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Settings {
    relay_addr: Option<String>,
    machine_id: String,
    token: Option<String>,
    reconnect_interval: Duration,
}

#[derive(Debug)]
struct Shared {
    settings: Settings,
    connected: bool,
    connected_since: Option<DateTime<Utc>>,
    remotes: HashMap<u32, RemoteAgentInfo>,
    last_error: Option<String>,
}

/// Tunnel configuration and live status, shared between handlers and
/// the relay task.
#[derive(Debug)]
pub struct TunnelState {
    inner: Mutex<Shared>,
    /// Bumped on every disconnect; a relay task exits when its
    /// generation is stale.
    generation: AtomicU64,
}

impl TunnelState {
    #[must_use]
    pub fn new(config: &TunnelConfig) -> Self {
        Self {
            inner: Mutex::new(Shared {
                settings: Settings {
                    relay_addr: config.relay_addr.clone(),
                    machine_id: config
                        .machine_id
                        .clone()
                        .unwrap_or_else(default_machine_id),
                    token: config.token.clone(),
                    reconnect_interval: config
                        .reconnect_interval_secs
                        .map_or(DEFAULT_RECONNECT_INTERVAL, Duration::from_secs),
                },
                connected: false,
                connected_since: None,
                remotes: HashMap::new(),
                last_error: None,
            }),
            generation: AtomicU64::new(0),
        }
    }

    /// Merge settings from a `TUNNEL_CONFIG`/`TUNNEL_CONNECT` payload.
    pub fn apply_settings(&self, payload: &Value) {
        let mut inner = self.inner.lock().expect("tunnel lock poisoned");
        if let Some(addr) = payload.get("relay_addr").and_then(Value::as_str) {
            inner.settings.relay_addr = Some(addr.to_string());
        }
        if let Some(id) = payload.get("machine_id").and_then(Value::as_str) {
            inner.settings.machine_id = id.to_string();
        }
        if let Some(token) = payload.get("token").and_then(Value::as_str) {
            inner.settings.token = Some(token.to_string());
        }
        if let Some(secs) = payload.get("reconnect_interval").and_then(Value::as_u64) {
            inner.settings.reconnect_interval = Duration::from_secs(secs.max(1));
        }
    }

    /// Status document for `TUNNEL_STATUS` and friends.
    #[must_use]
    pub fn status(&self) -> Value {
        let inner = self.inner.lock().expect("tunnel lock poisoned");
        json!({
            "connected": inner.connected,
            "relay_addr": inner.settings.relay_addr,
            "machine_id": inner.settings.machine_id,
            "remote_agent_count": inner.remotes.len(),
            "connected_since": inner.connected_since.map(|t| t.timestamp_millis()),
            "error": inner.last_error,
        })
    }

    /// Rows for `TUNNEL_LIST_REMOTES`.
    #[must_use]
    pub fn remotes(&self) -> Vec<Value> {
        let inner = self.inner.lock().expect("tunnel lock poisoned");
        let mut remotes: Vec<&RemoteAgentInfo> = inner.remotes.values().collect();
        remotes.sort_by_key(|r| r.agent_id);
        remotes
            .iter()
            .map(|r| {
                json!({
                    "agent_id": r.agent_id,
                    "name": r.name,
                    "connected_at": r.connected_at.timestamp_millis(),
                })
            })
            .collect()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.lock().expect("tunnel lock poisoned").connected
    }

    /// Stop the active relay task, if any.
    pub fn disconnect(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let mut inner = self.inner.lock().expect("tunnel lock poisoned");
        inner.connected = false;
        inner.connected_since = None;
        inner.remotes.clear();
    }

    fn snapshot_settings(&self) -> Settings {
        self.inner.lock().expect("tunnel lock poisoned").settings.clone()
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn mark_connected(&self) {
        let mut inner = self.inner.lock().expect("tunnel lock poisoned");
        inner.connected = true;
        inner.connected_since = Some(Utc::now());
        inner.last_error = None;
    }

    fn mark_disconnected(&self, error: Option<String>) {
        let mut inner = self.inner.lock().expect("tunnel lock poisoned");
        inner.connected = false;
        inner.connected_since = None;
        inner.remotes.clear();
        if error.is_some() {
            inner.last_error = error;
        }
    }
}

/// Kick off the relay task.
///
/// Blocks (bounded) until the first connection attempt resolves so the
/// caller can report an immediate result. Returns `Err` when no relay
/// address is configured, no runtime is available, or the first
/// attempt fails.
pub fn connect(kernel: &Arc<Kernel>) -> Result<(), String> {
    let settings = kernel.tunnel.snapshot_settings();
    let Some(addr) = settings.relay_addr.clone() else {
        return Err("no relay address configured".to_string());
    };
    let Some(runtime) = kernel.runtime().cloned() else {
        return Err("no async runtime available for the tunnel".to_string());
    };

    // A fresh generation supersedes any previous relay task.
    kernel.tunnel.disconnect();
    let generation = kernel.tunnel.current_generation();

    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    let task_kernel = Arc::clone(kernel);
    runtime.spawn(async move {
        run_relay(task_kernel, addr, generation, ready_tx).await;
    });

    match ready_rx.recv_timeout(CONNECT_WAIT) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err("timed out waiting for relay connection".to_string()),
    }
}

async fn run_relay(
    kernel: Arc<Kernel>,
    addr: String,
    generation: u64,
    ready: std::sync::mpsc::Sender<Result<(), String>>,
) {
    let mut first_attempt = Some(ready);

    loop {
        if kernel.tunnel.current_generation() != generation {
            return;
        }

        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                info!(relay = %addr, "tunnel connected");
                if let Some(ready) = first_attempt.take() {
                    let _ = ready.send(Ok(()));
                }
                kernel.tunnel.mark_connected();
                let reason = relay_session(&kernel, stream, generation).await;
                kernel.tunnel.mark_disconnected(reason);
                if kernel.tunnel.current_generation() != generation {
                    return;
                }
                warn!(relay = %addr, "tunnel dropped, will reconnect");
            }
            Err(e) => {
                let error = format!("relay connection failed: {e}");
                if let Some(ready) = first_attempt.take() {
                    let _ = ready.send(Err(error.clone()));
                    // An explicit connect that failed does not retry in
                    // the background; reconnection is for drops.
                    kernel.tunnel.mark_disconnected(Some(error));
                    return;
                }
                kernel.tunnel.mark_disconnected(Some(error));
            }
        }

        let interval = kernel.tunnel.snapshot_settings().reconnect_interval;
        tokio::time::sleep(interval).await;
    }
}

/// Drive one connected relay session; returns the drop reason.
async fn relay_session(
    kernel: &Arc<Kernel>,
    stream: TcpStream,
    generation: u64,
) -> Option<String> {
    let settings = kernel.tunnel.snapshot_settings();
    let mut framed = Framed::new(stream, FrameCodec::new());

    // Authenticate: the relay sees a HELLO frame carrying the machine
    // identity and token.
    let auth = Message::json(
        0,
        SyscallOp::Hello,
        &json!({
            "machine_id": settings.machine_id,
            "token": settings.token,
            "role": "kernel",
        }),
    );
    if let Err(e) = framed.send(auth).await {
        return Some(format!("relay auth write failed: {e}"));
    }

    loop {
        // Poll for frames with a timeout so a stale generation is
        // noticed even on a silent link.
        let frame = match tokio::time::timeout(Duration::from_secs(1), framed.next()).await {
            Err(_) => {
                if kernel.tunnel.current_generation() != generation {
                    return None;
                }
                continue;
            }
            Ok(None) => return Some("relay closed the connection".to_string()),
            Ok(Some(Err(e))) => return Some(format!("relay protocol error: {e}")),
            Ok(Some(Ok(frame))) => frame,
        };

        let remote_id = frame.agent_id;
        let local_id = REMOTE_ID_BASE | remote_id;
        track_remote(kernel, remote_id, local_id, &frame);

        if frame.opcode == SyscallOp::Exit as u8 {
            forget_remote(kernel, local_id);
            kernel.purge_agent(local_id);
            continue;
        }

        let mut msg = frame;
        msg.agent_id = local_id;
        let dispatch_kernel = Arc::clone(kernel);
        let response = match tokio::task::spawn_blocking(move || dispatch_kernel.dispatch(&msg))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("tunnel dispatch panicked: {e}");
                continue;
            }
        };

        // Restore the relay-side id so the relay can route the
        // response to the right remote.
        let mut response = response;
        response.agent_id = remote_id;
        if let Err(e) = framed.send(response).await {
            return Some(format!("relay write failed: {e}"));
        }
    }
}

fn track_remote(kernel: &Arc<Kernel>, remote_id: u32, local_id: u32, frame: &Message) {
    let mut inner = kernel.tunnel.inner.lock().expect("tunnel lock poisoned");
    if inner.remotes.contains_key(&local_id) {
        return;
    }

    // A remote's first frame may be a HELLO carrying its display name.
    let name = serde_json::from_slice::<Value>(&frame.payload)
        .ok()
        .and_then(|v| v.get("name").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| format!("remote-{remote_id}"));

    inner.remotes.insert(
        local_id,
        RemoteAgentInfo {
            agent_id: local_id,
            name: name.clone(),
            connected_at: Utc::now(),
        },
    );
    drop(inner);

    debug!(remote_id, local_id, name = %name, "remote agent connected");
    kernel.events.emit(
        KernelEventType::Custom,
        json!({
            "custom_type": "TUNNEL_AGENT_CONNECTED",
            "agent_id": local_id,
            "name": name,
        }),
        0,
    );
}

fn forget_remote(kernel: &Arc<Kernel>, local_id: u32) {
    let mut inner = kernel.tunnel.inner.lock().expect("tunnel lock poisoned");
    let removed = inner.remotes.remove(&local_id);
    drop(inner);

    if let Some(remote) = removed {
        debug!(local_id, name = %remote.name, "remote agent disconnected");
        kernel.events.emit(
            KernelEventType::Custom,
            json!({
                "custom_type": "TUNNEL_AGENT_DISCONNECTED",
                "agent_id": local_id,
                "name": remote.name,
            }),
            0,
        );
    }
}

fn default_machine_id() -> String {
    let hostname = nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{hostname}-{}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> TunnelState {
        TunnelState::new(&TunnelConfig::default())
    }

    #[test]
    fn settings_merge_from_payload() {
        let tunnel = state();
        tunnel.apply_settings(&json!({
            "relay_addr": "relay.test:9100",
            "token": "secret",
            "reconnect_interval": 7
        }));

        let status = tunnel.status();
        assert_eq!(status["relay_addr"], "relay.test:9100");
        assert_eq!(status["connected"], false);
        assert_eq!(
            tunnel.snapshot_settings().reconnect_interval,
            Duration::from_secs(7)
        );
        // The token never appears in status output.
        assert!(status.get("token").is_none());
    }

    #[test]
    fn disconnect_bumps_generation_and_clears_remotes() {
        let tunnel = state();
        let before = tunnel.current_generation();
        {
            let mut inner = tunnel.inner.lock().unwrap();
            inner.connected = true;
            inner.remotes.insert(
                REMOTE_ID_BASE | 1,
                RemoteAgentInfo {
                    agent_id: REMOTE_ID_BASE | 1,
                    name: "r".into(),
                    connected_at: Utc::now(),
                },
            );
        }

        tunnel.disconnect();
        assert!(tunnel.current_generation() > before);
        assert!(!tunnel.is_connected());
        assert!(tunnel.remotes().is_empty());
    }

    #[test]
    fn machine_id_defaults_to_hostname_pid() {
        let tunnel = state();
        let id = tunnel.snapshot_settings().machine_id;
        assert!(id.contains('-'));
    }
}
