//! Agent lifecycle syscalls: `SPAWN`, `KILL`, `LIST`, `PAUSE`,
//! `RESUME`.
//!
//! All but `LIST` require the `spawn` capability — lifecycle power
//! over other agents is the same privilege as creating them. The
//! spawning syscall's sender is recorded as the new agent's parent,
//! forming a display-only hierarchy.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::{json, Value};
use vivarium_core::audit::AuditCategory;
use vivarium_core::events::KernelEventType;
use vivarium_core::protocol::{Message, SyscallOp};
use vivarium_core::restart::{RestartConfig, RestartPolicy};

use super::{deny, parse_payload, required_str, respond, respond_err};
use crate::agent::{AgentConfig, AgentSelector, ResourceLimits};
use crate::kernel::Kernel;
use crate::router::SyscallRouter;

pub fn register(router: &mut SyscallRouter) {
    router.register(SyscallOp::Spawn, handle_spawn);
    router.register(SyscallOp::Kill, handle_kill);
    router.register(SyscallOp::List, handle_list);
    router.register(SyscallOp::Pause, handle_pause);
    router.register(SyscallOp::Resume, handle_resume);
}

fn handle_spawn(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };

    let perms = kernel.permissions.get_or_create(msg.agent_id);
    if !perms.can_spawn {
        return deny(kernel, msg, "SPAWN", "spawn capability not granted");
    }

    let name = match required_str(msg, &payload, "name") {
        Ok(n) => n.to_string(),
        Err(response) => return response,
    };
    let script = match required_str(msg, &payload, "script") {
        Ok(s) => PathBuf::from(s),
        Err(response) => return response,
    };

    let mut config = AgentConfig::new(&name, script, kernel.config().socket_path.clone());
    if let Some(interpreter) = payload.get("interpreter").and_then(Value::as_str) {
        config.interpreter = interpreter.to_string();
    }
    if let Some(sandboxed) = payload.get("sandboxed").and_then(Value::as_bool) {
        config.sandboxed = sandboxed;
    }
    if let Some(network) = payload.get("network").and_then(Value::as_bool) {
        config.network = network;
    }
    if let Some(limits) = payload.get("limits") {
        config.limits = ResourceLimits::from_payload(limits);
    }
    config.restart = restart_config(&payload);

    match kernel.agents.spawn(config, msg.agent_id) {
        Ok(info) => {
            kernel.events.emit(
                KernelEventType::AgentSpawned,
                json!({"agent": name, "agent_id": info.id, "pid": info.pid}),
                msg.agent_id,
            );
            kernel.audit.log(
                AuditCategory::Lifecycle,
                "SPAWN",
                Some(msg.agent_id),
                json!({"agent": name, "agent_id": info.id, "pid": info.pid}),
                true,
            );
            respond(
                msg,
                json!({
                    "success": true,
                    "id": info.id,
                    "pid": info.pid,
                    "status": "running",
                }),
            )
        }
        Err(e) => {
            kernel.audit.log(
                AuditCategory::Resource,
                "SPAWN_FAILED",
                Some(msg.agent_id),
                json!({"agent": name, "error": e.wire_message()}),
                false,
            );
            respond_err(msg, e.wire_message())
        }
    }
}

/// Restart schedule from the flat spawn payload fields.
fn restart_config(payload: &Value) -> RestartConfig {
    let mut config = RestartConfig::default();
    if let Some(policy) = payload.get("restart_policy").and_then(Value::as_str) {
        config.policy = RestartPolicy::from_str(policy).unwrap_or(RestartPolicy::Never);
    }
    if let Some(max) = payload.get("max_restarts").and_then(Value::as_u64) {
        config.max_restarts = max as u32;
    }
    if let Some(window) = payload.get("restart_window").and_then(Value::as_u64) {
        config.window_secs = window;
    }
    if let Some(initial) = payload.get("backoff_initial_ms").and_then(Value::as_u64) {
        config.backoff_initial_ms = initial;
    }
    if let Some(max) = payload.get("backoff_max_ms").and_then(Value::as_u64) {
        config.backoff_max_ms = max;
    }
    if let Some(multiplier) = payload.get("backoff_multiplier").and_then(Value::as_f64) {
        config.backoff_multiplier = multiplier;
    }
    config
}

fn handle_kill(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };

    let perms = kernel.permissions.get_or_create(msg.agent_id);
    if !perms.can_spawn {
        return deny(kernel, msg, "KILL", "spawn capability not granted");
    }

    let Some(selector) = AgentSelector::from_payload(&payload) else {
        return respond_err(msg, "name or id is required");
    };

    match kernel.agents.kill(&selector) {
        Ok((id, name)) => {
            kernel.events.emit(
                KernelEventType::AgentExited,
                json!({"agent": name, "agent_id": id, "killed": true}),
                msg.agent_id,
            );
            kernel.audit.log(
                AuditCategory::Lifecycle,
                "KILL",
                Some(msg.agent_id),
                json!({"agent": name, "agent_id": id}),
                true,
            );
            kernel.purge_agent(id);
            respond(msg, json!({"success": true, "killed": true, "id": id}))
        }
        Err(e) => respond(
            msg,
            json!({"success": false, "killed": false, "error": e.wire_message()}),
        ),
    }
}

fn handle_list(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let agents = kernel.agents.list();
    respond(
        msg,
        json!({"success": true, "count": agents.len(), "agents": agents}),
    )
}

fn handle_pause(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };
    let perms = kernel.permissions.get_or_create(msg.agent_id);
    if !perms.can_spawn {
        return deny(kernel, msg, "PAUSE", "spawn capability not granted");
    }
    let Some(selector) = AgentSelector::from_payload(&payload) else {
        return respond_err(msg, "name or id is required");
    };

    match kernel.agents.pause(&selector) {
        Ok((id, name)) => {
            kernel.events.emit(
                KernelEventType::AgentPaused,
                json!({"agent": name, "agent_id": id}),
                msg.agent_id,
            );
            kernel.audit.log(
                AuditCategory::Lifecycle,
                "PAUSE",
                Some(msg.agent_id),
                json!({"agent": name}),
                true,
            );
            respond(msg, json!({"success": true, "id": id, "name": name}))
        }
        Err(e) => respond_err(msg, e.wire_message()),
    }
}

fn handle_resume(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };
    let perms = kernel.permissions.get_or_create(msg.agent_id);
    if !perms.can_spawn {
        return deny(kernel, msg, "RESUME", "spawn capability not granted");
    }
    let Some(selector) = AgentSelector::from_payload(&payload) else {
        return respond_err(msg, "name or id is required");
    };

    match kernel.agents.resume(&selector) {
        Ok((id, name)) => {
            kernel.events.emit(
                KernelEventType::AgentResumed,
                json!({"agent": name, "agent_id": id}),
                msg.agent_id,
            );
            kernel.audit.log(
                AuditCategory::Lifecycle,
                "RESUME",
                Some(msg.agent_id),
                json!({"agent": name}),
                true,
            );
            respond(msg, json!({"success": true, "id": id, "name": name}))
        }
        Err(e) => respond_err(msg, e.wire_message()),
    }
}
