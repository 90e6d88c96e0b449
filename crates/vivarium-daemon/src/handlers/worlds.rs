//! World simulation syscalls.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::info;
use vivarium_core::audit::AuditCategory;
use vivarium_core::protocol::{Message, SyscallOp};

use super::{parse_payload, required_str, respond, respond_err};
use crate::kernel::Kernel;
use crate::router::SyscallRouter;

pub fn register(router: &mut SyscallRouter) {
    router.register(SyscallOp::WorldCreate, handle_create);
    router.register(SyscallOp::WorldDestroy, handle_destroy);
    router.register(SyscallOp::WorldList, handle_list);
    router.register(SyscallOp::WorldJoin, handle_join);
    router.register(SyscallOp::WorldLeave, handle_leave);
    router.register(SyscallOp::WorldEvent, handle_event);
    router.register(SyscallOp::WorldState, handle_state);
    router.register(SyscallOp::WorldSnapshot, handle_snapshot);
    router.register(SyscallOp::WorldRestore, handle_restore);
}

fn handle_create(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };
    let name = payload
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("unnamed");
    let config = payload.get("config").cloned().unwrap_or(json!({}));

    let world_id = kernel.worlds.create(name, &config);
    info!(agent_id = msg.agent_id, world_id = %world_id, name, "world created");
    kernel.audit.log(
        AuditCategory::World,
        "WORLD_CREATED",
        Some(msg.agent_id),
        json!({"world_id": world_id, "name": name}),
        true,
    );

    respond(
        msg,
        json!({"success": true, "world_id": world_id, "name": name}),
    )
}

fn handle_destroy(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };
    let world_id = match required_str(msg, &payload, "world_id") {
        Ok(id) => id,
        Err(response) => return response,
    };
    let force = payload.get("force").and_then(Value::as_bool).unwrap_or(false);

    match kernel.worlds.destroy(world_id, force) {
        Ok(()) => {
            info!(agent_id = msg.agent_id, world_id, "world destroyed");
            kernel.audit.log(
                AuditCategory::World,
                "WORLD_DESTROYED",
                Some(msg.agent_id),
                json!({"world_id": world_id, "force": force}),
                true,
            );
            respond(msg, json!({"success": true, "world_id": world_id}))
        }
        Err(e) => respond_err(msg, e.wire_message()),
    }
}

fn handle_list(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let worlds = kernel.worlds.list();
    respond(
        msg,
        json!({"success": true, "count": worlds.len(), "worlds": worlds}),
    )
}

fn handle_join(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };
    let world_id = match required_str(msg, &payload, "world_id") {
        Ok(id) => id,
        Err(response) => return response,
    };

    match kernel.worlds.join(msg.agent_id, world_id) {
        Ok(()) => {
            info!(agent_id = msg.agent_id, world_id, "agent joined world");
            kernel.audit.log(
                AuditCategory::World,
                "WORLD_JOINED",
                Some(msg.agent_id),
                json!({"world_id": world_id}),
                true,
            );
            respond(msg, json!({"success": true, "world_id": world_id}))
        }
        Err(e) => respond_err(msg, e.wire_message()),
    }
}

fn handle_leave(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    match kernel.worlds.leave(msg.agent_id) {
        Ok(world_id) => {
            info!(agent_id = msg.agent_id, world_id = %world_id, "agent left world");
            kernel.audit.log(
                AuditCategory::World,
                "WORLD_LEFT",
                Some(msg.agent_id),
                json!({"world_id": world_id}),
                true,
            );
            respond(msg, json!({"success": true, "world_id": world_id}))
        }
        Err(_) => respond_err(msg, "not in any world"),
    }
}

fn handle_event(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };
    let world_id = match required_str(msg, &payload, "world_id") {
        Ok(id) => id,
        Err(response) => return response,
    };
    let event_type = match required_str(msg, &payload, "event_type") {
        Ok(t) => t,
        Err(response) => return response,
    };
    let params = payload.get("params").cloned().unwrap_or(json!({}));

    match kernel.worlds.inject_event(world_id, event_type, params) {
        Ok(()) => {
            info!(agent_id = msg.agent_id, world_id, event_type, "chaos event injected");
            kernel.audit.log(
                AuditCategory::World,
                "WORLD_EVENT_INJECTED",
                Some(msg.agent_id),
                json!({"world_id": world_id, "event_type": event_type}),
                true,
            );
            respond(
                msg,
                json!({"success": true, "world_id": world_id, "event_type": event_type}),
            )
        }
        Err(e) => respond_err(msg, e.wire_message()),
    }
}

fn handle_state(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };
    let world_id = match required_str(msg, &payload, "world_id") {
        Ok(id) => id,
        Err(response) => return response,
    };

    match kernel.worlds.state(world_id) {
        Some(state) => respond(msg, json!({"success": true, "state": state})),
        None => respond_err(msg, "world not found"),
    }
}

fn handle_snapshot(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };
    let world_id = match required_str(msg, &payload, "world_id") {
        Ok(id) => id,
        Err(response) => return response,
    };

    match kernel.worlds.snapshot(world_id) {
        Some(snapshot) => {
            info!(agent_id = msg.agent_id, world_id, "world snapshot created");
            respond(msg, json!({"success": true, "snapshot": snapshot}))
        }
        None => respond_err(msg, "world not found"),
    }
}

fn handle_restore(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };
    let Some(snapshot) = payload.get("snapshot").filter(|s| !s.is_null()) else {
        return respond_err(msg, "snapshot is required");
    };
    let new_world_id = payload.get("new_world_id").and_then(Value::as_str);

    match kernel.worlds.restore(snapshot, new_world_id) {
        Ok(world_id) => {
            info!(agent_id = msg.agent_id, world_id = %world_id, "world restored");
            kernel.audit.log(
                AuditCategory::World,
                "WORLD_RESTORED",
                Some(msg.agent_id),
                json!({"world_id": world_id}),
                true,
            );
            respond(msg, json!({"success": true, "world_id": world_id}))
        }
        Err(e) => respond_err(msg, e.wire_message()),
    }
}
