//! Permission syscalls: `GET_PERMS`, `SET_PERMS`.
//!
//! An agent may mutate only its own permissions unless it holds the
//! `spawn` capability, which grants permission authority over any
//! target. Every change is audited under `security`.

use std::str::FromStr;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::info;
use vivarium_core::audit::AuditCategory;
use vivarium_core::permissions::{AgentPermissions, PermissionLevel};
use vivarium_core::protocol::{Message, SyscallOp};

use super::{deny, parse_payload, respond, respond_err};
use crate::kernel::Kernel;
use crate::router::SyscallRouter;

pub fn register(router: &mut SyscallRouter) {
    router.register(SyscallOp::GetPerms, handle_get_perms);
    router.register(SyscallOp::SetPerms, handle_set_perms);
}

fn handle_get_perms(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let perms = kernel.permissions.get_or_create(msg.agent_id);
    let permissions = serde_json::to_value(&perms).unwrap_or_default();
    respond(msg, json!({"success": true, "permissions": permissions}))
}

fn handle_set_perms(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };

    let target_id = payload
        .get("agent_id")
        .and_then(Value::as_u64)
        .map_or(msg.agent_id, |id| id as u32);

    if target_id != msg.agent_id {
        let caller = kernel.permissions.get_or_create(msg.agent_id);
        if !caller.can_spawn {
            return deny(
                kernel,
                msg,
                "SET_PERMS",
                "cannot modify another agent's permissions",
            );
        }
    }

    let applied: Value;
    if let Some(permissions) = payload.get("permissions") {
        let perms: AgentPermissions = match serde_json::from_value(permissions.clone()) {
            Ok(p) => p,
            Err(e) => return respond_err(msg, format_args!("invalid request: {e}")),
        };
        kernel.permissions.set(target_id, perms);
        applied = json!({"permissions": permissions});
        info!(
            agent_id = msg.agent_id,
            target_id, "permissions replaced"
        );
    } else if let Some(level) = payload.get("level").and_then(Value::as_str) {
        let level = PermissionLevel::from_str(level).unwrap_or(PermissionLevel::Standard);
        kernel.permissions.set_level(target_id, level);
        applied = json!({"level": payload["level"]});
        info!(agent_id = msg.agent_id, target_id, "permission level applied");
    } else {
        return respond_err(msg, "permissions or level is required");
    }

    kernel.audit.log(
        AuditCategory::Security,
        "PERMISSIONS_CHANGED",
        Some(msg.agent_id),
        json!({"target": target_id, "change": applied}),
        true,
    );

    respond(msg, json!({"success": true, "agent_id": target_id}))
}
