//! Audit log syscalls: `GET_AUDIT_LOG`, `SET_AUDIT_CONFIG`.

use std::str::FromStr;
use std::sync::Arc;

use serde_json::{json, Value};
use vivarium_core::audit::{AuditCategory, AuditEntry};
use vivarium_core::protocol::{Message, SyscallOp};

use super::{parse_payload, respond};
use crate::kernel::Kernel;
use crate::router::SyscallRouter;

pub fn register(router: &mut SyscallRouter) {
    router.register(SyscallOp::GetAuditLog, handle_get_audit_log);
    router.register(SyscallOp::SetAuditConfig, handle_set_audit_config);
}

fn handle_get_audit_log(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };

    let category = payload
        .get("category")
        .and_then(Value::as_str)
        .and_then(|s| AuditCategory::from_str(s).ok());
    let agent_id = payload
        .get("agent_id")
        .and_then(Value::as_u64)
        .filter(|&id| id > 0)
        .map(|id| id as u32);
    let since_id = payload.get("since_id").and_then(Value::as_u64).unwrap_or(0);
    let limit = payload.get("limit").and_then(Value::as_u64).unwrap_or(100) as usize;

    let entries: Vec<Value> = kernel
        .audit
        .query(category, agent_id, since_id, limit)
        .iter()
        .map(AuditEntry::to_json)
        .collect();

    respond(
        msg,
        json!({"success": true, "count": entries.len(), "entries": entries}),
    )
}

fn handle_set_audit_config(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };

    let mut config = kernel.audit.config();
    if let Some(v) = payload.get("max_entries").and_then(Value::as_u64) {
        config.max_entries = v as usize;
    }
    for (field, flag) in [
        ("log_syscalls", &mut config.log_syscalls),
        ("log_security", &mut config.log_security),
        ("log_lifecycle", &mut config.log_lifecycle),
        ("log_ipc", &mut config.log_ipc),
        ("log_state", &mut config.log_state),
        ("log_resource", &mut config.log_resource),
        ("log_network", &mut config.log_network),
        ("log_world", &mut config.log_world),
    ] {
        if let Some(v) = payload.get(field).and_then(Value::as_bool) {
            *flag = v;
        }
    }
    kernel.audit.set_config(config.clone());

    kernel.audit.log(
        AuditCategory::Security,
        "AUDIT_CONFIG_CHANGED",
        Some(msg.agent_id),
        json!({"changed_by": msg.agent_id, "new_config": payload}),
        true,
    );

    respond(msg, json!({"success": true, "config": config.to_json()}))
}
