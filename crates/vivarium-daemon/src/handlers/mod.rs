//! Syscall handlers, one module per opcode family.
//!
//! Every handler follows the same shape: decode the JSON payload,
//! consult permissions, call into the owning service, and build a JSON
//! response that always carries `success` and either a result shape or
//! `error`. Handlers never panic across the router boundary and never
//! close connections; only the transport does that, on protocol
//! errors.

pub mod agents;
pub mod audit;
pub mod core;
pub mod events;
pub mod exec;
pub mod fs;
pub mod http;
pub mod ipc;
pub mod metrics;
pub mod perms;
pub mod replay;
pub mod state;
pub mod tasks;
pub mod tunnel;
pub mod worlds;

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::warn;
use vivarium_core::audit::AuditCategory;
use vivarium_core::events::KernelEventType;
use vivarium_core::protocol::Message;

use crate::kernel::Kernel;
use crate::router::SyscallRouter;

/// Register every syscall module. Called once at kernel construction.
pub fn register_all(router: &mut SyscallRouter) {
    core::register(router);
    fs::register(router);
    exec::register(router);
    agents::register(router);
    ipc::register(router);
    state::register(router);
    perms::register(router);
    http::register(router);
    events::register(router);
    replay::register(router);
    audit::register(router);
    tasks::register(router);
    worlds::register(router);
    tunnel::register(router);
    metrics::register(router);
}

/// Response message with the request's opcode and agent id.
pub(crate) fn respond(msg: &Message, body: Value) -> Message {
    Message::raw(msg.agent_id, msg.opcode, body.to_string())
}

/// Canonical failure response.
pub(crate) fn respond_err(msg: &Message, error: impl std::fmt::Display) -> Message {
    respond(msg, json!({"success": false, "error": error.to_string()}))
}

/// Decode the payload as JSON; an empty payload is an empty object.
///
/// The `Err` arm is the ready-made failure response, so handlers can
/// `match`/`?`-style early-return it.
pub(crate) fn parse_payload(msg: &Message) -> Result<Value, Message> {
    if msg.payload.is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_slice(&msg.payload)
        .map_err(|e| respond_err(msg, format_args!("invalid request: {e}")))
}

/// Permission-denial path: audit under `security`, emit
/// `SYSCALL_BLOCKED`, and produce the failure response.
pub(crate) fn deny(kernel: &Arc<Kernel>, msg: &Message, action: &str, reason: &str) -> Message {
    warn!(agent_id = msg.agent_id, action, "denied: {reason}");
    kernel.audit.log(
        AuditCategory::Security,
        action,
        Some(msg.agent_id),
        json!({"reason": reason}),
        false,
    );
    kernel.events.emit(
        KernelEventType::SyscallBlocked,
        json!({"action": action, "reason": reason}),
        msg.agent_id,
    );
    respond_err(msg, format_args!("Permission denied: {reason}"))
}

/// `payload[field]` as a non-empty string, or a ready failure
/// response naming the field.
pub(crate) fn required_str<'a>(
    msg: &Message,
    payload: &'a Value,
    field: &str,
) -> Result<&'a str, Message> {
    match payload.get(field).and_then(Value::as_str) {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(respond_err(msg, format_args!("{field} is required"))),
    }
}
