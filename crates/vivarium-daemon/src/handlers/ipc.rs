//! Inter-agent messaging syscalls: `REGISTER`, `SEND`, `RECV`,
//! `BROADCAST`.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tracing::{debug, info};
use vivarium_core::audit::AuditCategory;
use vivarium_core::events::KernelEventType;
use vivarium_core::mailbox::IpcMessage;
use vivarium_core::protocol::{Message, SyscallOp};
use vivarium_core::KernelError;

use super::{parse_payload, required_str, respond, respond_err};
use crate::kernel::Kernel;
use crate::router::SyscallRouter;

pub fn register(router: &mut SyscallRouter) {
    router.register(SyscallOp::Register, handle_register);
    router.register(SyscallOp::Send, handle_send);
    router.register(SyscallOp::Recv, handle_recv);
    router.register(SyscallOp::Broadcast, handle_broadcast);
}

fn handle_register(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };
    let name = match required_str(msg, &payload, "name") {
        Ok(n) => n,
        Err(response) => return response,
    };

    match kernel.mailboxes.register(msg.agent_id, name) {
        Ok(()) => {
            info!(agent_id = msg.agent_id, name, "agent registered");
            kernel.audit.log(
                AuditCategory::Ipc,
                "REGISTER",
                Some(msg.agent_id),
                json!({"name": name}),
                true,
            );
            respond(
                msg,
                json!({"success": true, "agent_id": msg.agent_id, "name": name}),
            )
        }
        Err(e) => respond_err(msg, e.wire_message()),
    }
}

fn handle_send(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };

    let mut target_id = payload.get("to").and_then(Value::as_u64).unwrap_or(0) as u32;
    if target_id == 0 {
        if let Some(target_name) = payload.get("to_name").and_then(Value::as_str) {
            match kernel.mailboxes.resolve(target_name) {
                Some(id) => target_id = id,
                None => {
                    return respond_err(
                        msg,
                        format_args!("target agent not found: {target_name}"),
                    )
                }
            }
        }
    }
    if target_id == 0 {
        return respond_err(msg, "target agent required (to or to_name)");
    }

    let ipc_msg = IpcMessage {
        from_id: msg.agent_id,
        from_name: kernel.mailboxes.name_of(msg.agent_id).unwrap_or_default(),
        body: payload.get("message").cloned().unwrap_or(json!({})),
        enqueued_at: Instant::now(),
    };

    match kernel.mailboxes.enqueue(target_id, ipc_msg) {
        Ok(()) => {
            debug!(from = msg.agent_id, to = target_id, "message delivered");
            kernel.events.emit(
                KernelEventType::MessageReceived,
                json!({"from": msg.agent_id, "to": target_id}),
                msg.agent_id,
            );
            respond(msg, json!({"success": true, "delivered_to": target_id}))
        }
        Err(e @ KernelError::Overflow(_)) => {
            kernel.audit.log(
                AuditCategory::Resource,
                "MAILBOX_OVERFLOW",
                Some(msg.agent_id),
                json!({"target": target_id}),
                false,
            );
            respond_err(msg, e.wire_message())
        }
        Err(e) => respond_err(msg, e.wire_message()),
    }
}

fn handle_recv(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };
    let max = payload.get("max").and_then(Value::as_u64).unwrap_or(10) as usize;

    let messages: Vec<Value> = kernel
        .mailboxes
        .dequeue(msg.agent_id, max)
        .into_iter()
        .map(|m| {
            json!({
                "from": m.from_id,
                "from_name": m.from_name,
                "message": m.body,
                "age_ms": m.enqueued_at.elapsed().as_millis() as u64,
            })
        })
        .collect();

    respond(
        msg,
        json!({"success": true, "count": messages.len(), "messages": messages}),
    )
}

fn handle_broadcast(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };
    let include_self = payload
        .get("include_self")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let ipc_msg = IpcMessage {
        from_id: msg.agent_id,
        from_name: kernel.mailboxes.name_of(msg.agent_id).unwrap_or_default(),
        body: payload.get("message").cloned().unwrap_or(json!({})),
        enqueued_at: Instant::now(),
    };

    let delivered = kernel.mailboxes.broadcast(&ipc_msg, include_self);
    debug!(from = msg.agent_id, delivered, "broadcast");
    respond(msg, json!({"success": true, "delivered_count": delivered}))
}
