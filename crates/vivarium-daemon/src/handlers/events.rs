//! Pub/sub syscalls: `SUBSCRIBE`, `UNSUBSCRIBE`, `POLL_EVENTS`,
//! `EMIT`.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;
use vivarium_core::events::KernelEventType;
use vivarium_core::protocol::{Message, SyscallOp};

use super::{parse_payload, respond, respond_err};
use crate::kernel::Kernel;
use crate::router::SyscallRouter;

pub fn register(router: &mut SyscallRouter) {
    router.register(SyscallOp::Subscribe, handle_subscribe);
    router.register(SyscallOp::Unsubscribe, handle_unsubscribe);
    router.register(SyscallOp::PollEvents, handle_poll_events);
    router.register(SyscallOp::Emit, handle_emit);
}

/// Event names from any of the accepted payload spellings:
/// `{"events": [...]}`, `{"event_types": [...]}`, or `{"event": "..."}`.
fn event_names(payload: &Value) -> Vec<String> {
    for key in ["events", "event_types"] {
        if let Some(list) = payload.get(key).and_then(Value::as_array) {
            return list
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
        }
    }
    payload
        .get("event")
        .and_then(Value::as_str)
        .map(|e| vec![e.to_string()])
        .unwrap_or_default()
}

fn handle_subscribe(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };
    let names = event_names(&payload);
    if names.is_empty() {
        return respond_err(msg, "no events specified");
    }

    let types: Vec<KernelEventType> = names.iter().map(|n| KernelEventType::parse(n)).collect();
    kernel.events.subscribe(msg.agent_id, &types);
    debug!(agent_id = msg.agent_id, count = names.len(), "subscribed");

    respond(msg, json!({"success": true, "subscribed": names}))
}

fn handle_unsubscribe(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };
    let all = payload.get("all").and_then(Value::as_bool).unwrap_or(false);
    let types: Vec<KernelEventType> = if all {
        Vec::new()
    } else {
        event_names(&payload)
            .iter()
            .map(|n| KernelEventType::parse(n))
            .collect()
    };

    kernel.events.unsubscribe(msg.agent_id, &types, all);
    respond(msg, json!({"success": true}))
}

fn handle_poll_events(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };
    let max = payload.get("max").and_then(Value::as_u64).unwrap_or(100) as usize;

    let events: Vec<Value> = kernel
        .events
        .poll(msg.agent_id, max)
        .iter()
        .map(vivarium_core::events::KernelEvent::to_json)
        .collect();

    respond(
        msg,
        json!({"success": true, "count": events.len(), "events": events}),
    )
}

fn handle_emit(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };
    let event_name = payload
        .get("event")
        .and_then(Value::as_str)
        .unwrap_or("CUSTOM")
        .to_string();
    let mut data = payload.get("data").cloned().unwrap_or(json!({}));

    // Agents emit only CUSTOM events; a non-reserved name rides along
    // as `custom_type` so subscribers can tell them apart.
    if event_name != "CUSTOM" {
        if let Some(map) = data.as_object_mut() {
            map.insert("custom_type".to_string(), json!(event_name));
        }
    }

    kernel
        .events
        .emit(KernelEventType::Custom, data, msg.agent_id);
    debug!(agent_id = msg.agent_id, event = %event_name, "custom event emitted");

    respond(msg, json!({"success": true, "event": event_name}))
}
