//! `ASYNC_POLL`: drain the caller's async result inbox.

use std::sync::Arc;

use serde_json::{json, Value};
use vivarium_core::protocol::{Message, SyscallOp};

use super::{parse_payload, respond};
use crate::kernel::Kernel;
use crate::router::SyscallRouter;

pub fn register(router: &mut SyscallRouter) {
    router.register(SyscallOp::AsyncPoll, handle_async_poll);
}

fn handle_async_poll(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };
    let max = payload.get("max").and_then(Value::as_u64).unwrap_or(10) as usize;

    let results: Vec<Value> = kernel
        .tasks
        .poll(msg.agent_id, max)
        .into_iter()
        .map(|r| {
            let opcode_name = SyscallOp::from_u8(r.opcode).map_or("UNKNOWN", SyscallOp::name);
            json!({
                "request_id": r.request_id,
                "opcode": r.opcode,
                "opcode_name": opcode_name,
                "payload": r.payload,
            })
        })
        .collect();

    respond(
        msg,
        json!({"success": true, "count": results.len(), "results": results}),
    )
}
