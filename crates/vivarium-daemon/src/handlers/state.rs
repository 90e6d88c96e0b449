//! State store syscalls: `STORE`, `FETCH`, `DELETE`, `KEYS`.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::debug;
use vivarium_core::audit::AuditCategory;
use vivarium_core::events::KernelEventType;
use vivarium_core::protocol::{Message, SyscallOp};
use vivarium_core::state::Scope;

use super::{parse_payload, required_str, respond};
use crate::kernel::Kernel;
use crate::router::SyscallRouter;

pub fn register(router: &mut SyscallRouter) {
    router.register(SyscallOp::Store, handle_store);
    router.register(SyscallOp::Fetch, handle_fetch);
    router.register(SyscallOp::Delete, handle_delete);
    router.register(SyscallOp::Keys, handle_keys);
}

fn handle_store(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };
    let key = match required_str(msg, &payload, "key") {
        Ok(k) => k,
        Err(response) => return response,
    };

    let scope = payload
        .get("scope")
        .and_then(Value::as_str)
        .and_then(|s| Scope::from_str(s).ok())
        .unwrap_or(Scope::Global);
    let ttl = payload
        .get("ttl")
        .and_then(Value::as_u64)
        .map(Duration::from_secs);
    let value = payload.get("value").cloned().unwrap_or(Value::Null);

    let outcome = kernel.state.store(msg.agent_id, key, value, scope, ttl);
    debug!(
        agent_id = msg.agent_id,
        key = %outcome.key,
        scope = outcome.scope.as_str(),
        "stored key"
    );

    // Global writes are visible to everyone; announce them.
    if outcome.scope == Scope::Global {
        kernel.events.emit(
            KernelEventType::StateChanged,
            json!({"key": key, "action": "store", "agent_id": msg.agent_id}),
            msg.agent_id,
        );
    }
    kernel.audit.log(
        AuditCategory::State,
        "STORE",
        Some(msg.agent_id),
        json!({"key": key, "scope": outcome.scope.as_str()}),
        true,
    );

    respond(msg, json!({"success": true, "key": key}))
}

fn handle_fetch(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };
    let key = match required_str(msg, &payload, "key") {
        Ok(k) => k,
        Err(response) => return response,
    };

    let outcome = kernel.state.fetch(msg.agent_id, key);
    let mut body = json!({
        "success": true,
        "exists": outcome.exists,
        "value": outcome.value,
    });
    if let Some(scope) = outcome.scope {
        body["scope"] = json!(scope.as_str());
    }
    respond(msg, body)
}

fn handle_delete(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };
    let key = match required_str(msg, &payload, "key") {
        Ok(k) => k,
        Err(response) => return response,
    };

    let deleted = kernel.state.erase(msg.agent_id, key);
    if deleted {
        debug!(agent_id = msg.agent_id, key, "deleted key");
        kernel.audit.log(
            AuditCategory::State,
            "DELETE",
            Some(msg.agent_id),
            json!({"key": key}),
            true,
        );
    }
    respond(msg, json!({"success": true, "deleted": deleted}))
}

fn handle_keys(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };
    let prefix = payload.get("prefix").and_then(Value::as_str).unwrap_or("");

    let keys = kernel.state.keys(msg.agent_id, prefix);
    respond(
        msg,
        json!({"success": true, "count": keys.len(), "keys": keys}),
    )
}
