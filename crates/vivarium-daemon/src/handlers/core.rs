//! Core opcodes: liveness, handshake, graceful disconnect, and the LLM
//! proxy.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;
use vivarium_core::audit::AuditCategory;
use vivarium_core::events::KernelEventType;
use vivarium_core::protocol::{Message, SyscallOp};

use super::{deny, parse_payload, respond, respond_err};
use crate::http::{perform, HttpRequestSpec, DEFAULT_HTTP_TIMEOUT};
use crate::kernel::Kernel;
use crate::router::SyscallRouter;

pub fn register(router: &mut SyscallRouter) {
    router.register(SyscallOp::Noop, handle_noop);
    router.register(SyscallOp::Hello, handle_hello);
    router.register(SyscallOp::Exit, handle_exit);
    router.register(SyscallOp::Think, handle_think);
    router.register(SyscallOp::LlmReport, handle_llm_report);
}

/// Echo the payload untouched; the payload is opaque here.
fn handle_noop(_kernel: &Arc<Kernel>, msg: &Message) -> Message {
    Message::raw(msg.agent_id, msg.opcode, msg.payload.clone())
}

fn handle_hello(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    debug!(agent_id = msg.agent_id, "handshake");
    respond(
        msg,
        json!({
            "success": true,
            "version": env!("CARGO_PKG_VERSION"),
            "capabilities": kernel.capabilities(),
            "agent_id": msg.agent_id,
            "uptime": kernel.uptime_secs(),
        }),
    )
}

/// The transport closes the connection after writing this response.
fn handle_exit(_kernel: &Arc<Kernel>, msg: &Message) -> Message {
    respond(msg, json!({"success": true, "goodbye": true}))
}

/// LLM proxy. Disabled unless an endpoint is configured; always
/// answered asynchronously through the worker pool.
fn handle_think(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };

    let perms = kernel.permissions.get_or_create(msg.agent_id);
    if !perms.can_think {
        return deny(kernel, msg, "THINK", "think capability not granted");
    }

    let Some(llm) = kernel.config().llm.clone() else {
        return respond_err(msg, "LLM proxy disabled: no endpoint configured");
    };

    let Some(prompt) = payload.get("prompt").and_then(Value::as_str) else {
        return respond_err(msg, "prompt is required");
    };

    if perms.max_llm_calls_per_minute > 0 {
        let recent = kernel.llm_usage.calls_in_last_minute(msg.agent_id);
        if recent >= perms.max_llm_calls_per_minute {
            kernel.events.emit(
                KernelEventType::ResourceWarning,
                json!({
                    "resource": "llm_calls_per_minute",
                    "limit": perms.max_llm_calls_per_minute,
                }),
                msg.agent_id,
            );
            kernel.audit.log(
                AuditCategory::Resource,
                "LLM_RATE_LIMITED",
                Some(msg.agent_id),
                json!({"limit": perms.max_llm_calls_per_minute}),
                false,
            );
            return respond_err(msg, "LLM rate limit exceeded");
        }
    }
    kernel.llm_usage.record(msg.agent_id, 0);

    let model = payload
        .get("model")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or(llm.model.clone());
    let mut body = json!({"prompt": prompt});
    if let Some(model) = &model {
        body["model"] = json!(model);
    }
    if let Some(system) = payload.get("system_instruction") {
        body["system"] = system.clone();
    }
    if let Some(temperature) = payload.get("temperature") {
        body["temperature"] = temperature.clone();
    }

    let mut headers = std::collections::HashMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    if let Some(key) = &llm.api_key {
        headers.insert("authorization".to_string(), format!("Bearer {key}"));
    }
    let spec = HttpRequestSpec {
        url: llm.endpoint.clone(),
        method: "POST".to_string(),
        headers,
        body: Some(body.to_string()),
        timeout: DEFAULT_HTTP_TIMEOUT,
    };

    let request_id = kernel.tasks.next_request_id();
    let submitted = kernel
        .tasks
        .submit(msg.agent_id, msg.opcode, request_id, move || {
            match perform(&spec) {
                Ok(outcome) if outcome.status < 400 => {
                    // The provider is expected to answer with
                    // `{content, tokens?}`; pass unknown shapes through
                    // raw.
                    let parsed: Value =
                        serde_json::from_str(&outcome.body).unwrap_or(Value::Null);
                    let content = parsed
                        .get("content")
                        .and_then(Value::as_str)
                        .map_or_else(|| outcome.body.clone(), str::to_string);
                    let tokens = parsed.get("tokens").cloned().unwrap_or(json!(0));
                    json!({
                        "success": true,
                        "content": content,
                        "tokens": tokens,
                        "request_id": request_id,
                    })
                    .to_string()
                }
                Ok(outcome) => json!({
                    "success": false,
                    "error": format!("LLM endpoint returned status {}", outcome.status),
                    "request_id": request_id,
                })
                .to_string(),
                Err(e) => json!({
                    "success": false,
                    "error": e,
                    "request_id": request_id,
                })
                .to_string(),
            }
        });

    if !submitted {
        return respond_err(msg, "kernel is shutting down");
    }
    respond(
        msg,
        json!({"success": true, "async": true, "request_id": request_id}),
    )
}

/// SDK-side LLM usage report; feeds the same counters the THINK rate
/// cap consults.
fn handle_llm_report(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };
    let tokens = payload.get("tokens").and_then(Value::as_u64).unwrap_or(0);
    kernel.llm_usage.record(msg.agent_id, tokens);
    respond(msg, json!({"success": true}))
}
