//! `HTTP`: outbound requests, world-aware.
//!
//! Order of consultation: the caller's world network mock decides
//! whether to intercept (with chaos failure and latency applied),
//! then permissions gate the real network, then the call runs — on a
//! worker by default, inline for `{"async": false}`. In a world's
//! record mode the real response is captured into the mock table's
//! transcript.

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::{json, Value};
use tracing::debug;
use vivarium_core::audit::AuditCategory;
use vivarium_core::protocol::{Message, SyscallOp};
use vivarium_core::world::{MockLookup, MockResponse};

use super::{deny, parse_payload, respond, respond_err};
use crate::http::{perform, HttpOutcome, HttpRequestSpec};
use crate::kernel::Kernel;
use crate::router::SyscallRouter;

pub fn register(router: &mut SyscallRouter) {
    router.register(SyscallOp::Http, handle_http);
}

enum WorldDecision {
    ChaosFailure { world: String },
    Mock { response: MockResponse, extra_latency_ms: u64, world: String },
    Passthrough { record: bool },
}

fn handle_http(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };
    let Some(spec) = HttpRequestSpec::from_payload(&payload) else {
        return respond_err(msg, "url is required");
    };

    let decision = kernel
        .worlds
        .with_agent_world(msg.agent_id, |world| {
            if !world.network.is_enabled() {
                return WorldDecision::Passthrough { record: false };
            }
            world.record_syscall();
            if world.chaos.should_fail_network(&spec.url) {
                return WorldDecision::ChaosFailure {
                    world: world.id().to_string(),
                };
            }
            match world.network.lookup(&spec.url) {
                MockLookup::Intercept(response) => WorldDecision::Mock {
                    response,
                    extra_latency_ms: world.chaos.latency_ms(),
                    world: world.id().to_string(),
                },
                MockLookup::Passthrough => WorldDecision::Passthrough { record: false },
                MockLookup::PassthroughAndRecord => WorldDecision::Passthrough { record: true },
            }
        })
        .unwrap_or(WorldDecision::Passthrough { record: false });

    let record = match decision {
        WorldDecision::ChaosFailure { world } => {
            debug!(agent_id = msg.agent_id, url = %spec.url, "chaos network failure");
            return respond(
                msg,
                json!({
                    "success": false,
                    "error": "Simulated network failure (chaos)",
                    "world": world,
                }),
            );
        }
        WorldDecision::Mock {
            response,
            extra_latency_ms,
            world,
        } => {
            // Mock latency is honored here; this runs on a blocking
            // thread, not the reactor.
            let total = response.latency_ms + extra_latency_ms;
            if total > 0 {
                std::thread::sleep(Duration::from_millis(total));
            }
            return respond(
                msg,
                json!({
                    "success": true,
                    "status": response.status,
                    "body": response.body,
                    "headers": response.headers,
                    "mocked": true,
                    "world": world,
                }),
            );
        }
        WorldDecision::Passthrough { record } => record,
    };

    let perms = kernel.permissions.get_or_create(msg.agent_id);
    if !perms.can_access_url(&spec.url) {
        return deny(kernel, msg, "HTTP", "domain not allowed");
    }

    kernel.audit.log(
        AuditCategory::Network,
        "HTTP",
        Some(msg.agent_id),
        json!({"url": spec.url, "method": spec.method}),
        true,
    );

    let run_async = payload.get("async").and_then(Value::as_bool).unwrap_or(true);
    if !run_async {
        let outcome = perform(&spec);
        if record {
            capture(&Arc::downgrade(kernel), msg.agent_id, &spec, &outcome);
        }
        return respond(msg, outcome_payload(outcome, None));
    }

    let request_id = kernel.tasks.next_request_id();
    let weak = Arc::downgrade(kernel);
    let agent_id = msg.agent_id;
    let submitted = kernel
        .tasks
        .submit(msg.agent_id, msg.opcode, request_id, move || {
            let outcome = perform(&spec);
            if record {
                capture(&weak, agent_id, &spec, &outcome);
            }
            outcome_payload(outcome, Some(request_id)).to_string()
        });
    if !submitted {
        return respond_err(msg, "kernel is shutting down");
    }

    respond(
        msg,
        json!({"success": true, "async": true, "request_id": request_id}),
    )
}

fn outcome_payload(outcome: Result<HttpOutcome, String>, request_id: Option<u64>) -> Value {
    let mut body = match outcome {
        Ok(out) => json!({
            "success": true,
            "status": out.status,
            "body": out.body,
            "headers": out.headers,
        }),
        Err(e) => json!({"success": false, "error": e}),
    };
    if let Some(id) = request_id {
        body["request_id"] = json!(id);
    }
    body
}

/// Record-mode capture of a real response into the caller's world.
fn capture(
    kernel: &Weak<Kernel>,
    agent_id: u32,
    spec: &HttpRequestSpec,
    outcome: &Result<HttpOutcome, String>,
) {
    let Ok(out) = outcome else {
        return;
    };
    let Some(kernel) = kernel.upgrade() else {
        return;
    };
    kernel.worlds.with_agent_world(agent_id, |world| {
        world
            .network
            .record(&spec.url, &spec.method, out.status, &out.body);
    });
}
