//! Metrics syscalls: kernel-wide counters and per-agent snapshots.

use std::sync::Arc;

use serde_json::json;
use vivarium_core::protocol::{Message, SyscallOp};

use super::{parse_payload, respond, respond_err};
use crate::agent::AgentSelector;
use crate::kernel::Kernel;
use crate::router::SyscallRouter;

pub fn register(router: &mut SyscallRouter) {
    router.register(SyscallOp::MetricsSystem, handle_system);
    router.register(SyscallOp::MetricsAgent, handle_agent);
}

fn handle_system(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    respond(
        msg,
        json!({
            "success": true,
            "agents": kernel.agents.count(),
            "worlds": kernel.worlds.world_count(),
            "uptime_seconds": kernel.uptime_secs(),
            "syscalls_handled": kernel.syscalls_handled(),
            "world_metrics": kernel.worlds.metrics(),
        }),
    )
}

fn handle_agent(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };
    let Some(selector) = AgentSelector::from_payload(&payload) else {
        return respond_err(msg, "name or id is required");
    };

    let (requests, tokens) = kernel
        .agents
        .resolve_id(&selector)
        .map_or((0, 0), |id| kernel.llm_usage.totals(id));

    match kernel.agents.metrics(&selector, requests, tokens) {
        Some(metrics) => respond(msg, json!({"success": true, "metrics": metrics})),
        None => respond_err(msg, format_args!("agent {selector} not found")),
    }
}
