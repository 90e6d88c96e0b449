//! Tunnel control syscalls.

use std::sync::Arc;

use serde_json::json;
use tracing::info;
use vivarium_core::audit::AuditCategory;
use vivarium_core::protocol::{Message, SyscallOp};

use super::{parse_payload, respond};
use crate::kernel::Kernel;
use crate::router::SyscallRouter;
use crate::tunnel;

pub fn register(router: &mut SyscallRouter) {
    router.register(SyscallOp::TunnelConnect, handle_connect);
    router.register(SyscallOp::TunnelDisconnect, handle_disconnect);
    router.register(SyscallOp::TunnelStatus, handle_status);
    router.register(SyscallOp::TunnelListRemotes, handle_list_remotes);
    router.register(SyscallOp::TunnelConfig, handle_config);
}

fn status_body(kernel: &Arc<Kernel>, success: bool, error: Option<String>) -> serde_json::Value {
    let mut body = kernel.tunnel.status();
    body["success"] = json!(success);
    if let Some(error) = error {
        body["error"] = json!(error);
    }
    body
}

fn handle_connect(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };
    kernel.tunnel.apply_settings(&payload);

    match tunnel::connect(kernel) {
        Ok(()) => {
            info!(agent_id = msg.agent_id, "tunnel connected");
            kernel.audit.log(
                AuditCategory::Network,
                "TUNNEL_CONNECTED",
                Some(msg.agent_id),
                kernel.tunnel.status(),
                true,
            );
            respond(msg, status_body(kernel, true, None))
        }
        Err(e) => {
            kernel.audit.log(
                AuditCategory::Network,
                "TUNNEL_CONNECT_FAILED",
                Some(msg.agent_id),
                json!({"error": e}),
                false,
            );
            respond(msg, status_body(kernel, false, Some(e)))
        }
    }
}

fn handle_disconnect(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    kernel.tunnel.disconnect();
    info!(agent_id = msg.agent_id, "tunnel disconnected");
    kernel.audit.log(
        AuditCategory::Network,
        "TUNNEL_DISCONNECTED",
        Some(msg.agent_id),
        json!({}),
        true,
    );
    respond(msg, json!({"success": true}))
}

fn handle_status(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    respond(msg, status_body(kernel, true, None))
}

fn handle_list_remotes(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let agents = kernel.tunnel.remotes();
    respond(
        msg,
        json!({"success": true, "count": agents.len(), "agents": agents}),
    )
}

fn handle_config(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };
    kernel.tunnel.apply_settings(&payload);
    respond(msg, status_body(kernel, true, None))
}
