//! File syscalls: `READ` and `WRITE`, world-aware.
//!
//! Before permissions and the host filesystem are consulted, the
//! handler checks whether the caller is in a world whose VFS claims
//! the path. If so, the operation stays entirely inside the virtual
//! tree, with chaos failure injection applied first.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;
use vivarium_core::audit::AuditCategory;
use vivarium_core::protocol::{Message, SyscallOp};

use super::{deny, parse_payload, required_str, respond, respond_err};
use crate::kernel::Kernel;
use crate::router::SyscallRouter;

pub fn register(router: &mut SyscallRouter) {
    router.register(SyscallOp::Read, handle_read);
    router.register(SyscallOp::Write, handle_write);
}

enum VirtualRead {
    ChaosFailure(String),
    NotFound(String),
    Content(String, String),
}

fn handle_read(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };
    let path = match required_str(msg, &payload, "path") {
        Ok(p) => p.to_string(),
        Err(response) => return response,
    };

    let virtual_outcome = kernel.worlds.with_agent_world(msg.agent_id, |world| {
        if !world.vfs.is_enabled() || !world.vfs.should_intercept(&path) {
            return None;
        }
        world.record_syscall();
        if world.chaos.should_fail_read(&path) {
            return Some(VirtualRead::ChaosFailure(world.id().to_string()));
        }
        Some(match world.vfs.read(&path) {
            Some(content) => VirtualRead::Content(content, world.id().to_string()),
            None => VirtualRead::NotFound(world.id().to_string()),
        })
    });

    match virtual_outcome.flatten() {
        Some(VirtualRead::ChaosFailure(world)) => {
            debug!(agent_id = msg.agent_id, path = %path, "chaos read failure");
            return respond(
                msg,
                json!({
                    "success": false,
                    "error": "Simulated read failure (chaos)",
                    "content": "",
                    "size": 0,
                    "world": world,
                }),
            );
        }
        Some(VirtualRead::NotFound(world)) => {
            return respond(
                msg,
                json!({
                    "success": false,
                    "error": "File not found in virtual filesystem",
                    "content": "",
                    "size": 0,
                    "world": world,
                }),
            );
        }
        Some(VirtualRead::Content(content, world)) => {
            return respond(
                msg,
                json!({
                    "success": true,
                    "content": content,
                    "size": content.len(),
                    "world": world,
                    "virtual": true,
                }),
            );
        }
        None => {}
    }

    let perms = kernel.permissions.get_or_create(msg.agent_id);
    if !perms.can_read_path(&path) {
        return deny(kernel, msg, "READ", "path not allowed for reading");
    }

    debug!(agent_id = msg.agent_id, path = %path, "reading file");
    match std::fs::read(&path) {
        Ok(bytes) => {
            let content = String::from_utf8_lossy(&bytes).into_owned();
            respond(
                msg,
                json!({"success": true, "content": content, "size": bytes.len()}),
            )
        }
        Err(e) => respond(
            msg,
            json!({
                "success": false,
                "error": format!("failed to open file: {e}"),
                "content": "",
                "size": 0,
            }),
        ),
    }
}

enum VirtualWrite {
    ChaosFailure(String),
    Denied(String),
    Written(String),
}

fn handle_write(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };
    let path = match required_str(msg, &payload, "path") {
        Ok(p) => p.to_string(),
        Err(response) => return response,
    };
    let content = payload
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let append = payload.get("mode").and_then(Value::as_str) == Some("append");

    let virtual_outcome = kernel.worlds.with_agent_world(msg.agent_id, |world| {
        if !world.vfs.is_enabled() || !world.vfs.should_intercept(&path) {
            return None;
        }
        world.record_syscall();
        if world.chaos.should_fail_write(&path) {
            return Some(VirtualWrite::ChaosFailure(world.id().to_string()));
        }
        Some(if world.vfs.write(&path, &content, append) {
            VirtualWrite::Written(world.id().to_string())
        } else {
            VirtualWrite::Denied(world.id().to_string())
        })
    });

    match virtual_outcome.flatten() {
        Some(VirtualWrite::ChaosFailure(world)) => {
            debug!(agent_id = msg.agent_id, path = %path, "chaos write failure");
            return respond(
                msg,
                json!({
                    "success": false,
                    "error": "Simulated write failure (chaos)",
                    "bytes_written": 0,
                    "world": world,
                }),
            );
        }
        Some(VirtualWrite::Denied(world)) => {
            return respond(
                msg,
                json!({
                    "success": false,
                    "error": "Virtual filesystem write denied",
                    "bytes_written": 0,
                    "world": world,
                }),
            );
        }
        Some(VirtualWrite::Written(world)) => {
            return respond(
                msg,
                json!({
                    "success": true,
                    "bytes_written": content.len(),
                    "world": world,
                    "virtual": true,
                }),
            );
        }
        None => {}
    }

    let perms = kernel.permissions.get_or_create(msg.agent_id);
    if !perms.can_write_path(&path) {
        return deny(kernel, msg, "WRITE", "path not allowed for writing");
    }

    debug!(agent_id = msg.agent_id, path = %path, append, "writing file");
    let result = if append {
        use std::io::Write;
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| f.write_all(content.as_bytes()))
    } else {
        std::fs::write(&path, content.as_bytes())
    };

    match result {
        Ok(()) => {
            kernel.audit.log(
                AuditCategory::State,
                "FILE_WRITE",
                Some(msg.agent_id),
                json!({"path": path, "bytes": content.len()}),
                true,
            );
            respond(
                msg,
                json!({"success": true, "bytes_written": content.len()}),
            )
        }
        Err(e) => respond_err(msg, format_args!("failed to write file: {e}")),
    }
}
