//! `EXEC`: shell command execution.
//!
//! Synchronous by default; `{"async": true}` offloads to the worker
//! pool and immediately returns an acknowledgement with a request id.
//! Either way the command runs under a hard deadline and an overrun
//! child is killed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::debug;
use vivarium_core::audit::AuditCategory;
use vivarium_core::protocol::{Message, SyscallOp};

use super::{deny, parse_payload, required_str, respond, respond_err};
use crate::exec::{run_command, ExecOutcome, DEFAULT_EXEC_TIMEOUT};
use crate::kernel::Kernel;
use crate::router::SyscallRouter;

pub fn register(router: &mut SyscallRouter) {
    router.register(SyscallOp::Exec, handle_exec);
}

fn handle_exec(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };
    let command = match required_str(msg, &payload, "command") {
        Ok(c) => c.to_string(),
        Err(response) => return response,
    };

    let perms = kernel.permissions.get_or_create(msg.agent_id);
    if !perms.can_exec_command(&command) {
        return deny(kernel, msg, "EXEC", "command not allowed");
    }

    let cwd = payload
        .get("cwd")
        .and_then(Value::as_str)
        .map(PathBuf::from);
    let timeout = payload
        .get("timeout")
        .and_then(Value::as_u64)
        .map_or(DEFAULT_EXEC_TIMEOUT, Duration::from_secs);
    let run_async = payload
        .get("async")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    kernel.audit.log(
        AuditCategory::Syscall,
        "EXEC",
        Some(msg.agent_id),
        json!({"command": command, "async": run_async}),
        true,
    );
    debug!(agent_id = msg.agent_id, command = %command, run_async, "executing command");

    if run_async {
        let request_id = kernel.tasks.next_request_id();
        let submitted = kernel
            .tasks
            .submit(msg.agent_id, msg.opcode, request_id, move || {
                let outcome = run_command(&command, cwd.as_deref(), timeout);
                let mut body = outcome_payload(outcome);
                body["request_id"] = json!(request_id);
                body.to_string()
            });
        if !submitted {
            return respond_err(msg, "kernel is shutting down");
        }
        return respond(
            msg,
            json!({"success": true, "async": true, "request_id": request_id}),
        );
    }

    respond(msg, outcome_payload(run_command(&command, cwd.as_deref(), timeout)))
}

fn outcome_payload(outcome: std::io::Result<ExecOutcome>) -> Value {
    match outcome {
        Ok(out) if out.timed_out => json!({
            "success": false,
            "error": "timeout",
            "stdout": out.stdout,
            "stderr": out.stderr,
            "exit_code": out.exit_code,
            "duration_ms": out.duration_ms,
        }),
        Ok(out) => json!({
            "success": true,
            "stdout": out.stdout,
            "stderr": out.stderr,
            "exit_code": out.exit_code,
            "duration_ms": out.duration_ms,
        }),
        Err(e) => json!({
            "success": false,
            "error": format!("failed to run command: {e}"),
            "stdout": "",
            "stderr": "",
            "exit_code": -1,
        }),
    }
}
