//! Record/replay control syscalls.

use std::sync::Arc;

use serde_json::{json, Value};
use vivarium_core::audit::AuditCategory;
use vivarium_core::execution::RecordingState;
use vivarium_core::protocol::{Message, SyscallOp};

use super::{parse_payload, respond, respond_err};
use crate::kernel::Kernel;
use crate::router::SyscallRouter;

pub fn register(router: &mut SyscallRouter) {
    router.register(SyscallOp::RecordStart, handle_record_start);
    router.register(SyscallOp::RecordStop, handle_record_stop);
    router.register(SyscallOp::RecordStatus, handle_record_status);
    router.register(SyscallOp::ReplayStart, handle_replay_start);
    router.register(SyscallOp::ReplayStatus, handle_replay_status);
}

fn handle_record_start(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };

    let mut config = kernel.execution.config();
    if let Some(v) = payload.get("include_think").and_then(Value::as_bool) {
        config.include_think = v;
    }
    if let Some(v) = payload.get("include_http").and_then(Value::as_bool) {
        config.include_http = v;
    }
    if let Some(v) = payload.get("include_exec").and_then(Value::as_bool) {
        config.include_exec = v;
    }
    if let Some(v) = payload.get("max_entries").and_then(Value::as_u64) {
        config.max_entries = v as usize;
    }
    if let Some(agents) = payload.get("filter_agents").and_then(Value::as_array) {
        config.filter_agents = agents
            .iter()
            .filter_map(Value::as_u64)
            .map(|id| id as u32)
            .collect();
    }
    kernel.execution.set_config(config);

    let started = kernel.execution.start_recording();
    if started {
        kernel.audit.log(
            AuditCategory::Syscall,
            "RECORDING_STARTED",
            Some(msg.agent_id),
            json!({"started_by": msg.agent_id}),
            true,
        );
    }
    respond(msg, json!({"success": started, "recording": started}))
}

fn handle_record_stop(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let stopped = kernel.execution.stop_recording();
    let entries = kernel.execution.entry_count();
    if stopped {
        kernel.audit.log(
            AuditCategory::Syscall,
            "RECORDING_STOPPED",
            Some(msg.agent_id),
            json!({"stopped_by": msg.agent_id, "entries_recorded": entries}),
            true,
        );
    }
    respond(
        msg,
        json!({"success": stopped, "recording": false, "entries_recorded": entries}),
    )
}

fn handle_record_status(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };

    let state = kernel.execution.recording_state();
    let mut body = json!({
        "success": true,
        "recording": state == RecordingState::Recording,
        "paused": state == RecordingState::Paused,
        "entry_count": kernel.execution.entry_count(),
        "last_sequence_id": kernel.execution.last_sequence_id(),
    });

    if payload.get("export").and_then(Value::as_bool).unwrap_or(false) {
        body["recording_data"] = kernel.execution.export();
    }
    if payload.get("get_entries").is_some() {
        let since = payload.get("since_id").and_then(Value::as_u64).unwrap_or(0);
        let limit = payload.get("limit").and_then(Value::as_u64).unwrap_or(100) as usize;
        let entries: Vec<Value> = kernel
            .execution
            .entries_since(since, limit)
            .iter()
            .map(vivarium_core::execution::ExecutionEntry::to_json)
            .collect();
        body["entries"] = json!(entries);
    }

    respond(msg, body)
}

fn handle_replay_start(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let payload = match parse_payload(msg) {
        Ok(p) => p,
        Err(response) => return response,
    };

    if let Some(data) = payload.get("recording_data") {
        let document = match data {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if !kernel.execution.import(&document) {
            return respond_err(msg, "failed to import recording data");
        }
    }

    let started = kernel.execution.start_replay();
    let progress = kernel.execution.progress();
    if !started {
        return respond(
            msg,
            json!({"success": false, "error": progress.last_error}),
        );
    }

    kernel.audit.log(
        AuditCategory::Syscall,
        "REPLAY_STARTED",
        Some(msg.agent_id),
        json!({"started_by": msg.agent_id, "total_entries": progress.total_entries}),
        true,
    );
    respond(
        msg,
        json!({"success": true, "total_entries": progress.total_entries}),
    )
}

fn handle_replay_status(kernel: &Arc<Kernel>, msg: &Message) -> Message {
    let progress = kernel.execution.progress();

    let percent = if progress.total_entries > 0 {
        (100 * progress.current_entry / progress.total_entries) as u64
    } else {
        0
    };

    let mut body = json!({
        "success": true,
        "state": progress.state.as_str(),
        "total_entries": progress.total_entries,
        "current_entry": progress.current_entry,
        "entries_replayed": progress.entries_replayed,
        "entries_skipped": progress.entries_skipped,
        "progress_percent": percent,
    });
    if !progress.last_error.is_empty() {
        body["last_error"] = json!(progress.last_error);
    }
    respond(msg, body)
}
