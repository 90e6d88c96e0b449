//! Syscall transcript recording and deterministic replay.
//!
//! While recording, every handled syscall is appended with its request
//! and response payloads. A recording exports to a single JSON document
//! and imports back. During replay the kernel walks the recorded
//! sequence: side-effecting syscalls are answered from the transcript
//! instead of executing, so a replayed session touches nothing outside
//! the kernel.
//!
//! Matching rule: scan forward from the cursor for the next entry with
//! the same opcode and agent id. Entries passed over count as skipped.
//! A side-effecting syscall with no matching entry fails rather than
//! falling through to real execution.

use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::protocol::SyscallOp;

/// Default transcript capacity.
pub const DEFAULT_RECORDING_CAPACITY: usize = 10_000;

/// What gets recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub include_think: bool,
    pub include_http: bool,
    pub include_exec: bool,
    pub max_entries: usize,
    /// Empty means all agents.
    pub filter_agents: Vec<u32>,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            include_think: true,
            include_http: true,
            include_exec: true,
            max_entries: DEFAULT_RECORDING_CAPACITY,
            filter_agents: Vec::new(),
        }
    }
}

/// One recorded syscall.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEntry {
    pub id: u64,
    pub agent_id: u32,
    pub opcode: u8,
    pub request: String,
    pub response: String,
    pub timestamp_ms: i64,
}

impl ExecutionEntry {
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Exported transcript document.
#[derive(Debug, Serialize, Deserialize)]
struct RecordingDocument {
    version: u32,
    entries: Vec<ExecutionEntry>,
}

/// Recorder states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    Recording,
    Paused,
}

/// Replay states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayState {
    Idle,
    Running,
    Paused,
    Completed,
    Error,
}

impl ReplayState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

/// Progress snapshot for `REPLAY_STATUS`.
#[derive(Debug, Clone)]
pub struct ReplayProgress {
    pub state: ReplayState,
    pub total_entries: usize,
    pub current_entry: usize,
    pub entries_replayed: usize,
    pub entries_skipped: usize,
    pub last_error: String,
}

#[derive(Debug)]
struct Inner {
    config: RecordingConfig,
    recording: RecordingState,
    entries: Vec<ExecutionEntry>,
    next_id: u64,

    replay: ReplayState,
    cursor: usize,
    replayed: usize,
    skipped: usize,
    last_error: String,
}

/// Record/replay service.
#[derive(Debug)]
pub struct ExecutionLog {
    inner: Mutex<Inner>,
}

impl Default for ExecutionLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionLog {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                config: RecordingConfig::default(),
                recording: RecordingState::Idle,
                entries: Vec::new(),
                next_id: 1,
                replay: ReplayState::Idle,
                cursor: 0,
                replayed: 0,
                skipped: 0,
                last_error: String::new(),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> RecordingConfig {
        self.inner.lock().expect("execution lock poisoned").config.clone()
    }

    pub fn set_config(&self, config: RecordingConfig) {
        self.inner.lock().expect("execution lock poisoned").config = config;
    }

    /// Begin recording. Clears any prior transcript.
    pub fn start_recording(&self) -> bool {
        let mut inner = self.inner.lock().expect("execution lock poisoned");
        if inner.replay == ReplayState::Running {
            return false;
        }
        inner.entries.clear();
        inner.next_id = 1;
        inner.recording = RecordingState::Recording;
        true
    }

    pub fn stop_recording(&self) -> bool {
        let mut inner = self.inner.lock().expect("execution lock poisoned");
        let was_recording = inner.recording == RecordingState::Recording;
        inner.recording = RecordingState::Idle;
        was_recording
    }

    #[must_use]
    pub fn recording_state(&self) -> RecordingState {
        self.inner.lock().expect("execution lock poisoned").recording
    }

    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.recording_state() == RecordingState::Recording
    }

    /// Append one handled syscall, subject to the recording filters.
    pub fn record(&self, agent_id: u32, op: SyscallOp, request: &str, response: &str) {
        let mut inner = self.inner.lock().expect("execution lock poisoned");
        if inner.recording != RecordingState::Recording {
            return;
        }

        let cfg = &inner.config;
        let included = match op {
            SyscallOp::Think => cfg.include_think,
            SyscallOp::Http => cfg.include_http,
            SyscallOp::Exec => cfg.include_exec,
            _ => true,
        };
        if !included {
            return;
        }
        if !cfg.filter_agents.is_empty() && !cfg.filter_agents.contains(&agent_id) {
            return;
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let max = inner.config.max_entries;
        if inner.entries.len() >= max {
            inner.entries.remove(0);
        }
        inner.entries.push(ExecutionEntry {
            id,
            agent_id,
            opcode: op as u8,
            request: request.to_string(),
            response: response.to_string(),
            timestamp_ms: Utc::now().timestamp_millis(),
        });
    }

    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.inner.lock().expect("execution lock poisoned").entries.len()
    }

    #[must_use]
    pub fn last_sequence_id(&self) -> u64 {
        let inner = self.inner.lock().expect("execution lock poisoned");
        inner.entries.last().map_or(0, |e| e.id)
    }

    /// Entries with id greater than `since_id`, capped at `limit`.
    pub fn entries_since(&self, since_id: u64, limit: usize) -> Vec<ExecutionEntry> {
        let inner = self.inner.lock().expect("execution lock poisoned");
        inner
            .entries
            .iter()
            .filter(|e| e.id > since_id)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Export the transcript as one JSON document.
    #[must_use]
    pub fn export(&self) -> serde_json::Value {
        let inner = self.inner.lock().expect("execution lock poisoned");
        serde_json::to_value(RecordingDocument {
            version: 1,
            entries: inner.entries.clone(),
        })
        .unwrap_or_default()
    }

    /// Replace the transcript with an imported document.
    pub fn import(&self, document: &str) -> bool {
        let Ok(doc) = serde_json::from_str::<RecordingDocument>(document) else {
            return false;
        };
        let mut inner = self.inner.lock().expect("execution lock poisoned");
        inner.next_id = doc.entries.last().map_or(1, |e| e.id + 1);
        inner.entries = doc.entries;
        inner.replay = ReplayState::Idle;
        inner.cursor = 0;
        true
    }

    /// Start replaying the loaded transcript.
    pub fn start_replay(&self) -> bool {
        let mut inner = self.inner.lock().expect("execution lock poisoned");
        if inner.entries.is_empty() {
            inner.replay = ReplayState::Error;
            inner.last_error = "no recording loaded".to_string();
            return false;
        }
        inner.recording = RecordingState::Idle;
        inner.replay = ReplayState::Running;
        inner.cursor = 0;
        inner.replayed = 0;
        inner.skipped = 0;
        inner.last_error.clear();
        true
    }

    #[must_use]
    pub fn replay_active(&self) -> bool {
        self.inner.lock().expect("execution lock poisoned").replay == ReplayState::Running
    }

    /// The recorded response for the next matching syscall, if any.
    ///
    /// Returns `None` when replay is not running or no entry ahead of
    /// the cursor matches; in the latter case the replay is marked
    /// errored so the divergence is visible in `REPLAY_STATUS`.
    pub fn next_response(&self, agent_id: u32, op: SyscallOp) -> Option<String> {
        let mut inner = self.inner.lock().expect("execution lock poisoned");
        if inner.replay != ReplayState::Running {
            return None;
        }

        let found = inner.entries[inner.cursor..]
            .iter()
            .position(|e| e.agent_id == agent_id && e.opcode == op as u8);

        match found {
            Some(offset) => {
                inner.skipped += offset;
                let index = inner.cursor + offset;
                let response = inner.entries[index].response.clone();
                inner.cursor = index + 1;
                inner.replayed += 1;
                if inner.cursor >= inner.entries.len() {
                    inner.replay = ReplayState::Completed;
                }
                Some(response)
            }
            None => {
                inner.replay = ReplayState::Error;
                inner.last_error = format!(
                    "no recorded response for {} from agent {agent_id}",
                    op.name()
                );
                None
            }
        }
    }

    #[must_use]
    pub fn progress(&self) -> ReplayProgress {
        let inner = self.inner.lock().expect("execution lock poisoned");
        ReplayProgress {
            state: inner.replay,
            total_entries: inner.entries.len(),
            current_entry: inner.cursor,
            entries_replayed: inner.replayed,
            entries_skipped: inner.skipped,
            last_error: inner.last_error.clone(),
        }
    }
}
