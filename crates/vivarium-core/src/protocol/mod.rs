//! Binary wire protocol between agents and the kernel.
//!
//! Every syscall is one request frame answered by exactly one response
//! frame with the same opcode. A frame is a fixed 17-byte header
//! followed by an opaque payload (commonly UTF-8 JSON):
//!
//! ```text
//! +-----------+-----------+----------+------------------+-----------+
//! | Magic 4B  | Agent 4B  | Op 1B    | Payload len 8B   | Payload   |
//! +-----------+-----------+----------+------------------+-----------+
//! ```
//!
//! All header integers are little-endian. The magic is the constant
//! `0x41474E54` ("AGNT"); payloads are capped at 1 MiB.

mod error;
mod framing;

pub use error::{ProtocolError, ProtocolResult};
pub use framing::FrameCodec;

use bytes::Bytes;
use serde_json::Value;

/// Frame magic, "AGNT" read as a little-endian u32.
pub const MAGIC: u32 = 0x4147_4E54;

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 17;

/// Maximum payload size (1 MiB). Larger frames are a protocol error.
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Default kernel listening socket.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/vivarium.sock";

/// Environment variable overriding the socket path for agents and the
/// kernel alike.
pub const SOCKET_ENV_VAR: &str = "VIVARIUM_SOCKET";

/// Syscall operation codes.
///
/// The discriminants are wire bytes and must never be renumbered.
/// Unknown bytes are not an error at the router: they echo the request
/// payload back, which is the compatibility escape hatch for opcodes
/// newer than this kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SyscallOp {
    Noop = 0x00,
    Think = 0x01,
    Exec = 0x02,
    Read = 0x03,
    Write = 0x04,

    Spawn = 0x10,
    Kill = 0x11,
    List = 0x12,
    Pause = 0x14,
    Resume = 0x15,

    Send = 0x20,
    Recv = 0x21,
    Broadcast = 0x22,
    Register = 0x23,

    Store = 0x30,
    Fetch = 0x31,
    Delete = 0x32,
    Keys = 0x33,

    GetPerms = 0x40,
    SetPerms = 0x41,

    Http = 0x50,

    Subscribe = 0x60,
    Unsubscribe = 0x61,
    PollEvents = 0x62,
    Emit = 0x63,

    RecordStart = 0x70,
    RecordStop = 0x71,
    RecordStatus = 0x72,
    ReplayStart = 0x73,
    ReplayStatus = 0x74,

    GetAuditLog = 0x76,
    SetAuditConfig = 0x77,

    AsyncPoll = 0x80,

    WorldCreate = 0xA0,
    WorldDestroy = 0xA1,
    WorldList = 0xA2,
    WorldJoin = 0xA3,
    WorldLeave = 0xA4,
    WorldEvent = 0xA5,
    WorldState = 0xA6,
    WorldSnapshot = 0xA7,
    WorldRestore = 0xA8,

    TunnelConnect = 0xB0,
    TunnelDisconnect = 0xB1,
    TunnelStatus = 0xB2,
    TunnelListRemotes = 0xB3,
    TunnelConfig = 0xB4,

    MetricsSystem = 0xC0,
    MetricsAgent = 0xC1,

    LlmReport = 0xF0,
    Hello = 0xFE,
    Exit = 0xFF,
}

impl SyscallOp {
    /// Decode a wire byte into a known opcode.
    #[must_use]
    pub const fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0x00 => Self::Noop,
            0x01 => Self::Think,
            0x02 => Self::Exec,
            0x03 => Self::Read,
            0x04 => Self::Write,
            0x10 => Self::Spawn,
            0x11 => Self::Kill,
            0x12 => Self::List,
            0x14 => Self::Pause,
            0x15 => Self::Resume,
            0x20 => Self::Send,
            0x21 => Self::Recv,
            0x22 => Self::Broadcast,
            0x23 => Self::Register,
            0x30 => Self::Store,
            0x31 => Self::Fetch,
            0x32 => Self::Delete,
            0x33 => Self::Keys,
            0x40 => Self::GetPerms,
            0x41 => Self::SetPerms,
            0x50 => Self::Http,
            0x60 => Self::Subscribe,
            0x61 => Self::Unsubscribe,
            0x62 => Self::PollEvents,
            0x63 => Self::Emit,
            0x70 => Self::RecordStart,
            0x71 => Self::RecordStop,
            0x72 => Self::RecordStatus,
            0x73 => Self::ReplayStart,
            0x74 => Self::ReplayStatus,
            0x76 => Self::GetAuditLog,
            0x77 => Self::SetAuditConfig,
            0x80 => Self::AsyncPoll,
            0xA0 => Self::WorldCreate,
            0xA1 => Self::WorldDestroy,
            0xA2 => Self::WorldList,
            0xA3 => Self::WorldJoin,
            0xA4 => Self::WorldLeave,
            0xA5 => Self::WorldEvent,
            0xA6 => Self::WorldState,
            0xA7 => Self::WorldSnapshot,
            0xA8 => Self::WorldRestore,
            0xB0 => Self::TunnelConnect,
            0xB1 => Self::TunnelDisconnect,
            0xB2 => Self::TunnelStatus,
            0xB3 => Self::TunnelListRemotes,
            0xB4 => Self::TunnelConfig,
            0xC0 => Self::MetricsSystem,
            0xC1 => Self::MetricsAgent,
            0xF0 => Self::LlmReport,
            0xFE => Self::Hello,
            0xFF => Self::Exit,
            _ => return None,
        })
    }

    /// Stable wire-facing name, used in async poll results and logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Noop => "NOOP",
            Self::Think => "THINK",
            Self::Exec => "EXEC",
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::Spawn => "SPAWN",
            Self::Kill => "KILL",
            Self::List => "LIST",
            Self::Pause => "PAUSE",
            Self::Resume => "RESUME",
            Self::Send => "SEND",
            Self::Recv => "RECV",
            Self::Broadcast => "BROADCAST",
            Self::Register => "REGISTER",
            Self::Store => "STORE",
            Self::Fetch => "FETCH",
            Self::Delete => "DELETE",
            Self::Keys => "KEYS",
            Self::GetPerms => "GET_PERMS",
            Self::SetPerms => "SET_PERMS",
            Self::Http => "HTTP",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::PollEvents => "POLL_EVENTS",
            Self::Emit => "EMIT",
            Self::RecordStart => "RECORD_START",
            Self::RecordStop => "RECORD_STOP",
            Self::RecordStatus => "RECORD_STATUS",
            Self::ReplayStart => "REPLAY_START",
            Self::ReplayStatus => "REPLAY_STATUS",
            Self::GetAuditLog => "GET_AUDIT_LOG",
            Self::SetAuditConfig => "SET_AUDIT_CONFIG",
            Self::AsyncPoll => "ASYNC_POLL",
            Self::WorldCreate => "WORLD_CREATE",
            Self::WorldDestroy => "WORLD_DESTROY",
            Self::WorldList => "WORLD_LIST",
            Self::WorldJoin => "WORLD_JOIN",
            Self::WorldLeave => "WORLD_LEAVE",
            Self::WorldEvent => "WORLD_EVENT",
            Self::WorldState => "WORLD_STATE",
            Self::WorldSnapshot => "WORLD_SNAPSHOT",
            Self::WorldRestore => "WORLD_RESTORE",
            Self::TunnelConnect => "TUNNEL_CONNECT",
            Self::TunnelDisconnect => "TUNNEL_DISCONNECT",
            Self::TunnelStatus => "TUNNEL_STATUS",
            Self::TunnelListRemotes => "TUNNEL_LIST_REMOTES",
            Self::TunnelConfig => "TUNNEL_CONFIG",
            Self::MetricsSystem => "METRICS_SYSTEM",
            Self::MetricsAgent => "METRICS_AGENT",
            Self::LlmReport => "LLM_REPORT",
            Self::Hello => "HELLO",
            Self::Exit => "EXIT",
        }
    }

    /// Opcodes whose handlers touch the outside world.
    ///
    /// During replay these are short-circuited with the recorded
    /// response instead of executing.
    #[must_use]
    pub const fn has_side_effects(self) -> bool {
        matches!(
            self,
            Self::Exec | Self::Http | Self::Think | Self::Read | Self::Write
        )
    }
}

/// One decoded wire message.
///
/// The opcode is kept as the raw byte so unknown opcodes can round-trip
/// through the echo path unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Kernel-assigned agent id; 0 until the first response fixes it.
    pub agent_id: u32,
    /// Raw opcode byte.
    pub opcode: u8,
    /// Opaque payload bytes.
    pub payload: Bytes,
}

impl Message {
    /// Build a message for a known opcode.
    pub fn new(agent_id: u32, op: SyscallOp, payload: impl Into<Bytes>) -> Self {
        Self {
            agent_id,
            opcode: op as u8,
            payload: payload.into(),
        }
    }

    /// Build a message from a raw opcode byte (echo path).
    pub fn raw(agent_id: u32, opcode: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            agent_id,
            opcode,
            payload: payload.into(),
        }
    }

    /// Build a message whose payload is a serialized JSON value.
    #[must_use]
    pub fn json(agent_id: u32, op: SyscallOp, body: &Value) -> Self {
        Self::new(agent_id, op, body.to_string())
    }

    /// The opcode, if this kernel knows it.
    #[must_use]
    pub const fn op(&self) -> Option<SyscallOp> {
        SyscallOp::from_u8(self.opcode)
    }

    /// Payload interpreted as UTF-8, lossily.
    #[must_use]
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}
