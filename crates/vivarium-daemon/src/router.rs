//! Syscall dispatch table.
//!
//! A flat map from opcode byte to handler function. Registration
//! happens once at kernel construction and is static afterwards.
//! Unknown opcodes echo the request payload back with the same opcode
//! — the compatibility escape hatch for clients newer than the kernel.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;
use vivarium_core::protocol::{Message, SyscallOp};

use crate::kernel::Kernel;

/// A syscall handler. Runs to completion on the dispatch thread and
/// always produces a response message.
pub type Handler = fn(&Arc<Kernel>, &Message) -> Message;

/// Opcode → handler map.
#[derive(Default)]
pub struct SyscallRouter {
    handlers: HashMap<u8, Handler>,
}

impl std::fmt::Debug for SyscallRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyscallRouter")
            .field("registered", &self.handlers.len())
            .finish()
    }
}

impl SyscallRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an opcode. Last registration wins; in
    /// practice every opcode is registered exactly once at startup.
    pub fn register(&mut self, op: SyscallOp, handler: Handler) {
        self.handlers.insert(op as u8, handler);
    }

    /// Number of registered opcodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Dispatch one message, echoing unknown opcodes.
    #[must_use]
    pub fn handle(&self, kernel: &Arc<Kernel>, msg: &Message) -> Message {
        match self.handlers.get(&msg.opcode) {
            Some(handler) => handler(kernel, msg),
            None => {
                trace!(opcode = msg.opcode, "unknown opcode, echoing payload");
                Message::raw(msg.agent_id, msg.opcode, msg.payload.clone())
            }
        }
    }
}
