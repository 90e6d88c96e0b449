//! Protocol-level errors.
//!
//! These are the only errors that terminate a connection: the peer is
//! speaking something that is not the vivarium wire protocol, so there
//! is no frame boundary left to resynchronize on.

use thiserror::Error;

use super::{MAGIC, MAX_PAYLOAD_SIZE};

/// Result alias for codec operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame header did not start with [`MAGIC`].
    #[error("bad magic 0x{actual:08x}, expected 0x{MAGIC:08x}")]
    BadMagic {
        /// The magic bytes actually observed.
        actual: u32,
    },

    /// The declared payload length exceeds [`MAX_PAYLOAD_SIZE`].
    #[error("payload length {size} exceeds limit {MAX_PAYLOAD_SIZE}")]
    PayloadTooLarge {
        /// Declared payload length.
        size: u64,
    },

    /// Underlying transport error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
