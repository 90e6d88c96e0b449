//! Error types surfaced at service and handler boundaries.

use thiserror::Error;

/// Error kinds produced by the in-kernel services.
///
/// Handlers translate these into failure response payloads; they never
/// cross the router boundary as panics. Only [`KernelError::Protocol`]
/// terminates a connection.
#[derive(Debug, Error)]
pub enum KernelError {
    /// Malformed wire data. The transport closes the offending
    /// connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Malformed JSON payload. Synchronous failure response, no state
    /// mutation.
    #[error("invalid request: {0}")]
    Parse(String),

    /// A permission predicate denied the operation.
    #[error("Permission denied: {0}")]
    Permission(String),

    /// The named agent, world, or key does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// A uniqueness or membership rule was violated.
    #[error("{0}")]
    Conflict(String),

    /// Spawn, cgroup setup, or another infrastructure action failed.
    #[error("{0}")]
    Resource(String),

    /// A bounded queue refused an enqueue.
    #[error("{0}")]
    Overflow(String),

    /// An async task exceeded its budget.
    #[error("timeout")]
    Timeout,

    /// Unexpected internal condition; detail goes to the log, not the
    /// wire.
    #[error("internal error")]
    Internal(String),
}

impl KernelError {
    /// Human-readable message suitable for a failure response payload.
    #[must_use]
    pub fn wire_message(&self) -> String {
        match self {
            // Internal detail stays out of responses.
            Self::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_detail_is_not_exposed() {
        let err = KernelError::Internal("lock poisoned in state store".into());
        assert_eq!(err.wire_message(), "internal error");
    }

    #[test]
    fn permission_message_keeps_prefix() {
        let err = KernelError::Permission("path not allowed for reading".into());
        assert_eq!(
            err.wire_message(),
            "Permission denied: path not allowed for reading"
        );
    }
}
