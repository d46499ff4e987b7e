//! Endpoint error types.

use std::time::Duration;

use mirrorfault_proto::{CodecError, FrameKind};
use thiserror::Error;

/// Errors from guarded endpoint operations.
///
/// Every variant is returned synchronously to the calling step. A deadline
/// always resolves to [`FaultError::Timeout`] or
/// [`FaultError::ConnectTimeout`], never to a success.
#[derive(Debug, Error)]
pub enum FaultError {
    /// Peer stalled or closed before a complete frame arrived.
    #[error("incomplete {frame} frame: expected {expected} bytes, received {received}")]
    FrameIncomplete {
        /// Frame being read.
        frame: FrameKind,
        /// Bytes a complete frame needs.
        expected: usize,
        /// Bytes delivered before close or deadline.
        received: usize,
    },

    /// Peer stalled or closed in the middle of a payload.
    #[error("incomplete payload: expected {expected} bytes, received {received}")]
    PayloadIncomplete {
        /// Payload length announced by the request.
        expected: u64,
        /// Bytes delivered before close or deadline.
        received: u64,
    },

    /// Wrong magic, size disagreement or uncorrelated reply.
    #[error("protocol mismatch: {reason}")]
    ProtocolMismatch {
        /// What disagreed.
        reason: String,
    },

    /// A guarded operation ran past its deadline.
    #[error("timed out waiting for {operation} after {limit:?}")]
    Timeout {
        /// What was being waited for.
        operation: &'static str,
        /// Deadline the operation was given.
        limit: Duration,
    },

    /// No connection could be opened before the retry deadline.
    #[error("could not connect to {address} within {limit:?} after {attempts} attempts")]
    ConnectTimeout {
        /// Address being connected to.
        address: String,
        /// Total retry budget.
        limit: Duration,
        /// Connection attempts made.
        attempts: u32,
    },

    /// Correlation handle was not exactly 8 bytes.
    #[error("invalid handle: expected 8 bytes, got {len}")]
    InvalidHandle {
        /// Length of the rejected handle.
        len: usize,
    },

    /// Request type code outside the known command set.
    #[error("unknown request type: {0}")]
    UnknownRequestType(u32),

    /// Explicit refusal by the peer or its access control.
    #[error("rejected: {reason}")]
    Rejected {
        /// Refusal as reported by the peer.
        reason: String,
    },

    /// The connection was already torn down.
    #[error("connection is closed")]
    NotConnected,

    /// Underlying socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FaultError {
    /// Whether this is a deadline failure.
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::ConnectTimeout { .. })
    }

    /// Whether the connection can no longer be used after this error.
    pub const fn poisons_connection(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::FrameIncomplete { .. }
                | Self::PayloadIncomplete { .. }
                | Self::Io(_)
        )
    }

    pub(crate) fn mismatch(reason: impl Into<String>) -> Self {
        Self::ProtocolMismatch { reason: reason.into() }
    }
}

impl From<CodecError> for FaultError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::FrameIncomplete { frame, expected, received } => {
                Self::FrameIncomplete { frame, expected, received }
            },
            CodecError::InvalidHandle { len } => Self::InvalidHandle { len },
            CodecError::UnknownRequestType(code) => Self::UnknownRequestType(code),
        }
    }
}

/// Result alias for endpoint operations.
pub type Result<T> = std::result::Result<T, FaultError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_errors_keep_their_meaning() {
        let err: FaultError = CodecError::InvalidHandle { len: 3 }.into();
        assert!(matches!(err, FaultError::InvalidHandle { len: 3 }));

        let err: FaultError = CodecError::FrameIncomplete {
            frame: FrameKind::Handshake,
            expected: 152,
            received: 0,
        }
        .into();
        assert!(matches!(err, FaultError::FrameIncomplete { received: 0, .. }));
    }

    #[test]
    fn timeouts_are_timeouts() {
        let err = FaultError::Timeout { operation: "hello", limit: Duration::from_secs(2) };
        assert!(err.is_timeout());
        assert!(err.poisons_connection());
        assert!(!FaultError::Rejected { reason: "acl".to_string() }.is_timeout());
    }

    #[test]
    fn timeout_display_is_fixed() {
        let err = FaultError::Timeout { operation: "hello", limit: Duration::from_secs(2) };
        assert_eq!(err.to_string(), "timed out waiting for hello after 2s");
    }
}
