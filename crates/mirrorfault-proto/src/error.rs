//! Codec error types.

use std::fmt;

use thiserror::Error;

/// The three frame types on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// 152-byte handshake sent by the destination.
    Handshake,
    /// 28-byte request sent by the source.
    Request,
    /// 16-byte response sent by the destination.
    Response,
}

impl FrameKind {
    /// Wire size of this frame type.
    pub const fn size(self) -> usize {
        match self {
            Self::Handshake => crate::HANDSHAKE_SIZE,
            Self::Request => crate::REQUEST_SIZE,
            Self::Response => crate::RESPONSE_SIZE,
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handshake => write!(f, "handshake"),
            Self::Request => write!(f, "request"),
            Self::Response => write!(f, "response"),
        }
    }
}

/// Errors from encoding or decoding frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Fewer bytes than a full frame were available.
    #[error("incomplete {frame} frame: expected {expected} bytes, received {received}")]
    FrameIncomplete {
        /// Frame being decoded.
        frame: FrameKind,
        /// Bytes a complete frame needs.
        expected: usize,
        /// Bytes actually delivered.
        received: usize,
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
}

impl CodecError {
    pub(crate) const fn incomplete(frame: FrameKind, received: usize) -> Self {
        Self::FrameIncomplete { frame, expected: frame.size(), received }
    }
}
