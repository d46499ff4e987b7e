//! Response frame.

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned, byteorder::big_endian::U32,
};

use crate::{
    CodecError, FrameKind, Handle, RequestFrame,
    constants::{REPLY_MAGIC, RESPONSE_SIZE},
};

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct RawResponse {
    magic: [u8; 4],
    error: U32,
    handle: [u8; 8],
}

const _: () = assert!(size_of::<RawResponse>() == RESPONSE_SIZE);

/// Reply from the destination to one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseFrame {
    /// Reply marker; [`REPLY_MAGIC`] unless garbled.
    pub magic: [u8; 4],
    /// 0 on success.
    pub error: u32,
    /// Handle of the answered request.
    pub handle: Handle,
}

impl ResponseFrame {
    /// Response size on the wire.
    pub const SIZE: usize = RESPONSE_SIZE;

    /// Correctly formed reply to `request`.
    pub const fn reply_to(request: &RequestFrame, error: u32) -> Self {
        Self { magic: REPLY_MAGIC, error, handle: request.handle }
    }

    /// Whether `magic` is the reply marker.
    pub fn has_valid_magic(&self) -> bool {
        self.magic == REPLY_MAGIC
    }

    /// Whether this is a well-formed reply correlated with `request`.
    pub fn answers(&self, request: &RequestFrame) -> bool {
        self.has_valid_magic() && self.handle == request.handle
    }

    /// Encode into 16 wire bytes.
    pub fn encode(&self) -> [u8; RESPONSE_SIZE] {
        let raw = RawResponse {
            magic: self.magic,
            error: U32::new(self.error),
            handle: self.handle.to_bytes(),
        };
        let mut out = [0u8; RESPONSE_SIZE];
        out.copy_from_slice(raw.as_bytes());
        out
    }

    /// Decode from the first 16 bytes of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let (raw, _) = RawResponse::read_from_prefix(bytes)
            .map_err(|_| CodecError::incomplete(FrameKind::Response, bytes.len()))?;
        Ok(Self { magic: raw.magic, error: raw.error.get(), handle: Handle::new(raw.handle) })
    }
}

/// Decode a response from wire bytes.
pub fn decode_response_bytes(bytes: &[u8]) -> Result<ResponseFrame, CodecError> {
    ResponseFrame::decode(bytes)
}
