//! Request frame.

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned, byteorder::big_endian::U32,
};

use crate::{
    CodecError, FrameKind, Handle,
    constants::{REQUEST_MAGIC, REQUEST_SIZE},
    offset::{offset_from_wire, offset_to_wire},
};

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct RawRequest {
    magic: [u8; 4],
    kind: U32,
    handle: [u8; 8],
    offset: [u8; 8],
    length: U32,
}

const _: () = assert!(size_of::<RawRequest>() == REQUEST_SIZE);

/// Command carried by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    /// Read `length` bytes at `offset`; the reply carries the data.
    Read,
    /// Write the `length` payload bytes following the frame.
    Write,
    /// Orderly end of the session.
    Disconnect,
    /// Irrevocable handoff of serving authority to the destination.
    Entrust,
}

impl RequestType {
    /// Wire code of this command.
    pub const fn code(self) -> u32 {
        match self {
            Self::Read => 0,
            Self::Write => 1,
            Self::Disconnect => 2,
            Self::Entrust => 65536,
        }
    }

    /// Parse a wire code.
    pub const fn from_code(code: u32) -> Result<Self, CodecError> {
        match code {
            0 => Ok(Self::Read),
            1 => Ok(Self::Write),
            2 => Ok(Self::Disconnect),
            65536 => Ok(Self::Entrust),
            other => Err(CodecError::UnknownRequestType(other)),
        }
    }
}

/// Request sent by the mirroring source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestFrame {
    /// Request marker; [`REQUEST_MAGIC`] unless deliberately malformed.
    pub magic: [u8; 4],
    /// Command.
    pub kind: RequestType,
    /// Correlation token echoed in the response.
    pub handle: Handle,
    /// Byte offset into the export.
    pub offset: i64,
    /// Payload size of a WRITE, or expected reply size of a READ.
    pub length: u32,
}

impl RequestFrame {
    /// Request size on the wire.
    pub const SIZE: usize = REQUEST_SIZE;

    /// Well-formed request with the standard magic.
    pub const fn new(kind: RequestType, handle: Handle, offset: i64, length: u32) -> Self {
        Self { magic: REQUEST_MAGIC, kind, handle, offset, length }
    }

    /// Whether `magic` is the request marker.
    pub fn has_valid_magic(&self) -> bool {
        self.magic == REQUEST_MAGIC
    }

    /// Encode into 28 wire bytes.
    pub fn encode(&self) -> [u8; REQUEST_SIZE] {
        let raw = RawRequest {
            magic: self.magic,
            kind: U32::new(self.kind.code()),
            handle: self.handle.to_bytes(),
            offset: offset_to_wire(self.offset),
            length: U32::new(self.length),
        };
        let mut out = [0u8; REQUEST_SIZE];
        out.copy_from_slice(raw.as_bytes());
        out
    }

    /// Decode from the first 28 bytes of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let (raw, _) = RawRequest::read_from_prefix(bytes)
            .map_err(|_| CodecError::incomplete(FrameKind::Request, bytes.len()))?;
        Ok(Self {
            magic: raw.magic,
            kind: RequestType::from_code(raw.kind.get())?,
            handle: Handle::new(raw.handle),
            offset: offset_from_wire(raw.offset),
            length: raw.length.get(),
        })
    }
}

/// Encode a request from loose parts.
///
/// `handle` must be exactly 8 bytes; `magic` is written as given so that
/// malformed requests can be produced on purpose.
pub fn encode_request(
    kind: RequestType,
    handle: &[u8],
    offset: i64,
    length: u32,
    magic: [u8; 4],
) -> Result<[u8; REQUEST_SIZE], CodecError> {
    let handle = Handle::try_from(handle)?;
    Ok(RequestFrame { magic, kind, handle, offset, length }.encode())
}

/// Decode a request from wire bytes.
pub fn decode_request(bytes: &[u8]) -> Result<RequestFrame, CodecError> {
    RequestFrame::decode(bytes)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn write_request_bytes() {
        let bytes = encode_request(RequestType::Write, b"myhandle", 1, 8, REQUEST_MAGIC).unwrap();
        insta::assert_snapshot!(hex::encode(bytes), @"25609513000000016d7968616e646c65010000000000000000000008");
    }

    #[test]
    fn entrust_code_on_wire() {
        let bytes = RequestFrame::new(RequestType::Entrust, Handle::default(), 0, 0).encode();
        assert_eq!(&bytes[4..8], &65536_u32.to_be_bytes());
    }

    #[test]
    fn encode_rejects_short_handle() {
        let result = encode_request(RequestType::Read, b"short", 0, 0, REQUEST_MAGIC);
        assert_eq!(result, Err(CodecError::InvalidHandle { len: 5 }));
    }

    #[test]
    fn decode_unknown_type() {
        let mut bytes = RequestFrame::new(RequestType::Read, Handle::default(), 0, 0).encode();
        bytes[4..8].copy_from_slice(&7_u32.to_be_bytes());
        assert_eq!(decode_request(&bytes), Err(CodecError::UnknownRequestType(7)));
    }

    #[test]
    fn decode_truncated() {
        let bytes = RequestFrame::new(RequestType::Read, Handle::default(), 0, 0).encode();
        assert!(matches!(
            decode_request(&bytes[..27]),
            Err(CodecError::FrameIncomplete { frame: FrameKind::Request, received: 27, .. })
        ));
    }

    #[test]
    fn malformed_magic_is_preserved() {
        let bytes = encode_request(RequestType::Write, b"myhandle", 0, 8, *b"XXXX").unwrap();
        let frame = decode_request(&bytes).unwrap();
        assert!(!frame.has_valid_magic());
    }

    fn request_type() -> impl Strategy<Value = RequestType> {
        prop_oneof![
            Just(RequestType::Read),
            Just(RequestType::Write),
            Just(RequestType::Disconnect),
            Just(RequestType::Entrust),
        ]
    }

    proptest! {
        #[test]
        fn request_round_trip(
            kind in request_type(),
            handle in any::<[u8; 8]>(),
            offset in any::<i64>(),
            length in any::<u32>(),
        ) {
            let bytes = encode_request(kind, &handle, offset, length, REQUEST_MAGIC).unwrap();
            let frame = decode_request(&bytes).unwrap();
            prop_assert_eq!(frame.kind, kind);
            prop_assert_eq!(frame.handle.to_bytes(), handle);
            prop_assert_eq!(frame.offset, offset);
            prop_assert_eq!(frame.length, length);
        }
    }
}
