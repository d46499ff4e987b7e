//! Handshake frame.

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned, byteorder::big_endian::U64,
};

use crate::{
    CodecError, FrameKind,
    constants::{HANDSHAKE_PADDING, HANDSHAKE_SIZE, INIT_MAGIC, INIT_PASSWD},
};

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct RawHandshake {
    magic: [u8; 8],
    reserved: [u8; 8],
    export_size: U64,
    padding: [u8; HANDSHAKE_PADDING],
}

const _: () = assert!(size_of::<RawHandshake>() == HANDSHAKE_SIZE);

/// First frame a destination sends after accepting a connection.
///
/// Announces protocol acceptance through `magic` and the size of the
/// exported device. Immutable once received: the export size never changes
/// for the lifetime of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeFrame {
    /// Protocol acceptance token.
    pub magic: [u8; 8],
    /// Not examined by the decoder.
    pub reserved: [u8; 8],
    /// Size in bytes of the exported device.
    pub export_size: u64,
}

impl HandshakeFrame {
    /// Handshake size on the wire.
    pub const SIZE: usize = HANDSHAKE_SIZE;

    /// The handshake a correctly behaving destination sends.
    pub const fn accepting(export_size: u64) -> Self {
        Self { magic: INIT_PASSWD, reserved: INIT_MAGIC.to_be_bytes(), export_size }
    }

    /// Whether `magic` is the acceptance token.
    pub fn is_accepting(&self) -> bool {
        self.magic == INIT_PASSWD
    }

    /// Encode into 152 wire bytes; padding is zeroed.
    pub fn encode(&self) -> [u8; HANDSHAKE_SIZE] {
        let raw = RawHandshake {
            magic: self.magic,
            reserved: self.reserved,
            export_size: U64::new(self.export_size),
            padding: [0; HANDSHAKE_PADDING],
        };
        let mut out = [0u8; HANDSHAKE_SIZE];
        out.copy_from_slice(raw.as_bytes());
        out
    }

    /// Decode from the first 152 bytes of `bytes`.
    ///
    /// A shorter buffer is `FrameIncomplete`; no partially populated frame
    /// is ever returned.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let (raw, _) = RawHandshake::read_from_prefix(bytes)
            .map_err(|_| CodecError::incomplete(FrameKind::Handshake, bytes.len()))?;
        Ok(Self { magic: raw.magic, reserved: raw.reserved, export_size: raw.export_size.get() })
    }
}

/// Encode a handshake with the given magic and export size.
///
/// Both reserved regions are zero bytes.
pub fn encode_handshake(magic: [u8; 8], export_size: u64) -> [u8; HANDSHAKE_SIZE] {
    HandshakeFrame { magic, reserved: [0; 8], export_size }.encode()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_layout() {
        let bytes = encode_handshake(*b"NBDMAGIC", 4096);
        assert_eq!(bytes.len(), 152);
        assert_eq!(&bytes[..8], b"NBDMAGIC");
        assert_eq!(&bytes[8..16], &[0; 8]);
        assert_eq!(&bytes[16..24], &4096_u64.to_be_bytes());
        assert!(bytes[24..].iter().all(|b| *b == 0));
    }

    #[test]
    fn accepting_sets_init_magic() {
        let bytes = HandshakeFrame::accepting(1).encode();
        insta::assert_snapshot!(hex::encode(&bytes[..24]), @"4e42444d4147494300004202818612530000000000000001");
    }

    #[test]
    fn decode_reads_size_big_endian() {
        let export_size = 0x0000_0001_0000_0002;
        let frame = HandshakeFrame::decode(&encode_handshake(INIT_PASSWD, export_size)).unwrap();
        assert_eq!(frame.export_size, export_size);
        assert!(frame.is_accepting());
    }

    #[test]
    fn wrong_magic_still_decodes() {
        let frame = HandshakeFrame::decode(&encode_handshake(*b"NOTMAGIC", 4)).unwrap();
        assert!(!frame.is_accepting());
        assert_eq!(frame.export_size, 4);
    }

    #[test]
    fn decode_every_truncation_is_incomplete() {
        let bytes = HandshakeFrame::accepting(4096).encode();
        for k in 0..HANDSHAKE_SIZE {
            assert_eq!(
                HandshakeFrame::decode(&bytes[..k]),
                Err(CodecError::FrameIncomplete {
                    frame: FrameKind::Handshake,
                    expected: HANDSHAKE_SIZE,
                    received: k,
                }),
                "truncated at {k}"
            );
        }
    }
}
