//! Fuzz target for wire frame decoding
//!
//! Untrusted peers control every byte the endpoint reads, so decoding must
//! fail cleanly on anything.
//!
//! # Strategy
//!
//! - Raw bytes: arbitrary buffers fed to each frame decoder
//! - Loose parts: arbitrary handles, offsets and magics through
//!   `encode_request`
//!
//! # Invariants
//!
//! - NEVER panic on malformed input
//! - A buffer shorter than the frame MUST fail `FrameIncomplete` with the
//!   received length
//! - A decoded frame re-encodes to the bytes it was decoded from
//!   (handshake padding excepted, it is always zeroed)
//! - `encode_request` accepts a handle only if it is exactly 8 bytes
//! - The offset transform is its own inverse

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use mirrorfault_proto::{
    CodecError, FrameKind, HandshakeFrame, RequestFrame, RequestType, ResponseFrame,
    encode_request, offset_from_wire, offset_to_wire,
};

#[derive(Debug, Arbitrary)]
enum Input {
    Handshake(Vec<u8>),
    Request(Vec<u8>),
    Response(Vec<u8>),
    Parts { handle: Vec<u8>, offset: i64, length: u32, magic: [u8; 4], write: bool },
}

fn check_incomplete(err: &CodecError, frame: FrameKind, len: usize) {
    if len < frame.size() {
        assert_eq!(
            *err,
            CodecError::FrameIncomplete { frame, expected: frame.size(), received: len }
        );
    }
}

fuzz_target!(|input: Input| {
    match input {
        Input::Handshake(bytes) => match HandshakeFrame::decode(&bytes) {
            Ok(frame) => {
                let encoded = frame.encode();
                assert_eq!(encoded[..24], bytes[..24]);
                assert!(encoded[24..].iter().all(|&b| b == 0));
            },
            Err(err) => check_incomplete(&err, FrameKind::Handshake, bytes.len()),
        },
        Input::Request(bytes) => match RequestFrame::decode(&bytes) {
            Ok(frame) => assert_eq!(frame.encode()[..], bytes[..RequestFrame::SIZE]),
            Err(CodecError::UnknownRequestType(code)) => {
                assert!(RequestType::from_code(code).is_err());
            },
            Err(err) => check_incomplete(&err, FrameKind::Request, bytes.len()),
        },
        Input::Response(bytes) => match ResponseFrame::decode(&bytes) {
            Ok(frame) => assert_eq!(frame.encode()[..], bytes[..ResponseFrame::SIZE]),
            Err(err) => check_incomplete(&err, FrameKind::Response, bytes.len()),
        },
        Input::Parts { handle, offset, length, magic, write } => {
            assert_eq!(offset_from_wire(offset_to_wire(offset)), offset);

            let kind = if write { RequestType::Write } else { RequestType::Read };
            match encode_request(kind, &handle, offset, length, magic) {
                Ok(bytes) => {
                    assert_eq!(handle.len(), 8);
                    let frame = RequestFrame::decode(&bytes).unwrap();
                    assert_eq!(frame.handle.to_bytes()[..], handle[..]);
                    assert_eq!((frame.offset, frame.length, frame.magic), (offset, length, magic));
                },
                Err(err) => assert_eq!(err, CodecError::InvalidHandle { len: handle.len() }),
            }
        },
    }
});
