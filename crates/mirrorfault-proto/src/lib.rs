//! Wire frames for the block-device mirroring protocol.
//!
//! Three fixed-layout frames cross the wire between a mirroring source and
//! its destination:
//!
//! ```text
//! HandshakeFrame (152 bytes)
//!   magic[8] | reserved[8] | export_size u64 BE | padding[128]
//!
//! RequestFrame (28 bytes)
//!   magic[4] | type u32 BE | handle[8] | offset (reversed) | length u32 BE
//!
//! ResponseFrame (16 bytes)
//!   magic[4] | error u32 BE | handle[8]
//! ```
//!
//! Everything here is pure: encoding and decoding of byte buffers, no I/O.
//! Deadline-bounded reads live in `mirrorfault-core`.
//!
//! # Offset Field
//!
//! The request offset is not plain big-endian. Both peers reverse its byte
//! order around the big-endian encoding, see [`offset`]. Every producer and
//! consumer of the field goes through [`offset_to_wire`] and
//! [`offset_from_wire`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod constants;
mod error;
mod handle;
mod handshake;
pub mod offset;
mod request;
mod response;

pub use constants::{
    HANDSHAKE_SIZE, INIT_MAGIC, INIT_PASSWD, NBD_EINVAL, NBD_EIO, REPLY_MAGIC, REQUEST_MAGIC,
    REQUEST_SIZE, RESPONSE_SIZE,
};
pub use error::{CodecError, FrameKind};
pub use handle::Handle;
pub use handshake::{HandshakeFrame, encode_handshake};
pub use offset::{offset_from_wire, offset_to_wire};
pub use request::{RequestFrame, RequestType, decode_request, encode_request};
pub use response::{ResponseFrame, decode_response_bytes};
