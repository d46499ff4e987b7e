//! Protocol constants.

/// Handshake token a destination sends when it accepts a mirror (ASCII
/// "NBDMAGIC").
pub const INIT_PASSWD: [u8; 8] = *b"NBDMAGIC";

/// Conventional contents of the handshake's reserved field.
pub const INIT_MAGIC: u64 = 0x0000_4202_8186_1253;

/// Marks the start of every request frame.
pub const REQUEST_MAGIC: [u8; 4] = 0x2560_9513_u32.to_be_bytes();

/// Marks the start of every response frame.
pub const REPLY_MAGIC: [u8; 4] = 0x6744_6698_u32.to_be_bytes();

/// Size of a handshake frame on the wire.
pub const HANDSHAKE_SIZE: usize = 152;

/// Zero padding after the export size in the handshake.
pub const HANDSHAKE_PADDING: usize = 128;

/// Size of a request frame on the wire.
pub const REQUEST_SIZE: usize = 28;

/// Size of a response frame on the wire.
pub const RESPONSE_SIZE: usize = 16;

/// Error code for a failed I/O operation.
pub const NBD_EIO: u32 = 5;

/// Error code for an invalid request.
pub const NBD_EINVAL: u32 = 22;
