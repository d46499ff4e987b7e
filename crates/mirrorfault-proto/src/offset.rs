//! Byte-reversed 64-bit offset field.
//!
//! The request offset goes through a fixed transform: swap byte `i` with
//! byte `7 - i`, then write the result big-endian. The wire bytes therefore
//! do not read as an ordinary big-endian integer. The real migration client
//! applies the same transform, so it must never be normalized here.
//!
//! The transform is its own inverse.

/// Encode a request offset into its 8 wire bytes.
pub const fn offset_to_wire(offset: i64) -> [u8; 8] {
    offset.swap_bytes().to_be_bytes()
}

/// Decode 8 wire bytes back into a request offset.
pub const fn offset_from_wire(bytes: [u8; 8]) -> i64 {
    i64::from_be_bytes(bytes).swap_bytes()
}
