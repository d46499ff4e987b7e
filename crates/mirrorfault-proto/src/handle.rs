//! Request/response correlation token.

use std::fmt;

use crate::CodecError;

/// Opaque 8-byte token pairing a request with its response.
///
/// The receiver echoes it verbatim; the bytes carry no meaning.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Handle([u8; 8]);

impl Handle {
    /// Wrap 8 raw bytes.
    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Raw bytes of the handle.
    pub const fn to_bytes(self) -> [u8; 8] {
        self.0
    }

    /// A handle differing from `self` in every byte.
    pub fn corrupted(self) -> Self {
        let mut bytes = self.0;
        for b in &mut bytes {
            *b = !*b;
        }
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for Handle {
    type Error = CodecError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        <[u8; 8]>::try_from(value)
            .map(Self)
            .map_err(|_| CodecError::InvalidHandle { len: value.len() })
    }
}

impl From<[u8; 8]> for Handle {
    fn from(value: [u8; 8]) -> Self {
        Self(value)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.iter().all(u8::is_ascii_graphic) {
            write!(f, "Handle({:?})", String::from_utf8_lossy(&self.0))
        } else {
            write!(f, "Handle({:02x?})", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_from_eight_bytes() {
        let handle = Handle::try_from(&b"myhandle"[..]).unwrap();
        assert_eq!(handle.to_bytes(), *b"myhandle");
    }

    #[test]
    fn handle_rejects_wrong_length() {
        assert_eq!(Handle::try_from(&b"short"[..]), Err(CodecError::InvalidHandle { len: 5 }));
        assert_eq!(
            Handle::try_from(&b"much too long"[..]),
            Err(CodecError::InvalidHandle { len: 13 })
        );
    }

    #[test]
    fn corrupted_handle_never_matches() {
        let handle = Handle::new(*b"myhandle");
        let bad = handle.corrupted();
        assert_ne!(handle, bad);
        assert!(handle.to_bytes().iter().zip(bad.to_bytes()).all(|(a, b)| *a != b));
    }

    #[test]
    fn debug_is_readable_for_ascii() {
        assert_eq!(format!("{:?}", Handle::new(*b"myhandle")), "Handle(\"myhandle\")");
    }
}
