//! Key material and payloads.
//!
//! Callers hand over either raw bytes or UTF-8 text. Both are resolved to
//! one canonical byte sequence before anything reaches the transport.

use bytes::Bytes;

/// Raw bytes or UTF-8 text, canonicalized to bytes at the transport boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Bytes(Bytes),
    Text(String),
}

impl Payload {
    /// Canonical byte form. Text is encoded as UTF-8.
    pub fn into_bytes(self) -> Bytes {
        match self {
            Payload::Bytes(bytes) => bytes,
            Payload::Text(text) => Bytes::from(text),
        }
    }

    /// Borrow the canonical bytes without consuming the payload.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Bytes(bytes) => bytes,
            Payload::Text(text) => text.as_bytes(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_owned())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(bytes))
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Bytes(Bytes::copy_from_slice(bytes))
    }
}

impl<const N: usize> From<[u8; N]> for Payload {
    fn from(bytes: [u8; N]) -> Self {
        Payload::Bytes(Bytes::copy_from_slice(&bytes))
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Bytes(bytes)
    }
}

/// Pre-shared key supplied at start/connect time.
///
/// Opaque to this crate: forwarded unchanged to the transport, never
/// derived or regenerated here.
#[derive(Clone, PartialEq, Eq)]
pub struct PresharedKey(Payload);

impl PresharedKey {
    pub fn new(material: impl Into<Payload>) -> Self {
        Self(material.into())
    }

    /// Decode a hex string (as accepted on the command line and in config).
    pub fn from_hex(encoded: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(encoded.trim()).map(Self::new)
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PresharedKey(<{} bytes redacted>)", self.0.len())
    }
}

macro_rules! key_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for PresharedKey {
            fn from(material: $ty) -> Self {
                Self::new(material)
            }
        })*
    };
}

key_from!(&str, String, Vec<u8>, &[u8], Bytes, Payload);

impl<const N: usize> From<[u8; N]> for PresharedKey {
    fn from(material: [u8; N]) -> Self {
        Self::new(material)
    }
}
