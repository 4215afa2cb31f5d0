//! # Peer Identity
//!
//! Opaque 32-byte peer identities. The transport layer never interprets the
//! bytes; identity derivation (key hashing, HELLO exchange) belongs to an
//! external collaborator. Everything here is plumbing: byte-wise comparison,
//! hashing for table keys, and a hex rendering for logs and URLs.

use std::fmt;

use thiserror::Error;

/// Length of a peer identity in bytes.
pub const PEER_ID_LEN: usize = 32;

/// Errors produced when constructing a [`PeerId`] from external input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    /// The input did not contain exactly [`PEER_ID_LEN`] bytes.
    #[error("peer identity must be {PEER_ID_LEN} bytes, got {0}")]
    BadLength(usize),

    /// The input was not valid lowercase/uppercase hex.
    #[error("peer identity is not valid hex: {0}")]
    BadHex(String),
}

/// An opaque peer identity.
///
/// Compared byte-wise; produced by an external collaborator. Used as the key
/// half of session-table lookups and stamped into every outer frame.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Wrap a raw 32-byte identity.
    pub const fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    /// Construct from a byte slice, validating the length.
    ///
    /// Used by the wire codecs, which hand over exactly-sized sub-slices of
    /// untrusted buffers.
    pub fn from_slice(slice: &[u8]) -> Result<Self, IdentityError> {
        let bytes: [u8; PEER_ID_LEN] = slice
            .try_into()
            .map_err(|_| IdentityError::BadLength(slice.len()))?;
        Ok(Self(bytes))
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(hex: &str) -> Result<Self, IdentityError> {
        if hex.len() != PEER_ID_LEN * 2 {
            return Err(IdentityError::BadLength(hex.len() / 2));
        }
        let mut bytes = [0u8; PEER_ID_LEN];
        for (i, chunk) in hex.as_bytes().chunks_exact(2).enumerate() {
            let pair = std::str::from_utf8(chunk)
                .map_err(|_| IdentityError::BadHex(hex.to_string()))?;
            bytes[i] = u8::from_str_radix(pair, 16)
                .map_err(|_| IdentityError::BadHex(hex.to_string()))?;
        }
        Ok(Self(bytes))
    }

    /// Full lowercase hex rendering (64 characters).
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(PEER_ID_LEN * 2);
        for byte in &self.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }

    /// Abbreviated rendering for log lines (first 8 hex characters).
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({}..)", self.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let id = PeerId::from_bytes([0xab; PEER_ID_LEN]);
        let hex = id.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(PeerId::from_hex(&hex).unwrap(), id);
    }

    #[test]
    fn from_slice_rejects_wrong_length() {
        assert_eq!(
            PeerId::from_slice(&[0u8; 31]),
            Err(IdentityError::BadLength(31))
        );
        assert!(PeerId::from_slice(&[0u8; 32]).is_ok());
    }

    #[test]
    fn from_hex_rejects_garbage() {
        let short = "abcd";
        assert!(matches!(
            PeerId::from_hex(short),
            Err(IdentityError::BadLength(_))
        ));
        let bad = "zz".repeat(32);
        assert!(matches!(PeerId::from_hex(&bad), Err(IdentityError::BadHex(_))));
    }

    #[test]
    fn comparison_is_bytewise() {
        let a = PeerId::from_bytes([1; PEER_ID_LEN]);
        let mut raw = [1u8; PEER_ID_LEN];
        raw[31] = 2;
        let b = PeerId::from_bytes(raw);
        assert_ne!(a, b);
        assert!(a < b);
    }
}
