//! 32-byte block hash primitive.

use sha2::{Digest, Sha256};
use std::fmt;

/// A 32-byte hash identifying a block or linking to its parent.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, sbor::prelude::BasicSbor)]
pub struct Hash([u8; 32]);

impl Hash {
    /// The all-zero hash. Used as the "no parent" / unset sentinel.
    pub const ZERO: Hash = Hash([0u8; 32]);

    /// Hash arbitrary bytes into a `Hash` (SHA-256).
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Hash(hasher.finalize().into())
    }

    /// Wrap an existing 32-byte digest.
    pub fn from_raw(raw: [u8; 32]) -> Self {
        Hash(raw)
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether this is the zero sentinel.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl Default for Hash {
    fn default() -> Self {
        Hash::ZERO
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash(0x{})", hex::encode(self.0))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form for logs; Debug carries the full digest.
        write!(f, "0x{}", hex::encode(&self.0[..8]))
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_bytes_is_deterministic() {
        let a = Hash::from_bytes(b"block");
        let b = Hash::from_bytes(b"block");
        assert_eq!(a, b);
        assert_ne!(a, Hash::from_bytes(b"other"));
    }

    #[test]
    fn zero_sentinel() {
        assert!(Hash::ZERO.is_zero());
        assert!(Hash::default().is_zero());
        assert!(!Hash::from_bytes(b"x").is_zero());
    }

    #[test]
    fn display_is_short_hex() {
        let h = Hash::from_raw([0xab; 32]);
        assert_eq!(h.to_string(), "0xabababababababab");
    }
}
