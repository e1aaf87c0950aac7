//! Block references used to anchor sync ranges.

use crate::hash::Hash;
use std::fmt;

/// Reference to an L2 block: enough to anchor trust and walk parent links.
///
/// The default value is the zero reference, which carries no trust anchor
/// and is rejected by the sync client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct BlockRef {
    /// Hash of the referenced block.
    pub hash: Hash,
    /// Block number.
    pub number: u64,
    /// Hash of the parent block.
    pub parent_hash: Hash,
    /// Unix timestamp of the block.
    pub timestamp: u64,
}

impl BlockRef {
    /// Whether this is the zero reference (no trust anchor).
    pub fn is_zero(&self) -> bool {
        *self == BlockRef::default()
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.number, self.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_reference() {
        assert!(BlockRef::default().is_zero());

        let anchored = BlockRef {
            hash: Hash::from_bytes(b"head"),
            number: 7,
            parent_hash: Hash::from_bytes(b"parent"),
            timestamp: 1_700_000_000,
        };
        assert!(!anchored.is_zero());
    }
}
