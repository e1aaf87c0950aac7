//! Execution payloads and their wire codec.
//!
//! The sync core only ever reads the block hash, parent hash, and block
//! number; everything else rides along opaquely to the receiver.

use crate::block::BlockRef;
use crate::hash::Hash;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors from encoding or decoding a payload body.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("failed to encode payload: {0}")]
    Encode(String),

    #[error("failed to decode payload: {0}")]
    Decode(String),
}

/// An L2 block body exchanged over the sync protocol.
///
/// The declared `block_hash` is part of the encoded form; whether it matches
/// the body is checked with [`ExecutionPayload::check_block_hash`], never
/// assumed.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct ExecutionPayload {
    parent_hash: Hash,
    block_number: u64,
    timestamp: u64,
    state_root: Hash,
    transactions: Vec<Vec<u8>>,
    block_hash: Hash,
}

impl ExecutionPayload {
    /// Build a payload and seal its block hash from the body.
    pub fn new(
        parent_hash: Hash,
        block_number: u64,
        timestamp: u64,
        state_root: Hash,
        transactions: Vec<Vec<u8>>,
    ) -> Self {
        let mut payload = Self {
            parent_hash,
            block_number,
            timestamp,
            state_root,
            transactions,
            block_hash: Hash::ZERO,
        };
        payload.block_hash = payload.compute_block_hash();
        payload
    }

    /// Build a payload with an explicitly declared block hash.
    ///
    /// The declared hash is not checked here; this is the shape a decoded
    /// wire body has, where the hash is whatever the peer claimed.
    pub fn from_parts(
        parent_hash: Hash,
        block_number: u64,
        timestamp: u64,
        state_root: Hash,
        transactions: Vec<Vec<u8>>,
        block_hash: Hash,
    ) -> Self {
        Self {
            parent_hash,
            block_number,
            timestamp,
            state_root,
            transactions,
            block_hash,
        }
    }

    /// The declared block hash.
    pub fn block_hash(&self) -> Hash {
        self.block_hash
    }

    /// The parent block hash.
    pub fn parent_hash(&self) -> Hash {
        self.parent_hash
    }

    /// The block number.
    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    /// The block timestamp.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Recompute the hash from the body and compare with the declared hash.
    pub fn check_block_hash(&self) -> bool {
        self.compute_block_hash() == self.block_hash
    }

    /// A `BlockRef` pointing at this payload.
    pub fn block_ref(&self) -> BlockRef {
        BlockRef {
            hash: self.block_hash,
            number: self.block_number,
            parent_hash: self.parent_hash,
            timestamp: self.timestamp,
        }
    }

    /// Compact `number:hash` identifier for logs.
    pub fn id(&self) -> String {
        format!("{}:{}", self.block_number, self.block_hash)
    }

    fn compute_block_hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.parent_hash.as_bytes());
        hasher.update(self.block_number.to_le_bytes());
        hasher.update(self.timestamp.to_le_bytes());
        hasher.update(self.state_root.as_bytes());
        hasher.update((self.transactions.len() as u64).to_le_bytes());
        for tx in &self.transactions {
            hasher.update((tx.len() as u64).to_le_bytes());
            hasher.update(tx);
        }
        Hash::from_raw(hasher.finalize().into())
    }
}

/// Encode a payload for the wire.
pub fn encode_payload(payload: &ExecutionPayload) -> Result<Vec<u8>, PayloadError> {
    sbor::basic_encode(payload).map_err(|e| PayloadError::Encode(format!("{e:?}")))
}

/// Decode a payload from the wire.
pub fn decode_payload(bytes: &[u8]) -> Result<ExecutionPayload, PayloadError> {
    sbor::basic_decode(bytes).map_err(|e| PayloadError::Decode(format!("{e:?}")))
}
