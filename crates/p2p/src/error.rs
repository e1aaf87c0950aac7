//! Error taxonomy for the sync client and server.

use opsync_types::{Hash, PayloadError};
use thiserror::Error;

/// Why a single request exchange with a peer failed.
///
/// Nothing here is retried in place: the worker backs off, and the
/// coordinator re-schedules the block number on a later range request.
#[derive(Debug, Error)]
pub enum RequestError {
    /// Opening, reading, or writing the stream failed.
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),

    /// The response length prefix exceeded the configured maximum.
    #[error("response length {length} exceeds limit {limit}")]
    ResponseTooLarge { length: u32, limit: u32 },

    /// The response body did not decode as a payload.
    #[error(transparent)]
    Decode(#[from] PayloadError),

    /// The payload carried a different block number than requested.
    #[error("received payload for block {actual}, expected block {expected}")]
    WrongBlock { expected: u64, actual: u64 },

    /// The payload's declared hash does not match its contents.
    #[error("received payload for block {number} with bad block hash {hash}")]
    BadBlockHash { number: u64, hash: Hash },

    /// The results queue was saturated; the coordinator is too busy.
    #[error("sync client too busy to accept result")]
    Busy,

    /// A per-step deadline elapsed mid-exchange.
    #[error("timed out while {0}")]
    Timeout(&'static str),

    /// The worker was cancelled mid-exchange.
    #[error("sync worker cancelled")]
    Cancelled,
}

/// Why a range request was not accepted by the sync client.
#[derive(Debug, Error)]
pub enum RangeError {
    /// The main loop did not pick the request up within the send budget.
    #[error("too busy with sync results/requests")]
    Busy,

    /// The client has shut down.
    #[error("sync client is closed")]
    Closed,
}

/// Errors from the canonical block source behind the server.
#[derive(Debug, Error)]
pub enum ChainError {
    /// No block at the requested number.
    #[error("block not found")]
    NotFound,

    /// The source failed internally.
    #[error("chain source: {0}")]
    Internal(String),
}
