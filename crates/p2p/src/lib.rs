//! Peer-to-peer reverse-range block sync for a rollup node.
//!
//! This crate implements both halves of the payload-by-number
//! request-response protocol:
//!
//! - [`SyncClient`]: given a range of block numbers anchored on a trusted
//!   future block reference, fetches each missing block from the registered
//!   peers and delivers verified blocks to a receiver in reverse chain
//!   order.
//! - [`ReqRespServer`]: answers inbound payload-by-number requests from the
//!   canonical chain, behind global and per-peer admission control.
//!
//! # Architecture
//!
//! The client uses the single-owner pattern: one coordinator task owns all
//! request bookkeeping (trust set, quarantine, in-flight table) and receives
//! range requests and fetch results over bounded channels. One worker task
//! per registered peer pulls block numbers from a shared fan-out queue,
//! rate-limited per peer, and runs the wire exchange. No bookkeeping state
//! is shared across tasks, so none of it is locked.
//!
//! ```text
//! request_range ──▶ coordinator ──▶ peer_requests ──▶ worker (per peer)
//!                       ▲                                  │ stream I/O
//!                       └────────────── results ◀──────────┘
//!                       │
//!                       ├─▶ quarantine (LRU + by-number index)
//!                       ├─▶ trust set
//!                       └─▶ receive_payload
//! ```
//!
//! The transport is injected: the client opens streams through an
//! [`OpenStream`] implementation, the server is handed accepted streams,
//! and both ends only require [`PayloadStream`] byte streams.

mod client;
mod config;
mod error;
mod limiter;
pub mod metrics;
mod quarantine;
mod server;
mod trust;
mod wire;

pub use client::{BoxError, OpenStream, ReceivePayload, SyncClient};
pub use config::{ConfigError, RollupConfig, ServerConfig, SyncConfig};
pub use error::{ChainError, RangeError, RequestError};
pub use server::{serve_stream, L2Chain, ReqRespServer, ServeError};
pub use wire::{payload_by_number_protocol, BoxStream, PayloadStream};
