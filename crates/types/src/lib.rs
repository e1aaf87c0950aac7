//! Foundation types for the opsync reverse-range block sync.
//!
//! This crate provides the small vocabulary the sync engine is built from:
//!
//! - **[`Hash`]**: 32-byte block hash primitive
//! - **[`BlockRef`]**: block reference used as a sync trust anchor
//! - **[`ExecutionPayload`]**: opaque block body with header-level accessors
//!   and its wire codec
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer.

mod block;
mod hash;
mod payload;

pub use block::BlockRef;
pub use hash::Hash;
pub use payload::{decode_payload, encode_payload, ExecutionPayload, PayloadError};
