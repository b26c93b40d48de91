//! # Chunkstream Core
//!
//! Pure primitives for chunkstream: content addresses, chunks, streams and
//! proximity arithmetic.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`Address`] - Content address of a chunk (Blake3 of its payload)
//! - [`NodeId`] - Identity and overlay address of a peer
//! - [`Chunk`] - Payload plus its address
//! - [`Descriptor`] - Entry of a store's per-bin pull index
//! - [`Stream`] - Name of a logical data feed between two peers
//! - [`Range`] - Half-open bounds over bin ids
//! - [`Priority`] - Outbound lane of a protocol message
//!
//! ## Proximity
//!
//! Addresses and node ids live in the same 256-bit space. The proximity order
//! of two addresses is the number of leading bits they share, capped at
//! [`MAX_PO`]. Sync streams are partitioned by proximity bin.

pub mod chunk;
pub mod error;
pub mod stream;
pub mod types;

pub use chunk::{split_into_chunks, Chunk, Descriptor, CHUNK_SIZE};
pub use error::{CoreError, Result};
pub use stream::{
    format_sync_bin_key, parse_sync_bin_key, Priority, Range, Stream, RETRIEVAL_STREAM,
    SYNC_STREAM,
};
pub use types::{proximity, Address, NodeId, MAX_PO};
