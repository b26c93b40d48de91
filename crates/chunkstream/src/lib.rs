//! # Chunkstream
//!
//! A node of a content-addressed chunk network: local storage, streaming
//! sync with peers, and on-demand retrieval.
//!
//! ## Overview
//!
//! Data is split into chunks of at most [`CHUNK_SIZE`] bytes, each addressed
//! by the BLAKE3 hash of its payload. Chunks are indexed by proximity bin
//! relative to the node's own address. Peers subscribe to each other's bins
//! and receive every chunk they lack; a read that misses locally asks the
//! closest peers instead.
//!
//! - **Chunks**: immutable, self-verifying payloads
//! - **Bins**: per-proximity arrival logs that sync streams are read from
//! - **Sync**: offer / want / deliver batches over prioritized lanes
//! - **Retrieval**: closest-peer requests with fallback and deduplication
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chunkstream::{Node, NodeConfig};
//! use chunkstream::core::NodeId;
//! use chunkstream::sync::MemoryOverlay;
//!
//! async fn example() {
//!     let node = Node::in_memory(
//!         NodeId::random(),
//!         Arc::new(MemoryOverlay::new()),
//!         NodeConfig::default(),
//!     );
//!
//!     let addresses = node.upload(b"hello world").await.unwrap();
//!     let data = node.download(&addresses).await.unwrap();
//!     assert_eq!(data, b"hello world");
//!
//!     node.close().await;
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `chunkstream::core` - Core primitives (Chunk, Address, Stream, etc.)
//! - `chunkstream::store` - Chunk and state storage
//! - `chunkstream::sync` - Sync and retrieval protocol

pub mod error;
pub mod node;

// Re-export component crates
pub use chunkstream_core as core;
pub use chunkstream_store as store;
pub use chunkstream_sync as sync;

// Re-export main types for convenience
pub use error::{NodeError, Result};
pub use node::{Node, NodeConfig};

// Re-export commonly used types
pub use chunkstream_core::{Address, Chunk, NodeId, Priority, Range, Stream, CHUNK_SIZE};
pub use chunkstream_sync::{Registry, RegistryConfig, Syncing};
