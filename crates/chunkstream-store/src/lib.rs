//! # Chunkstream Store
//!
//! Storage abstractions consumed by the sync protocol, plus reference
//! implementations.
//!
//! ## Overview
//!
//! Two collaborators live here:
//!
//! - [`ChunkStore`] holds chunk payloads by address and keeps, per proximity
//!   bin, an ordered-by-arrival pull index that sync servers stream from.
//! - [`StateStore`] is a small key-value store used to persist interval
//!   cursors across restarts.
//!
//! ## Key Types
//!
//! - [`MemoryChunkStore`] - In-memory chunk store with live pull subscriptions
//! - [`MemoryStateStore`] - In-memory state store for tests
//! - [`SqliteStateStore`] - SQLite-backed durable state store
//! - [`PullSubscription`] - Lazy, cancellable cursor over one bin
//!
//! ## Usage
//!
//! ```rust,no_run
//! use chunkstream_core::{Address, Chunk};
//! use chunkstream_store::{ChunkStore, MemoryChunkStore, PutMode};
//!
//! async fn example() {
//!     let store = MemoryChunkStore::new(Address::ZERO);
//!     let chunk = Chunk::new(&b"hello"[..]).unwrap();
//!     store.put(PutMode::Upload, chunk.clone()).await.unwrap();
//!
//!     let bin = store.bin_of(chunk.address());
//!     let mut pull = store.subscribe_pull(bin, 0, None);
//!     let first = pull.next().await.unwrap();
//!     assert_eq!(&first.address, chunk.address());
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Idempotent puts**: putting a chunk that is already present returns
//!   `AlreadyExists` and leaves the pull index untouched
//! - **Monotonic bin ids**: ids are never reused, even after deletes
//! - **Cancellation by drop**: dropping a [`PullSubscription`] stops its feeder

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::{MemoryChunkStore, MemoryStateStore};
pub use sqlite::SqliteStateStore;
pub use traits::{ChunkStore, PullSubscription, PutMode, PutResult, StateStore};
