//! Store traits: the abstract interfaces the sync protocol consumes.
//!
//! The protocol never touches chunk bytes or cursor state except through
//! these traits, so any storage engine can sit underneath.

use async_trait::async_trait;
use tokio::sync::mpsc;

use chunkstream_core::{proximity, Address, Chunk, Descriptor};

use crate::error::Result;

/// Why a chunk is being written. Backends may index modes differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PutMode {
    /// Created locally.
    Upload,
    /// Received through a sync subscription.
    Sync,
    /// Received as the answer to an on-demand retrieval.
    Request,
}

/// Result of putting a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutResult {
    /// Chunk was new and is now stored.
    Stored,
    /// Chunk was already present (idempotent - not an error).
    AlreadyExists,
}

/// Lazy ordered cursor over one bin of a store's pull index.
///
/// Yields descriptors in ascending `bin_id` order. For a bounded subscription
/// `next` returns `None` once the bound is reached; a live subscription waits
/// for new arrivals. Dropping the subscription stops the feeder.
#[derive(Debug)]
pub struct PullSubscription {
    rx: mpsc::Receiver<Descriptor>,
}

impl PullSubscription {
    /// Wrap the receiving end of a feeder channel.
    pub fn new(rx: mpsc::Receiver<Descriptor>) -> Self {
        Self { rx }
    }

    /// Next descriptor, or `None` when the subscription is exhausted.
    pub async fn next(&mut self) -> Option<Descriptor> {
        self.rx.recv().await
    }
}

/// The chunk store consumed by the sync protocol.
///
/// Implementations must tolerate concurrent readers and concurrent writers of
/// distinct addresses. Concurrent puts of one address are idempotent.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// The overlay address this store measures proximity from.
    fn base_address(&self) -> Address;

    /// Proximity bin an address falls into for this store.
    fn bin_of(&self, address: &Address) -> u8 {
        proximity(self.base_address().as_bytes(), address.as_bytes())
    }

    /// Check whether a chunk is present.
    async fn has(&self, address: &Address) -> Result<bool>;

    /// Get a chunk by address.
    async fn get(&self, address: &Address) -> Result<Option<Chunk>>;

    /// Store a chunk. New chunks are appended to the pull index of their bin.
    async fn put(&self, mode: PutMode, chunk: Chunk) -> Result<PutResult>;

    /// Remove a chunk. Returns whether it was present.
    async fn delete(&self, address: &Address) -> Result<bool>;

    /// Highest bin id assigned so far in a bin (0 when empty).
    async fn last_bin_id(&self, bin: u8) -> Result<u64>;

    /// Stream descriptors of `bin` with `since < bin_id <= until`.
    ///
    /// `until = None` keeps the subscription live.
    fn subscribe_pull(&self, bin: u8, since: u64, until: Option<u64>) -> PullSubscription;
}

/// Small durable key-value store, used for interval cursors.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;
}
