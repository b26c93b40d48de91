//! Error types for the node.

use chunkstream_core::{Address, CoreError};
use chunkstream_store::StoreError;
use chunkstream_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Malformed chunk or identifier.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Neither the local store nor any peer has the chunk.
    #[error("chunk not found: {0}")]
    NotFound(Address),
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
