//! Error types for the sync module.

use thiserror::Error;

use chunkstream_core::{Address, NodeId, Stream};

use crate::messages::SyncErrorCode;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Protocol version mismatch with peer.
    #[error("protocol version mismatch: local={local}, peer={peer}")]
    VersionMismatch { local: u32, peer: u32 },

    /// No active compatible session with the peer.
    #[error("peer not found: {0}")]
    PeerNotFound(NodeId),

    /// A session with the peer already exists.
    #[error("peer already connected: {0}")]
    AlreadyConnected(NodeId),

    /// A client subscription for (peer, stream) already exists.
    #[error("already subscribed to {stream} at {peer}")]
    AlreadySubscribed { peer: NodeId, stream: Stream },

    /// The remote does not serve this stream.
    #[error("unknown stream: {0}")]
    UnknownStream(Stream),

    /// Timeout waiting for peer.
    #[error("timeout: {0}")]
    Timeout(String),

    /// No candidate peer could be found for a retrieval.
    #[error("no peer found for chunk {0}")]
    NoPeerFound(Address),

    /// A peer delivered a payload that does not hash to its address.
    #[error("corrupt delivery of chunk {address} from {peer}")]
    CorruptDelivery { address: Address, peer: NodeId },

    /// Operation attempted after shutdown.
    #[error("closed")]
    Closed,

    /// Message validation failed.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// Peer sent an error message.
    #[error("peer error ({code:?}): {message}")]
    PeerError { code: SyncErrorCode, message: String },

    /// The local store failed while a shared retrieval flow was running.
    #[error("local store failure: {0}")]
    LocalStore(String),

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] chunkstream_store::StoreError),

    /// Primitive validation failed.
    #[error("core error: {0}")]
    Core(#[from] chunkstream_core::CoreError),
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
