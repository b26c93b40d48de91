//! # Chunkstream Sync
//!
//! Streaming synchronization and on-demand retrieval of content-addressed
//! chunks between peers.
//!
//! ## Overview
//!
//! Each node runs one [`Registry`]. For every connected peer whose protocol
//! version matches, the registry starts a [`PeerSession`]. Over a session a
//! node can subscribe to the peer's per-bin sync streams, serve the peer's
//! subscriptions to its own streams, and answer or issue single-chunk
//! retrieve requests.
//!
//! ## Key Properties
//!
//! - **Version-gated**: peers with a different protocol version never get a
//!   session
//! - **Bandwidth-efficient**: servers offer addresses first and only deliver
//!   what the client says it lacks
//! - **Resumable**: per-(peer, stream) cursors are persisted and only advance
//!   over fully received windows
//! - **Prioritized**: control traffic and retrievals overtake bulk backfill
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chunkstream_core::{NodeId, Priority, Range, Stream};
//! use chunkstream_store::{MemoryChunkStore, MemoryStateStore};
//! use chunkstream_sync::{MemoryNetwork, MemoryOverlay, Registry, RegistryConfig};
//!
//! async fn example() -> chunkstream_sync::Result<()> {
//!     let network = MemoryNetwork::new();
//!     let (a, b) = (NodeId::random(), NodeId::random());
//!     let registry = |id: NodeId| {
//!         Registry::new(
//!             id,
//!             Arc::new(MemoryChunkStore::new(id.overlay())),
//!             Arc::new(MemoryStateStore::new()),
//!             Arc::new(MemoryOverlay::new()),
//!             RegistryConfig::default(),
//!         )
//!     };
//!     let (reg_a, reg_b) = (registry(a), registry(b));
//!
//!     let (conn_a, conn_b) = network.connect(a, b);
//!     let (ra, rb) = tokio::join!(reg_a.add_peer(conn_a), reg_b.add_peer(conn_b));
//!     ra?;
//!     rb?;
//!
//!     reg_a
//!         .subscribe(b, Stream::sync(0, true), Range::default(), Priority::Mid)
//!         .await?;
//!     reg_a.close().await;
//!     reg_b.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! Client                              Server
//!   |-------- Handshake -------------->|
//!   |<------- Handshake ---------------|
//!   |-------- SubscribeRequest ------->|
//!   |<------- SubscribeResult ---------|
//!   |<------- OfferedBatch ------------|
//!   |-------- WantedBitmask ---------->|
//!   |<------- ChunkDelivery (wanted) --|
//!   |<------- OfferedBatch ------------|
//!   |               ...                |
//!   |<------- SubscriptionEnded -------|   (history streams only)
//! ```

pub mod delivery;
pub mod error;
pub mod intervals;
pub mod messages;
pub mod peer;
pub mod registry;
pub mod routing;
pub mod scheduler;
pub mod shutdown;
pub mod stats;
mod subscription;
pub mod transport;
pub mod window;

pub use delivery::Delivery;
pub use error::{Result, SyncError};
pub use intervals::{cursor_key, IntervalStore};
pub use messages::{
    limits, DeliveryOrigin, Rejection, StreamMessage, SyncErrorCode, PROTOCOL_VERSION,
};
pub use peer::{PeerSession, SessionState};
pub use registry::{auto_subscribe_bins, Registry, RegistryConfig, Syncing};
pub use routing::{MemoryOverlay, Overlay};
pub use stats::SyncStats;
pub use transport::memory::{LinkEvent, MemoryNetwork};
pub use transport::{Connection, MessageSink, MessageSource};
