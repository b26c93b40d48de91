//! The Node: one participant of the chunk network.
//!
//! A node owns a chunk store, a state store for sync cursors and a protocol
//! registry. Reads fall back to the network on a local miss.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use chunkstream_core::{split_into_chunks, Address, Chunk, NodeId, Priority, Range, Stream};
use chunkstream_store::{ChunkStore, MemoryChunkStore, MemoryStateStore, PutMode, StateStore};
use chunkstream_sync::{Connection, Overlay, Registry, RegistryConfig, SyncError, SyncStats};

use crate::error::{NodeError, Result};

/// Configuration for a node.
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    /// Protocol configuration.
    pub registry: RegistryConfig,
}

/// A chunk network node.
pub struct Node {
    id: NodeId,
    store: Arc<dyn ChunkStore>,
    registry: Registry,
}

impl Node {
    /// Create a node over the given stores.
    pub fn new(
        id: NodeId,
        store: Arc<dyn ChunkStore>,
        state: Arc<dyn StateStore>,
        overlay: Arc<dyn Overlay>,
        config: NodeConfig,
    ) -> Self {
        let registry = Registry::new(id, store.clone(), state, overlay, config.registry);
        Self {
            id,
            store,
            registry,
        }
    }

    /// Create a node whose chunks and cursors live in memory.
    pub fn in_memory(id: NodeId, overlay: Arc<dyn Overlay>, config: NodeConfig) -> Self {
        Self::new(
            id,
            Arc::new(MemoryChunkStore::new(id.overlay())),
            Arc::new(MemoryStateStore::new()),
            overlay,
            config,
        )
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Content
    // ─────────────────────────────────────────────────────────────────────────

    /// Split `data` into chunks and store them locally.
    ///
    /// Returns the chunk addresses in order. Peers pick the chunks up through
    /// their sync subscriptions.
    pub async fn upload(&self, data: &[u8]) -> Result<Vec<Address>> {
        let chunks = split_into_chunks(data);
        let mut addresses = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            addresses.push(*chunk.address());
            self.store.put(PutMode::Upload, chunk).await?;
        }
        debug!(node = %self.id, chunks = addresses.len(), bytes = data.len(), "uploaded");
        Ok(addresses)
    }

    /// Whether the chunk is stored locally.
    pub async fn has(&self, address: &Address) -> Result<bool> {
        Ok(self.store.has(address).await?)
    }

    /// Read a chunk, retrieving it from peers on a local miss.
    pub async fn get(&self, address: &Address) -> Result<Chunk> {
        if let Some(chunk) = self.store.get(address).await? {
            return Ok(chunk);
        }
        match self
            .registry
            .request_from_peers(*address, HashSet::new())
            .await
        {
            Ok(chunk) => Ok(chunk),
            Err(SyncError::NoPeerFound(_)) => Err(NodeError::NotFound(*address)),
            Err(e) => Err(e.into()),
        }
    }

    /// Read every chunk of an upload and join the payloads.
    pub async fn download(&self, addresses: &[Address]) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        for address in addresses {
            let chunk = self.get(address).await?;
            data.extend_from_slice(chunk.data());
        }
        Ok(data)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Peers
    // ─────────────────────────────────────────────────────────────────────────

    /// Handshake a connection and start syncing with the peer.
    pub async fn add_peer(&self, connection: Connection) -> Result<()> {
        Ok(self.registry.add_peer(connection).await?)
    }

    /// Subscribe to the live sync stream of one bin at `peer`.
    pub async fn sync_bin(&self, peer: NodeId, bin: u8, priority: Priority) -> Result<()> {
        Ok(self
            .registry
            .subscribe(peer, Stream::sync(bin, true), Range::default(), priority)
            .await?)
    }

    pub fn stats(&self) -> SyncStats {
        self.registry.stats()
    }

    /// Shut the node's protocol side down.
    pub async fn close(&self) {
        self.registry.close().await;
        info!(node = %self.id, "node closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkstream_core::CHUNK_SIZE;
    use chunkstream_sync::MemoryOverlay;
    use proptest::prelude::*;

    fn node() -> Node {
        Node::in_memory(
            NodeId::random(),
            Arc::new(MemoryOverlay::new()),
            NodeConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_upload_and_local_download() {
        let node = node();
        let data: Vec<u8> = (0..CHUNK_SIZE * 2 + 17).map(|i| (i % 251) as u8).collect();

        let addresses = node.upload(&data).await.unwrap();
        assert_eq!(addresses.len(), 3);
        for address in &addresses {
            assert!(node.has(address).await.unwrap());
        }
        assert_eq!(node.download(&addresses).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_get_without_peers_is_not_found() {
        let node = node();
        let address = Address::of(b"nobody has this");
        assert!(matches!(
            node.get(&address).await,
            Err(NodeError::NotFound(a)) if a == address
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn upload_then_download_round_trips(data in prop::collection::vec(any::<u8>(), 0..CHUNK_SIZE * 3)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let restored = rt.block_on(async {
                let node = node();
                let addresses = node.upload(&data).await.unwrap();
                assert_eq!(addresses.len(), data.len().div_ceil(CHUNK_SIZE));
                node.download(&addresses).await.unwrap()
            });
            prop_assert_eq!(restored, data);
        }
    }

    #[tokio::test]
    async fn test_closed_node_refuses_retrieval() {
        let node = node();
        node.close().await;
        assert!(matches!(
            node.get(&Address::of(b"x")).await,
            Err(NodeError::Sync(SyncError::Closed))
        ));
    }
}
