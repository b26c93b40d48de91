//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};

use chunkstream::{Node, NodeConfig};
use chunkstream_core::{Address, NodeId};
use chunkstream_store::{MemoryChunkStore, MemoryStateStore, StateStore};
use chunkstream_sync::{
    MemoryNetwork, MemoryOverlay, MessageSink, MessageSource, RegistryConfig, StreamMessage,
    PROTOCOL_VERSION,
};

/// Install a fmt subscriber that writes through the test harness.
///
/// Safe to call from every test; only the first call installs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Registry settings tuned for fast tests.
pub fn fast_config() -> RegistryConfig {
    RegistryConfig {
        batch_timeout: Duration::from_millis(5),
        handshake_timeout: Duration::from_secs(2),
        subscribe_timeout: Duration::from_secs(2),
        search_timeout: Duration::from_millis(300),
        close_timeout: Duration::from_millis(500),
        ..RegistryConfig::default()
    }
}

/// A node with in-memory chunk storage and a hand-managed overlay.
pub struct TestNode {
    pub node: Node,
    pub overlay: Arc<MemoryOverlay>,
}

impl TestNode {
    /// A node with a random id and in-memory state.
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        Self::with_state(
            NodeId::random(),
            Arc::new(MemoryStateStore::new()),
            config,
        )
    }

    /// A node whose cursors live in `state`, e.g. a SQLite store that
    /// outlives the node.
    pub fn with_state(id: NodeId, state: Arc<dyn StateStore>, config: RegistryConfig) -> Self {
        let overlay = Arc::new(MemoryOverlay::new());
        let node = Node::new(
            id,
            Arc::new(MemoryChunkStore::new(id.overlay())),
            state,
            overlay.clone(),
            NodeConfig { registry: config },
        );
        Self { node, overlay }
    }

    /// Count how many of `addresses` are stored locally.
    pub async fn count_present(&self, addresses: &[Address]) -> anyhow::Result<usize> {
        let mut found = 0;
        for address in addresses {
            if self.node.has(address).await? {
                found += 1;
            }
        }
        Ok(found)
    }
}

impl Default for TestNode {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for TestNode {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.node
    }
}

/// Link two nodes, handshake both sides and make each a retrieval
/// candidate of the other.
pub async fn connect(network: &MemoryNetwork, a: &TestNode, b: &TestNode) -> anyhow::Result<()> {
    let (conn_a, conn_b) = network.connect(a.id(), b.id());
    let (ra, rb) = tokio::join!(a.add_peer(conn_a), b.add_peer(conn_b));
    ra.with_context(|| format!("{} adding {}", a.id(), b.id()))?;
    rb.with_context(|| format!("{} adding {}", b.id(), a.id()))?;
    a.overlay.add_peer(b.id());
    b.overlay.add_peer(a.id());
    Ok(())
}

/// Poll `check` until it returns true or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<bool>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await? {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scripted peer
// ─────────────────────────────────────────────────────────────────────────────

/// A raw protocol endpoint driven message by message from a test.
///
/// Useful for peers that misbehave: stay silent, return corrupt payloads,
/// announce another protocol version.
pub struct ScriptedPeer {
    pub id: NodeId,
    sink: Box<dyn MessageSink>,
    source: Box<dyn MessageSource>,
}

impl ScriptedPeer {
    /// Connect to `node` and run the handshake with `version`.
    ///
    /// Returns the peer together with the node's `add_peer` result.
    pub async fn connect(
        network: &MemoryNetwork,
        node: &TestNode,
        version: u32,
    ) -> anyhow::Result<(Self, chunkstream::Result<()>)> {
        let id = NodeId::random();
        let (conn_node, conn_peer) = network.connect(node.id(), id);
        let mut peer = Self {
            id,
            sink: conn_peer.sink,
            source: conn_peer.source,
        };

        let (added, handshake) = tokio::join!(
            node.add_peer(conn_node),
            peer.handshake(version, node.id())
        );
        handshake?;
        node.overlay.add_peer(id);
        Ok((peer, added))
    }

    /// Connect with the current protocol version and expect success.
    pub async fn attach(network: &MemoryNetwork, node: &TestNode) -> anyhow::Result<Self> {
        let (peer, added) = Self::connect(network, node, PROTOCOL_VERSION).await?;
        added?;
        Ok(peer)
    }

    async fn handshake(&mut self, version: u32, expected: NodeId) -> anyhow::Result<()> {
        self.send(StreamMessage::Handshake {
            node_id: self.id,
            version,
        })
        .await?;
        match self.recv().await? {
            StreamMessage::Handshake { node_id, .. } if node_id == expected => Ok(()),
            other => bail!("expected handshake, got {}", other.kind()),
        }
    }

    pub async fn send(&mut self, message: StreamMessage) -> anyhow::Result<()> {
        self.sink.send(message).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> anyhow::Result<StreamMessage> {
        self.source
            .recv()
            .await?
            .ok_or_else(|| anyhow!("connection to scripted peer closed"))
    }

    /// Receive until a message matches `select`, dropping the others.
    pub async fn recv_matching<T>(
        &mut self,
        timeout: Duration,
        mut select: impl FnMut(StreamMessage) -> Option<T>,
    ) -> anyhow::Result<T> {
        tokio::time::timeout(timeout, async {
            loop {
                if let Some(found) = select(self.recv().await?) {
                    return Ok::<T, anyhow::Error>(found);
                }
            }
        })
        .await
        .map_err(|_| anyhow!("no matching message within {:?}", timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_registers_both_sides() {
        let network = MemoryNetwork::new();
        let (a, b) = (TestNode::new(), TestNode::new());
        connect(&network, &a, &b).await.unwrap();

        assert_eq!(a.registry().peers(), vec![b.id()]);
        assert_eq!(b.registry().peers(), vec![a.id()]);
        assert_eq!(a.overlay.peers(), vec![b.id()]);

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_scripted_peer_handshake() {
        let network = MemoryNetwork::new();
        let node = TestNode::new();
        let peer = ScriptedPeer::attach(&network, &node).await.unwrap();

        assert!(node.registry().get_peer(&peer.id).is_some());
        node.close().await;
    }

    #[tokio::test]
    async fn test_wait_until_times_out() {
        let result = wait_until(Duration::from_millis(30), || async { Ok(false) }).await;
        assert!(result.is_err());
    }
}
