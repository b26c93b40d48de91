//! Version gating and peer bookkeeping.

use std::time::Duration;

use chunkstream::NodeError;
use chunkstream_core::NodeId;
use chunkstream_sync::{
    MemoryNetwork, MessageSink, MessageSource, RegistryConfig, StreamMessage, SyncError,
    PROTOCOL_VERSION,
};
use chunkstream_testkit::{connect, fast_config, init_tracing, wait_until, ScriptedPeer, TestNode};

#[tokio::test]
async fn test_same_version_peers_see_each_other() {
    init_tracing();
    let network = MemoryNetwork::new();
    let (a, b) = (TestNode::new(), TestNode::new());
    connect(&network, &a, &b).await.unwrap();

    assert_eq!(a.registry().peers_count(), 1);
    assert_eq!(b.registry().peers_count(), 1);
    let session = a.registry().get_peer(&b.id()).expect("session with b");
    assert!(session.is_active());
    assert_eq!(session.version(), PROTOCOL_VERSION);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_different_version_peers_stay_at_transport_level() {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = TestNode::new();
    let b = TestNode::with_config(RegistryConfig {
        version: PROTOCOL_VERSION + 1,
        ..fast_config()
    });

    let (conn_a, conn_b) = network.connect(a.id(), b.id());
    let (ra, rb) = tokio::join!(a.add_peer(conn_a), b.add_peer(conn_b));

    assert!(matches!(
        ra,
        Err(NodeError::Sync(SyncError::VersionMismatch { local, peer }))
            if local == PROTOCOL_VERSION && peer == PROTOCOL_VERSION + 1
    ));
    assert!(matches!(
        rb,
        Err(NodeError::Sync(SyncError::VersionMismatch { .. }))
    ));

    // Connected, but no protocol session on either side.
    assert_eq!(network.link_count(), 1);
    assert_eq!(a.registry().transport_peers_count(), 1);
    assert_eq!(a.registry().peers_count(), 0);
    assert!(a.registry().get_peer(&b.id()).is_none());
    assert!(b.registry().get_peer(&a.id()).is_none());

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_version_gated_peer_cannot_be_subscribed() {
    init_tracing();
    let network = MemoryNetwork::new();
    let node = TestNode::new();
    let (peer, added) = ScriptedPeer::connect(&network, &node, PROTOCOL_VERSION + 7)
        .await
        .unwrap();
    assert!(added.is_err());

    let result = node.sync_bin(peer.id, 0, chunkstream::Priority::Mid).await;
    assert!(matches!(
        result,
        Err(NodeError::Sync(SyncError::PeerNotFound(id))) if id == peer.id
    ));

    node.close().await;
}

#[tokio::test]
async fn test_duplicate_connection_is_refused() {
    init_tracing();
    let network = MemoryNetwork::new();
    let node = TestNode::new();
    let peer = ScriptedPeer::attach(&network, &node).await.unwrap();

    // A second network, so the live link is left alone.
    let (conn, _other_end) = MemoryNetwork::new().connect(node.id(), peer.id);
    let result = node.add_peer(conn).await;
    assert!(matches!(
        result,
        Err(NodeError::Sync(SyncError::AlreadyConnected(id))) if id == peer.id
    ));

    node.close().await;
}

#[tokio::test]
async fn test_disconnect_removes_session() {
    init_tracing();
    let network = MemoryNetwork::new();
    let (a, b) = (TestNode::new(), TestNode::new());
    connect(&network, &a, &b).await.unwrap();

    assert!(network.disconnect(a.id(), b.id()));
    wait_until(Duration::from_secs(2), || async {
        Ok(a.registry().peers_count() == 0 && b.registry().peers_count() == 0)
    })
    .await
    .unwrap();

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_close_during_handshake_leaves_no_session() {
    init_tracing();
    let network = MemoryNetwork::new();
    let node = TestNode::new();
    let remote = NodeId::random();
    let (conn_node, mut conn_remote) = network.connect(node.id(), remote);

    let adding = tokio::spawn({
        let registry = node.registry().clone();
        async move { registry.add_peer(conn_node).await }
    });

    // Our hello is out; the registry closes before the answer arrives.
    let hello = conn_remote.source.recv().await.unwrap();
    assert!(matches!(hello, Some(StreamMessage::Handshake { .. })));
    node.close().await;
    conn_remote
        .sink
        .send(StreamMessage::Handshake {
            node_id: remote,
            version: PROTOCOL_VERSION,
        })
        .await
        .unwrap();

    assert!(matches!(adding.await.unwrap(), Err(SyncError::Closed)));
    assert_eq!(node.registry().peers_count(), 0);
    assert_eq!(node.registry().transport_peers_count(), 0);
}
