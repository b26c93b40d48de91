//! Two-node scenarios over the in-memory network.

use std::sync::Arc;
use std::time::Duration;

use chunkstream::core::{proximity, NodeId, Priority, Stream, MAX_PO};
use chunkstream::store::{MemoryChunkStore, SqliteStateStore};
use chunkstream::sync::{MemoryNetwork, MemoryOverlay};
use chunkstream::{Node, NodeConfig, NodeError, CHUNK_SIZE};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

struct Pair {
    a: Node,
    b: Node,
}

async fn connected_pair() -> Pair {
    let network = MemoryNetwork::new();
    let (id_a, id_b) = (NodeId::random(), NodeId::random());
    let a = Node::in_memory(
        id_a,
        Arc::new(MemoryOverlay::with_peers([id_b])),
        NodeConfig::default(),
    );
    let b = Node::in_memory(
        id_b,
        Arc::new(MemoryOverlay::with_peers([id_a])),
        NodeConfig::default(),
    );

    let (conn_a, conn_b) = network.connect(id_a, id_b);
    let (ra, rb) = tokio::join!(a.add_peer(conn_a), b.add_peer(conn_b));
    ra.unwrap();
    rb.unwrap();
    Pair { a, b }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

#[tokio::test]
async fn test_download_retrieves_from_peer() {
    init_tracing();
    let Pair { a, b } = connected_pair().await;

    let data = payload(CHUNK_SIZE * 3 + 100);
    let addresses = a.upload(&data).await.unwrap();

    let downloaded = b.download(&addresses).await.unwrap();
    assert_eq!(downloaded, data);
    assert_eq!(b.registry().requests_sent(), addresses.len() as u64);
    for address in &addresses {
        assert!(b.has(address).await.unwrap(), "retrieved chunk is cached");
    }

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_missing_everywhere_is_not_found() {
    init_tracing();
    let Pair { a, b } = connected_pair().await;

    let missing = chunkstream::Address::of(b"nobody uploaded this");
    let result = b.get(&missing).await;
    assert!(matches!(result, Err(NodeError::NotFound(address)) if address == missing));

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_sync_bins_replicates_upload() {
    init_tracing();
    let Pair { a, b } = connected_pair().await;

    for bin in 0..=MAX_PO {
        b.sync_bin(a.id(), bin, Priority::Mid).await.unwrap();
    }
    let addresses = a.upload(&payload(CHUNK_SIZE * 5)).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let mut missing = 0;
        for address in &addresses {
            if !b.has(address).await.unwrap() {
                missing += 1;
            }
        }
        if missing == 0 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "{} chunks never synced",
            missing
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(b.registry().requests_sent(), 0);
    assert!(b.stats().chunks_synced >= addresses.len() as u64);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_sqlite_state_records_cursors() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let network = MemoryNetwork::new();
    let (id_a, id_b) = (NodeId::random(), NodeId::random());

    let a = Node::in_memory(
        id_a,
        Arc::new(MemoryOverlay::with_peers([id_b])),
        NodeConfig::default(),
    );
    let b = Node::new(
        id_b,
        Arc::new(MemoryChunkStore::new(id_b.overlay())),
        Arc::new(SqliteStateStore::open(dir.path().join("state.db")).unwrap()),
        Arc::new(MemoryOverlay::with_peers([id_a])),
        NodeConfig::default(),
    );
    let (conn_a, conn_b) = network.connect(id_a, id_b);
    let (ra, rb) = tokio::join!(a.add_peer(conn_a), b.add_peer(conn_b));
    ra.unwrap();
    rb.unwrap();

    let addresses = a.upload(&payload(CHUNK_SIZE)).await.unwrap();
    let bin = proximity(id_a.as_bytes(), addresses[0].as_bytes());
    b.sync_bin(id_a, bin, Priority::Top).await.unwrap();

    let stream = Stream::sync(bin, true);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while b.registry().cursor(&id_a, &stream).await.unwrap() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "cursor never advanced");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(b.registry().cursor(&id_a, &stream).await.unwrap(), 2);
    assert!(b.has(&addresses[0]).await.unwrap());

    a.close().await;
    b.close().await;
}
