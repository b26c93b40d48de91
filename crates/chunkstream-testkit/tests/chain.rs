//! Full replication along a chain of nodes.

use chunkstream_testkit::simulation::{run_chain, ChainConfig, ChainOutcome};
use chunkstream_testkit::init_tracing;

async fn assert_chain_syncs(nodes: usize) {
    init_tracing();
    let report = run_chain(ChainConfig::with_nodes(nodes)).await.unwrap();

    if report.is_inconclusive() {
        eprintln!("chain of {} inconclusive: {:?}", nodes, report.outcome);
        return;
    }
    assert_eq!(report.outcome, ChainOutcome::Synced, "{:?}", report);
    assert!(report.total > 0);
    assert_eq!(report.found, report.total);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_chain_of_2() {
    assert_chain_syncs(2).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_chain_of_4() {
    assert_chain_syncs(4).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_chain_of_8() {
    assert_chain_syncs(8).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_chain_of_16() {
    assert_chain_syncs(16).await;
}

#[tokio::test]
async fn test_chain_report_counts_every_node() {
    init_tracing();
    let config = ChainConfig {
        chunks_per_node: 2,
        ..ChainConfig::with_nodes(3)
    };
    let report = run_chain(config).await.unwrap();
    // Three nodes, each expected to hold all six chunks.
    assert_eq!(report.total, 18);
}
