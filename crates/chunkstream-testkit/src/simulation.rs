//! Chain-topology sync simulation.
//!
//! `N` nodes are linked in a line, `0 - 1 - ... - N-1`. Each node uploads
//! its own content, then every node subscribes to every bin of each chain
//! neighbour. Chunks hop node by node until everyone holds everything.
//!
//! A link that drops during the run makes the result inconclusive rather
//! than failed: the protocol is best-effort under disconnects.

use std::time::Duration;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use chunkstream_core::{Address, NodeId, Priority, Range, Stream, CHUNK_SIZE, MAX_PO};
use chunkstream_sync::{LinkEvent, MemoryNetwork, RegistryConfig};

use crate::fixtures::{connect, fast_config, TestNode};
use crate::generators::seeded_blob;

/// Parameters of a chain run.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub nodes: usize,
    /// Chunks each node uploads.
    pub chunks_per_node: usize,
    /// Give up waiting for full replication after this long.
    pub deadline: Duration,
    pub seed: u64,
    pub registry: RegistryConfig,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            nodes: 4,
            chunks_per_node: 4,
            deadline: Duration::from_secs(30),
            seed: 1,
            registry: fast_config(),
        }
    }
}

impl ChainConfig {
    pub fn with_nodes(nodes: usize) -> Self {
        Self {
            nodes,
            ..Self::default()
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainOutcome {
    /// Every node holds every chunk.
    Synced,
    /// The deadline passed with chunks still missing.
    TimedOut,
    /// A link dropped mid-run.
    Inconclusive { node: NodeId, peer: NodeId },
}

#[derive(Debug, Clone)]
pub struct ChainReport {
    pub outcome: ChainOutcome,
    /// (node, chunk) pairs present at the end.
    pub found: usize,
    /// Expected pairs: nodes times uploaded chunks.
    pub total: usize,
    pub elapsed: Duration,
}

impl ChainReport {
    pub fn is_synced(&self) -> bool {
        self.outcome == ChainOutcome::Synced && self.found == self.total && self.total > 0
    }

    pub fn is_inconclusive(&self) -> bool {
        matches!(self.outcome, ChainOutcome::Inconclusive { .. })
    }
}

/// Build the chain, upload, subscribe and wait for full replication.
///
/// All nodes are closed before returning.
pub async fn run_chain(config: ChainConfig) -> anyhow::Result<ChainReport> {
    anyhow::ensure!(config.nodes >= 2, "a chain needs at least two nodes");

    let network = MemoryNetwork::new();
    let mut events = network.events();
    let nodes: Vec<TestNode> = (0..config.nodes)
        .map(|_| TestNode::with_config(config.registry.clone()))
        .collect();

    let result = drive(&config, &network, &nodes, &mut events).await;

    for node in &nodes {
        node.close().await;
    }
    result
}

async fn drive(
    config: &ChainConfig,
    network: &MemoryNetwork,
    nodes: &[TestNode],
    events: &mut tokio::sync::broadcast::Receiver<LinkEvent>,
) -> anyhow::Result<ChainReport> {
    let started = Instant::now();

    let mut addresses: Vec<Address> = Vec::new();
    for (i, node) in nodes.iter().enumerate() {
        let blob = seeded_blob(config.seed, i, CHUNK_SIZE * config.chunks_per_node);
        addresses.extend(node.upload(&blob).await?);
    }
    let total = addresses.len() * nodes.len();

    for pair in nodes.windows(2) {
        connect(network, &pair[0], &pair[1]).await?;
    }
    for pair in nodes.windows(2) {
        subscribe_all_bins(&pair[0], &pair[1]).await?;
        subscribe_all_bins(&pair[1], &pair[0]).await?;
    }
    info!(nodes = nodes.len(), chunks = addresses.len(), "chain wired");

    let deadline = started + config.deadline;
    let mut poll = tokio::time::interval(Duration::from_millis(25));
    let outcome = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(LinkEvent::Disconnected { node, peer }) => {
                    warn!(%node, %peer, "link dropped, run is inconclusive");
                    break ChainOutcome::Inconclusive { node, peer };
                }
                Ok(LinkEvent::Connected { .. }) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => {}
            },
            _ = poll.tick() => {
                let found = count_found(nodes, &addresses).await?;
                debug!(found, total, "polling replication");
                if found == total {
                    break ChainOutcome::Synced;
                }
                if Instant::now() >= deadline {
                    break ChainOutcome::TimedOut;
                }
            }
        }
    };

    let found = count_found(nodes, &addresses).await?;
    let report = ChainReport {
        outcome,
        found,
        total,
        elapsed: started.elapsed(),
    };
    info!(outcome = ?report.outcome, found, total, elapsed = ?report.elapsed, "chain run finished");
    Ok(report)
}

/// `client` subscribes to the live stream of every bin at `server`.
async fn subscribe_all_bins(client: &TestNode, server: &TestNode) -> anyhow::Result<()> {
    for bin in 0..=MAX_PO {
        client
            .registry()
            .subscribe(
                server.id(),
                Stream::sync(bin, true),
                Range::default(),
                Priority::Mid,
            )
            .await
            .with_context(|| format!("{} subscribing to bin {} at {}", client.id(), bin, server.id()))?;
    }
    Ok(())
}

async fn count_found(nodes: &[TestNode], addresses: &[Address]) -> anyhow::Result<usize> {
    let mut found = 0;
    for node in nodes {
        found += node.count_present(addresses).await?;
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_chain_rejects_single_node() {
        assert!(run_chain(ChainConfig::with_nodes(1)).await.is_err());
    }

    #[test]
    fn test_report_requires_content() {
        let report = ChainReport {
            outcome: ChainOutcome::Synced,
            found: 0,
            total: 0,
            elapsed: Duration::ZERO,
        };
        assert!(!report.is_synced());
    }
}
