//! Overlay routing view.
//!
//! The protocol does not maintain a routing table itself. It asks an
//! [`Overlay`] which known peers are closest to an address and what the
//! local neighbourhood depth is.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::RwLock;

use chunkstream_core::{Address, NodeId, MAX_PO};

/// Read-only routing queries.
pub trait Overlay: Send + Sync {
    /// Up to `count` known peers, closest to `address` first, skipping any
    /// in `exclude`.
    fn closest_peers(&self, address: &Address, exclude: &HashSet<NodeId>, count: usize)
        -> Vec<NodeId>;

    /// Proximity order from which peers count as neighbours.
    fn depth(&self) -> u8;
}

/// XOR distance comparison of two overlay addresses to a target.
pub fn cmp_distance(target: &Address, a: &Address, b: &Address) -> CmpOrdering {
    let (t, a, b) = (target.as_bytes(), a.as_bytes(), b.as_bytes());
    for i in 0..t.len() {
        let da = t[i] ^ a[i];
        let db = t[i] ^ b[i];
        if da != db {
            return da.cmp(&db);
        }
    }
    CmpOrdering::Equal
}

/// A fixed in-memory peer set.
#[derive(Debug, Default)]
pub struct MemoryOverlay {
    peers: RwLock<BTreeSet<NodeId>>,
    depth: AtomicU8,
}

impl MemoryOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peers(peers: impl IntoIterator<Item = NodeId>) -> Self {
        let overlay = Self::new();
        for peer in peers {
            overlay.add_peer(peer);
        }
        overlay
    }

    pub fn add_peer(&self, peer: NodeId) {
        if let Ok(mut peers) = self.peers.write() {
            peers.insert(peer);
        }
    }

    pub fn remove_peer(&self, peer: &NodeId) -> bool {
        self.peers
            .write()
            .map(|mut peers| peers.remove(peer))
            .unwrap_or(false)
    }

    pub fn peers(&self) -> Vec<NodeId> {
        self.peers
            .read()
            .map(|peers| peers.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn set_depth(&self, depth: u8) {
        self.depth.store(depth.min(MAX_PO), Ordering::Relaxed);
    }
}

impl Overlay for MemoryOverlay {
    fn closest_peers(
        &self,
        address: &Address,
        exclude: &HashSet<NodeId>,
        count: usize,
    ) -> Vec<NodeId> {
        let mut candidates: Vec<NodeId> = match self.peers.read() {
            Ok(peers) => peers.iter().filter(|p| !exclude.contains(p)).copied().collect(),
            Err(_) => return Vec::new(),
        };
        candidates.sort_by(|a, b| cmp_distance(address, &a.overlay(), &b.overlay()));
        candidates.truncate(count);
        candidates
    }

    fn depth(&self) -> u8 {
        self.depth.load(Ordering::Relaxed)
    }
}
