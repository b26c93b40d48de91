//! Node-wide protocol coordinator.
//!
//! The registry owns every peer session of one node. It gates new
//! connections on the protocol version, routes subscribe and retrieval calls
//! to the right session, and tears everything down on [`Registry::close`].
//! Each node (and each simulated node in a test) has its own registry; there
//! is no process-wide state.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use chunkstream_core::{proximity, Address, Chunk, NodeId, Priority, Range, Stream, MAX_PO};
use chunkstream_store::{ChunkStore, StateStore};

use crate::delivery::Delivery;
use crate::error::{Result, SyncError};
use crate::intervals::IntervalStore;
use crate::messages::{StreamMessage, PROTOCOL_VERSION};
use crate::peer::{PeerSession, SessionDeps};
use crate::routing::Overlay;
use crate::stats::{StatsCounters, SyncStats};
use crate::transport::Connection;

/// Whether new peers are subscribed to automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Syncing {
    #[default]
    Disabled,
    /// Subscribe to the live sync streams of every new peer, for the bins
    /// chosen by neighbourhood depth.
    AutoSubscribe,
}

/// Configuration for the registry and its sessions.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Protocol version announced in the handshake.
    pub version: u32,
    pub syncing: Syncing,
    /// Max addresses per offered batch, capped at the wire limit.
    pub batch_size: usize,
    /// How long a producer gathers descriptors after the first one.
    pub batch_timeout: Duration,
    pub handshake_timeout: Duration,
    /// How long `subscribe` waits for the remote's answer.
    pub subscribe_timeout: Duration,
    /// Per-candidate deadline of a retrieve request.
    pub search_timeout: Duration,
    /// Candidates fetched from the overlay per round.
    pub max_candidates: usize,
    /// Capacity of each outbound priority lane.
    pub outbox_capacity: usize,
    /// Bound on session teardown.
    pub close_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            syncing: Syncing::Disabled,
            batch_size: 64,
            batch_timeout: Duration::from_millis(20),
            handshake_timeout: Duration::from_secs(5),
            subscribe_timeout: Duration::from_secs(10),
            search_timeout: Duration::from_secs(1),
            max_candidates: 8,
            outbox_capacity: 1024,
            close_timeout: Duration::from_secs(2),
        }
    }
}

/// Bins to auto-subscribe at a peer with proximity `po`.
///
/// A peer outside our neighbourhood only serves its own bin; a neighbour
/// serves every bin from the depth up.
pub fn auto_subscribe_bins(po: u8, depth: u8) -> Vec<u8> {
    if po < depth {
        vec![po]
    } else {
        (depth..=MAX_PO).collect()
    }
}

/// Node-wide protocol coordinator. Cheap to clone.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    local: NodeId,
    config: Arc<RegistryConfig>,
    store: Arc<dyn ChunkStore>,
    intervals: Arc<IntervalStore>,
    overlay: Arc<dyn Overlay>,
    delivery: Delivery,
    stats: Arc<StatsCounters>,
    sessions: RwLock<HashMap<NodeId, Arc<PeerSession>>>,
    /// Every connected peer. Incompatible ones keep their connection here.
    transport_peers: Mutex<HashMap<NodeId, Option<Connection>>>,
    closed: AtomicBool,
}

impl RegistryInner {
    fn sessions(&self) -> std::sync::RwLockReadGuard<'_, HashMap<NodeId, Arc<PeerSession>>> {
        self.sessions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn sessions_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<NodeId, Arc<PeerSession>>> {
        self.sessions.write().unwrap_or_else(|e| e.into_inner())
    }

    fn transport_peers(&self) -> MutexGuard<'_, HashMap<NodeId, Option<Connection>>> {
        self.transport_peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn session_deps(&self) -> SessionDeps {
        SessionDeps {
            config: self.config.clone(),
            store: self.store.clone(),
            intervals: self.intervals.clone(),
            delivery: self.delivery.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl Registry {
    pub fn new(
        local: NodeId,
        store: Arc<dyn ChunkStore>,
        state: Arc<dyn StateStore>,
        overlay: Arc<dyn Overlay>,
        config: RegistryConfig,
    ) -> Self {
        let stats = Arc::new(StatsCounters::default());
        let delivery = Delivery::new(
            store.clone(),
            overlay.clone(),
            stats.clone(),
            config.search_timeout,
            config.max_candidates,
        );
        Self {
            inner: Arc::new(RegistryInner {
                local,
                config: Arc::new(config),
                store,
                intervals: Arc::new(IntervalStore::new(state)),
                overlay,
                delivery,
                stats,
                sessions: RwLock::new(HashMap::new()),
                transport_peers: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn local(&self) -> NodeId {
        self.inner.local
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Closed);
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Peers
    // ─────────────────────────────────────────────────────────────────────────

    /// Handshake a new connection and, if the versions match, start a session.
    ///
    /// On a version mismatch the connection stays registered at transport
    /// level but no session is created.
    pub async fn add_peer(&self, connection: Connection) -> Result<()> {
        self.ensure_open()?;
        let inner = &self.inner;
        let Connection {
            peer,
            mut sink,
            mut source,
        } = connection;

        if inner.sessions().contains_key(&peer) {
            return Err(SyncError::AlreadyConnected(peer));
        }
        inner.transport_peers().insert(peer, None);

        let handshake = async {
            sink.send(StreamMessage::Handshake {
                node_id: inner.local,
                version: inner.config.version,
            })
            .await?;
            match source.recv().await? {
                Some(StreamMessage::Handshake { node_id, version }) if node_id == peer => Ok(version),
                Some(StreamMessage::Handshake { node_id, .. }) => Err(SyncError::InvalidMessage(
                    format!("handshake from {}, expected {}", node_id, peer),
                )),
                Some(other) => Err(SyncError::InvalidMessage(format!(
                    "expected handshake, got {}",
                    other.kind()
                ))),
                None => Err(SyncError::TransportError(
                    "connection closed during handshake".into(),
                )),
            }
        };
        let remote_version = match tokio::time::timeout(inner.config.handshake_timeout, handshake).await {
            Ok(Ok(version)) => version,
            Ok(Err(e)) => {
                inner.transport_peers().remove(&peer);
                return Err(e);
            }
            Err(_) => {
                inner.transport_peers().remove(&peer);
                return Err(SyncError::Timeout(format!("handshake with {}", peer)));
            }
        };

        if remote_version != inner.config.version {
            warn!(
                %peer,
                local = inner.config.version,
                remote = remote_version,
                "protocol version mismatch, peer kept at transport level only"
            );
            inner.transport_peers().insert(peer, Some(Connection { peer, sink, source }));
            return Err(SyncError::VersionMismatch {
                local: inner.config.version,
                peer: remote_version,
            });
        }

        let session = {
            let mut sessions = inner.sessions_mut();
            // `close` may have drained the sessions during the handshake.
            if inner.closed.load(Ordering::SeqCst) {
                drop(sessions);
                inner.transport_peers().remove(&peer);
                return Err(SyncError::Closed);
            }
            if sessions.contains_key(&peer) {
                return Err(SyncError::AlreadyConnected(peer));
            }
            let session = PeerSession::start(peer, remote_version, sink, source, inner.session_deps());
            sessions.insert(peer, session.clone());
            session
        };
        inner.delivery.attach_peer(peer, session.outbox());

        let registry = self.clone();
        let watched = session.clone();
        tokio::spawn(async move {
            watched.ended().await;
            registry.session_ended(&watched).await;
        });

        if inner.config.syncing == Syncing::AutoSubscribe {
            tokio::spawn(self.clone().auto_subscribe(peer));
        }

        info!(%peer, version = remote_version, "peer session active");
        Ok(())
    }

    async fn session_ended(&self, session: &Arc<PeerSession>) {
        let peer = session.peer();
        let removed = {
            let mut sessions = self.inner.sessions_mut();
            let is_current = sessions
                .get(&peer)
                .is_some_and(|current| Arc::ptr_eq(current, session));
            if is_current {
                sessions.remove(&peer)
            } else {
                None
            }
        };
        session.close().await;
        if removed.is_some() {
            self.inner.transport_peers().remove(&peer);
            info!(%peer, "peer session ended");
        }
    }

    async fn auto_subscribe(self, peer: NodeId) {
        let po = proximity(self.inner.local.as_bytes(), peer.as_bytes());
        let bins = auto_subscribe_bins(po, self.inner.overlay.depth());
        debug!(%peer, po, ?bins, "auto-subscribing");

        for bin in bins {
            let stream = Stream::sync(bin, true);
            match self
                .subscribe(peer, stream.clone(), Range::default(), Priority::Mid)
                .await
            {
                Ok(()) | Err(SyncError::AlreadySubscribed { .. }) => {}
                Err(SyncError::Closed) | Err(SyncError::PeerNotFound(_)) => return,
                Err(e) => warn!(%peer, %stream, error = %e, "auto-subscribe failed"),
            }
        }
    }

    /// Number of peers with an active session.
    pub fn peers_count(&self) -> usize {
        self.inner.sessions().len()
    }

    /// Number of connected peers, compatible or not.
    pub fn transport_peers_count(&self) -> usize {
        self.inner.transport_peers().len()
    }

    /// The session with `peer`, if its handshake succeeded.
    pub fn get_peer(&self, peer: &NodeId) -> Option<Arc<PeerSession>> {
        self.inner.sessions().get(peer).cloned()
    }

    pub fn peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<_> = self.inner.sessions().keys().copied().collect();
        peers.sort();
        peers
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Subscriptions
    // ─────────────────────────────────────────────────────────────────────────

    /// Subscribe to `stream` at `peer`.
    ///
    /// Returns once the peer accepted. Resumes from the persisted cursor when
    /// it is past `range.from`.
    pub async fn subscribe(
        &self,
        peer: NodeId,
        stream: Stream,
        range: Range,
        priority: Priority,
    ) -> Result<()> {
        self.ensure_open()?;
        let session = self.get_peer(&peer).ok_or(SyncError::PeerNotFound(peer))?;
        session.subscribe(stream, range, priority).await
    }

    pub async fn unsubscribe(&self, peer: NodeId, stream: &Stream) -> Result<()> {
        self.ensure_open()?;
        let session = self.get_peer(&peer).ok_or(SyncError::PeerNotFound(peer))?;
        session.unsubscribe(stream).await
    }

    /// The persisted sync cursor for (peer, stream).
    pub async fn cursor(&self, peer: &NodeId, stream: &Stream) -> Result<u64> {
        self.inner.intervals.cursor(peer, stream).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Retrieval
    // ─────────────────────────────────────────────────────────────────────────

    /// Fetch a chunk from the network, skipping the peers in `skip`.
    pub async fn request_from_peers(&self, address: Address, skip: HashSet<NodeId>) -> Result<Chunk> {
        self.ensure_open()?;
        self.inner.delivery.request_from_peers(address, skip).await
    }

    /// Retrieve requests sent by this node so far.
    pub fn requests_sent(&self) -> u64 {
        self.inner.delivery.requests_sent()
    }

    pub fn stats(&self) -> SyncStats {
        self.inner.stats.snapshot()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close every session and fail pending retrievals.
    ///
    /// Sessions close concurrently, each bounded by the close timeout.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.delivery.close();

        let sessions: Vec<_> = self.inner.sessions_mut().drain().map(|(_, s)| s).collect();
        let count = sessions.len();
        let mut closing = JoinSet::new();
        for session in sessions {
            closing.spawn(async move { session.close().await });
        }
        while closing.join_next().await.is_some() {}

        self.inner.transport_peers().clear();
        info!(local = %self.inner.local, sessions = count, "registry closed");
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("local", &self.inner.local)
            .field("peers", &self.peers_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_subscribe_bins() {
        assert_eq!(auto_subscribe_bins(2, 5), vec![2]);
        assert_eq!(auto_subscribe_bins(5, 5), (5..=MAX_PO).collect::<Vec<_>>());
        assert_eq!(auto_subscribe_bins(9, 0).len(), MAX_PO as usize + 1);
    }

    #[test]
    fn test_default_config() {
        let config = RegistryConfig::default();
        assert_eq!(config.version, PROTOCOL_VERSION);
        assert_eq!(config.syncing, Syncing::Disabled);
        assert!(config.batch_size <= crate::messages::limits::MAX_BATCH_SIZE);
    }
}
