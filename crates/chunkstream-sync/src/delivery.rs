//! On-demand chunk retrieval with peer fallback.
//!
//! A request for an address that is not stored locally is sent to the
//! closest connected peer. If that peer answers "not found", times out,
//! disconnects or returns a corrupt payload, the next-closest peer is
//! tried, until a valid chunk arrives or the candidates run out.
//!
//! Concurrent requests for one address share a single flow: the first
//! caller spawns it, later callers wait on its outcome. The flow runs as its
//! own task so a caller that gives up cannot strand the others.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tracing::{debug, trace, warn};

use chunkstream_core::{Address, Chunk, NodeId, Priority};
use chunkstream_store::{ChunkStore, PutMode};

use crate::error::{Result, SyncError};
use crate::messages::{DeliveryOrigin, StreamMessage};
use crate::routing::Overlay;
use crate::scheduler::Outbox;
use crate::shutdown::Shutdown;
use crate::stats::StatsCounters;

/// Retrieval front end, shared by the registry and every session.
#[derive(Clone)]
pub struct Delivery {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn ChunkStore>,
    overlay: Arc<dyn Overlay>,
    /// Outboxes of peers with an active session.
    routes: RwLock<HashMap<NodeId, Outbox>>,
    pending: Mutex<HashMap<Address, Arc<PendingRequest>>>,
    stats: Arc<StatsCounters>,
    search_timeout: Duration,
    max_candidates: usize,
    shutdown: Shutdown,
}

struct PendingRequest {
    attempt: Mutex<Option<Attempt>>,
    outcome: watch::Sender<Option<Outcome>>,
}

/// The one peer currently being asked.
struct Attempt {
    peer: NodeId,
    reply: oneshot::Sender<Reply>,
}

enum Reply {
    Delivered(Chunk),
    NotFound,
    PeerGone,
}

#[derive(Debug, Clone)]
enum Outcome {
    Found(Chunk),
    Failed(Failure),
}

#[derive(Debug, Clone)]
enum Failure {
    NoPeer,
    Timeout,
    Corrupt(NodeId),
    Closed,
    Store(String),
}

impl Failure {
    fn into_error(self, address: Address) -> SyncError {
        match self {
            Failure::NoPeer => SyncError::NoPeerFound(address),
            Failure::Timeout => SyncError::Timeout(format!("retrieving chunk {}", address)),
            Failure::Corrupt(peer) => SyncError::CorruptDelivery { address, peer },
            Failure::Closed => SyncError::Closed,
            Failure::Store(e) => SyncError::LocalStore(e),
        }
    }
}

impl PendingRequest {
    fn new() -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            attempt: Mutex::new(None),
            outcome,
        }
    }

    fn attempt(&self) -> MutexGuard<'_, Option<Attempt>> {
        self.attempt.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resolve the current attempt if it is addressed to `peer`.
    fn reply_from(&self, peer: &NodeId, reply: Reply) -> std::result::Result<(), Reply> {
        let mut attempt = self.attempt();
        match attempt.take() {
            Some(current) if current.peer == *peer => {
                let _ = current.reply.send(reply);
                Ok(())
            }
            other => {
                *attempt = other;
                Err(reply)
            }
        }
    }
}

impl Delivery {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        overlay: Arc<dyn Overlay>,
        stats: Arc<StatsCounters>,
        search_timeout: Duration,
        max_candidates: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                overlay,
                routes: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                stats,
                search_timeout,
                max_candidates: max_candidates.max(1),
                shutdown: Shutdown::new(),
            }),
        }
    }

    /// Fetch `address` from the network, never asking a peer in `skip`.
    pub async fn request_from_peers(
        &self,
        address: Address,
        skip: HashSet<NodeId>,
    ) -> Result<Chunk> {
        if self.inner.shutdown.is_triggered() {
            return Err(SyncError::Closed);
        }

        let (pending, fresh) = {
            let mut table = self.inner.pending();
            match table.get(&address) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let created = Arc::new(PendingRequest::new());
                    table.insert(address, created.clone());
                    (created, true)
                }
            }
        };

        let mut outcome = pending.outcome.subscribe();
        if fresh {
            let inner = self.inner.clone();
            tokio::spawn(inner.run(address, skip, pending));
        } else {
            trace!(%address, "joining pending retrieval");
        }

        let resolved = outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| SyncError::Closed)?
            .clone();
        match resolved {
            Some(Outcome::Found(chunk)) => Ok(chunk),
            Some(Outcome::Failed(failure)) => Err(failure.into_error(address)),
            None => Err(SyncError::Closed),
        }
    }

    /// Serve a peer's retrieve request from the local store.
    ///
    /// The reply is posted without waiting for lane room.
    pub async fn handle_retrieve_request(
        &self,
        peer: &NodeId,
        outbox: &Outbox,
        address: Address,
    ) -> Result<()> {
        let reply = match self.inner.store.get(&address).await? {
            Some(chunk) => {
                StatsCounters::incr(&self.inner.stats.retrieve_requests_served);
                let (address, data) = chunk.into_parts();
                StreamMessage::ChunkDelivery {
                    origin: DeliveryOrigin::Retrieval,
                    address,
                    data,
                }
            }
            None => {
                StatsCounters::incr(&self.inner.stats.retrieve_not_found);
                debug!(%peer, %address, "retrieve request miss");
                StreamMessage::RetrieveNotFound { address }
            }
        };
        outbox.post(Priority::Top, reply)
    }

    /// A retrieval delivery arrived from `peer`.
    pub async fn on_delivery(&self, peer: &NodeId, chunk: Chunk) -> Result<()> {
        let address = *chunk.address();
        let pending = self.inner.pending().get(&address).cloned();
        let Some(pending) = pending else {
            trace!(%peer, %address, "unsolicited retrieval delivery dropped");
            return Ok(());
        };

        let Err(Reply::Delivered(chunk)) = pending.reply_from(peer, Reply::Delivered(chunk))
        else {
            return Ok(());
        };

        // Late answer from an earlier candidate.
        if chunk.verify().is_err() {
            StatsCounters::incr(&self.inner.stats.corrupt_deliveries);
            warn!(%peer, %address, "late delivery failed verification");
            return Ok(());
        }
        self.inner.store.put(PutMode::Request, chunk).await?;
        debug!(%peer, %address, "stored late retrieval delivery");
        Ok(())
    }

    /// `peer` does not have `address`.
    pub fn on_not_found(&self, peer: &NodeId, address: &Address) {
        let pending = self.inner.pending().get(address).cloned();
        if let Some(pending) = pending {
            let _ = pending.reply_from(peer, Reply::NotFound);
        }
    }

    /// Make `peer` a retrieval candidate.
    pub(crate) fn attach_peer(&self, peer: NodeId, outbox: Outbox) {
        self.inner.routes_mut().insert(peer, outbox);
    }

    /// Remove `peer` and fail over every attempt waiting on it.
    pub(crate) fn detach_peer(&self, peer: &NodeId) {
        self.inner.routes_mut().remove(peer);
        let pending: Vec<_> = self.inner.pending().values().cloned().collect();
        for request in pending {
            let _ = request.reply_from(peer, Reply::PeerGone);
        }
    }

    /// Number of retrieve requests sent so far.
    pub fn requests_sent(&self) -> u64 {
        self.inner
            .stats
            .retrieve_requests_sent
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Number of addresses with a flow in progress.
    pub fn pending_count(&self) -> usize {
        self.inner.pending().len()
    }

    /// Fail every flow with `Closed` and refuse new ones.
    pub fn close(&self) {
        self.inner.shutdown.trigger();
        self.inner.routes_mut().clear();
    }
}

impl Inner {
    fn pending(&self) -> MutexGuard<'_, HashMap<Address, Arc<PendingRequest>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn routes_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<NodeId, Outbox>> {
        self.routes.write().unwrap_or_else(|e| e.into_inner())
    }

    async fn run(self: Arc<Self>, address: Address, skip: HashSet<NodeId>, pending: Arc<PendingRequest>) {
        let mut shutdown = self.shutdown.to_signal();
        let outcome = tokio::select! {
            outcome = self.search(address, skip, &pending) => outcome,
            _ = shutdown.wait() => Outcome::Failed(Failure::Closed),
        };
        if let Outcome::Failed(failure) = &outcome {
            debug!(%address, ?failure, "retrieval failed");
        }
        pending.outcome.send_replace(Some(outcome));
        self.pending().remove(&address);
    }

    /// Closest routable peer not in `skip`. Unroutable peers are added to
    /// `skip` along the way.
    fn next_candidate(&self, address: &Address, skip: &mut HashSet<NodeId>) -> Option<(NodeId, Outbox)> {
        loop {
            let closest = self
                .overlay
                .closest_peers(address, skip, self.max_candidates);
            if closest.is_empty() {
                return None;
            }
            let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
            for peer in closest {
                match routes.get(&peer) {
                    Some(outbox) => return Some((peer, outbox.clone())),
                    None => {
                        skip.insert(peer);
                    }
                }
            }
        }
    }

    async fn search(&self, address: Address, mut skip: HashSet<NodeId>, pending: &PendingRequest) -> Outcome {
        let mut failure = Failure::NoPeer;
        loop {
            match self.store.get(&address).await {
                Ok(Some(chunk)) => return Outcome::Found(chunk),
                Ok(None) => {}
                Err(e) => return Outcome::Failed(Failure::Store(e.to_string())),
            }

            let Some((peer, outbox)) = self.next_candidate(&address, &mut skip) else {
                return Outcome::Failed(failure);
            };
            skip.insert(peer);

            let (reply_tx, reply_rx) = oneshot::channel();
            *pending.attempt() = Some(Attempt {
                peer,
                reply: reply_tx,
            });

            if outbox
                .send(Priority::Top, StreamMessage::RetrieveRequest { address })
                .await
                .is_err()
            {
                debug!(%peer, %address, "candidate session gone before request");
                pending.attempt().take();
                continue;
            }
            StatsCounters::incr(&self.stats.retrieve_requests_sent);

            let reply = tokio::time::timeout(self.search_timeout, reply_rx).await;
            pending.attempt().take();

            match reply {
                Ok(Ok(Reply::Delivered(chunk))) => {
                    if chunk.address() != &address || chunk.verify().is_err() {
                        StatsCounters::incr(&self.stats.corrupt_deliveries);
                        warn!(%peer, %address, "corrupt delivery, excluding peer");
                        failure = Failure::Corrupt(peer);
                        continue;
                    }
                    return match self.store.put(PutMode::Request, chunk.clone()).await {
                        Ok(_) => {
                            trace!(%peer, %address, "retrieved");
                            Outcome::Found(chunk)
                        }
                        Err(e) => Outcome::Failed(Failure::Store(e.to_string())),
                    };
                }
                Ok(Ok(Reply::NotFound)) => {
                    debug!(%peer, %address, "candidate does not have chunk");
                    failure = Failure::NoPeer;
                }
                Ok(Ok(Reply::PeerGone)) | Ok(Err(_)) => {
                    debug!(%peer, %address, "candidate disconnected");
                    failure = Failure::NoPeer;
                }
                Err(_) => {
                    debug!(%peer, %address, timeout = ?self.search_timeout, "candidate timed out");
                    failure = Failure::Timeout;
                }
            }
        }
    }
}
