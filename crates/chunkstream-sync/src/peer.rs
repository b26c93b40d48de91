//! Per-peer protocol session.
//!
//! A session exists only for a peer whose handshake matched our protocol
//! version. While active it runs one reader task, one writer task and one
//! producer task per stream the peer subscribed to.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use chunkstream_core::{Chunk, NodeId, Priority, Range, Stream};
use chunkstream_store::ChunkStore;

use crate::delivery::Delivery;
use crate::error::{Result, SyncError};
use crate::intervals::IntervalStore;
use crate::messages::{DeliveryOrigin, Rejection, StreamMessage, SyncErrorCode};
use crate::registry::RegistryConfig;
use crate::scheduler::{self, Outbox};
use crate::shutdown::{Shutdown, ShutdownSignal};
use crate::stats::StatsCounters;
use crate::subscription::{self, ClientSubscription, ServerSubscription};
use crate::transport::{MessageSink, MessageSource};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Registry-wide collaborators handed to every new session.
#[derive(Clone)]
pub(crate) struct SessionDeps {
    pub config: Arc<RegistryConfig>,
    pub store: Arc<dyn ChunkStore>,
    pub intervals: Arc<IntervalStore>,
    pub delivery: Delivery,
    pub stats: Arc<StatsCounters>,
}

/// State shared by a session's tasks.
pub(crate) struct SessionContext {
    pub peer: NodeId,
    pub config: Arc<RegistryConfig>,
    pub store: Arc<dyn ChunkStore>,
    pub intervals: Arc<IntervalStore>,
    pub delivery: Delivery,
    pub stats: Arc<StatsCounters>,
    pub outbox: Outbox,
    /// Streams we consume from this peer.
    pub clients: Mutex<HashMap<Stream, ClientSubscription>>,
    /// Streams this peer consumes from us.
    pub servers: Mutex<HashMap<Stream, ServerSubscription>>,
    pub next_server_id: AtomicU64,
    pub shutdown: ShutdownSignal,
}

/// Protocol session with one compatible peer.
pub struct PeerSession {
    ctx: Arc<SessionContext>,
    version: u32,
    state: std::sync::Mutex<SessionState>,
    shutdown: Shutdown,
    reader_done: ShutdownSignal,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerSession {
    /// Spawn the reader and writer for a handshaken connection.
    pub(crate) fn start(
        peer: NodeId,
        version: u32,
        sink: Box<dyn MessageSink>,
        source: Box<dyn MessageSource>,
        deps: SessionDeps,
    ) -> Arc<Self> {
        let (outbox, lanes) = scheduler::lanes(deps.config.outbox_capacity);
        let shutdown = Shutdown::new();
        let ctx = Arc::new(SessionContext {
            peer,
            config: deps.config,
            store: deps.store,
            intervals: deps.intervals,
            delivery: deps.delivery,
            stats: deps.stats,
            outbox,
            clients: Mutex::new(HashMap::new()),
            servers: Mutex::new(HashMap::new()),
            next_server_id: AtomicU64::new(0),
            shutdown: shutdown.to_signal(),
        });

        let reader_exit = Shutdown::new();
        let reader_done = reader_exit.to_signal();
        let writer = tokio::spawn(scheduler::run_writer(
            peer,
            lanes,
            sink,
            shutdown.to_signal(),
        ));
        let reader = tokio::spawn(run_reader(
            ctx.clone(),
            source,
            shutdown.to_signal(),
            reader_exit,
        ));

        let session = Arc::new(Self {
            ctx,
            version,
            state: std::sync::Mutex::new(SessionState::Connecting),
            shutdown,
            reader_done,
            tasks: Mutex::new(vec![reader, writer]),
        });
        session.set_state(SessionState::Active);
        debug!(%peer, version, "session started");
        session
    }

    pub fn peer(&self) -> NodeId {
        self.ctx.peer
    }

    /// The protocol version both sides agreed on.
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Streams we are subscribed to at this peer.
    pub async fn client_streams(&self) -> Vec<Stream> {
        let mut streams: Vec<_> = self.ctx.clients.lock().await.keys().cloned().collect();
        streams.sort();
        streams
    }

    /// Streams this peer is subscribed to at us.
    pub async fn server_streams(&self) -> Vec<Stream> {
        let mut streams: Vec<_> = self.ctx.servers.lock().await.keys().cloned().collect();
        streams.sort();
        streams
    }

    pub(crate) fn outbox(&self) -> Outbox {
        self.ctx.outbox.clone()
    }

    /// Resolves once the reader has stopped, i.e. the connection is gone or
    /// the session was closed.
    pub(crate) async fn ended(&self) {
        self.reader_done.clone().wait().await;
    }

    pub(crate) async fn subscribe(&self, stream: Stream, range: Range, priority: Priority) -> Result<()> {
        if !self.is_active() {
            return Err(SyncError::PeerNotFound(self.ctx.peer));
        }
        subscription::subscribe(&self.ctx, stream, range, priority).await
    }

    pub(crate) async fn unsubscribe(&self, stream: &Stream) -> Result<()> {
        if !self.is_active() {
            return Err(SyncError::PeerNotFound(self.ctx.peer));
        }
        subscription::unsubscribe(&self.ctx, stream).await
    }

    /// Tear the session down.
    ///
    /// Stops every producer, drops client subscriptions, fails over pending
    /// retrievals addressed to this peer and discards queued messages. Tasks
    /// that do not stop within the configured close timeout are aborted.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                return;
            }
            *state = SessionState::Closing;
        }
        let peer = self.ctx.peer;
        self.shutdown.trigger();

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        for (_, server) in self.ctx.servers.lock().await.drain() {
            server.cancel.trigger();
            handles.push(server.task);
        }
        self.ctx.clients.lock().await.clear();
        self.ctx.delivery.detach_peer(&peer);
        handles.extend(self.tasks.lock().await.drain(..));

        let deadline = Instant::now() + self.ctx.config.close_timeout;
        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!(%peer, "session task overran close timeout, aborting");
                handle.abort();
            }
        }

        self.set_state(SessionState::Closed);
        debug!(%peer, "session closed");
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("peer", &self.ctx.peer)
            .field("version", &self.version)
            .field("state", &self.state())
            .finish()
    }
}

async fn run_reader(
    ctx: Arc<SessionContext>,
    mut source: Box<dyn MessageSource>,
    mut shutdown: ShutdownSignal,
    _exit: Shutdown,
) {
    let peer = ctx.peer;
    loop {
        let received = tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            received = source.recv() => received,
        };
        match received {
            Ok(Some(message)) => match dispatch(&ctx, message).await {
                Ok(()) => {}
                Err(SyncError::Closed) => break,
                Err(e) => warn!(%peer, error = %e, "failed to handle message"),
            },
            Ok(None) => {
                debug!(%peer, "connection closed by peer");
                break;
            }
            Err(SyncError::InvalidMessage(reason)) => {
                warn!(%peer, %reason, "dropping undecodable message");
            }
            Err(e) => {
                warn!(%peer, error = %e, "transport failure");
                break;
            }
        }
    }
}

async fn dispatch(ctx: &Arc<SessionContext>, message: StreamMessage) -> Result<()> {
    if let Err(reason) = message.validate_limits() {
        warn!(peer = %ctx.peer, kind = message.kind(), reason, "message violates limits");
        // The subscriber is waiting on an answer.
        if let StreamMessage::SubscribeRequest { stream, .. } = message {
            let rejection = Rejection::new(SyncErrorCode::InvalidMessage, reason);
            return ctx.outbox.post(
                Priority::Top,
                StreamMessage::SubscribeResult {
                    stream,
                    rejection: Some(rejection),
                },
            );
        }
        return Ok(());
    }
    trace!(peer = %ctx.peer, kind = message.kind(), "received");

    match message {
        StreamMessage::Handshake { node_id, version } => {
            warn!(peer = %ctx.peer, %node_id, version, "unexpected handshake on active session");
            Ok(())
        }
        StreamMessage::SubscribeRequest {
            stream,
            range,
            priority,
        } => subscription::on_subscribe_request(ctx, stream, range, priority).await,
        StreamMessage::SubscribeResult { stream, rejection } => {
            subscription::on_subscribe_result(ctx, stream, rejection).await;
            Ok(())
        }
        StreamMessage::UnsubscribeRequest { stream } => {
            subscription::on_unsubscribe_request(ctx, &stream).await;
            Ok(())
        }
        StreamMessage::OfferedBatch {
            stream,
            range,
            addresses,
        } => subscription::on_offered_batch(ctx, stream, range, addresses).await,
        StreamMessage::WantedBitmask {
            stream,
            range,
            bitmask,
        } => {
            subscription::on_wanted(ctx, stream, range, bitmask).await;
            Ok(())
        }
        StreamMessage::ChunkDelivery {
            origin: DeliveryOrigin::Sync(stream),
            address,
            data,
        } => subscription::on_chunk_delivery(ctx, stream, Chunk::with_address(address, data)).await,
        StreamMessage::ChunkDelivery {
            origin: DeliveryOrigin::Retrieval,
            address,
            data,
        } => {
            ctx.delivery
                .on_delivery(&ctx.peer, Chunk::with_address(address, data))
                .await
        }
        StreamMessage::RetrieveRequest { address } => {
            ctx.delivery
                .handle_retrieve_request(&ctx.peer, &ctx.outbox, address)
                .await
        }
        StreamMessage::RetrieveNotFound { address } => {
            ctx.delivery.on_not_found(&ctx.peer, &address);
            Ok(())
        }
        StreamMessage::SubscriptionEnded { stream } => {
            subscription::on_subscription_ended(ctx, &stream).await;
            Ok(())
        }
    }
}
