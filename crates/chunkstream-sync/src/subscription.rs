//! Both halves of a stream subscription.
//!
//! The server half runs a producer task per (peer, stream): it reads the
//! bin's pull feed, offers batches, waits for the client's want bitmask and
//! delivers only the wanted chunks. The client half answers offers with a
//! bitmask, stores deliveries and advances the persisted cursor once a
//! window is complete.
//!
//! Everything here runs on the session's reader task, except the producers.
//! Subscription maps are never locked across a network wait, and the reader
//! only posts to the outbox, it never waits for lane room.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use chunkstream_core::{Address, Chunk, Descriptor, Priority, Range, Stream};
use chunkstream_store::{PullSubscription, PutMode, PutResult};

use crate::error::{Result, SyncError};
use crate::messages::{limits, DeliveryOrigin, Rejection, StreamMessage, SyncErrorCode};
use crate::peer::SessionContext;
use crate::shutdown::{Shutdown, ShutdownSignal};
use crate::stats::StatsCounters;
use crate::window::BatchWindow;

// ─────────────────────────────────────────────────────────────────────────────
// Client half
// ─────────────────────────────────────────────────────────────────────────────

/// Our subscription to a stream served by the peer.
pub(crate) struct ClientSubscription {
    priority: Priority,
    /// False once a window was abandoned; the cursor then stays put.
    contiguous: bool,
    window: Option<BatchWindow>,
    /// Completes the pending `subscribe` call.
    ready: Option<oneshot::Sender<Result<()>>>,
}

/// Register a client half and ask the peer to serve `stream`.
///
/// Resumes from the persisted cursor if it is past `range.from`. A history
/// range the cursor already covers completes without contacting the peer;
/// a live stream in that position only asks for new data.
pub(crate) async fn subscribe(
    ctx: &SessionContext,
    stream: Stream,
    range: Range,
    priority: Priority,
) -> Result<()> {
    let cursor = ctx.intervals.cursor(&ctx.peer, &stream).await?;
    let from = range.from.max(cursor);
    let covered = !range.is_unbounded() && from >= range.to;

    let (ready_tx, ready_rx) = oneshot::channel();
    {
        let mut clients = ctx.clients.lock().await;
        if clients.contains_key(&stream) {
            return Err(SyncError::AlreadySubscribed {
                peer: ctx.peer,
                stream,
            });
        }
        if covered && !stream.live {
            debug!(peer = %ctx.peer, %stream, %range, cursor, "range already synced");
            return Ok(());
        }
        clients.insert(
            stream.clone(),
            ClientSubscription {
                priority,
                contiguous: true,
                window: None,
                ready: Some(ready_tx),
            },
        );
    }

    let request = StreamMessage::SubscribeRequest {
        stream: stream.clone(),
        range: Range::new(from, if covered { 0 } else { range.to }),
        priority,
    };
    if let Err(e) = ctx.outbox.send(Priority::Top, request).await {
        ctx.clients.lock().await.remove(&stream);
        return Err(e);
    }
    debug!(peer = %ctx.peer, %stream, from, cursor, "subscribing");

    match tokio::time::timeout(ctx.config.subscribe_timeout, ready_rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(SyncError::Closed),
        Err(_) => {
            ctx.clients.lock().await.remove(&stream);
            // The peer may still accept later; tell it not to bother.
            let _ = ctx
                .outbox
                .send(Priority::Top, StreamMessage::UnsubscribeRequest { stream: stream.clone() })
                .await;
            Err(SyncError::Timeout(format!("subscribing to {}", stream)))
        }
    }
}

/// Drop the client half and tell the peer to stop serving.
///
/// Unknown streams are a no-op.
pub(crate) async fn unsubscribe(ctx: &SessionContext, stream: &Stream) -> Result<()> {
    let removed = ctx.clients.lock().await.remove(stream);
    if removed.is_none() {
        return Ok(());
    }
    debug!(peer = %ctx.peer, %stream, "unsubscribing");
    ctx.outbox
        .send(
            Priority::Top,
            StreamMessage::UnsubscribeRequest {
                stream: stream.clone(),
            },
        )
        .await
}

pub(crate) async fn on_subscribe_result(
    ctx: &SessionContext,
    stream: Stream,
    rejection: Option<Rejection>,
) {
    let mut clients = ctx.clients.lock().await;
    let ready = match rejection {
        None => clients
            .get_mut(&stream)
            .and_then(|sub| sub.ready.take())
            .map(|ready| (ready, Ok(()))),
        Some(rejection) => {
            debug!(peer = %ctx.peer, %stream, code = ?rejection.code, "subscription rejected");
            clients.remove(&stream).and_then(|mut sub| {
                let err = rejection_error(ctx, stream.clone(), rejection);
                sub.ready.take().map(|ready| (ready, Err(err)))
            })
        }
    };
    match ready {
        Some((ready, result)) => {
            let _ = ready.send(result);
        }
        None => trace!(peer = %ctx.peer, %stream, "subscribe result without pending request"),
    }
}

fn rejection_error(ctx: &SessionContext, stream: Stream, rejection: Rejection) -> SyncError {
    match rejection.code {
        SyncErrorCode::UnknownStream => SyncError::UnknownStream(stream),
        SyncErrorCode::AlreadySubscribed => SyncError::AlreadySubscribed {
            peer: ctx.peer,
            stream,
        },
        code => SyncError::PeerError {
            code,
            message: rejection.message,
        },
    }
}

/// Answer an offered batch with the bitmask of addresses we lack.
pub(crate) async fn on_offered_batch(
    ctx: &SessionContext,
    stream: Stream,
    range: Range,
    addresses: Vec<Address>,
) -> Result<()> {
    let priority = match ctx.clients.lock().await.get(&stream) {
        Some(sub) => sub.priority,
        None => {
            trace!(peer = %ctx.peer, %stream, "offer for unknown subscription discarded");
            return Ok(());
        }
    };

    let mut window = BatchWindow::new(range, addresses);
    for index in 0..window.addresses().len() {
        if !ctx.store.has(&window.addresses()[index]).await? {
            window.want(index);
        }
    }
    let wanted = window.wanted_count();
    let bitmask = window.wanted().as_bytes().to_vec();

    {
        let mut clients = ctx.clients.lock().await;
        let Some(sub) = clients.get_mut(&stream) else {
            return Ok(());
        };
        if let Some(previous) = sub.window.replace(window) {
            if !previous.is_complete() {
                sub.contiguous = false;
                StatsCounters::incr(&ctx.stats.windows_abandoned);
                warn!(
                    peer = %ctx.peer,
                    %stream,
                    range = %previous.range(),
                    outstanding = previous.outstanding(),
                    "window abandoned, cursor frozen for this subscription"
                );
            }
        }
    }
    StatsCounters::incr(&ctx.stats.windows_received);
    StatsCounters::add(&ctx.stats.chunks_wanted, wanted as u64);
    trace!(peer = %ctx.peer, %stream, %range, wanted, "offer received");

    ctx.outbox.post(
        priority,
        StreamMessage::WantedBitmask {
            stream: stream.clone(),
            range,
            bitmask,
        },
    )?;

    if wanted == 0 {
        complete_window(ctx, &stream).await?;
    }
    Ok(())
}

/// Store a synced chunk that belongs to the open window.
pub(crate) async fn on_chunk_delivery(ctx: &SessionContext, stream: Stream, chunk: Chunk) -> Result<()> {
    let address = *chunk.address();
    let expected = ctx
        .clients
        .lock()
        .await
        .get(&stream)
        .and_then(|sub| sub.window.as_ref())
        .map(|window| window.expects(&address))
        .unwrap_or(false);
    if !expected {
        trace!(peer = %ctx.peer, %stream, %address, "unexpected delivery dropped");
        return Ok(());
    }

    if let Err(e) = chunk.verify() {
        StatsCounters::incr(&ctx.stats.corrupt_deliveries);
        warn!(peer = %ctx.peer, %stream, %address, error = %e, "corrupt sync delivery dropped");
        return Ok(());
    }

    match ctx.store.put(PutMode::Sync, chunk).await? {
        PutResult::Stored => StatsCounters::incr(&ctx.stats.chunks_synced),
        PutResult::AlreadyExists => StatsCounters::incr(&ctx.stats.chunks_duplicate),
    }

    let complete = ctx
        .clients
        .lock()
        .await
        .get_mut(&stream)
        .and_then(|sub| sub.window.as_mut())
        .map(|window| {
            window.ack(&address);
            window.is_complete()
        })
        .unwrap_or(false);
    if complete {
        complete_window(ctx, &stream).await?;
    }
    Ok(())
}

/// Close the open window if it is complete and persist the cursor.
async fn complete_window(ctx: &SessionContext, stream: &Stream) -> Result<()> {
    let advance_to = {
        let mut clients = ctx.clients.lock().await;
        let Some(sub) = clients.get_mut(stream) else {
            return Ok(());
        };
        if !sub.window.as_ref().is_some_and(BatchWindow::is_complete) {
            return Ok(());
        }
        let Some(window) = sub.window.take() else {
            return Ok(());
        };
        StatsCounters::incr(&ctx.stats.windows_completed);
        sub.contiguous.then(|| window.range().to)
    };

    if let Some(to) = advance_to {
        ctx.intervals.advance(&ctx.peer, stream, to).await?;
    }
    Ok(())
}

pub(crate) async fn on_subscription_ended(ctx: &SessionContext, stream: &Stream) {
    let removed = ctx.clients.lock().await.remove(stream);
    if let Some(mut sub) = removed {
        if let Some(ready) = sub.ready.take() {
            let _ = ready.send(Ok(()));
        }
        debug!(peer = %ctx.peer, %stream, "history stream ended");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server half
// ─────────────────────────────────────────────────────────────────────────────

type Want = (Range, Vec<u8>);

/// A stream we serve to the peer.
pub(crate) struct ServerSubscription {
    id: u64,
    pub(crate) cancel: Shutdown,
    wants: mpsc::Sender<Want>,
    pub(crate) task: JoinHandle<()>,
}

/// Accept or reject a subscribe request and answer it.
pub(crate) async fn on_subscribe_request(
    ctx: &Arc<SessionContext>,
    stream: Stream,
    range: Range,
    priority: Priority,
) -> Result<()> {
    let rejection = match accept(ctx, &stream, range, priority).await {
        Ok(()) => {
            debug!(peer = %ctx.peer, %stream, %range, ?priority, "serving stream");
            None
        }
        Err(rejection) => {
            debug!(peer = %ctx.peer, %stream, code = ?rejection.code, "refusing stream");
            Some(rejection)
        }
    };
    ctx.outbox
        .post(Priority::Top, StreamMessage::SubscribeResult { stream, rejection })
}

async fn accept(
    ctx: &Arc<SessionContext>,
    stream: &Stream,
    range: Range,
    priority: Priority,
) -> std::result::Result<(), Rejection> {
    let bin = stream.sync_bin().map_err(|_| {
        Rejection::new(SyncErrorCode::UnknownStream, format!("unknown stream {}", stream))
    })?;

    // A live stream keeps going past `to`; it only bounds history.
    let until = match (stream.live, range.is_unbounded()) {
        (true, _) => None,
        (false, false) => Some(range.to.saturating_sub(1)),
        // History up to what exists right now.
        (false, true) => Some(
            ctx.store
                .last_bin_id(bin)
                .await
                .map_err(|e| Rejection::new(SyncErrorCode::InternalError, e.to_string()))?,
        ),
    };

    let mut servers = ctx.servers.lock().await;
    if servers.contains_key(stream) {
        return Err(Rejection::new(
            SyncErrorCode::AlreadySubscribed,
            format!("already serving {}", stream),
        ));
    }

    let pull = ctx
        .store
        .subscribe_pull(bin, range.from.saturating_sub(1), until);
    let (wants_tx, wants_rx) = mpsc::channel(4);
    let cancel = Shutdown::new();
    let id = ctx.next_server_id.fetch_add(1, Ordering::Relaxed);
    let producer = Producer {
        ctx: ctx.clone(),
        id,
        stream: stream.clone(),
        priority,
        pull,
        wants: wants_rx,
        cancel: cancel.to_signal(),
        session: ctx.shutdown.clone(),
    };
    let task = tokio::spawn(producer.run());
    servers.insert(
        stream.clone(),
        ServerSubscription {
            id,
            cancel,
            wants: wants_tx,
            task,
        },
    );
    Ok(())
}

pub(crate) async fn on_unsubscribe_request(ctx: &SessionContext, stream: &Stream) {
    let removed = ctx.servers.lock().await.remove(stream);
    if let Some(server) = removed {
        server.cancel.trigger();
        debug!(peer = %ctx.peer, %stream, "peer unsubscribed");
    }
}

/// Route a want bitmask to the producer waiting for it.
pub(crate) async fn on_wanted(ctx: &SessionContext, stream: Stream, range: Range, bitmask: Vec<u8>) {
    let wants = ctx.servers.lock().await.get(&stream).map(|s| s.wants.clone());
    match wants {
        // A producer waits on one want at a time; a full queue means the
        // peer is sending wants nobody asked for.
        Some(wants) => {
            if wants.try_send((range, bitmask)).is_err() {
                trace!(peer = %ctx.peer, %stream, "want dropped");
            }
        }
        None => trace!(peer = %ctx.peer, %stream, "want for unknown subscription dropped"),
    }
}

struct Producer {
    ctx: Arc<SessionContext>,
    id: u64,
    stream: Stream,
    priority: Priority,
    pull: PullSubscription,
    wants: mpsc::Receiver<Want>,
    cancel: ShutdownSignal,
    session: ShutdownSignal,
}

impl Producer {
    async fn run(mut self) {
        let batch_size = self.ctx.config.batch_size.clamp(1, limits::MAX_BATCH_SIZE);

        let exhausted = loop {
            let first = tokio::select! {
                biased;
                _ = self.cancel.wait() => break false,
                _ = self.session.wait() => break false,
                next = self.pull.next() => next,
            };
            let Some(first) = first else {
                break true;
            };

            let (batch, drained) = self.fill_batch(first, batch_size).await;
            match self.serve(&batch).await {
                Ok(true) => {}
                Ok(false) => break false,
                Err(e) => {
                    warn!(peer = %self.ctx.peer, stream = %self.stream, error = %e, "producer stopped");
                    break false;
                }
            }
            if drained {
                break true;
            }
        };

        if exhausted {
            let ended = StreamMessage::SubscriptionEnded {
                stream: self.stream.clone(),
            };
            // Same lane as the deliveries, so it arrives after them.
            if self.ctx.outbox.send(self.priority, ended).await.is_ok() {
                debug!(peer = %self.ctx.peer, stream = %self.stream, "history served");
            }
        }

        let mut servers = self.ctx.servers.lock().await;
        if servers.get(&self.stream).is_some_and(|s| s.id == self.id) {
            servers.remove(&self.stream);
        }
    }

    /// Gather up to `batch_size` descriptors within the batch timeout.
    /// The flag reports that the pull feed ended.
    async fn fill_batch(&mut self, first: Descriptor, batch_size: usize) -> (Vec<Descriptor>, bool) {
        let mut batch = Vec::with_capacity(batch_size);
        batch.push(first);
        let deadline = Instant::now() + self.ctx.config.batch_timeout;
        while batch.len() < batch_size {
            match tokio::time::timeout_at(deadline, self.pull.next()).await {
                Ok(Some(descriptor)) => batch.push(descriptor),
                Ok(None) => return (batch, true),
                Err(_) => break,
            }
        }
        (batch, false)
    }

    /// Offer one batch, wait for the want, deliver.
    ///
    /// Returns false if the subscription was cancelled meanwhile.
    async fn serve(&mut self, batch: &[Descriptor]) -> Result<bool> {
        let (Some(first), Some(last)) = (batch.first(), batch.last()) else {
            return Ok(true);
        };
        let range = Range::new(first.bin_id, last.bin_id + 1);
        let addresses: Vec<Address> = batch.iter().map(|d| d.address).collect();
        let mut window = BatchWindow::new(range, addresses.clone());

        self.ctx
            .outbox
            .send(
                self.priority,
                StreamMessage::OfferedBatch {
                    stream: self.stream.clone(),
                    range,
                    addresses,
                },
            )
            .await?;
        StatsCounters::incr(&self.ctx.stats.batches_offered);
        StatsCounters::add(&self.ctx.stats.chunks_offered, batch.len() as u64);

        let bitmask = loop {
            let want = tokio::select! {
                biased;
                _ = self.cancel.wait() => return Ok(false),
                _ = self.session.wait() => return Ok(false),
                want = self.wants.recv() => want,
            };
            match want {
                Some((want_range, bitmask)) if want_range == range => break bitmask,
                Some((stale, _)) => {
                    debug!(peer = %self.ctx.peer, stream = %self.stream, %stale, "stale want ignored");
                }
                None => return Ok(false),
            }
        };

        if !window.apply_wanted(bitmask) {
            return Err(SyncError::InvalidMessage(format!(
                "want bitmask does not fit window {}",
                range
            )));
        }

        for address in window.wanted_addresses() {
            match self.ctx.store.get(&address).await? {
                Some(chunk) => {
                    let (address, data) = chunk.into_parts();
                    self.ctx
                        .outbox
                        .send(
                            self.priority,
                            StreamMessage::ChunkDelivery {
                                origin: DeliveryOrigin::Sync(self.stream.clone()),
                                address,
                                data,
                            },
                        )
                        .await?;
                    StatsCounters::incr(&self.ctx.stats.chunks_delivered);
                }
                None => {
                    warn!(peer = %self.ctx.peer, stream = %self.stream, %address, "wanted chunk vanished");
                }
            }
        }
        Ok(true)
    }
}
