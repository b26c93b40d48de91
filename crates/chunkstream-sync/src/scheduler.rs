//! Priority lanes for outbound messages.
//!
//! Every session owns three bounded queues, one per [`Priority`]. A single
//! writer task drains them into the connection, always taking from the
//! highest non-empty lane, so control traffic and retrievals overtake bulk
//! history backfill. Within a lane the writer rotates between streams, one
//! message each, so a burst from one subscription does not hold back the
//! others. Messages of one stream keep their order.

use std::collections::VecDeque;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace, warn};

use chunkstream_core::{NodeId, Priority, Stream};

use crate::error::{Result, SyncError};
use crate::messages::StreamMessage;
use crate::shutdown::ShutdownSignal;
use crate::transport::MessageSink;

/// Producer handle for a session's lanes.
#[derive(Debug, Clone)]
pub struct Outbox {
    lanes: [mpsc::Sender<StreamMessage>; 3],
}

impl Outbox {
    /// Queue a message on the lane for `priority`.
    ///
    /// Waits while the lane is full. Fails once the writer is gone.
    pub async fn send(&self, priority: Priority, message: StreamMessage) -> Result<()> {
        self.lanes[priority.index()]
            .send(message)
            .await
            .map_err(|_| SyncError::Closed)
    }

    /// Queue a message without waiting.
    ///
    /// Used by the session reader. If the lane is full the message is handed
    /// to a task that waits for room, so the reader keeps receiving.
    pub fn post(&self, priority: Priority, message: StreamMessage) -> Result<()> {
        let lane = &self.lanes[priority.index()];
        match lane.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(SyncError::Closed),
            Err(TrySendError::Full(message)) => {
                trace!(kind = message.kind(), ?priority, "lane full, deferring");
                let lane = lane.clone();
                tokio::spawn(async move {
                    let _ = lane.send(message).await;
                });
                Ok(())
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lanes.iter().all(|lane| lane.is_closed())
    }
}

/// Messages taken off one lane, grouped by stream in rotation order.
#[derive(Debug, Default)]
struct Rotation {
    flows: VecDeque<(Option<Stream>, VecDeque<StreamMessage>)>,
    len: usize,
}

impl Rotation {
    fn push(&mut self, message: StreamMessage) {
        let key = message.stream().cloned();
        self.len += 1;
        match self.flows.iter_mut().find(|(k, _)| *k == key) {
            Some((_, queue)) => queue.push_back(message),
            None => self.flows.push_back((key, VecDeque::from([message]))),
        }
    }

    fn pop(&mut self) -> Option<StreamMessage> {
        let (key, mut queue) = self.flows.pop_front()?;
        let message = queue.pop_front()?;
        self.len -= 1;
        if !queue.is_empty() {
            self.flows.push_back((key, queue));
        }
        Some(message)
    }

    fn clear(&mut self) -> usize {
        let dropped = self.len;
        self.flows.clear();
        self.len = 0;
        dropped
    }
}

/// Consumer side of a session's lanes.
#[derive(Debug)]
pub struct Lanes {
    receivers: [mpsc::Receiver<StreamMessage>; 3],
    staged: [Rotation; 3],
    capacity: usize,
}

/// Create the lanes for one session, each holding `capacity` messages.
pub fn lanes(capacity: usize) -> (Outbox, Lanes) {
    let capacity = capacity.max(1);
    let (low_tx, low_rx) = mpsc::channel(capacity);
    let (mid_tx, mid_rx) = mpsc::channel(capacity);
    let (top_tx, top_rx) = mpsc::channel(capacity);
    (
        Outbox {
            lanes: [low_tx, mid_tx, top_tx],
        },
        Lanes {
            receivers: [low_rx, mid_rx, top_rx],
            staged: Default::default(),
            capacity,
        },
    )
}

impl Lanes {
    /// Next message: highest lane first, rotating between streams within it.
    ///
    /// Returns None once every producer is gone and the lanes are empty.
    pub async fn next(&mut self) -> Option<(Priority, StreamMessage)> {
        loop {
            self.stage_ready();
            for priority in Priority::DESCENDING {
                if let Some(message) = self.staged[priority.index()].pop() {
                    return Some((priority, message));
                }
            }

            let [low, mid, top] = &mut self.receivers;
            let (priority, message) = tokio::select! {
                biased;
                Some(message) = top.recv() => (Priority::Top, message),
                Some(message) = mid.recv() => (Priority::Mid, message),
                Some(message) = low.recv() => (Priority::Low, message),
                else => return None,
            };
            self.staged[priority.index()].push(message);
        }
    }

    /// Move whatever is already queued into the rotations, up to `capacity`
    /// per lane so backpressure still reaches the producers.
    fn stage_ready(&mut self) {
        for (receiver, rotation) in self.receivers.iter_mut().zip(self.staged.iter_mut()) {
            while rotation.len < self.capacity {
                match receiver.try_recv() {
                    Ok(message) => rotation.push(message),
                    Err(_) => break,
                }
            }
        }
    }

    /// Drop everything still queued. Returns how many messages were dropped.
    pub fn discard(&mut self) -> usize {
        let mut dropped = 0;
        for (lane, rotation) in self.receivers.iter_mut().zip(self.staged.iter_mut()) {
            lane.close();
            while lane.try_recv().is_ok() {
                dropped += 1;
            }
            dropped += rotation.clear();
        }
        dropped
    }
}

/// Drain `lanes` into `sink` until shutdown, transport failure, or every
/// producer hangs up.
pub async fn run_writer(
    peer: NodeId,
    mut lanes: Lanes,
    mut sink: Box<dyn MessageSink>,
    mut shutdown: ShutdownSignal,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            next = lanes.next() => next,
        };
        let Some((priority, message)) = next else {
            break;
        };
        let kind = message.kind();
        if let Err(e) = sink.send(message).await {
            warn!(%peer, kind, ?priority, error = %e, "send failed, stopping writer");
            break;
        }
    }

    let dropped = lanes.discard();
    if dropped > 0 {
        debug!(%peer, dropped, "discarded queued messages");
    }
}
