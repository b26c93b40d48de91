//! Transport abstraction for the stream protocol.
//!
//! A [`Connection`] is one bidirectional, ordered, reliable message pipe to
//! a single peer. The transport decides how messages travel; sessions only
//! see [`StreamMessage`] values. Implementations may use QUIC, TCP or
//! anything else that frames CBOR values.

use async_trait::async_trait;

use chunkstream_core::NodeId;

use crate::error::Result;
use crate::messages::StreamMessage;

/// Outgoing half of a connection.
#[async_trait]
pub trait MessageSink: Send {
    /// Send one message. Fails once the connection is gone.
    async fn send(&mut self, message: StreamMessage) -> Result<()>;
}

/// Incoming half of a connection.
#[async_trait]
pub trait MessageSource: Send {
    /// Receive the next message.
    ///
    /// Returns `Ok(None)` when the remote closed the connection.
    async fn recv(&mut self) -> Result<Option<StreamMessage>>;
}

/// A connection to one remote node.
pub struct Connection {
    /// The remote node.
    pub peer: NodeId,
    pub sink: Box<dyn MessageSink>,
    pub source: Box<dyn MessageSource>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("peer", &self.peer).finish()
    }
}

/// A simple in-memory transport for testing and simulation.
///
/// Each link is a pair of bounded channels carrying CBOR-encoded messages,
/// so encoding bugs surface the same way they would on a real wire.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;
    use tokio::sync::{broadcast, mpsc, watch};

    use crate::error::SyncError;

    /// Default per-direction buffer of a link, in messages.
    pub const DEFAULT_LINK_CAPACITY: usize = 1024;

    /// Link lifecycle notifications.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum LinkEvent {
        Connected { a: NodeId, b: NodeId },
        /// `node` saw its connection to `peer` go away.
        Disconnected { node: NodeId, peer: NodeId },
    }

    type LinkKey = (NodeId, NodeId);

    fn link_key(a: NodeId, b: NodeId) -> LinkKey {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    /// Shared state for the memory transport network.
    pub struct MemoryNetwork {
        /// Severance flag per live link.
        links: Mutex<HashMap<LinkKey, Arc<watch::Sender<bool>>>>,
        events: broadcast::Sender<LinkEvent>,
        capacity: usize,
    }

    impl MemoryNetwork {
        /// Create a new memory network.
        pub fn new() -> Arc<Self> {
            Self::with_capacity(DEFAULT_LINK_CAPACITY)
        }

        pub fn with_capacity(capacity: usize) -> Arc<Self> {
            let (events, _) = broadcast::channel(256);
            Arc::new(Self {
                links: Mutex::new(HashMap::new()),
                events,
                capacity,
            })
        }

        /// Subscribe to link events.
        pub fn events(&self) -> broadcast::Receiver<LinkEvent> {
            self.events.subscribe()
        }

        /// Number of live links.
        pub fn link_count(&self) -> usize {
            self.links.lock().map(|links| links.len()).unwrap_or(0)
        }

        /// Create a link between `a` and `b`.
        ///
        /// Returns `a`'s end first. Linking an already linked pair severs the
        /// old link.
        pub fn connect(&self, a: NodeId, b: NodeId) -> (Connection, Connection) {
            let (severed, _) = watch::channel(false);
            let severed = Arc::new(severed);

            if let Ok(mut links) = self.links.lock() {
                if let Some(old) = links.insert(link_key(a, b), severed.clone()) {
                    old.send_replace(true);
                }
            }

            let (a_to_b, b_from_a) = mpsc::channel(self.capacity);
            let (b_to_a, a_from_b) = mpsc::channel(self.capacity);

            let end_a = Connection {
                peer: b,
                sink: Box::new(MemorySink {
                    tx: a_to_b,
                    severed: severed.clone(),
                }),
                source: Box::new(MemorySource {
                    node: a,
                    peer: b,
                    rx: a_from_b,
                    severed: severed.clone(),
                    events: self.events.clone(),
                    ended: false,
                }),
            };
            let end_b = Connection {
                peer: a,
                sink: Box::new(MemorySink {
                    tx: b_to_a,
                    severed: severed.clone(),
                }),
                source: Box::new(MemorySource {
                    node: b,
                    peer: a,
                    rx: b_from_a,
                    severed,
                    events: self.events.clone(),
                    ended: false,
                }),
            };

            let _ = self.events.send(LinkEvent::Connected { a, b });
            (end_a, end_b)
        }

        /// Sever the link between `a` and `b`, as a network fault would.
        ///
        /// Returns false if there was no such link.
        pub fn disconnect(&self, a: NodeId, b: NodeId) -> bool {
            let link = match self.links.lock() {
                Ok(mut links) => links.remove(&link_key(a, b)),
                Err(_) => None,
            };
            match link {
                Some(severed) => {
                    severed.send_replace(true);
                    true
                }
                None => false,
            }
        }
    }

    struct MemorySink {
        tx: mpsc::Sender<Bytes>,
        severed: Arc<watch::Sender<bool>>,
    }

    #[async_trait]
    impl MessageSink for MemorySink {
        async fn send(&mut self, message: StreamMessage) -> Result<()> {
            if *self.severed.borrow() {
                return Err(SyncError::TransportError("link severed".into()));
            }
            let bytes = message.to_bytes()?;
            self.tx
                .send(bytes)
                .await
                .map_err(|_| SyncError::TransportError("peer disconnected".into()))
        }
    }

    struct MemorySource {
        node: NodeId,
        peer: NodeId,
        rx: mpsc::Receiver<Bytes>,
        severed: Arc<watch::Sender<bool>>,
        events: broadcast::Sender<LinkEvent>,
        ended: bool,
    }

    impl MemorySource {
        fn end(&mut self) {
            if !self.ended {
                self.ended = true;
                let _ = self.events.send(LinkEvent::Disconnected {
                    node: self.node,
                    peer: self.peer,
                });
            }
        }
    }

    #[async_trait]
    impl MessageSource for MemorySource {
        async fn recv(&mut self) -> Result<Option<StreamMessage>> {
            if self.ended {
                return Ok(None);
            }
            let mut severed = self.severed.subscribe();
            let received = tokio::select! {
                biased;
                _ = severed.wait_for(|cut| *cut) => None,
                bytes = self.rx.recv() => bytes,
            };
            match received {
                Some(bytes) => StreamMessage::from_bytes(&bytes).map(Some),
                None => {
                    self.end();
                    Ok(None)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::{LinkEvent, MemoryNetwork};
    use super::*;
    use crate::messages::PROTOCOL_VERSION;

    #[tokio::test]
    async fn test_memory_link_send_recv() {
        let network = MemoryNetwork::new();

        let node_a = NodeId::from_bytes([0xAA; 32]);
        let node_b = NodeId::from_bytes([0xBB; 32]);

        let (mut a, mut b) = network.connect(node_a, node_b);
        assert_eq!(a.peer, node_b);
        assert_eq!(b.peer, node_a);

        let msg = StreamMessage::Handshake {
            node_id: node_a,
            version: PROTOCOL_VERSION,
        };
        a.sink.send(msg.clone()).await.unwrap();

        let received = b.source.recv().await.unwrap();
        assert_eq!(received, Some(msg));
    }

    #[tokio::test]
    async fn test_dropped_sink_closes_source() {
        let network = MemoryNetwork::new();
        let node_a = NodeId::from_bytes([0xAA; 32]);
        let node_b = NodeId::from_bytes([0xBB; 32]);
        let mut events = network.events();

        let (a, mut b) = network.connect(node_a, node_b);
        drop(a);

        assert_eq!(b.source.recv().await.unwrap(), None);
        assert_eq!(
            events.recv().await.unwrap(),
            LinkEvent::Connected {
                a: node_a,
                b: node_b
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            LinkEvent::Disconnected {
                node: node_b,
                peer: node_a
            }
        );
    }

    #[tokio::test]
    async fn test_disconnect_severs_both_directions() {
        let network = MemoryNetwork::new();
        let node_a = NodeId::from_bytes([0xAA; 32]);
        let node_b = NodeId::from_bytes([0xBB; 32]);

        let (mut a, mut b) = network.connect(node_a, node_b);
        assert_eq!(network.link_count(), 1);
        assert!(network.disconnect(node_b, node_a));
        assert!(!network.disconnect(node_a, node_b));
        assert_eq!(network.link_count(), 0);

        assert_eq!(a.source.recv().await.unwrap(), None);
        assert_eq!(b.source.recv().await.unwrap(), None);
        let msg = StreamMessage::RetrieveRequest {
            address: chunkstream_core::Address::ZERO,
        };
        assert!(a.sink.send(msg).await.is_err());
    }
}
