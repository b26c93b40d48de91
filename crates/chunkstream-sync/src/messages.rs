//! Stream protocol message types.
//!
//! These messages are exchanged over one peer connection to negotiate
//! subscriptions, offer and request chunks, and serve retrievals. On the
//! wire every message is a single CBOR value.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use chunkstream_core::{Address, NodeId, Priority, Range, Stream, CHUNK_SIZE};

use crate::error::{Result, SyncError};

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Message size limits.
pub mod limits {
    /// Max addresses in one OfferedBatch.
    pub const MAX_BATCH_SIZE: usize = 128;
    /// Max bytes of a WantedBitmask.
    pub const MAX_BITMASK_BYTES: usize = MAX_BATCH_SIZE.div_ceil(8);
    /// Max payload bytes in one ChunkDelivery.
    pub const MAX_PAYLOAD: usize = chunkstream_core::CHUNK_SIZE;
    /// Max length of a stream name or key.
    pub const MAX_STREAM_FIELD: usize = 64;
    /// Max length of an error message string.
    pub const MAX_ERROR_MESSAGE: usize = 1024;
}

/// Stream protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamMessage {
    /// First message on every connection, in both directions.
    Handshake {
        /// Sender's identity.
        node_id: NodeId,
        /// Sender's protocol version.
        version: u32,
    },

    /// Ask the remote to serve a stream over a range.
    SubscribeRequest {
        stream: Stream,
        range: Range,
        priority: Priority,
    },

    /// Answer to a SubscribeRequest. `rejection` is None on acceptance.
    SubscribeResult {
        stream: Stream,
        rejection: Option<Rejection>,
    },

    /// Stop serving a stream.
    UnsubscribeRequest { stream: Stream },

    /// Addresses of the chunks in a contiguous bin-id window.
    OfferedBatch {
        stream: Stream,
        range: Range,
        addresses: Vec<Address>,
    },

    /// Which of the offered addresses the client wants. Bit i covers
    /// `addresses[i]`, least significant bit first.
    WantedBitmask {
        stream: Stream,
        range: Range,
        bitmask: Vec<u8>,
    },

    /// A chunk payload.
    ChunkDelivery {
        origin: DeliveryOrigin,
        address: Address,
        data: Bytes,
    },

    /// Ask a peer for a single chunk.
    RetrieveRequest { address: Address },

    /// The peer does not have the requested chunk.
    RetrieveNotFound { address: Address },

    /// A bounded history stream is exhausted.
    SubscriptionEnded { stream: Stream },
}

/// What a ChunkDelivery answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryOrigin {
    Retrieval,
    Sync(Stream),
}

/// Why a subscription was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub code: SyncErrorCode,
    pub message: String,
}

impl Rejection {
    pub fn new(code: SyncErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl StreamMessage {
    /// Short name of the message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamMessage::Handshake { .. } => "handshake",
            StreamMessage::SubscribeRequest { .. } => "subscribe_request",
            StreamMessage::SubscribeResult { .. } => "subscribe_result",
            StreamMessage::UnsubscribeRequest { .. } => "unsubscribe_request",
            StreamMessage::OfferedBatch { .. } => "offered_batch",
            StreamMessage::WantedBitmask { .. } => "wanted_bitmask",
            StreamMessage::ChunkDelivery { .. } => "chunk_delivery",
            StreamMessage::RetrieveRequest { .. } => "retrieve_request",
            StreamMessage::RetrieveNotFound { .. } => "retrieve_not_found",
            StreamMessage::SubscriptionEnded { .. } => "subscription_ended",
        }
    }

    /// The sync stream a message belongs to, if any.
    pub fn stream(&self) -> Option<&Stream> {
        match self {
            StreamMessage::SubscribeRequest { stream, .. }
            | StreamMessage::SubscribeResult { stream, .. }
            | StreamMessage::UnsubscribeRequest { stream }
            | StreamMessage::OfferedBatch { stream, .. }
            | StreamMessage::WantedBitmask { stream, .. }
            | StreamMessage::SubscriptionEnded { stream }
            | StreamMessage::ChunkDelivery {
                origin: DeliveryOrigin::Sync(stream),
                ..
            } => Some(stream),
            StreamMessage::Handshake { .. }
            | StreamMessage::ChunkDelivery {
                origin: DeliveryOrigin::Retrieval,
                ..
            }
            | StreamMessage::RetrieveRequest { .. }
            | StreamMessage::RetrieveNotFound { .. } => None,
        }
    }

    /// Check if this message respects size limits.
    pub fn validate_limits(&self) -> std::result::Result<(), &'static str> {
        match self {
            StreamMessage::Handshake { .. } => {}
            StreamMessage::SubscribeRequest { stream, range, .. } => {
                check_stream(stream)?;
                if !range.is_unbounded() && range.to < range.from {
                    return Err("inverted range");
                }
            }
            StreamMessage::SubscribeResult { stream, rejection } => {
                check_stream(stream)?;
                if let Some(rejection) = rejection {
                    if rejection.message.len() > limits::MAX_ERROR_MESSAGE {
                        return Err("rejection message too long");
                    }
                }
            }
            StreamMessage::UnsubscribeRequest { stream }
            | StreamMessage::SubscriptionEnded { stream } => check_stream(stream)?,
            StreamMessage::OfferedBatch {
                stream,
                range,
                addresses,
            } => {
                check_stream(stream)?;
                if addresses.is_empty() {
                    return Err("empty batch");
                }
                if addresses.len() > limits::MAX_BATCH_SIZE {
                    return Err("too many addresses in batch");
                }
                match range.len() {
                    Some(len) if len >= addresses.len() as u64 => {}
                    _ => return Err("batch range does not cover its addresses"),
                }
            }
            StreamMessage::WantedBitmask { stream, bitmask, .. } => {
                check_stream(stream)?;
                if bitmask.len() > limits::MAX_BITMASK_BYTES {
                    return Err("bitmask too long");
                }
            }
            StreamMessage::ChunkDelivery { origin, data, .. } => {
                if let DeliveryOrigin::Sync(stream) = origin {
                    check_stream(stream)?;
                }
                if data.len() > limits::MAX_PAYLOAD {
                    return Err("payload too large");
                }
            }
            StreamMessage::RetrieveRequest { .. } | StreamMessage::RetrieveNotFound { .. } => {}
        }
        Ok(())
    }

    /// Encode as CBOR.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = Vec::with_capacity(64);
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| SyncError::InvalidMessage(format!("encode: {}", e)))?;
        Ok(Bytes::from(buf))
    }

    /// Decode from CBOR.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| SyncError::InvalidMessage(format!("decode: {}", e)))
    }
}

fn check_stream(stream: &Stream) -> std::result::Result<(), &'static str> {
    if stream.name.len() > limits::MAX_STREAM_FIELD || stream.key.len() > limits::MAX_STREAM_FIELD {
        return Err("stream identifier too long");
    }
    Ok(())
}

/// Error codes for the stream protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum SyncErrorCode {
    /// Unknown/unspecified error.
    Unknown = 0,
    /// Protocol version mismatch.
    VersionMismatch = 1,
    /// Message too large.
    MessageTooLarge = 2,
    /// Invalid message format.
    InvalidMessage = 3,
    /// Stream name or key not served.
    UnknownStream = 4,
    /// The stream is already being served to this peer.
    AlreadySubscribed = 5,
    /// Internal error on peer.
    InternalError = 6,
}

const _: () = assert!(limits::MAX_PAYLOAD == CHUNK_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(n: usize, range: Range) -> StreamMessage {
        StreamMessage::OfferedBatch {
            stream: Stream::sync(3, true),
            range,
            addresses: (0..n).map(|i| Address::of(&[i as u8])).collect(),
        }
    }

    #[test]
    fn test_message_limits_valid() {
        let msg = StreamMessage::Handshake {
            node_id: NodeId::from_bytes([0u8; 32]),
            version: PROTOCOL_VERSION,
        };
        assert!(msg.validate_limits().is_ok());
        assert!(offer(4, Range::new(1, 5)).validate_limits().is_ok());
    }

    #[test]
    fn test_offer_limits() {
        assert!(offer(0, Range::new(1, 5)).validate_limits().is_err());
        assert!(offer(limits::MAX_BATCH_SIZE + 1, Range::new(1, 1000))
            .validate_limits()
            .is_err());
        // A window shorter than its address list is malformed.
        assert!(offer(4, Range::new(1, 3)).validate_limits().is_err());
        // Holes in the bin-id sequence are fine.
        assert!(offer(2, Range::new(1, 9)).validate_limits().is_ok());
    }

    #[test]
    fn test_payload_limit() {
        let msg = StreamMessage::ChunkDelivery {
            origin: DeliveryOrigin::Retrieval,
            address: Address::ZERO,
            data: Bytes::from(vec![0u8; CHUNK_SIZE + 1]),
        };
        assert!(msg.validate_limits().is_err());
    }

    #[test]
    fn test_bitmask_limit() {
        let msg = StreamMessage::WantedBitmask {
            stream: Stream::sync(0, false),
            range: Range::new(1, 2),
            bitmask: vec![0xff; limits::MAX_BITMASK_BYTES + 1],
        };
        assert!(msg.validate_limits().is_err());
    }

    #[test]
    fn test_cbor_encoding() {
        let msg = StreamMessage::ChunkDelivery {
            origin: DeliveryOrigin::Sync(Stream::sync(7, false)),
            address: Address::of(b"payload"),
            data: Bytes::from_static(b"payload"),
        };
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(StreamMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let err = StreamMessage::from_bytes(&[0xff, 0x00, 0x13]).unwrap_err();
        assert!(matches!(err, SyncError::InvalidMessage(_)));
    }
}
