//! Persisted sync progress.
//!
//! For each (peer, stream) we keep a cursor: the next bin id to ask the
//! peer for. It only moves forward, and only past windows that were fully
//! received, so a restart resumes without gaps.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::trace;

use chunkstream_core::{NodeId, Stream};
use chunkstream_store::{StateStore, StoreError};

use crate::error::Result;

/// State-store key of a cursor.
pub fn cursor_key(peer: &NodeId, stream: &Stream) -> String {
    let mode = if stream.live { "l" } else { "h" };
    format!("cursor:{}:{}:{}:{}", peer.to_hex(), stream.name, stream.key, mode)
}

/// Cursor bookkeeping on top of a [`StateStore`].
pub struct IntervalStore {
    state: Arc<dyn StateStore>,
    /// Serializes read-modify-write cycles.
    write: Mutex<()>,
}

impl IntervalStore {
    pub fn new(state: Arc<dyn StateStore>) -> Self {
        Self {
            state,
            write: Mutex::new(()),
        }
    }

    /// The persisted cursor, or 0 if nothing was recorded.
    pub async fn cursor(&self, peer: &NodeId, stream: &Stream) -> Result<u64> {
        let key = cursor_key(peer, stream);
        match self.state.get(&key).await? {
            Some(bytes) => decode(&bytes),
            None => Ok(0),
        }
    }

    /// Move the cursor forward to `to`.
    ///
    /// Never moves it backward. Returns whether it moved.
    pub async fn advance(&self, peer: &NodeId, stream: &Stream, to: u64) -> Result<bool> {
        let _guard = self.write.lock().await;
        let current = self.cursor(peer, stream).await?;
        if to <= current {
            return Ok(false);
        }
        self.state
            .put(&cursor_key(peer, stream), &to.to_be_bytes())
            .await?;
        trace!(%peer, %stream, from = current, to, "cursor advanced");
        Ok(true)
    }

    /// Forget the cursor.
    pub async fn reset(&self, peer: &NodeId, stream: &Stream) -> Result<()> {
        let _guard = self.write.lock().await;
        self.state.delete(&cursor_key(peer, stream)).await?;
        Ok(())
    }
}

fn decode(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| {
        StoreError::InvalidData(format!("cursor has {} bytes, expected 8", bytes.len()))
    })?;
    Ok(u64::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkstream_store::{MemoryStateStore, SqliteStateStore};

    fn peer() -> NodeId {
        NodeId::from_bytes([0x11; 32])
    }

    #[test]
    fn test_cursor_key_format() {
        let key = cursor_key(&peer(), &Stream::sync(10, true));
        assert_eq!(key, format!("cursor:{}:SYNC:a:l", "11".repeat(32)));
        let key = cursor_key(&peer(), &Stream::sync(10, false));
        assert!(key.ends_with(":SYNC:a:h"));
    }

    #[tokio::test]
    async fn test_cursor_is_monotonic() {
        let intervals = IntervalStore::new(Arc::new(MemoryStateStore::new()));
        let stream = Stream::sync(2, true);

        assert_eq!(intervals.cursor(&peer(), &stream).await.unwrap(), 0);
        assert!(intervals.advance(&peer(), &stream, 17).await.unwrap());
        assert!(!intervals.advance(&peer(), &stream, 9).await.unwrap());
        assert!(!intervals.advance(&peer(), &stream, 17).await.unwrap());
        assert_eq!(intervals.cursor(&peer(), &stream).await.unwrap(), 17);

        // Live and history cursors are independent.
        assert_eq!(
            intervals
                .cursor(&peer(), &Stream::sync(2, false))
                .await
                .unwrap(),
            0
        );

        intervals.reset(&peer(), &stream).await.unwrap();
        assert_eq!(intervals.cursor(&peer(), &stream).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_cursor_is_an_error() {
        let state = Arc::new(MemoryStateStore::new());
        let stream = Stream::sync(0, false);
        state.put(&cursor_key(&peer(), &stream), b"abc").await.unwrap();

        let intervals = IntervalStore::new(state);
        assert!(intervals.cursor(&peer(), &stream).await.is_err());
    }

    #[tokio::test]
    async fn test_cursor_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let stream = Stream::sync(5, true);

        {
            let intervals = IntervalStore::new(Arc::new(SqliteStateStore::open(&path).unwrap()));
            intervals.advance(&peer(), &stream, 42).await.unwrap();
        }

        let intervals = IntervalStore::new(Arc::new(SqliteStateStore::open(&path).unwrap()));
        assert_eq!(intervals.cursor(&peer(), &stream).await.unwrap(), 42);
    }
}
