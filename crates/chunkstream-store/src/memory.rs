//! In-memory implementations of the store traits.
//!
//! [`MemoryChunkStore`] has the full semantics the protocol relies on,
//! including live pull subscriptions, but keeps everything in memory with no
//! persistence.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use chunkstream_core::{proximity, Address, Chunk, Descriptor, MAX_PO};

use crate::error::{Result, StoreError};
use crate::traits::{ChunkStore, PullSubscription, PutMode, PutResult, StateStore};

/// Descriptors buffered between a pull feeder and its consumer.
const PULL_BUFFER: usize = 64;

/// In-memory chunk store.
///
/// Thread-safe via RwLock. A watch channel wakes live pull subscriptions
/// whenever a new descriptor is indexed.
pub struct MemoryChunkStore {
    base: Address,
    inner: Arc<RwLock<ChunkIndex>>,
    updates: watch::Sender<u64>,
}

struct ChunkIndex {
    /// Chunks indexed by address.
    chunks: HashMap<Address, StoredChunk>,

    /// Pull index per bin: bin_id -> address.
    bins: Vec<BTreeMap<u64, Address>>,

    /// Last assigned bin id per bin.
    last_ids: Vec<u64>,
}

struct StoredChunk {
    chunk: Chunk,
    bin: u8,
    bin_id: u64,
    mode: PutMode,
}

impl MemoryChunkStore {
    /// Create an empty store measuring proximity from `base`.
    pub fn new(base: Address) -> Self {
        let bins = MAX_PO as usize + 1;
        let (updates, _) = watch::channel(0);
        Self {
            base,
            inner: Arc::new(RwLock::new(ChunkIndex {
                chunks: HashMap::new(),
                bins: vec![BTreeMap::new(); bins],
                last_ids: vec![0; bins],
            })),
            updates,
        }
    }

    /// Number of chunks held.
    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.chunks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mode the chunk was first stored with.
    pub fn put_mode(&self, address: &Address) -> Option<PutMode> {
        let inner = self.inner.read().ok()?;
        inner.chunks.get(address).map(|s| s.mode)
    }

    /// Addresses in a bin, in pull order.
    pub fn bin_addresses(&self, bin: u8) -> Vec<Address> {
        match self.inner.read() {
            Ok(inner) => inner
                .bins
                .get(bin as usize)
                .map(|b| b.values().copied().collect())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    fn base_address(&self) -> Address {
        self.base
    }

    async fn has(&self, address: &Address) -> Result<bool> {
        let inner = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(inner.chunks.contains_key(address))
    }

    async fn get(&self, address: &Address) -> Result<Option<Chunk>> {
        let inner = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(inner.chunks.get(address).map(|s| s.chunk.clone()))
    }

    async fn put(&self, mode: PutMode, chunk: Chunk) -> Result<PutResult> {
        chunk.verify()?;
        let address = *chunk.address();
        let bin = proximity(self.base.as_bytes(), address.as_bytes());

        let bin_id = {
            let mut inner = self.inner.write().map_err(|_| StoreError::Poisoned)?;
            if inner.chunks.contains_key(&address) {
                return Ok(PutResult::AlreadyExists);
            }

            let idx = bin as usize;
            inner.last_ids[idx] += 1;
            let bin_id = inner.last_ids[idx];
            inner.bins[idx].insert(bin_id, address);
            inner.chunks.insert(
                address,
                StoredChunk {
                    chunk,
                    bin,
                    bin_id,
                    mode,
                },
            );
            bin_id
        };

        tracing::trace!(%address, bin, bin_id, ?mode, "chunk stored");
        self.updates.send_modify(|v| *v += 1);
        Ok(PutResult::Stored)
    }

    async fn delete(&self, address: &Address) -> Result<bool> {
        let mut inner = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        match inner.chunks.remove(address) {
            Some(stored) => {
                inner.bins[stored.bin as usize].remove(&stored.bin_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn last_bin_id(&self, bin: u8) -> Result<u64> {
        let inner = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(inner.last_ids.get(bin as usize).copied().unwrap_or(0))
    }

    fn subscribe_pull(&self, bin: u8, since: u64, until: Option<u64>) -> PullSubscription {
        let (tx, rx) = mpsc::channel(PULL_BUFFER);
        let inner = Arc::clone(&self.inner);
        let mut updates = self.updates.subscribe();
        let idx = bin as usize;

        tokio::spawn(async move {
            let mut last = since;
            let upper = until.unwrap_or(u64::MAX);
            loop {
                // Mark the current version seen before reading, so an insert
                // racing with the read still wakes us below.
                updates.borrow_and_update();

                let (batch, bin_last) = {
                    let Ok(inner) = inner.read() else { return };
                    let Some(index) = inner.bins.get(idx) else { return };
                    let batch: Vec<Descriptor> = if last >= upper {
                        Vec::new()
                    } else {
                        index
                            .range(last + 1..=upper)
                            .take(PULL_BUFFER)
                            .map(|(&bin_id, &address)| Descriptor { address, bin_id })
                            .collect()
                    };
                    (batch, inner.last_ids[idx])
                };

                let read = batch.len();
                for descriptor in batch {
                    last = descriptor.bin_id;
                    if tx.send(descriptor).await.is_err() {
                        return;
                    }
                }

                if let Some(until) = until {
                    // Deleted entries leave holes, so compare against the
                    // bin's counter rather than waiting for `until` itself.
                    if last >= until || (read == 0 && bin_last >= until) {
                        return;
                    }
                }
                if read > 0 {
                    continue;
                }

                tokio::select! {
                    changed = updates.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = tx.closed() => return,
                }
            }
        });

        PullSubscription::new(rx)
    }
}

/// In-memory state store.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(inner.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        inner.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        inner.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn chunk(i: u32) -> Chunk {
        Chunk::new(format!("chunk payload {}", i).into_bytes()).unwrap()
    }

    async fn fill(store: &MemoryChunkStore, n: u32) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        for i in 0..n {
            let c = chunk(i);
            store.put(PutMode::Upload, c.clone()).await.unwrap();
            chunks.push(c);
        }
        chunks
    }

    fn fullest_bin(store: &MemoryChunkStore) -> u8 {
        (0..=MAX_PO)
            .max_by_key(|b| store.bin_addresses(*b).len())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let store = MemoryChunkStore::new(Address::ZERO);
        let c = chunk(1);

        let r1 = store.put(PutMode::Upload, c.clone()).await.unwrap();
        assert_eq!(r1, PutResult::Stored);
        let r2 = store.put(PutMode::Sync, c.clone()).await.unwrap();
        assert_eq!(r2, PutResult::AlreadyExists);

        let bin = store.bin_of(c.address());
        assert_eq!(store.last_bin_id(bin).await.unwrap(), 1);
        assert_eq!(store.put_mode(c.address()), Some(PutMode::Upload));
    }

    #[tokio::test]
    async fn test_put_rejects_corrupt_chunk() {
        let store = MemoryChunkStore::new(Address::ZERO);
        let bad = Chunk::with_address(Address::of(b"x"), &b"y"[..]);
        assert!(matches!(
            store.put(PutMode::Sync, bad).await,
            Err(StoreError::InvalidChunk(_))
        ));
    }

    #[tokio::test]
    async fn test_get_has_delete() {
        let store = MemoryChunkStore::new(Address::ZERO);
        let c = chunk(7);
        store.put(PutMode::Upload, c.clone()).await.unwrap();

        assert!(store.has(c.address()).await.unwrap());
        assert_eq!(store.get(c.address()).await.unwrap(), Some(c.clone()));
        assert!(store.delete(c.address()).await.unwrap());
        assert!(!store.has(c.address()).await.unwrap());
        assert!(!store.delete(c.address()).await.unwrap());
    }

    #[tokio::test]
    async fn test_bounded_pull_is_ordered_and_ends() {
        let store = MemoryChunkStore::new(Address::ZERO);
        fill(&store, 40).await;
        let bin = fullest_bin(&store);
        let expected = store.bin_addresses(bin);
        let until = store.last_bin_id(bin).await.unwrap();

        let mut pull = store.subscribe_pull(bin, 0, Some(until));
        let mut got = Vec::new();
        let mut last_id = 0;
        while let Some(d) = pull.next().await {
            assert!(d.bin_id > last_id);
            last_id = d.bin_id;
            got.push(d.address);
        }
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_pull_since_skips_prefix() {
        let store = MemoryChunkStore::new(Address::ZERO);
        fill(&store, 20).await;
        let bin = fullest_bin(&store);
        let until = store.last_bin_id(bin).await.unwrap();

        let mut pull = store.subscribe_pull(bin, 1, Some(until));
        let first = pull.next().await.unwrap();
        assert_eq!(first.bin_id, 2);
    }

    #[tokio::test]
    async fn test_bounded_pull_ends_despite_deleted_tail() {
        let store = MemoryChunkStore::new(Address::ZERO);
        fill(&store, 10).await;
        let bin = fullest_bin(&store);
        let addrs = store.bin_addresses(bin);
        let until = store.last_bin_id(bin).await.unwrap();
        store.delete(addrs.last().unwrap()).await.unwrap();

        let mut pull = store.subscribe_pull(bin, 0, Some(until));
        let mut n = 0;
        let drained = tokio::time::timeout(Duration::from_secs(2), async {
            while pull.next().await.is_some() {
                n += 1;
            }
        })
        .await;
        assert!(drained.is_ok());
        assert_eq!(n, addrs.len() - 1);
    }

    #[tokio::test]
    async fn test_live_pull_wakes_on_new_chunk() {
        let store = Arc::new(MemoryChunkStore::new(Address::ZERO));
        let first = chunk(0);
        let bin = store.bin_of(first.address());

        let mut pull = store.subscribe_pull(bin, 0, None);
        let waiter = tokio::spawn(async move { pull.next().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.put(PutMode::Upload, first.clone()).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&got.address, first.address());
        assert_eq!(got.bin_id, 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn pull_resumes_after_since_in_order(n in 1u32..48, since in 0u64..24) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let (ids, last) = rt.block_on(async {
                let store = MemoryChunkStore::new(Address::ZERO);
                fill(&store, n).await;
                let bin = fullest_bin(&store);
                let last = store.last_bin_id(bin).await.unwrap();

                let mut pull = store.subscribe_pull(bin, since, Some(last));
                let mut ids = Vec::new();
                while let Some(d) = pull.next().await {
                    ids.push(d.bin_id);
                }
                (ids, last)
            });

            prop_assert!(ids.windows(2).all(|w| w[0] < w[1]));
            prop_assert!(ids.iter().all(|id| *id > since && *id <= last));
            prop_assert_eq!(ids.len() as u64, last.saturating_sub(since));
        }
    }

    #[tokio::test]
    async fn test_state_store_roundtrip() {
        let state = MemoryStateStore::new();
        assert_eq!(state.get("k").await.unwrap(), None);
        state.put("k", b"v1").await.unwrap();
        state.put("k", b"v2").await.unwrap();
        assert_eq!(state.get("k").await.unwrap(), Some(b"v2".to_vec()));
        state.delete("k").await.unwrap();
        assert_eq!(state.get("k").await.unwrap(), None);
    }
}
