//! Protocol counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Live counters shared by every session of a registry.
#[derive(Debug, Default)]
pub struct StatsCounters {
    pub(crate) batches_offered: AtomicU64,
    pub(crate) chunks_offered: AtomicU64,
    pub(crate) chunks_delivered: AtomicU64,
    pub(crate) windows_received: AtomicU64,
    pub(crate) windows_completed: AtomicU64,
    pub(crate) windows_abandoned: AtomicU64,
    pub(crate) chunks_wanted: AtomicU64,
    pub(crate) chunks_synced: AtomicU64,
    pub(crate) chunks_duplicate: AtomicU64,
    pub(crate) corrupt_deliveries: AtomicU64,
    pub(crate) retrieve_requests_sent: AtomicU64,
    pub(crate) retrieve_requests_served: AtomicU64,
    pub(crate) retrieve_not_found: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    pub fn snapshot(&self) -> SyncStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        SyncStats {
            batches_offered: get(&self.batches_offered),
            chunks_offered: get(&self.chunks_offered),
            chunks_delivered: get(&self.chunks_delivered),
            windows_received: get(&self.windows_received),
            windows_completed: get(&self.windows_completed),
            windows_abandoned: get(&self.windows_abandoned),
            chunks_wanted: get(&self.chunks_wanted),
            chunks_synced: get(&self.chunks_synced),
            chunks_duplicate: get(&self.chunks_duplicate),
            corrupt_deliveries: get(&self.corrupt_deliveries),
            retrieve_requests_sent: get(&self.retrieve_requests_sent),
            retrieve_requests_served: get(&self.retrieve_requests_served),
            retrieve_not_found: get(&self.retrieve_not_found),
        }
    }
}

/// Point-in-time copy of the counters.
///
/// Server-side counters (offered, delivered, served) count what this node
/// sent; client-side counters count what it received.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub batches_offered: u64,
    pub chunks_offered: u64,
    pub chunks_delivered: u64,
    pub windows_received: u64,
    pub windows_completed: u64,
    pub windows_abandoned: u64,
    pub chunks_wanted: u64,
    /// Synced chunks that were new to the local store.
    pub chunks_synced: u64,
    pub chunks_duplicate: u64,
    pub corrupt_deliveries: u64,
    pub retrieve_requests_sent: u64,
    pub retrieve_requests_served: u64,
    pub retrieve_not_found: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = StatsCounters::default();
        StatsCounters::incr(&stats.batches_offered);
        StatsCounters::add(&stats.chunks_offered, 12);
        StatsCounters::incr(&stats.corrupt_deliveries);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.batches_offered, 1);
        assert_eq!(snapshot.chunks_offered, 12);
        assert_eq!(snapshot.corrupt_deliveries, 1);
        assert_eq!(snapshot.chunks_synced, 0);
    }
}
