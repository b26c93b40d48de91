//! Proptest generators for property-based testing.

use proptest::prelude::*;

use chunkstream_core::{Address, NodeId, Priority, Range, Stream, CHUNK_SIZE, MAX_PO};

/// Generate a random Address.
pub fn address() -> impl Strategy<Value = Address> {
    any::<[u8; 32]>().prop_map(Address::from_bytes)
}

/// Generate a random NodeId.
pub fn node_id() -> impl Strategy<Value = NodeId> {
    any::<[u8; 32]>().prop_map(NodeId::from_bytes)
}

/// Generate a valid proximity bin.
pub fn bin() -> impl Strategy<Value = u8> {
    0..=MAX_PO
}

/// Generate a SYNC stream, live or history.
pub fn sync_stream() -> impl Strategy<Value = Stream> {
    (bin(), any::<bool>()).prop_map(|(bin, live)| Stream::sync(bin, live))
}

/// Generate a Range; roughly one in four is unbounded.
pub fn range() -> impl Strategy<Value = Range> {
    prop_oneof![
        1 => (0u64..1_000).prop_map(|from| Range::new(from, 0)),
        3 => (0u64..1_000, 1u64..1_000).prop_map(|(from, len)| Range::new(from, from + len)),
    ]
}

pub fn priority() -> impl Strategy<Value = Priority> {
    prop_oneof![Just(Priority::Low), Just(Priority::Mid), Just(Priority::Top)]
}

/// Generate payload bytes of specified max length.
pub fn payload(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max_len)
}

/// Generate a blob spanning up to `max_chunks` chunks.
pub fn blob(max_chunks: usize) -> impl Strategy<Value = Vec<u8>> {
    payload(CHUNK_SIZE * max_chunks)
}

/// Deterministic blob unique to `(seed, index)`, for simulations that need
/// many distinct uploads.
pub fn seeded_blob(seed: u64, index: usize, len: usize) -> Vec<u8> {
    use rand::{RngCore, SeedableRng};

    let mut rng = rand::rngs::StdRng::seed_from_u64(seed.wrapping_mul(31).wrapping_add(index as u64));
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn ranges_are_well_formed(range in range()) {
            prop_assert!(range.is_unbounded() || range.to > range.from);
        }

        #[test]
        fn sync_streams_name_a_bin(stream in sync_stream()) {
            prop_assert!(stream.is_sync());
            prop_assert!(stream.sync_bin().unwrap() <= MAX_PO);
        }
    }

    #[test]
    fn test_seeded_blob_is_deterministic() {
        assert_eq!(seeded_blob(7, 1, 64), seeded_blob(7, 1, 64));
        assert_ne!(seeded_blob(7, 1, 64), seeded_blob(7, 2, 64));
    }
}
