//! Property tests over the pure building blocks.

use proptest::prelude::*;

use chunkstream_core::{split_into_chunks, CHUNK_SIZE};
use chunkstream_sync::cursor_key;
use chunkstream_testkit::generators::{blob, node_id, sync_stream};

proptest! {
    #[test]
    fn cursor_keys_differ_per_peer(a in node_id(), b in node_id(), stream in sync_stream()) {
        prop_assume!(a != b);
        prop_assert_ne!(cursor_key(&a, &stream), cursor_key(&b, &stream));
    }

    #[test]
    fn cursor_keys_differ_per_stream(peer in node_id(), s in sync_stream(), t in sync_stream()) {
        prop_assume!(s != t);
        prop_assert_ne!(cursor_key(&peer, &s), cursor_key(&peer, &t));
    }

    #[test]
    fn chunks_reassemble_to_the_blob(data in blob(4)) {
        let chunks = split_into_chunks(&data);
        prop_assert_eq!(chunks.len(), data.len().div_ceil(CHUNK_SIZE));

        let mut joined = Vec::with_capacity(data.len());
        for chunk in &chunks {
            prop_assert!(chunk.data().len() <= CHUNK_SIZE);
            prop_assert!(chunk.verify().is_ok());
            joined.extend_from_slice(chunk.data());
        }
        prop_assert_eq!(joined, data);
    }
}
