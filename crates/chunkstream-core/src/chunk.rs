//! Chunks: the unit of storage and transfer.
//!
//! A chunk is a bounded payload identified by the Blake3 hash of its bytes.
//! Because the address is derived from the content, any party can check a
//! chunk it receives without trusting the sender.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::types::Address;

/// Maximum payload size of a single chunk.
pub const CHUNK_SIZE: usize = 4096;

/// A payload plus its content address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    address: Address,
    data: Bytes,
}

impl Chunk {
    /// Create a chunk, computing its address.
    pub fn new(data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        if data.len() > CHUNK_SIZE {
            return Err(CoreError::ChunkTooLarge {
                size: data.len(),
                max: CHUNK_SIZE,
            });
        }
        Ok(Self {
            address: Address::of(&data),
            data,
        })
    }

    /// Assemble a chunk from a claimed address and payload.
    ///
    /// Nothing is checked; call [`Chunk::verify`] before trusting it.
    pub fn with_address(address: Address, data: impl Into<Bytes>) -> Self {
        Self {
            address,
            data: data.into(),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Check the content-addressing contract: the address must equal the
    /// digest of the payload, and the payload must fit in a chunk.
    pub fn verify(&self) -> Result<()> {
        if self.data.len() > CHUNK_SIZE {
            return Err(CoreError::ChunkTooLarge {
                size: self.data.len(),
                max: CHUNK_SIZE,
            });
        }
        let actual = Address::of(&self.data);
        if actual != self.address {
            return Err(CoreError::AddressMismatch {
                expected: self.address,
                actual,
            });
        }
        Ok(())
    }

    pub fn into_parts(self) -> (Address, Bytes) {
        (self.address, self.data)
    }
}

/// One entry of a store's pull index.
///
/// `bin_id` is the arrival counter within the chunk's proximity bin,
/// starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Descriptor {
    pub address: Address,
    pub bin_id: u64,
}

/// Split a blob into consecutive chunks of at most [`CHUNK_SIZE`] bytes.
///
/// An empty blob yields no chunks.
pub fn split_into_chunks(data: &[u8]) -> Vec<Chunk> {
    data.chunks(CHUNK_SIZE)
        .map(|piece| Chunk {
            address: Address::of(piece),
            data: Bytes::copy_from_slice(piece),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_new_verifies() {
        let chunk = Chunk::new(&b"payload"[..]).unwrap();
        assert_eq!(chunk.address(), &Address::of(b"payload"));
        assert!(chunk.verify().is_ok());
    }

    #[test]
    fn test_chunk_too_large() {
        let data = vec![0u8; CHUNK_SIZE + 1];
        assert!(matches!(
            Chunk::new(data),
            Err(CoreError::ChunkTooLarge { .. })
        ));
    }

    #[test]
    fn test_chunk_with_wrong_address_fails_verify() {
        let chunk = Chunk::with_address(Address::of(b"other"), &b"payload"[..]);
        assert!(matches!(
            chunk.verify(),
            Err(CoreError::AddressMismatch { .. })
        ));
    }

    #[test]
    fn test_split_sizes() {
        let data = vec![7u8; CHUNK_SIZE * 2 + 10];
        let chunks = split_into_chunks(&data);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), CHUNK_SIZE);
        assert_eq!(chunks[2].len(), 10);
        assert!(chunks.iter().all(|c| c.verify().is_ok()));
    }

    #[test]
    fn test_split_empty() {
        assert!(split_into_chunks(&[]).is_empty());
    }
}
