//! Strong type definitions for chunkstream.
//!
//! All identifiers are newtypes to prevent misuse at compile time.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

/// Highest proximity order tracked. Closer pairs collapse into this bin.
pub const MAX_PO: u8 = 16;

/// A 32-byte chunk address, computed as Blake3(payload).
///
/// Two chunks with the same payload have the same address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub [u8; 32]);

impl Address {
    /// Compute the content address of a payload.
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        Ok(Self(decode_32(s)?))
    }

    /// The zero address (sentinel).
    pub const ZERO: Self = Self([0u8; 32]);
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl AsRef<[u8]> for Address {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for Address {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// Identity of a node in the overlay.
///
/// The id doubles as the node's overlay address, so it can be compared with
/// chunk addresses by [`proximity`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generate a random node ID.
    pub fn random() -> Self {
        use rand::Rng;
        Self(rand::thread_rng().gen())
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The node's position in address space.
    pub const fn overlay(&self) -> Address {
        Address(self.0)
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        Ok(Self(decode_32(s)?))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..8])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..8])
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

fn decode_32(s: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(s)?;
    if bytes.len() != 32 {
        return Err(hex::FromHexError::InvalidStringLength.into());
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

/// Proximity order of two addresses: the count of leading bits they share,
/// capped at [`MAX_PO`].
pub fn proximity(one: &[u8], other: &[u8]) -> u8 {
    let len = one.len().min(other.len());
    for i in 0..len {
        let diff = one[i] ^ other[i];
        if diff != 0 {
            let po = i * 8 + diff.leading_zeros() as usize;
            return po.min(MAX_PO as usize) as u8;
        }
        if (i + 1) * 8 >= MAX_PO as usize {
            return MAX_PO;
        }
    }
    MAX_PO
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_address_hex_roundtrip() {
        let addr = Address::from_bytes([0x42; 32]);
        let recovered = Address::from_hex(&addr.to_hex()).unwrap();
        assert_eq!(addr, recovered);
    }

    #[test]
    fn test_address_display() {
        let addr = Address::from_bytes([0xab; 32]);
        assert_eq!(format!("{}", addr), "abababababababab");
    }

    #[test]
    fn test_address_from_hex_wrong_length() {
        assert!(Address::from_hex("abcd").is_err());
    }

    #[test]
    fn test_address_is_content_digest() {
        let a = Address::of(b"hello");
        let b = Address::of(b"hello");
        let c = Address::of(b"world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_proximity_first_bit() {
        let mut a = [0u8; 32];
        let b = [0u8; 32];
        a[0] = 0b1000_0000;
        assert_eq!(proximity(&a, &b), 0);
        a[0] = 0b0000_0001;
        assert_eq!(proximity(&a, &b), 7);
        a[0] = 0;
        a[1] = 0b0100_0000;
        assert_eq!(proximity(&a, &b), 9);
    }

    #[test]
    fn test_proximity_capped() {
        let a = [0x11u8; 32];
        assert_eq!(proximity(&a, &a), MAX_PO);

        let mut b = a;
        b[31] ^= 1;
        assert_eq!(proximity(&a, &b), MAX_PO);
    }

    proptest! {
        #[test]
        fn proximity_is_symmetric(a in any::<[u8; 32]>(), b in any::<[u8; 32]>()) {
            prop_assert_eq!(proximity(&a, &b), proximity(&b, &a));
            prop_assert!(proximity(&a, &b) <= MAX_PO);
        }
    }
}
