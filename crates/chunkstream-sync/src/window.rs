//! Batch windows and want bitmasks.
//!
//! A window is one offered batch: a contiguous bin-id range and the
//! addresses the server found in it. Both sides keep one window per
//! subscription. The client records which addresses it wants and which of
//! those have arrived; the server records which addresses it must deliver.

use chunkstream_core::{Address, Range};

/// Packed want flags, bit i for the i-th offered address, LSB first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmask {
    bits: Vec<u8>,
    len: usize,
}

impl Bitmask {
    /// All-clear mask covering `len` entries.
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0u8; len.div_ceil(8)],
            len,
        }
    }

    /// Interpret wire bytes as a mask over `len` entries.
    ///
    /// Returns None if the byte length does not match or a bit beyond
    /// `len` is set.
    pub fn from_bytes(bits: Vec<u8>, len: usize) -> Option<Self> {
        if bits.len() != len.div_ceil(8) {
            return None;
        }
        let mask = Self { bits, len };
        let spare = mask.bits.len() * 8 - len;
        if spare > 0 {
            let last = *mask.bits.last()?;
            if last >> (8 - spare) != 0 {
                return None;
            }
        }
        Some(mask)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn set(&mut self, index: usize) {
        debug_assert!(index < self.len);
        self.bits[index / 8] |= 1 << (index % 8);
    }

    pub fn get(&self, index: usize) -> bool {
        index < self.len && self.bits[index / 8] & (1 << (index % 8)) != 0
    }

    pub fn count_ones(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |&i| self.get(i))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bits
    }
}

/// What happened when a delivery was matched against a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// First arrival of a wanted address.
    Accepted,
    /// Wanted, but already received.
    Duplicate,
    /// Not part of this window, or not wanted.
    Unexpected,
}

/// One offered batch.
#[derive(Debug, Clone)]
pub struct BatchWindow {
    range: Range,
    addresses: Vec<Address>,
    wanted: Bitmask,
    received: Bitmask,
}

impl BatchWindow {
    pub fn new(range: Range, addresses: Vec<Address>) -> Self {
        let len = addresses.len();
        Self {
            range,
            addresses,
            wanted: Bitmask::new(len),
            received: Bitmask::new(len),
        }
    }

    pub fn range(&self) -> Range {
        self.range
    }

    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    /// Mark `addresses[index]` as wanted.
    pub fn want(&mut self, index: usize) {
        self.wanted.set(index);
    }

    /// Install the wanted set chosen by the remote.
    ///
    /// Returns false and leaves the window unchanged if the wire mask does
    /// not fit this window.
    pub fn apply_wanted(&mut self, bits: Vec<u8>) -> bool {
        match Bitmask::from_bytes(bits, self.addresses.len()) {
            Some(mask) => {
                self.wanted = mask;
                true
            }
            None => false,
        }
    }

    pub fn wanted(&self) -> &Bitmask {
        &self.wanted
    }

    pub fn wanted_count(&self) -> usize {
        self.wanted.count_ones()
    }

    pub fn wanted_addresses(&self) -> impl Iterator<Item = Address> + '_ {
        self.wanted.iter_ones().map(move |i| self.addresses[i])
    }

    fn index_of(&self, address: &Address) -> Option<usize> {
        self.addresses.iter().position(|a| a == address)
    }

    /// Whether a delivery of `address` would be accepted.
    pub fn expects(&self, address: &Address) -> bool {
        self.index_of(address)
            .map(|i| self.wanted.get(i) && !self.received.get(i))
            .unwrap_or(false)
    }

    /// Record the arrival of `address`.
    pub fn ack(&mut self, address: &Address) -> Ack {
        let Some(index) = self.index_of(address) else {
            return Ack::Unexpected;
        };
        if !self.wanted.get(index) {
            return Ack::Unexpected;
        }
        if self.received.get(index) {
            return Ack::Duplicate;
        }
        self.received.set(index);
        Ack::Accepted
    }

    /// Number of wanted addresses not yet received.
    pub fn outstanding(&self) -> usize {
        self.wanted_count() - self.received.count_ones()
    }

    /// Every wanted address has arrived.
    pub fn is_complete(&self) -> bool {
        self.outstanding() == 0
    }
}
