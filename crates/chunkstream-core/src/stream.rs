//! Streams: named logical feeds between two peers.
//!
//! A stream is identified by (name, key, live). The name selects the kind of
//! feed, the key selects an instance of it (for sync streams, the proximity
//! bin), and `live` decides whether the feed continues past its range.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CoreError, Result};
use crate::types::MAX_PO;

/// Name of the per-bin synchronization feed.
pub const SYNC_STREAM: &str = "SYNC";

/// Name reserved for on-demand retrieval traffic.
pub const RETRIEVAL_STREAM: &str = "RETRIEVAL";

/// Identifier of a logical data feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Stream {
    pub name: String,
    pub key: String,
    pub live: bool,
}

impl Stream {
    pub fn new(name: impl Into<String>, key: impl Into<String>, live: bool) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            live,
        }
    }

    /// The sync feed for one proximity bin.
    pub fn sync(bin: u8, live: bool) -> Self {
        Self::new(SYNC_STREAM, format_sync_bin_key(bin), live)
    }

    pub fn is_sync(&self) -> bool {
        self.name == SYNC_STREAM
    }

    /// The bin of a sync stream.
    pub fn sync_bin(&self) -> Result<u8> {
        if !self.is_sync() {
            return Err(CoreError::InvalidBinKey(self.key.clone()));
        }
        parse_sync_bin_key(&self.key)
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = if self.live { "l" } else { "h" };
        write!(f, "{}|{}|{}", self.name, self.key, mode)
    }
}

/// Encode a bin index as a sync stream key (lowercase hex).
pub fn format_sync_bin_key(bin: u8) -> String {
    format!("{:x}", bin)
}

/// Decode a sync stream key. Rejects anything above [`MAX_PO`].
pub fn parse_sync_bin_key(key: &str) -> Result<u8> {
    let bin = u8::from_str_radix(key, 16).map_err(|_| CoreError::InvalidBinKey(key.to_string()))?;
    if bin > MAX_PO {
        return Err(CoreError::InvalidBinKey(key.to_string()));
    }
    Ok(bin)
}

/// Half-open bounds over bin ids: `from` inclusive, `to` exclusive.
///
/// `to == 0` means the range has no upper bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Range {
    pub from: u64,
    pub to: u64,
}

impl Range {
    pub const fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }

    pub const fn is_unbounded(&self) -> bool {
        self.to == 0
    }

    /// Whether `bin_id` falls inside the range.
    pub const fn contains(&self, bin_id: u64) -> bool {
        bin_id >= self.from && (self.to == 0 || bin_id < self.to)
    }

    /// Number of positions covered, `None` when unbounded.
    pub fn len(&self) -> Option<u64> {
        if self.is_unbounded() {
            None
        } else {
            Some(self.to.saturating_sub(self.from))
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unbounded() {
            write!(f, "[{}, ..)", self.from)
        } else {
            write!(f, "[{}, {})", self.from, self.to)
        }
    }
}

/// Outbound lane of a protocol message.
///
/// Top carries control and latency-sensitive traffic, Low carries bulk
/// historical backfill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Mid,
    Top,
}

impl Priority {
    /// All lanes, highest first.
    pub const DESCENDING: [Priority; 3] = [Priority::Top, Priority::Mid, Priority::Low];

    pub const fn index(self) -> usize {
        match self {
            Priority::Low => 0,
            Priority::Mid => 1,
            Priority::Top => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bin_key_roundtrip() {
        for bin in 0..=MAX_PO {
            let key = format_sync_bin_key(bin);
            assert_eq!(parse_sync_bin_key(&key).unwrap(), bin);
        }
        assert_eq!(format_sync_bin_key(10), "a");
    }

    #[test]
    fn test_bin_key_rejects_garbage() {
        assert!(parse_sync_bin_key("zz").is_err());
        assert!(parse_sync_bin_key("").is_err());
        assert!(parse_sync_bin_key("ff").is_err());
    }

    #[test]
    fn test_stream_equality_includes_live() {
        assert_eq!(Stream::sync(1, true), Stream::sync(1, true));
        assert_ne!(Stream::sync(1, true), Stream::sync(1, false));
        assert_ne!(Stream::sync(1, true), Stream::sync(2, true));
    }

    #[test]
    fn test_stream_display() {
        assert_eq!(Stream::sync(3, true).to_string(), "SYNC|3|l");
        assert_eq!(Stream::sync(3, false).to_string(), "SYNC|3|h");
    }

    #[test]
    fn test_sync_bin_of_non_sync_stream() {
        let stream = Stream::new(RETRIEVAL_STREAM, "", false);
        assert!(stream.sync_bin().is_err());
    }

    #[test]
    fn test_range_contains() {
        let r = Range::new(3, 7);
        assert!(!r.contains(2));
        assert!(r.contains(3));
        assert!(r.contains(6));
        assert!(!r.contains(7));
        assert_eq!(r.len(), Some(4));

        let open = Range::new(5, 0);
        assert!(open.is_unbounded());
        assert!(open.contains(u64::MAX));
        assert_eq!(open.len(), None);
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::Top > Priority::Mid);
        assert!(Priority::Mid > Priority::Low);
        assert_eq!(Priority::DESCENDING[0], Priority::Top);
    }

    #[test]
    fn test_stream_serde_json() {
        let stream = Stream::sync(4, true);
        let json = serde_json::to_string(&stream).unwrap();
        let back: Stream = serde_json::from_str(&json).unwrap();
        assert_eq!(stream, back);
    }
}
