//! Error types for chunkstream core.

use thiserror::Error;

use crate::types::Address;

/// Errors raised by the pure primitives.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid sync bin key: {0:?}")]
    InvalidBinKey(String),

    #[error("chunk too large: {size} bytes (max {max})")]
    ChunkTooLarge { size: usize, max: usize },

    #[error("content address mismatch: expected {expected}, payload hashes to {actual}")]
    AddressMismatch { expected: Address, actual: Address },

    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
