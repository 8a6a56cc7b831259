//! Error types for the store crate

use thiserror::Error;

/// Errors raised by the object store and ZCO subsystem
#[derive(Debug, Error)]
pub enum StoreError {
    /// A handle referred to an object that no longer exists
    #[error("Stale handle: {0}")]
    StaleHandle(String),

    /// A list element token referred to a detached element
    #[error("Stale list element")]
    StaleListElt,

    /// Heap budget would be exceeded
    #[error("Heap budget exhausted (needed {needed}, available {available})")]
    HeapExhausted { needed: u64, available: u64 },

    /// Byte range outside the object
    #[error("Range out of bounds (offset {offset}, length {length}, object length {object_length})")]
    RangeOutOfBounds {
        offset: u64,
        length: u64,
        object_length: u64,
    },

    /// I/O failure on a file-backed extent or checkpoint image
    #[error("Store I/O error: {0}")]
    Io(String),

    /// Checkpoint serialization failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Checkpoint deserialization failure
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}
