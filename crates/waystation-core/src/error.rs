//! Error types for core types and the wire codec

use thiserror::Error;

/// Errors from endpoint-ID parsing and validation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EidError {
    #[error("EID exceeds {max} bytes: {len}")]
    TooLong { len: usize, max: usize },

    #[error("EID has no scheme delimiter: {0}")]
    MissingDelimiter(String),

    #[error("Scheme name exceeds {max} bytes")]
    SchemeTooLong { max: usize },

    #[error("NSS exceeds {max} bytes")]
    NssTooLong { max: usize },

    #[error("Scheme name is empty")]
    EmptyScheme,

    #[error("NSS is empty")]
    EmptyNss,

    #[error("Malformed ipn NSS (expected <node>.<service>): {0}")]
    MalformedIpnNss(String),

    #[error("Node number {nbr} exceeds ceiling {max}")]
    NodeNumberTooLarge { nbr: u64, max: u64 },

    #[error("Service number {nbr} exceeds ceiling {max}")]
    ServiceNumberTooLarge { nbr: u32, max: u32 },
}

/// Errors from the bundle wire codec
#[derive(Debug, Error)]
pub enum CodecError {
    /// Ran out of bytes mid-field
    #[error("Truncated at offset {0}")]
    Truncated(usize),

    /// SDNV longer than 10 bytes or overflowing u64
    #[error("Invalid SDNV at offset {0}")]
    InvalidSdnv(usize),

    #[error("Unsupported bundle protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("Block of {length} bytes exceeds maximum {max}")]
    BlockTooLong { length: u64, max: u64 },

    #[error("Dictionary offset {0} out of range")]
    DictionaryOffset(u64),

    #[error("Invalid EID in block: {0}")]
    InvalidEid(#[from] EidError),

    #[error("Unknown administrative record type {0}")]
    UnknownAdminRecordType(u8),

    #[error("Invalid field value: {0}")]
    InvalidValue(String),
}
