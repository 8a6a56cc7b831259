//! Node-level error types
//!
//! Fatal conditions (store failure, codec failure on our own output)
//! propagate as `Err`; transient per-bundle conditions (unknown
//! destination, malformed inbound bundle, congestive refusal) are
//! ordinary outcome values on the operations that produce them.

use thiserror::Error;

use waystation_core::{CodecError, EidError};
use waystation_store::StoreError;

/// Errors surfaced by node operations
#[derive(Debug, Error)]
pub enum BpError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("EID error: {0}")]
    Eid(#[from] EidError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("No such scheme: {0}")]
    NoSuchScheme(String),

    #[error("No such endpoint: {0}")]
    NoSuchEndpoint(String),

    #[error("No such protocol: {0}")]
    NoSuchProtocol(String),

    #[error("No such duct: {0}")]
    NoSuchDuct(String),

    #[error("Name already registered: {0}")]
    DuplicateName(String),

    #[error("Endpoint already open: {0}")]
    EndpointBusy(String),

    #[error("Bundle no longer in the store")]
    StaleBundle,

    #[error("Wait was interrupted")]
    Interrupted,

    #[error("Node is shutting down")]
    ShuttingDown,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

/// Result alias for node operations
pub type BpResult<T> = Result<T, BpError>;
