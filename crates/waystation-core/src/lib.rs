//! # Waystation Core
//!
//! Core types and wire codec for the Waystation bundle node.
//!
//! This crate is the vocabulary of the node: endpoint identifiers,
//! bundle identity, class-of-service and processing flags, the SDNV
//! wire codec for primary/extension/payload blocks, and the
//! administrative record formats (status reports and custody signals).
//! It holds no node state; the engine lives in `waystation-node`.

pub mod admin;
pub mod codec;
pub mod cos;
pub mod eid;
pub mod error;
pub mod ids;

pub use admin::{
    AdminRecord, BpCtSignal, BpStatusRpt, CtReason, DtnTime, SrReason, StatusFlags,
};
pub use codec::{
    BLOCK_TYPE_BUNDLE_AGE, BLOCK_TYPE_PAYLOAD, BlockFlags, DEFAULT_MAX_BLOCK_SIZE, ExtensionBlock,
    MIN_PRIMARY_BLOCK_LEN, PrimaryBlock,
};
pub use cos::{
    BundleFlags, ClassOfService, CustodySwitch, ExtendedCos, SrrFlags, pack_proc_flags,
    unpack_proc_flags,
};
pub use eid::{
    CBHE_SCHEME_NAME, DTN_SCHEME_NAME, Eid, EidLimits, MAX_EID_LEN, MAX_NSS_LEN,
    MAX_SCHEME_NAME_LEN,
};
pub use error::{CodecError, EidError};
pub use ids::{BP_EPOCH_UNIX_SECS, BundleId, BundleKey, CreationTimestamp};
