//! Bundle wire codec
//!
//! Serialization and acquisition-side parsing of the bundle format:
//! SDNVs, the primary block, and the self-describing extension and
//! payload blocks that follow it.

pub mod block;
pub mod primary;
pub mod sdnv;

pub use block::{
    BLOCK_TYPE_BUNDLE_AGE, BLOCK_TYPE_PAYLOAD, BlockFlags, BlockHeader, DEFAULT_MAX_BLOCK_SIZE,
    ExtensionBlock, bundle_age_block, decode_bundle_age, parse_block_header,
    serialize_block_header,
};
pub use primary::{BP_VERSION, MIN_PRIMARY_BLOCK_LEN, PrimaryBlock};
