//! # Waystation Store
//!
//! Transactional object store and zero-copy objects for the Waystation
//! bundle node.
//!
//! The store is built from three pieces:
//!
//! - [`Arena`] / [`Handle`]: typed slot allocation with generational
//!   handles, the object-reference primitive of the persistent data
//!   model.
//! - [`DlList`] / [`ListElt`]: doubly-linked lists over an arena; every
//!   queue in the node is one of these, and an element token doubles as
//!   a retention reference.
//! - [`TxnStore`]: the serializable-transaction container holding the
//!   committed state image, with postcard checkpoint/restore.
//!
//! [`Zco`] provides zero-copy payload objects (heap- or file-backed
//! extents, range clones, reader cursors); [`Occupancy`] is the shared
//! heap budget that ZCO bodies and bundle overhead compete for.

pub mod arena;
pub mod error;
pub mod list;
pub mod txn;
pub mod zco;

pub use arena::{Arena, Handle};
pub use error::StoreError;
pub use list::{DlList, ListElt};
pub use txn::TxnStore;
pub use zco::{Extent, Occupancy, Zco, ZcoReader};
