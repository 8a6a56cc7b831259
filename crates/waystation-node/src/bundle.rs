//! The persistent bundle record
//!
//! A [`Bundle`] is the atom of retention: the parsed primary-block
//! state, the payload ZCO, the extension blocks, housekeeping booleans,
//! the sender dossier, and the set of back-references into the
//! containers that currently hold it. Each non-null back-reference is a
//! retention constraint; the bundle may be destroyed only when the last
//! one clears.

use serde::{Deserialize, Serialize};

use waystation_core::{
    BundleFlags, BundleId, BundleKey, ClassOfService, Eid, ExtendedCos, ExtensionBlock,
    PrimaryBlock, SrrFlags,
};
use waystation_store::{Handle, Zco};

use crate::db::{BundleElt, EventKey, IncompleteBundle, Outduct, Scheme, TrackingList};
use crate::db::Endpoint;

/// Payload of a bundle: a ZCO and its admitted length
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Payload {
    pub length: u64,
    pub content: Zco,
}

/// Sender assertions recorded by the convergence layer at acquisition
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Dossier {
    pub authentic: bool,
    pub sender_eid: Option<Eid>,
    pub sender_node_nbr: Option<u64>,
}

/// Where a bundle currently sits awaiting transmission
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum XmitRef {
    /// On one of an outduct's priority queues
    Duct {
        outduct: Handle<Outduct>,
        class: ClassOfService,
        elt: BundleElt,
    },
    /// On the limbo queue
    Limbo { elt: BundleElt },
}

/// A bundle held by the node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    pub id: BundleId,

    // Primary-block state.
    pub flags: BundleFlags,
    pub class: ClassOfService,
    pub srr: SrrFlags,
    pub destination: Eid,
    pub report_to: Eid,
    pub custodian: Eid,
    pub lifetime_secs: u64,
    /// Absolute expiry, unix seconds
    pub expiration_unix: i64,
    pub total_adu_length: u64,

    pub extended_cos: ExtendedCos,

    // Bundle-age block state.
    pub age_micros: u64,
    pub arrival_unix: Option<i64>,

    pub payload: Payload,
    pub payload_block_flags: waystation_core::BlockFlags,
    pub pre_payload_blocks: Vec<ExtensionBlock>,
    pub post_payload_blocks: Vec<ExtensionBlock>,
    pub collab_blocks: Vec<ExtensionBlock>,

    // Housekeeping.
    pub custody_taken: bool,
    pub stewarded: bool,
    pub delivered: bool,
    pub suspended: bool,
    pub return_to_sender: bool,
    pub accepted: bool,
    pub corrupt: bool,
    pub anonymous: bool,
    pub expired: bool,
    /// Store bytes this bundle's overhead occupies
    pub db_overhead: u64,
    pub dossier: Dossier,
    /// Source-routing itinerary, innermost hop last
    pub stations: Vec<Eid>,

    // Back-references: the retention constraints.
    pub hash_entry: Option<BundleKey>,
    pub ttl_elt: Option<EventKey>,
    pub overdue_elt: Option<EventKey>,
    pub ct_due_elt: Option<EventKey>,
    pub fwd_queue_ref: Option<(Handle<Scheme>, BundleElt)>,
    pub fragment_elt: Option<BundleElt>,
    pub dlv_queue_ref: Option<(Handle<Endpoint>, BundleElt)>,
    pub tracking_refs: Vec<(Handle<TrackingList>, BundleElt)>,
    pub incomplete_ref: Option<Handle<IncompleteBundle>>,

    // Transmission-queue state.
    pub duct_xmit: Option<XmitRef>,
    pub prox_node_eid: Option<Eid>,
    pub dest_duct_name: Option<String>,
    pub enqueue_unix: Option<i64>,
}

impl Bundle {
    /// Hash key: identity plus fragment length (zero for non-fragments)
    pub fn key(&self) -> BundleKey {
        let fragment_length = if self.flags.is_fragment {
            self.payload.length
        } else {
            0
        };
        BundleKey::new(&self.id, fragment_length)
    }

    /// Number of retention constraints still held
    ///
    /// The TTL and xmit-overdue timeline entries are not constraints:
    /// destruction cancels them itself. The custody-due entry is one,
    /// as is custody itself and stewardship.
    pub fn constraint_count(&self) -> usize {
        let mut count = self.tracking_refs.len();
        count += self.ct_due_elt.is_some() as usize;
        count += self.fwd_queue_ref.is_some() as usize;
        count += self.fragment_elt.is_some() as usize;
        count += self.dlv_queue_ref.is_some() as usize;
        count += self.incomplete_ref.is_some() as usize;
        count += self.duct_xmit.is_some() as usize;
        count += self.custody_taken as usize;
        count += self.stewarded as usize;
        count
    }

    /// Whether any retention constraint remains
    pub fn retained(&self) -> bool {
        self.constraint_count() > 0
    }

    /// The primary block this bundle serializes to
    pub fn primary_block(&self) -> PrimaryBlock {
        PrimaryBlock {
            flags: self.flags,
            class: self.class,
            srr: self.srr,
            destination: self.destination.clone(),
            source: self.id.source.clone(),
            report_to: self.report_to.clone(),
            custodian: self.custodian.clone(),
            creation: self.id.creation,
            lifetime_secs: self.lifetime_secs,
            fragment_offset: self.id.fragment_offset,
            total_adu_length: self.total_adu_length,
        }
    }

    /// Build a bundle from a parsed primary block and payload
    pub fn from_primary(primary: PrimaryBlock, payload: Payload, expiration_unix: i64) -> Self {
        Bundle {
            id: primary.bundle_id(),
            flags: primary.flags,
            class: primary.class,
            srr: primary.srr,
            destination: primary.destination,
            report_to: primary.report_to,
            custodian: primary.custodian,
            lifetime_secs: primary.lifetime_secs,
            expiration_unix,
            total_adu_length: primary.total_adu_length,
            extended_cos: ExtendedCos::default(),
            age_micros: 0,
            arrival_unix: None,
            payload,
            payload_block_flags: waystation_core::BlockFlags::default(),
            pre_payload_blocks: Vec::new(),
            post_payload_blocks: Vec::new(),
            collab_blocks: Vec::new(),
            custody_taken: false,
            stewarded: false,
            delivered: false,
            suspended: false,
            return_to_sender: false,
            accepted: false,
            corrupt: false,
            anonymous: false,
            expired: false,
            db_overhead: 0,
            dossier: Dossier::default(),
            stations: Vec::new(),
            hash_entry: None,
            ttl_elt: None,
            overdue_elt: None,
            ct_due_elt: None,
            fwd_queue_ref: None,
            fragment_elt: None,
            dlv_queue_ref: None,
            tracking_refs: Vec::new(),
            incomplete_ref: None,
            duct_xmit: None,
            prox_node_eid: None,
            dest_duct_name: None,
            enqueue_unix: None,
        }
    }

    /// Estimated store bytes occupied by this bundle's overhead
    ///
    /// Competes with ZCO bodies for the shared heap budget.
    pub fn guess_size(&self) -> u64 {
        let blocks: u64 = self
            .pre_payload_blocks
            .iter()
            .chain(&self.post_payload_blocks)
            .chain(&self.collab_blocks)
            .map(|b| b.body.len() as u64 + 16)
            .sum();
        // Fixed record overhead plus EID text and block bodies.
        256 + self.id.source.to_string().len() as u64
            + self.destination.to_string().len() as u64
            + blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waystation_core::CreationTimestamp;

    fn make_bundle() -> Bundle {
        let primary = PrimaryBlock {
            flags: BundleFlags::default(),
            class: ClassOfService::Standard,
            srr: SrrFlags::none(),
            destination: Eid::ipn(2, 1),
            source: Eid::ipn(1, 1),
            report_to: Eid::Null,
            custodian: Eid::Null,
            creation: CreationTimestamp::new(500, 1),
            lifetime_secs: 60,
            fragment_offset: 0,
            total_adu_length: 0,
        };
        Bundle::from_primary(primary, Payload::default(), 0)
    }

    #[test]
    fn test_fresh_bundle_unretained() {
        let bundle = make_bundle();
        assert!(!bundle.retained());
        assert_eq!(bundle.constraint_count(), 0);
    }

    #[test]
    fn test_custody_is_a_constraint() {
        let mut bundle = make_bundle();
        bundle.custody_taken = true;
        assert!(bundle.retained());
        bundle.custody_taken = false;
        assert!(!bundle.retained());
    }

    #[test]
    fn test_key_of_fragment_uses_payload_length() {
        let mut bundle = make_bundle();
        assert_eq!(bundle.key().fragment_length, 0);
        bundle.flags.is_fragment = true;
        bundle.payload.length = 42;
        assert_eq!(bundle.key().fragment_length, 42);
    }

    #[test]
    fn test_primary_block_roundtrips_identity() {
        let bundle = make_bundle();
        let primary = bundle.primary_block();
        assert_eq!(primary.bundle_id(), bundle.id);
        assert_eq!(primary.destination, bundle.destination);
    }
}
