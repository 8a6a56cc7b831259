//! The persistent database root and its catalogues
//!
//! Everything long-lived hangs off [`BpDb`]: the bundle arena and hash,
//! the scheme/endpoint/protocol/duct catalogues, the event timeline,
//! the limbo queue, counters, and statistics. The whole structure is
//! the state image of the transactional store; a transaction mutates a
//! working copy and commits or discards it atomically.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use waystation_core::{BpCtSignal, BundleKey, ClassOfService, CreationTimestamp, Eid, EidLimits};
use waystation_store::{Arena, DlList, Handle, ListElt, Occupancy};

use crate::bundle::Bundle;
use crate::stats::{
    EndpointStats, InductStats, NodeStats, OutductStats, WatchMask,
};

pub type BundleHandle = Handle<Bundle>;
pub type BundleQueue = DlList<BundleHandle>;
pub type BundleElt = ListElt<BundleHandle>;

/// Position of an event in the timeline: fire time plus an insertion
/// sequence that resolves ties in insertion order
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EventKey {
    pub time: i64,
    pub seq: u64,
}

/// Kinds of timeline events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BpEventKind {
    ExpiredTtl,
    XmitOverdue,
    CtDue,
    CsDue,
}

/// What a timeline event refers to
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum EventRef {
    Bundle(BundleHandle),
    Signal(ListElt<PendingCtSignal>),
}

/// A scheduled event
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BpEvent {
    pub kind: BpEventKind,
    pub subject: EventRef,
}

/// Time-ordered event list with O(log n) insertion
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Timeline {
    events: BTreeMap<EventKey, BpEvent>,
    next_seq: u64,
}

impl Timeline {
    /// Insert an event at the given absolute time
    pub fn insert(&mut self, time: i64, event: BpEvent) -> EventKey {
        let key = EventKey {
            time,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.events.insert(key, event);
        key
    }

    /// Remove an event by key
    pub fn remove(&mut self, key: EventKey) -> Option<BpEvent> {
        self.events.remove(&key)
    }

    /// Pop every event whose time is at or before `now`
    pub fn pop_due(&mut self, now: i64) -> Vec<(EventKey, BpEvent)> {
        let mut due = Vec::new();
        while let Some((&key, _)) = self.events.first_key_value() {
            if key.time > now {
                break;
            }
            if let Some(entry) = self.events.pop_first() {
                due.push(entry);
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Iterate in firing order
    pub fn iter(&self) -> impl Iterator<Item = (&EventKey, &BpEvent)> {
        self.events.iter()
    }
}

/// A custody signal awaiting (re-)emission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingCtSignal {
    pub to: Eid,
    pub signal: BpCtSignal,
}

/// Entry in the bundle hash
///
/// One live bundle keeps a direct handle; key collisions (or duplicate
/// custodial receptions) collapse to a bare count.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BundleSet {
    pub bundle: Option<BundleHandle>,
    pub count: u32,
}

/// Disposition of arrivals for an endpoint with no active consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RecvRule {
    Discard,
    #[default]
    Enqueue,
}

/// A registered endpoint of some scheme
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub nss: String,
    pub recv_rule: RecvRule,
    pub recv_script: Option<String>,
    pub incompletes: DlList<Handle<IncompleteBundle>>,
    pub delivery_queue: BundleQueue,
    pub scheme: Handle<Scheme>,
    pub stats: EndpointStats,
}

/// An ADU under reassembly, its fragments ordered by offset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncompleteBundle {
    /// Source of the fragmented ADU
    pub source: Eid,
    /// Creation timestamp of the fragmented ADU
    pub creation: CreationTimestamp,
    pub fragments: BundleQueue,
    pub total_adu_length: u64,
    pub endpoint: Handle<Endpoint>,
    /// This incomplete's position in the endpoint's incompletes list
    pub endpoint_elt: Option<ListElt<Handle<IncompleteBundle>>>,
}

/// A URI scheme the node can forward within
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scheme {
    pub name: String,
    pub cbhe: bool,
    pub unicast: bool,
    pub fwd_cmd: String,
    pub adm_app_cmd: String,
    pub forward_queue: BundleQueue,
    pub endpoints: Vec<Handle<Endpoint>>,
}

/// A convergence-layer protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClProtocol {
    pub name: String,
    pub payload_bytes_per_frame: u32,
    pub overhead_per_frame: u32,
    /// Bytes per second; zero disables rate gating
    pub nominal_rate: i64,
    pub inducts: Vec<Handle<Induct>>,
    pub outducts: Vec<Handle<Outduct>>,
}

/// An inbound convergence-layer duct
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Induct {
    pub name: String,
    pub cli_cmd: String,
    pub protocol: Handle<ClProtocol>,
    pub stats: InductStats,
}

/// Per-ordinal state of an outduct's expedited queue
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct OrdinalState {
    pub backlog_bytes: u64,
    pub last_for_ordinal: Option<BundleElt>,
}

/// An outbound convergence-layer duct with its priority queues
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outduct {
    pub name: String,
    pub clo_cmd: String,
    pub bulk_queue: BundleQueue,
    pub bulk_backlog: u64,
    pub std_queue: BundleQueue,
    pub std_backlog: u64,
    pub urgent_queue: BundleQueue,
    pub urgent_backlog: u64,
    /// Orders traffic inside the expedited queue
    pub ordinals: Vec<OrdinalState>,
    /// Zero means unlimited
    pub max_payload_len: u64,
    pub blocked: bool,
    pub protocol: Handle<ClProtocol>,
    pub stats: OutductStats,
}

impl Outduct {
    pub fn new(name: String, clo_cmd: String, protocol: Handle<ClProtocol>) -> Self {
        Self {
            name,
            clo_cmd,
            bulk_queue: DlList::new(),
            bulk_backlog: 0,
            std_queue: DlList::new(),
            std_backlog: 0,
            urgent_queue: DlList::new(),
            urgent_backlog: 0,
            ordinals: vec![OrdinalState::default(); 256],
            max_payload_len: 0,
            blocked: false,
            protocol,
            stats: OutductStats::default(),
        }
    }

    pub fn queue(&self, class: ClassOfService) -> &BundleQueue {
        match class {
            ClassOfService::Bulk => &self.bulk_queue,
            ClassOfService::Standard => &self.std_queue,
            ClassOfService::Expedited => &self.urgent_queue,
        }
    }

    pub fn queue_mut(&mut self, class: ClassOfService) -> &mut BundleQueue {
        match class {
            ClassOfService::Bulk => &mut self.bulk_queue,
            ClassOfService::Standard => &mut self.std_queue,
            ClassOfService::Expedited => &mut self.urgent_queue,
        }
    }

    pub fn backlog(&self, class: ClassOfService) -> u64 {
        match class {
            ClassOfService::Bulk => self.bulk_backlog,
            ClassOfService::Standard => self.std_backlog,
            ClassOfService::Expedited => self.urgent_backlog,
        }
    }

    pub fn backlog_mut(&mut self, class: ClassOfService) -> &mut u64 {
        match class {
            ClassOfService::Bulk => &mut self.bulk_backlog,
            ClassOfService::Standard => &mut self.std_backlog,
            ClassOfService::Expedited => &mut self.urgent_backlog,
        }
    }
}

/// An application tracking list
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TrackingList {
    pub bundles: BundleQueue,
}

/// The database root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BpDb {
    pub local_node_nbr: u64,
    pub eid_limits: EidLimits,
    pub max_block_size: u64,

    pub bundles: Arena<Bundle>,
    pub bundle_index: HashMap<BundleKey, BundleSet>,
    pub schemes: Arena<Scheme>,
    pub endpoints: Arena<Endpoint>,
    pub protocols: Arena<ClProtocol>,
    pub inducts: Arena<Induct>,
    pub outducts: Arena<Outduct>,
    pub incompletes: Arena<IncompleteBundle>,
    pub tracking_lists: Arena<TrackingList>,

    pub timeline: Timeline,
    pub limbo_queue: BundleQueue,
    pub pending_ct_signals: DlList<PendingCtSignal>,
    /// ZCOs of acquisitions still in progress, retained across restarts
    pub inbound_bundles: DlList<waystation_store::Zco>,

    pub occupancy: Occupancy,
    /// Ceiling on heap occupancy by a single in-progress acquisition
    pub max_acq_in_heap: u64,

    /// Disambiguates creation timestamps within one second, and stands
    /// in for the clock when it is not synchronized
    pub bundle_counter: u32,
    pub current_creation_sec: u64,
    pub clock_synced: bool,

    /// Seconds before an unacknowledged custody transfer is timed out
    pub ct_expired_timeout: u64,
    /// Seconds in an outduct queue after which transmission is overdue
    pub xmit_overdue_interval: Option<u64>,

    pub watch: WatchMask,
    pub stats: NodeStats,
}

impl BpDb {
    /// Find a scheme by name
    pub fn find_scheme(&self, name: &str) -> Option<Handle<Scheme>> {
        self.schemes
            .iter()
            .find(|(_, scheme)| scheme.name == name)
            .map(|(handle, _)| handle)
    }

    /// Find a registered endpoint by scheme name and NSS
    pub fn find_endpoint(&self, scheme_name: &str, nss: &str) -> Option<Handle<Endpoint>> {
        let scheme = self.find_scheme(scheme_name)?;
        self.schemes
            .get(scheme)?
            .endpoints
            .iter()
            .copied()
            .find(|&h| self.endpoints.get(h).is_some_and(|e| e.nss == nss))
    }

    /// The local endpoint an EID names, if any
    pub fn eid_is_local(&self, eid: &Eid) -> Option<Handle<Endpoint>> {
        self.find_endpoint(eid.scheme_name(), &eid.nss())
    }

    /// Find a protocol by name
    pub fn find_protocol(&self, name: &str) -> Option<Handle<ClProtocol>> {
        self.protocols
            .iter()
            .find(|(_, protocol)| protocol.name == name)
            .map(|(handle, _)| handle)
    }

    /// Find an induct by protocol and duct name
    pub fn find_induct(&self, protocol_name: &str, duct_name: &str) -> Option<Handle<Induct>> {
        let protocol = self.find_protocol(protocol_name)?;
        self.protocols
            .get(protocol)?
            .inducts
            .iter()
            .copied()
            .find(|&h| self.inducts.get(h).is_some_and(|d| d.name == duct_name))
    }

    /// Find an outduct by protocol and duct name
    pub fn find_outduct(&self, protocol_name: &str, duct_name: &str) -> Option<Handle<Outduct>> {
        let protocol = self.find_protocol(protocol_name)?;
        self.protocols
            .get(protocol)?
            .outducts
            .iter()
            .copied()
            .find(|&h| self.outducts.get(h).is_some_and(|d| d.name == duct_name))
    }

    /// Locate a bundle by hash key
    ///
    /// When the key has collapsed to a bare count, any extant member
    /// matching the key is returned.
    pub fn find_bundle(&self, key: &BundleKey) -> Option<BundleHandle> {
        let entry = self.bundle_index.get(key)?;
        if let Some(handle) = entry.bundle {
            return Some(handle);
        }
        self.bundles
            .iter()
            .find(|(_, bundle)| bundle.hash_entry.as_ref() == Some(key))
            .map(|(handle, _)| handle)
    }

    /// Insert a bundle handle under its key
    pub fn catalogue_bundle(&mut self, key: BundleKey, handle: BundleHandle) {
        let entry = self
            .bundle_index
            .entry(key)
            .or_insert(BundleSet {
                bundle: None,
                count: 0,
            });
        entry.count += 1;
        entry.bundle = if entry.count == 1 { Some(handle) } else { None };
    }

    /// Remove one bundle from under its key
    pub fn decatalogue_bundle(&mut self, key: &BundleKey, handle: BundleHandle) {
        if let Some(entry) = self.bundle_index.get_mut(key) {
            entry.count = entry.count.saturating_sub(1);
            if entry.count == 0 {
                self.bundle_index.remove(key);
            } else if entry.count == 1 {
                // Back to a unique member; restore the direct handle.
                let survivor = self
                    .bundles
                    .iter()
                    .find(|(h, bundle)| *h != handle && bundle.hash_entry.as_ref() == Some(key))
                    .map(|(h, _)| h);
                entry.bundle = survivor;
            }
        }
    }

    /// Next creation timestamp for a locally sourced bundle
    pub fn next_creation_timestamp(&mut self, now_unix: i64) -> CreationTimestamp {
        if self.clock_synced {
            let sec = CreationTimestamp::seconds_from_unix(now_unix);
            if sec != self.current_creation_sec {
                self.current_creation_sec = sec;
                self.bundle_counter = 0;
            }
        }
        self.bundle_counter += 1;
        CreationTimestamp::new(self.current_creation_sec, self.bundle_counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Arbitrary handle for tests that never dereference it
    fn test_handle() -> BundleHandle {
        let mut arena: Arena<Bundle> = Arena::new();
        let primary = waystation_core::PrimaryBlock {
            flags: Default::default(),
            class: Default::default(),
            srr: Default::default(),
            destination: Eid::Null,
            source: Eid::Null,
            report_to: Eid::Null,
            custodian: Eid::Null,
            creation: CreationTimestamp::default(),
            lifetime_secs: 0,
            fragment_offset: 0,
            total_adu_length: 0,
        };
        arena.insert(Bundle::from_primary(primary, Default::default(), 0))
    }

    #[test]
    fn test_timeline_orders_by_time_then_insertion() {
        let mut timeline = Timeline::default();
        let h = test_handle();
        let a = timeline.insert(10, BpEvent {
            kind: BpEventKind::ExpiredTtl,
            subject: EventRef::Bundle(h),
        });
        let b = timeline.insert(5, BpEvent {
            kind: BpEventKind::CtDue,
            subject: EventRef::Bundle(h),
        });
        let c = timeline.insert(10, BpEvent {
            kind: BpEventKind::XmitOverdue,
            subject: EventRef::Bundle(h),
        });

        let due = timeline.pop_due(10);
        let keys: Vec<EventKey> = due.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![b, a, c]);
        assert!(timeline.is_empty());
    }

    #[test]
    fn test_timeline_pop_due_leaves_future() {
        let mut timeline = Timeline::default();
        let h = test_handle();
        timeline.insert(5, BpEvent {
            kind: BpEventKind::ExpiredTtl,
            subject: EventRef::Bundle(h),
        });
        timeline.insert(50, BpEvent {
            kind: BpEventKind::ExpiredTtl,
            subject: EventRef::Bundle(h),
        });

        assert_eq!(timeline.pop_due(20).len(), 1);
        assert_eq!(timeline.len(), 1);
    }
}
