//! The node context and application interface
//!
//! A [`Node`] owns the transactional store, the volatile index, and the
//! clock. It is cheaply cloneable; every clone is an attachment to the
//! same node. Applications reserve endpoints with [`Node::open`],
//! submit ADUs with [`Node::send`], and extract deliveries with
//! [`Node::receive`].

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, instrument};

use waystation_core::{
    ClassOfService, CreationTimestamp, CustodySwitch, Eid, EidLimits, ExtendedCos, PrimaryBlock,
    SrReason, SrrFlags,
};
use waystation_store::{Occupancy, TxnStore, Zco};

use crate::acquire::ExtensionRegistry;
use crate::bundle::{Bundle, Payload};
use crate::db::{BpDb, BpEvent, BpEventKind, BundleHandle, EventRef, Timeline};
use crate::error::{BpError, BpResult};
use crate::forward::{DispatchOutcome, dispatch_bundle};
use crate::lifecycle::destroy_bundle;
use crate::stats::{self, NodeStats, WatchMask};
use crate::vdb::{VEndpoint, Vdb, WaitOutcome};

/// Time source, replaceable for deterministic tests
pub trait NodeClock: Send + Sync {
    /// Current wall-clock time in unix seconds
    fn now_unix(&self) -> i64;
}

/// The system wall clock
pub struct SystemClock;

impl NodeClock for SystemClock {
    fn now_unix(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Node-wide configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's CBHE node number
    pub node_nbr: u64,
    pub eid_limits: EidLimits,
    /// Shared heap budget for ZCO bodies and bundle overhead, bytes
    pub heap_ceiling: u64,
    /// Ceiling on a single acquisition's heap draw, bytes
    pub max_acq_in_heap: u64,
    /// Ceiling on a single block's serialized size, bytes
    pub max_block_size: u64,
    /// Seconds before an unacknowledged custody transfer times out
    pub ct_expired_timeout: u64,
    /// Seconds in an outduct queue before transmission is overdue;
    /// `None` disables the overdue timer
    pub xmit_overdue_interval: Option<u64>,
    pub watch: WatchMask,
    /// Whether the local clock is synchronized to UTC
    pub clock_synced: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_nbr: 1,
            eid_limits: EidLimits::default(),
            heap_ceiling: 16 * 1024 * 1024,
            max_acq_in_heap: 1024 * 1024,
            max_block_size: waystation_core::DEFAULT_MAX_BLOCK_SIZE,
            ct_expired_timeout: 3600,
            xmit_overdue_interval: None,
            watch: WatchMask::default(),
            clock_synced: true,
        }
    }
}

pub(crate) fn new_db(config: &NodeConfig) -> BpDb {
    BpDb {
        local_node_nbr: config.node_nbr,
        eid_limits: config.eid_limits,
        max_block_size: config.max_block_size,
        bundles: Default::default(),
        bundle_index: Default::default(),
        schemes: Default::default(),
        endpoints: Default::default(),
        protocols: Default::default(),
        inducts: Default::default(),
        outducts: Default::default(),
        incompletes: Default::default(),
        tracking_lists: Default::default(),
        timeline: Timeline::default(),
        limbo_queue: Default::default(),
        pending_ct_signals: Default::default(),
        inbound_bundles: Default::default(),
        occupancy: Occupancy::new(config.heap_ceiling),
        max_acq_in_heap: config.max_acq_in_heap,
        bundle_counter: 0,
        current_creation_sec: 0,
        clock_synced: config.clock_synced,
        ct_expired_timeout: config.ct_expired_timeout,
        xmit_overdue_interval: config.xmit_overdue_interval,
        watch: config.watch,
        stats: NodeStats::default(),
    }
}

pub(crate) struct NodeInner {
    pub store: TxnStore<BpDb>,
    pub vdb: Arc<Vdb>,
    pub clock: Arc<dyn NodeClock>,
    pub extensions: Arc<ExtensionRegistry>,
    clock_task: Mutex<Option<JoinHandle<()>>>,
}

/// A Waystation bundle node
#[derive(Clone)]
pub struct Node {
    pub(crate) inner: Arc<NodeInner>,
}

/// Wakeups accumulated inside a transaction and fired after commit
///
/// Signals must not be posted from inside a transaction: a rolled-back
/// transaction must wake nobody.
#[derive(Debug, Default)]
pub(crate) struct Wakeups {
    pub dispatch: Vec<String>,
    pub delivery: Vec<(String, String)>,
    pub xmit: Vec<(String, String)>,
}

impl Wakeups {
    pub fn fire(&self, vdb: &Vdb) {
        for scheme_name in &self.dispatch {
            if let Some(vscheme) = vdb.scheme(scheme_name) {
                vscheme.dispatch.post();
            }
        }
        for (scheme_name, nss) in &self.delivery {
            if let Some(vendpoint) = vdb.endpoint(scheme_name, nss) {
                vendpoint.delivery.post();
            }
        }
        for (protocol_name, duct_name) in &self.xmit {
            if let Some(voutduct) = vdb.outduct(protocol_name, duct_name) {
                voutduct.xmit.post();
            }
        }
    }
}

/// Per-transaction context threaded through the engines
pub(crate) struct TxnCtx {
    pub now_unix: i64,
    pub wakeups: Wakeups,
    pub vdb: Arc<Vdb>,
    pub extensions: Arc<ExtensionRegistry>,
}

impl TxnCtx {
    pub fn new(now_unix: i64, vdb: Arc<Vdb>, extensions: Arc<ExtensionRegistry>) -> Self {
        Self {
            now_unix,
            wakeups: Wakeups::default(),
            vdb,
            extensions,
        }
    }
}

/// Outcome of a send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Bundle created and dispatched
    Sent(BundleHandle),
    /// Destination unknown or malformed; nothing was created
    NoDestination,
}

/// Everything the internal send path needs to build a bundle
pub(crate) struct SendSpec {
    pub source: Eid,
    pub destination: Eid,
    pub report_to: Eid,
    pub lifespan_secs: u64,
    pub class: ClassOfService,
    pub custody: CustodySwitch,
    pub srr: SrrFlags,
    pub ack_requested: bool,
    pub extended_cos: ExtendedCos,
    pub adu: Zco,
    pub is_admin: bool,
}

/// An application's hold on an endpoint
pub struct Sap {
    pub eid: Eid,
    pub(crate) vendpoint: Arc<VEndpoint>,
}

/// One delivered ADU
#[derive(Debug, Clone)]
pub struct Delivery {
    pub source: Eid,
    pub creation: CreationTimestamp,
    pub adu: Zco,
    pub adu_length: u64,
    pub is_admin: bool,
    pub expiration_unix: i64,
}

impl Node {
    /// Initialize a fresh node
    pub fn init(config: NodeConfig) -> Node {
        Self::init_with_clock(config, Arc::new(SystemClock))
    }

    /// Initialize with an explicit time source
    pub fn init_with_clock(config: NodeConfig, clock: Arc<dyn NodeClock>) -> Node {
        let db = new_db(&config);
        let node = Node {
            inner: Arc::new(NodeInner {
                store: TxnStore::new(db),
                vdb: Arc::new(Vdb::new()),
                clock,
                extensions: Arc::new(ExtensionRegistry::standard()),
                clock_task: Mutex::new(None),
            }),
        };
        node.raise_vdb();
        node
    }

    /// Restore a node from a checkpoint image
    pub fn restore(path: &Path, clock: Arc<dyn NodeClock>) -> BpResult<Node> {
        let store = TxnStore::restore(path)?;
        let node = Node {
            inner: Arc::new(NodeInner {
                store,
                vdb: Arc::new(Vdb::new()),
                clock,
                extensions: Arc::new(ExtensionRegistry::standard()),
                clock_task: Mutex::new(None),
            }),
        };
        node.raise_vdb();
        Ok(node)
    }

    /// Checkpoint the committed state to a file
    pub fn checkpoint(&self, path: &Path) -> BpResult<()> {
        self.inner.store.checkpoint(path)?;
        Ok(())
    }

    /// Rebuild the volatile index from the persistent catalogues
    pub fn raise_vdb(&self) {
        self.inner.store.read(|db| {
            self.inner.vdb.raise(db, db.local_node_nbr);
        });
    }

    /// Start the node: raise the index and launch the clock task
    pub fn start(&self) {
        self.raise_vdb();
        let mut task = match self.inner.clock_task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if task.is_none() {
            *task = Some(crate::clock::run_clock(self.clone()));
            debug!("Node started");
        }
    }

    /// Stop the node: halt the clock and unblock every waiter
    pub fn stop(&self) {
        let mut task = match self.inner.clock_task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = task.take() {
            handle.abort();
        }
        self.inner.vdb.drop_all();
        debug!("Node stopped");
    }

    /// Another attachment to the same node
    pub fn attach(&self) -> Node {
        self.clone()
    }

    pub(crate) fn now(&self) -> i64 {
        self.inner.clock.now_unix()
    }

    /// Run a transaction with an engine context; wakeups fire only on
    /// commit
    pub(crate) fn transact_ctx<R>(
        &self,
        f: impl FnOnce(&mut BpDb, &mut TxnCtx) -> Result<R, BpError>,
    ) -> BpResult<R> {
        let mut ctx = TxnCtx::new(
            self.now(),
            self.inner.vdb.clone(),
            self.inner.extensions.clone(),
        );
        let result = self.inner.store.transact(|db| f(db, &mut ctx));
        if result.is_ok() {
            ctx.wakeups.fire(&ctx.vdb);
        }
        result
    }

    /// Read-only view of the committed state
    pub fn read<R>(&self, f: impl FnOnce(&BpDb) -> R) -> R {
        self.inner.store.read(f)
    }

    /// Snapshot of the node-wide statistics blocks
    pub fn stats(&self) -> NodeStats {
        self.read(|db| db.stats)
    }

    /// ZCOs of acquisitions that were in progress when the state was
    /// last committed; populated again after a restore
    pub fn pending_inbound(&self) -> Vec<Zco> {
        self.read(|db| db.inbound_bundles.iter().cloned().collect())
    }

    /// Reserve an endpoint for this application
    pub fn open(&self, eid: &Eid) -> BpResult<Sap> {
        let vendpoint = self
            .inner
            .vdb
            .endpoint(eid.scheme_name(), &eid.nss())
            .ok_or_else(|| BpError::NoSuchEndpoint(eid.to_string()))?;
        if vendpoint
            .app_open
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(BpError::EndpointBusy(eid.to_string()));
        }
        Ok(Sap {
            eid: eid.clone(),
            vendpoint,
        })
    }

    /// Release an endpoint
    pub fn close(&self, sap: Sap) {
        sap.vendpoint.app_open.store(false, Ordering::SeqCst);
    }

    /// Unblock this endpoint's current `receive` with the interrupted
    /// sentinel
    pub fn interrupt(&self, sap: &Sap) {
        sap.vendpoint.delivery.interrupt();
    }

    /// Submit an ADU for transmission
    #[instrument(skip(self, source, extended_cos, adu), fields(dest = %destination))]
    #[allow(clippy::too_many_arguments)]
    pub fn send(
        &self,
        source: Option<&Sap>,
        destination: &Eid,
        report_to: Option<Eid>,
        lifespan_secs: u64,
        class: ClassOfService,
        custody: CustodySwitch,
        srr: SrrFlags,
        ack_requested: bool,
        extended_cos: ExtendedCos,
        adu: Zco,
    ) -> BpResult<SendOutcome> {
        let spec = SendSpec {
            source: source.map(|sap| sap.eid.clone()).unwrap_or(Eid::Null),
            destination: destination.clone(),
            report_to: report_to.unwrap_or(Eid::Null),
            lifespan_secs,
            class,
            custody,
            srr,
            ack_requested,
            extended_cos,
            adu,
            is_admin: false,
        };
        self.transact_ctx(|db, ctx| send_in_txn(db, ctx, spec))
    }

    /// Extract the next delivery for an endpoint, waiting as needed
    pub async fn receive(&self, sap: &Sap) -> BpResult<Delivery> {
        loop {
            let delivery = self.transact_ctx(|db, ctx| {
                let handle = {
                    let Some(endpoint) = db.endpoints.get_mut(sap.vendpoint.handle) else {
                        return Err(BpError::NoSuchEndpoint(sap.eid.to_string()));
                    };
                    let Some(elt) = endpoint.delivery_queue.first_elt() else {
                        return Ok(None);
                    };
                    match endpoint.delivery_queue.remove(elt) {
                        Some(handle) => handle,
                        None => return Ok(None),
                    }
                };
                let (delivery, id) = {
                    let Some(bundle) = db.bundles.get_mut(handle) else {
                        return Ok(None);
                    };
                    bundle.dlv_queue_ref = None;
                    bundle.delivered = true;
                    // Custody ends at final delivery.
                    bundle.custody_taken = false;
                    let delivery = Delivery {
                        source: bundle.id.source.clone(),
                        creation: bundle.id.creation,
                        adu: bundle.payload.content.clone(),
                        adu_length: bundle.payload.length,
                        is_admin: bundle.flags.is_admin,
                        expiration_unix: bundle.expiration_unix,
                    };
                    (delivery, bundle.id.clone())
                };
                crate::lifecycle::cancel_ct_due(db, handle);
                if let Some(endpoint) = db.endpoints.get_mut(sap.vendpoint.handle) {
                    endpoint.stats.delivered.add(delivery.adu_length);
                }
                stats::watch(db.watch, WatchMask::DELIVERED, "deliver", &id);
                destroy_bundle(db, ctx, handle, false, SrReason::None)?;
                Ok(Some(delivery))
            })?;
            if let Some(delivery) = delivery {
                return Ok(delivery);
            }
            match sap.vendpoint.delivery.wait().await {
                WaitOutcome::Posted => continue,
                WaitOutcome::Interrupted => return Err(BpError::Interrupted),
                WaitOutcome::Shutdown => return Err(BpError::ShuttingDown),
            }
        }
    }

    /// Cancel a bundle: behaves like TTL expiry with reason Canceled
    pub fn cancel(&self, handle: BundleHandle) -> BpResult<bool> {
        self.transact_ctx(|db, ctx| {
            if !db.bundles.contains(handle) {
                return Err(BpError::StaleBundle);
            }
            destroy_bundle(db, ctx, handle, true, SrReason::Canceled)
        })
    }

    /// Create an application tracking list
    ///
    /// A tracked bundle cannot be destroyed until it is untracked.
    pub fn create_tracking_list(&self) -> BpResult<waystation_store::Handle<crate::db::TrackingList>> {
        self.transact_ctx(|db, _ctx| Ok(db.tracking_lists.insert(crate::db::TrackingList::default())))
    }

    /// Add a bundle to a tracking list
    pub fn track_bundle(
        &self,
        list: waystation_store::Handle<crate::db::TrackingList>,
        handle: BundleHandle,
    ) -> BpResult<()> {
        self.transact_ctx(|db, _ctx| {
            if !db.bundles.contains(handle) {
                return Err(BpError::StaleBundle);
            }
            let Some(tracking) = db.tracking_lists.get_mut(list) else {
                return Err(BpError::InvalidOperation("no such tracking list".into()));
            };
            let elt = tracking.bundles.push_back(handle);
            if let Some(bundle) = db.bundles.get_mut(handle) {
                bundle.tracking_refs.push((list, elt));
            }
            Ok(())
        })
    }

    /// Remove a bundle from a tracking list, releasing that retention
    /// constraint
    pub fn untrack_bundle(
        &self,
        list: waystation_store::Handle<crate::db::TrackingList>,
        handle: BundleHandle,
    ) -> BpResult<()> {
        self.transact_ctx(|db, ctx| {
            let refs = db
                .bundles
                .get_mut(handle)
                .map(|bundle| {
                    let mut removed = Vec::new();
                    bundle.tracking_refs.retain(|&(l, elt)| {
                        if l == list {
                            removed.push(elt);
                            false
                        } else {
                            true
                        }
                    });
                    removed
                })
                .unwrap_or_default();
            if let Some(tracking) = db.tracking_lists.get_mut(list) {
                for elt in refs {
                    tracking.bundles.remove(elt);
                }
            }
            destroy_bundle(db, ctx, handle, false, SrReason::None)?;
            Ok(())
        })
    }

    /// Bundles currently on a tracking list
    pub fn tracked_bundles(
        &self,
        list: waystation_store::Handle<crate::db::TrackingList>,
    ) -> Vec<BundleHandle> {
        self.read(|db| {
            db.tracking_lists
                .get(list)
                .map(|tracking| tracking.bundles.iter().copied().collect())
                .unwrap_or_default()
        })
    }
}

/// Create a bundle and dispatch it, inside an open transaction
pub(crate) fn send_in_txn(
    db: &mut BpDb,
    ctx: &mut TxnCtx,
    spec: SendSpec,
) -> Result<SendOutcome, BpError> {
    let destination_local = db.eid_is_local(&spec.destination).is_some();
    if !destination_local && db.find_scheme(spec.destination.scheme_name()).is_none() {
        return Ok(SendOutcome::NoDestination);
    }

    let creation = db.next_creation_timestamp(ctx.now_unix);
    let adu_length = spec.adu.len();
    let expiration_unix = ctx.now_unix + spec.lifespan_secs as i64;

    let primary = PrimaryBlock {
        flags: waystation_core::BundleFlags {
            is_fragment: false,
            is_admin: spec.is_admin,
            do_not_fragment: false,
            custodial: !matches!(spec.custody, CustodySwitch::NoCustody),
            singleton_destination: true,
            app_ack_request: spec.ack_requested,
        },
        class: spec.class,
        srr: spec.srr,
        destination: spec.destination,
        source: spec.source.clone(),
        report_to: spec.report_to,
        custodian: Eid::Null,
        creation,
        lifetime_secs: spec.lifespan_secs,
        fragment_offset: 0,
        total_adu_length: 0,
    };
    let mut bundle = Bundle::from_primary(
        primary,
        Payload {
            length: adu_length,
            content: spec.adu,
        },
        expiration_unix,
    );
    bundle.anonymous = spec.source.is_null();
    bundle.extended_cos = spec.extended_cos;
    bundle.db_overhead = bundle.guess_size();
    db.occupancy.increase(bundle.db_overhead + adu_length);

    let key = bundle.key();
    bundle.hash_entry = Some(key.clone());
    let handle = db.bundles.insert(bundle);
    db.catalogue_bundle(key, handle);

    let ttl_key = db.timeline.insert(
        expiration_unix,
        BpEvent {
            kind: BpEventKind::ExpiredTtl,
            subject: EventRef::Bundle(handle),
        },
    );
    if let Some(bundle) = db.bundles.get_mut(handle) {
        bundle.ttl_elt = Some(ttl_key);
    }

    db.stats.source.add(spec.class, adu_length);
    if let Some(endpoint) = db.eid_is_local(&spec.source)
        && let Some(endpoint) = db.endpoints.get_mut(endpoint)
    {
        endpoint.stats.sourced.add(adu_length);
    }
    if let Some(bundle) = db.bundles.get(handle) {
        stats::watch(db.watch, WatchMask::SOURCED, "source", &bundle.id);
    }

    match dispatch_bundle(db, ctx, handle)? {
        DispatchOutcome::Dispatched => Ok(SendOutcome::Sent(handle)),
        DispatchOutcome::NoScheme => {
            // Checked above; reachable only if the catalogue changed
            // inside this very transaction.
            destroy_bundle(db, ctx, handle, false, SrReason::NoKnownRoute)?;
            Ok(SendOutcome::NoDestination)
        }
    }
}
