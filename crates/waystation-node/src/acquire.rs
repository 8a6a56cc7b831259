//! The acquisition engine
//!
//! A convergence-layer input adapter acquires one bundle at a time
//! through an [`AcqWorkArea`]: begin, then either attach a pre-built
//! ZCO or append byte ranges, then end. Ending parses the accumulated
//! bytes, applies per-block-type handlers and unknown-block flag rules,
//! admits the bundle against the heap budget, catalogues it, and hands
//! it to the lifecycle engine.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use waystation_core::{
    BLOCK_TYPE_BUNDLE_AGE, BLOCK_TYPE_PAYLOAD, BP_EPOCH_UNIX_SECS, BlockFlags, CodecError, Eid,
    ExtensionBlock, PrimaryBlock, SrReason, StatusFlags, codec::block::parse_block_header,
    codec::decode_bundle_age,
};
use waystation_store::Zco;

use crate::bundle::{Bundle, Dossier, Payload};
use crate::db::{BpEvent, BpEventKind, EventRef};
use crate::error::{BpError, BpResult};
use crate::forward::{DispatchOutcome, dispatch_bundle};
use crate::lifecycle::abandon;
use crate::node::Node;

/// Scratch buffer size for block parsing
const ACQ_SCRATCH_LEN: usize = 2048;

/// Per-block-type acquisition and release callbacks
pub trait ExtensionHandler: Send + Sync {
    /// Incorporate an acquired block into the bundle under construction
    fn acquire(&self, block: &ExtensionBlock, bundle: &mut Bundle) -> Result<(), CodecError>;

    /// Invoked when the owning bundle is destroyed
    fn release(&self, _block: &ExtensionBlock) {}
}

/// Registry of block-type handlers
///
/// Unknown types fall through to generic opaque handling governed by
/// the block's own flag bits.
pub struct ExtensionRegistry {
    handlers: HashMap<u8, Arc<dyn ExtensionHandler>>,
}

impl ExtensionRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry with the standard block types installed
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(BLOCK_TYPE_BUNDLE_AGE, Arc::new(BundleAgeHandler));
        registry
    }

    /// Install a handler for a block type
    pub fn register(&mut self, block_type: u8, handler: Arc<dyn ExtensionHandler>) {
        self.handlers.insert(block_type, handler);
    }

    /// Handler for a block type, if any
    pub fn handler(&self, block_type: u8) -> Option<&Arc<dyn ExtensionHandler>> {
        self.handlers.get(&block_type)
    }

    /// Run the release hook for a block, if its type is known
    pub fn release(&self, block: &ExtensionBlock) {
        if let Some(handler) = self.handlers.get(&block.block_type) {
            handler.release(block);
        }
    }
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// Carries the bundle's accumulated age forward
struct BundleAgeHandler;

impl ExtensionHandler for BundleAgeHandler {
    fn acquire(&self, block: &ExtensionBlock, bundle: &mut Bundle) -> Result<(), CodecError> {
        bundle.age_micros = decode_bundle_age(&block.body)?;
        Ok(())
    }
}

/// Why a bundle was rejected at acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcqRejection {
    /// Unparseable primary block or block structure
    Malformed,
    /// Heap budget would not admit the bundle
    Congestive,
    /// An unreadable critical block forced abort
    Aborted,
    /// Acquired but unroutable; abandoned
    NoRoute,
}

/// Outcome of ending an acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcqOutcome {
    /// Fully acquired and dispatched
    Accepted(crate::db::BundleHandle),
    /// This bundle failed; acquisition itself can continue
    Rejected(AcqRejection),
}

/// Acquisition decision state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcqDecision {
    #[default]
    Tbd,
    Ok,
}

/// Work area for acquiring one bundle at a time from a CLA
pub struct AcqWorkArea {
    node: Node,
    induct: Option<(String, String)>,

    // Per-bundle state.
    authentic: bool,
    sender_eid: Option<Eid>,
    zco: Option<Zco>,
    /// Retention of the accumulating ZCO in the store's inbound list
    zco_elt: Option<waystation_store::ListElt<Zco>>,
    decision: AcqDecision,
    last_block_parsed: bool,
    malformed: bool,
    congestive: bool,
    must_abort: bool,
    header_length: usize,
    trailer_length: usize,
    bundle_length: u64,

    buffer: Box<[u8; ACQ_SCRATCH_LEN]>,
}

impl Node {
    /// Gate an induct's acquisition on its throttle
    ///
    /// The convergence-layer input adapter calls this before reading
    /// more bytes off the wire; the clock credits the throttle once per
    /// second.
    pub async fn wait_acq_capacity(&self, protocol: &str, duct: &str) -> BpResult<()> {
        let vinduct = self
            .inner
            .vdb
            .induct(protocol, duct)
            .ok_or_else(|| BpError::NoSuchDuct(format!("{protocol}/{duct}")))?;
        match vinduct.acq_throttle.wait_ready().await {
            crate::vdb::WaitOutcome::Posted => Ok(()),
            crate::vdb::WaitOutcome::Interrupted => Err(BpError::Interrupted),
            crate::vdb::WaitOutcome::Shutdown => Err(BpError::ShuttingDown),
        }
    }

    /// Unblock a CLA waiting in [`Node::wait_acq_capacity`]
    pub fn interrupt_induct(&self, protocol: &str, duct: &str) {
        if let Some(vinduct) = self.inner.vdb.induct(protocol, duct) {
            vinduct.acq_throttle.interrupt();
        }
    }

    /// Allocate an acquisition work area, optionally bound to an induct
    /// for statistics and throttling
    pub fn get_acq_area(&self, induct: Option<(String, String)>) -> AcqWorkArea {
        AcqWorkArea {
            node: self.clone(),
            induct,
            authentic: false,
            sender_eid: None,
            zco: None,
            zco_elt: None,
            decision: AcqDecision::Tbd,
            last_block_parsed: false,
            malformed: false,
            congestive: false,
            must_abort: false,
            header_length: 0,
            trailer_length: 0,
            bundle_length: 0,
            buffer: Box::new([0u8; ACQ_SCRATCH_LEN]),
        }
    }
}

impl AcqWorkArea {
    /// Initialize per-bundle state
    ///
    /// `authentic` and `sender_eid` are the convergence layer's own
    /// assertions about the inbound transmission.
    pub fn begin_acq(&mut self, authentic: bool, sender_eid: Option<Eid>) {
        self.authentic = authentic;
        self.sender_eid = sender_eid;
        self.zco = None;
        self.decision = AcqDecision::Tbd;
        self.last_block_parsed = false;
        self.malformed = false;
        self.congestive = false;
        self.must_abort = false;
        self.header_length = 0;
        self.trailer_length = 0;
        self.bundle_length = 0;
    }

    /// Attach a pre-built ZCO holding the whole catenated bundle
    pub fn load_acq(&mut self, zco: Zco) -> BpResult<()> {
        self.zco = Some(zco);
        self.retain_inbound()
    }

    /// Append a byte range, creating the acquisition ZCO on first call
    pub fn continue_acq(&mut self, bytes: &[u8]) -> BpResult<()> {
        let zco = self.zco.get_or_insert_with(Zco::new);
        zco.append(Bytes::copy_from_slice(bytes));
        self.retain_inbound()
    }

    /// Mirror the accumulating ZCO into the store's inbound list, so a
    /// partially received bundle survives a restart
    fn retain_inbound(&mut self) -> BpResult<()> {
        let Some(zco) = self.zco.clone() else {
            return Ok(());
        };
        let elt = self.zco_elt;
        let new_elt = self.node.transact_ctx(|db, _ctx| {
            if let Some(elt) = elt
                && let Some(slot) = db.inbound_bundles.get_mut(elt)
            {
                *slot = zco.clone();
                Ok(elt)
            } else {
                Ok(db.inbound_bundles.push_back(zco.clone()))
            }
        })?;
        self.zco_elt = Some(new_elt);
        Ok(())
    }

    /// Drop the store's retention of this acquisition's ZCO
    fn release_inbound(&mut self) -> BpResult<()> {
        if let Some(elt) = self.zco_elt.take() {
            self.node.transact_ctx(|db, _ctx| {
                db.inbound_bundles.remove(elt);
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Abort the acquisition, destroying the accumulated ZCO
    pub fn cancel_acq(&mut self) {
        self.zco = None;
        let _ = self.release_inbound();
        self.decision = AcqDecision::Tbd;
        self.malformed = false;
        self.congestive = false;
        self.must_abort = false;
    }

    /// Accumulated bytes so far
    pub fn bytes_received(&self) -> u64 {
        self.zco.as_ref().map(|z| z.len()).unwrap_or(0)
    }

    /// Parse the accumulated bundle and dispatch it
    pub fn end_acq(&mut self) -> BpResult<AcqOutcome> {
        self.release_inbound()?;
        let Some(zco) = self.zco.take() else {
            self.malformed = true;
            return self.reject(AcqRejection::Malformed);
        };
        self.bundle_length = zco.len();

        // Pull the catenated bytes through the scratch buffer.
        let mut bytes = Vec::with_capacity(self.bundle_length as usize);
        let mut reader = zco.reader();
        loop {
            let n = reader.read(&mut self.buffer[..])?;
            if n == 0 {
                break;
            }
            bytes.extend_from_slice(&self.buffer[..n]);
        }

        let (primary, primary_len) = match PrimaryBlock::parse(&bytes) {
            Ok(parsed) => parsed,
            Err(err) => {
                trace!(error = %err, "Malformed primary block");
                self.malformed = true;
                return self.reject(AcqRejection::Malformed);
            }
        };

        let max_block_size = self.node.read(|db| db.max_block_size);
        let mut cursor = primary_len;
        let mut pre_payload = Vec::new();
        let mut post_payload = Vec::new();
        let mut payload: Option<(BlockFlags, usize, u64)> = None;
        let mut report_if_aborted = false;

        while cursor < bytes.len() {
            let header = match parse_block_header(&bytes[cursor..]) {
                Ok(header) => header,
                Err(_) => {
                    self.malformed = true;
                    break;
                }
            };
            if header.block_type == BLOCK_TYPE_PAYLOAD {
                let body_start = cursor + header.header_length;
                let body_end = body_start + header.data_length as usize;
                if body_end > bytes.len() || payload.is_some() {
                    self.malformed = true;
                    break;
                }
                self.header_length = body_start;
                payload = Some((header.flags, body_start, header.data_length));
                if header.flags.contains(BlockFlags::IS_LAST) {
                    self.last_block_parsed = true;
                }
                cursor = body_end;
                continue;
            }
            let (block, consumed) = match ExtensionBlock::parse(&bytes[cursor..], max_block_size) {
                Ok(parsed) => parsed,
                Err(_) => {
                    self.malformed = true;
                    break;
                }
            };
            cursor += consumed;
            if block.flags.contains(BlockFlags::IS_LAST) {
                self.last_block_parsed = true;
            }

            let known = self.node.inner.extensions.handler(block.block_type).is_some();
            if !known {
                if block.flags.contains(BlockFlags::ABORT_IF_UNPROCESSED) {
                    self.must_abort = true;
                    if block.flags.contains(BlockFlags::REPORT_IF_UNPROCESSED) {
                        report_if_aborted = true;
                    }
                    continue;
                }
                if block.flags.contains(BlockFlags::REMOVE_IF_UNPROCESSED) {
                    continue;
                }
            }
            let mut block = block;
            if !known {
                block.flags.insert(BlockFlags::FORWARDED_OPAQUE);
            }
            if payload.is_none() {
                pre_payload.push(block);
            } else {
                post_payload.push(block);
            }
        }
        if payload.is_none() {
            self.malformed = true;
        }
        self.trailer_length = bytes.len() - payload.map(|(_, s, l)| s + l as usize).unwrap_or(bytes.len());

        if self.malformed {
            return self.reject(AcqRejection::Malformed);
        }
        if self.must_abort {
            if report_if_aborted {
                self.report_unacquired(&primary)?;
            }
            return self.reject(AcqRejection::Aborted);
        }
        let (payload_flags, payload_start, payload_length) =
            payload.unwrap_or((BlockFlags::default(), 0, 0));

        // Admission against the shared heap budget.
        let congestive = self.node.read(|db| {
            self.bundle_length > db.max_acq_in_heap
                || db.occupancy.would_exceed(self.bundle_length)
        });
        if congestive {
            self.congestive = true;
            return self.reject(AcqRejection::Congestive);
        }

        let payload_zco = zco.clone_range(payload_start as u64, payload_length)?;
        let authentic = self.authentic;
        let sender_eid = self.sender_eid.clone();
        let induct = self.induct.clone();
        let node = self.node.clone();

        // Acquired bytes count against the induct's acquisition rate.
        if let Some((protocol, duct)) = &self.induct
            && let Some(vinduct) = self.node.inner.vdb.induct(protocol, duct)
        {
            vinduct.acq_throttle.debit(self.bundle_length);
        }

        let outcome = node.transact_ctx(|db, ctx| {
            let expiration_unix =
                BP_EPOCH_UNIX_SECS + primary.creation.seconds as i64 + primary.lifetime_secs as i64;
            let mut bundle = Bundle::from_primary(
                primary.clone(),
                Payload {
                    length: payload_length,
                    content: payload_zco.clone(),
                },
                expiration_unix,
            );
            bundle.payload_block_flags = payload_flags;
            bundle.pre_payload_blocks = pre_payload.clone();
            bundle.post_payload_blocks = post_payload.clone();
            bundle.arrival_unix = Some(ctx.now_unix);
            bundle.dossier = Dossier {
                authentic,
                sender_node_nbr: sender_eid.as_ref().and_then(|eid| eid.node_nbr()),
                sender_eid: sender_eid.clone(),
            };
            let blocks: Vec<ExtensionBlock> = bundle
                .pre_payload_blocks
                .iter()
                .chain(bundle.post_payload_blocks.iter())
                .cloned()
                .collect();
            for block in &blocks {
                if let Some(handler) = ctx.extensions.handler(block.block_type)
                    && let Err(err) = handler.acquire(block, &mut bundle)
                {
                    warn!(block_type = block.block_type, error = %err, "Extension acquisition failed");
                }
            }

            bundle.db_overhead = bundle.guess_size();
            db.occupancy.increase(bundle.db_overhead + payload_length);
            let key = bundle.key();
            bundle.hash_entry = Some(key.clone());
            let duplicate = db.bundle_index.contains_key(&key);
            let handle = db.bundles.insert(bundle);
            db.catalogue_bundle(key, handle);
            if duplicate {
                debug!(bundle = %handle, "Duplicate bundle key; set collapsed to count");
            }

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

            if let Some((protocol, duct)) = &induct
                && let Some(induct_handle) = db.find_induct(protocol, duct)
                && let Some(induct) = db.inducts.get_mut(induct_handle)
            {
                induct.stats.received.add(payload_length);
            }

            match dispatch_bundle(db, ctx, handle)? {
                DispatchOutcome::Dispatched => Ok(AcqOutcome::Accepted(handle)),
                DispatchOutcome::NoScheme => {
                    abandon(db, ctx, handle, SrReason::NoKnownRoute)?;
                    Ok(AcqOutcome::Rejected(AcqRejection::NoRoute))
                }
            }
        })?;

        self.decision = AcqDecision::Ok;
        Ok(outcome)
    }

    /// Count a rejection against the bound induct and reset
    fn reject(&mut self, rejection: AcqRejection) -> BpResult<AcqOutcome> {
        let length = self.bundle_length;
        if let Some((protocol, duct)) = self.induct.clone() {
            self.node.transact_ctx(|db, _ctx| {
                if let Some(induct_handle) = db.find_induct(&protocol, &duct)
                    && let Some(induct) = db.inducts.get_mut(induct_handle)
                {
                    induct.stats.received.add(length);
                    match rejection {
                        AcqRejection::Malformed | AcqRejection::Aborted => {
                            induct.stats.malformed.add(length)
                        }
                        AcqRejection::Congestive => induct.stats.congestive.add(length),
                        AcqRejection::NoRoute => {}
                    }
                }
                Ok(())
            })?;
        }
        self.zco = None;
        Ok(AcqOutcome::Rejected(rejection))
    }

    /// Status report about a bundle that never entered the store
    fn report_unacquired(&self, primary: &PrimaryBlock) -> BpResult<()> {
        if !primary.srr.contains(waystation_core::SrrFlags::DELETED)
            || primary.report_to.is_null()
        {
            return Ok(());
        }
        let primary = primary.clone();
        self.node.transact_ctx(|db, ctx| {
            let mut flags = StatusFlags::default();
            flags.insert(StatusFlags::DELETED);
            let now =
                waystation_core::DtnTime::new(
                    waystation_core::CreationTimestamp::seconds_from_unix(ctx.now_unix),
                    0,
                );
            let rpt = waystation_core::BpStatusRpt {
                is_fragment: primary.flags.is_fragment,
                flags,
                reason: SrReason::BlockUnintelligible,
                fragment_offset: primary.fragment_offset,
                fragment_length: 0,
                deletion_time: now,
                creation: primary.creation,
                source_eid: primary.source.to_string(),
                ..Default::default()
            };
            db.stats.rpt.deleted += 1;
            let adu = Zco::from_bytes(
                waystation_core::AdminRecord::StatusReport(rpt).serialize().into(),
            );
            let _ = crate::node::send_in_txn(
                db,
                ctx,
                crate::node::SendSpec {
                    source: crate::admin::scheme_admin_eid(
                        primary.report_to.is_cbhe(),
                        primary.report_to.scheme_name(),
                        db.local_node_nbr,
                    ),
                    destination: primary.report_to.clone(),
                    report_to: Eid::Null,
                    lifespan_secs: primary.lifetime_secs.max(60),
                    class: primary.class,
                    custody: waystation_core::CustodySwitch::NoCustody,
                    srr: waystation_core::SrrFlags::none(),
                    ack_requested: false,
                    extended_cos: waystation_core::ExtendedCos::default(),
                    adu,
                    is_admin: true,
                },
            )?;
            Ok(())
        })
    }

    /// Final decision recorded by the last `end_acq`
    pub fn decision(&self) -> AcqDecision {
        self.decision
    }

    /// Whether a block flagged as last has been parsed
    pub fn last_block_parsed(&self) -> bool {
        self.last_block_parsed
    }

    /// Serialized header length of the last acquired bundle
    pub fn header_length(&self) -> usize {
        self.header_length
    }

    /// Serialized trailer length of the last acquired bundle
    pub fn trailer_length(&self) -> usize {
        self.trailer_length
    }

    /// Release the work area
    pub fn release(self) {}
}
