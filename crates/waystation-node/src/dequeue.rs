//! The dequeue engine
//!
//! A convergence-layer output adapter pulls bundles off its outduct
//! with [`Node::dequeue`]: rate-gate on the transmit throttle, select
//! across the three outflows, fragment to the payload ceiling,
//! catenate header and trailer onto the payload ZCO, and hand the
//! result to the wire. Expedited traffic strictly precedes the weighted
//! standard/bulk rotation.

use tracing::{trace, warn};

use waystation_core::{
    BLOCK_TYPE_BUNDLE_AGE, BLOCK_TYPE_PAYLOAD, BlockFlags, BundleKey, ClassOfService,
    PrimaryBlock, SrReason, SrrFlags, StatusFlags, codec::block::parse_block_header,
    codec::bundle_age_block, codec::serialize_block_header,
};
use waystation_core::{Eid, ExtendedCos};
use waystation_store::{Handle, Zco};

use crate::admin::emit_status_report;
use crate::bundle::XmitRef;
use crate::db::{BpDb, BundleHandle, ClProtocol, Outduct};
use crate::error::{BpError, BpResult};
use crate::forward::{detach_from_xmit, enqueue_to_limbo, forward_bundle};
use crate::lifecycle::{clone_bundle, destroy_bundle, detach_fwd_queue, install_ct_due};
use crate::node::{Node, TxnCtx};
use crate::stats::{self, WatchMask};
use crate::vdb::WaitOutcome;

/// Service factor of the expedited outflow
pub const EXPEDITED_SVC_FACTOR: u32 = 2;
/// Service factor of the standard outflow
pub const STANDARD_SVC_FACTOR: u32 = 2;
/// Service factor of the bulk outflow
pub const BULK_SVC_FACTOR: u32 = 1;

/// Bandwidth-rotation state for one priority class
///
/// Outflows are private to the output adapter; they mirror the
/// persistent queues only for QoS-sensitive selection.
#[derive(Debug, Clone, Copy)]
pub struct Outflow {
    pub class: ClassOfService,
    pub total_bytes_sent: u64,
    pub svc_factor: u32,
}

impl Outflow {
    /// The standard three-outflow set: Expedited, Standard, Bulk
    pub fn standard_set() -> [Outflow; 3] {
        [
            Outflow {
                class: ClassOfService::Expedited,
                total_bytes_sent: 0,
                svc_factor: EXPEDITED_SVC_FACTOR,
            },
            Outflow {
                class: ClassOfService::Standard,
                total_bytes_sent: 0,
                svc_factor: STANDARD_SVC_FACTOR,
            },
            Outflow {
                class: ClassOfService::Bulk,
                total_bytes_sent: 0,
                svc_factor: BULK_SVC_FACTOR,
            },
        ]
    }
}

/// Disposition contract between the engine and the output adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequeueTimeout {
    /// The adapter promises to report transmission success or failure
    Stewardship,
    /// No stewardship and no custody timer
    FireAndForget,
    /// No stewardship; infer custody failure after this many seconds
    CustodyTimer(u64),
}

/// A bundle ready for the wire
#[derive(Debug, Clone)]
pub struct DequeuedBundle {
    /// Catenated header + payload + trailer
    pub zco: Zco,
    pub class: ClassOfService,
    pub extended_cos: ExtendedCos,
    pub dest_duct_name: Option<String>,
    pub prox_node_eid: Option<Eid>,
    pub bundle: BundleHandle,
}

/// Serialize a bundle's header (primary + pre-payload blocks + payload
/// block header) and trailer (post-payload blocks)
fn catenate(db: &BpDb, handle: BundleHandle) -> Result<Option<Zco>, BpError> {
    let Some(bundle) = db.bundles.get(handle) else {
        return Ok(None);
    };
    let mut header = bundle.primary_block().serialize();
    for block in &bundle.pre_payload_blocks {
        let mut block = block.clone();
        block.flags.remove(BlockFlags::IS_LAST);
        block.serialize(&mut header);
    }
    let mut payload_flags = bundle.payload_block_flags;
    if bundle.post_payload_blocks.is_empty() {
        payload_flags.insert(BlockFlags::IS_LAST);
    } else {
        payload_flags.remove(BlockFlags::IS_LAST);
    }
    serialize_block_header(
        BLOCK_TYPE_PAYLOAD,
        payload_flags,
        &[],
        bundle.payload.length,
        &mut header,
    );

    let mut trailer = Vec::new();
    for (i, block) in bundle.post_payload_blocks.iter().enumerate() {
        let mut block = block.clone();
        if i + 1 == bundle.post_payload_blocks.len() {
            block.flags.insert(BlockFlags::IS_LAST);
        } else {
            block.flags.remove(BlockFlags::IS_LAST);
        }
        block.serialize(&mut trailer);
    }

    let mut zco = bundle.payload.content.clone_range(0, bundle.payload.length)?;
    zco.prepend(header.into());
    if !trailer.is_empty() {
        zco.append(trailer.into());
    }
    Ok(Some(zco))
}

/// Pick the class to serve next
///
/// Expedited strictly precedes the others; standard and bulk rotate by
/// minimal totalBytesSent · svcFactor, expedited-adjacent ties going to
/// standard.
fn select_class(outduct: &Outduct, outflows: &[Outflow; 3]) -> Option<ClassOfService> {
    if !outduct.urgent_queue.is_empty() {
        return Some(ClassOfService::Expedited);
    }
    let mut best: Option<(u64, ClassOfService)> = None;
    for outflow in outflows {
        if outflow.class == ClassOfService::Expedited {
            continue;
        }
        if outduct.queue(outflow.class).is_empty() {
            continue;
        }
        let metric = outflow.total_bytes_sent * outflow.svc_factor as u64;
        let better = match best {
            None => true,
            Some((best_metric, best_class)) => {
                metric < best_metric
                    || (metric == best_metric && outflow.class > best_class)
            }
        };
        if better {
            best = Some((metric, outflow.class));
        }
    }
    best.map(|(_, class)| class)
}

/// Split a queued bundle at `max_payload_len`, re-queuing the tail at
/// the head of the same queue
fn fragment_on_dequeue(
    db: &mut BpDb,
    ctx: &mut TxnCtx,
    outduct_handle: Handle<Outduct>,
    class: ClassOfService,
    handle: BundleHandle,
    max_payload_len: u64,
) -> Result<(), BpError> {
    let Some(bundle) = db.bundles.get(handle) else {
        return Err(BpError::StaleBundle);
    };
    let old_length = bundle.payload.length;
    let tail_length = old_length - max_payload_len;
    let was_fragment = bundle.flags.is_fragment;
    let old_key = bundle.key();

    let tail = clone_bundle(db, ctx, handle, max_payload_len, tail_length)?;

    // Truncate the selected bundle to the head range and re-key it.
    if let Some(bundle) = db.bundles.get_mut(handle) {
        bundle.payload.content.truncate(max_payload_len)?;
        bundle.payload.length = max_payload_len;
        if !was_fragment {
            bundle.total_adu_length = old_length;
            bundle.flags.is_fragment = true;
        }
    }
    db.occupancy.reduce(tail_length);
    db.decatalogue_bundle(&old_key, handle);
    let new_key = db.bundles.get(handle).map(|b| b.key());
    if let Some(new_key) = new_key {
        if let Some(bundle) = db.bundles.get_mut(handle) {
            bundle.hash_entry = Some(new_key.clone());
        }
        db.catalogue_bundle(new_key, handle);
    }

    let ordinal = db
        .bundles
        .get(tail)
        .map(|b| b.extended_cos.ordinal as usize)
        .unwrap_or(0);
    let Some(outduct) = db.outducts.get_mut(outduct_handle) else {
        return Err(BpError::NoSuchDuct(format!("{outduct_handle}")));
    };
    // The head part's queued bytes shrink; the tail re-enters at the
    // front of the same queue.
    // Class and ordinal backlogs are unchanged net: the head part
    // shrinks by exactly what the tail re-adds.
    let elt = outduct.queue_mut(class).push_front(tail);
    if class == ClassOfService::Expedited {
        let state = &mut outduct.ordinals[ordinal];
        if state.last_for_ordinal.is_none() {
            state.last_for_ordinal = Some(elt);
        }
    }
    if let Some(tail_bundle) = db.bundles.get_mut(tail) {
        tail_bundle.duct_xmit = Some(XmitRef::Duct {
            outduct: outduct_handle,
            class,
            elt,
        });
    }
    trace!(bundle = %handle, tail = %tail, max_payload_len, "Fragmented on dequeue");
    Ok(())
}

fn dequeue_in_txn(
    db: &mut BpDb,
    ctx: &mut TxnCtx,
    outduct_handle: Handle<Outduct>,
    outflows: &[Outflow; 3],
    max_payload_len: Option<u64>,
    timeout: DequeueTimeout,
) -> Result<Option<DequeuedBundle>, BpError> {
    loop {
        let Some(outduct) = db.outducts.get(outduct_handle) else {
            return Err(BpError::NoSuchDuct(format!("{outduct_handle}")));
        };
        let effective_max = max_payload_len.unwrap_or(outduct.max_payload_len);
        let Some(class) = select_class(outduct, outflows) else {
            return Ok(None);
        };
        let Some(elt) = outduct.queue(class).first_elt() else {
            return Ok(None);
        };
        let Some(&handle) = outduct.queue(class).get(elt) else {
            return Ok(None);
        };
        let Some(bundle) = db.bundles.get(handle) else {
            // Stale queue entry; drop it and try again.
            if let Some(outduct) = db.outducts.get_mut(outduct_handle) {
                outduct.queue_mut(class).remove(elt);
            }
            continue;
        };
        let expired = bundle.expired;
        let payload_length = bundle.payload.length;
        if expired {
            detach_from_xmit(db, handle);
            destroy_bundle(db, ctx, handle, false, SrReason::None)?;
            continue;
        }

        if effective_max > 0 && payload_length > effective_max {
            fragment_on_dequeue(db, ctx, outduct_handle, class, handle, effective_max)?;
        }

        // Carry the bundle-age block forward with the time spent here.
        if let Some(bundle) = db.bundles.get_mut(handle)
            && let Some(arrival) = bundle.arrival_unix
        {
            let resident_micros = (ctx.now_unix - arrival).max(0) as u64 * 1_000_000;
            let refreshed = bundle_age_block(bundle.age_micros + resident_micros);
            for block in bundle
                .pre_payload_blocks
                .iter_mut()
                .chain(bundle.post_payload_blocks.iter_mut())
            {
                if block.block_type == BLOCK_TYPE_BUNDLE_AGE {
                    block.body = refreshed.body.clone();
                }
            }
        }

        let Some(zco) = catenate(db, handle)? else {
            continue;
        };
        detach_from_xmit(db, handle);

        let Some(bundle) = db.bundles.get(handle) else {
            continue;
        };
        let payload_length = bundle.payload.length;
        let srr = bundle.srr;
        let custodial = bundle.custody_taken;
        let id = bundle.id.clone();
        let result = DequeuedBundle {
            zco,
            class,
            extended_cos: bundle.extended_cos,
            dest_duct_name: bundle.dest_duct_name.clone(),
            prox_node_eid: bundle.prox_node_eid.clone(),
            bundle: handle,
        };

        if srr.contains(SrrFlags::FORWARDED) {
            let mut flags = StatusFlags::default();
            flags.insert(StatusFlags::FORWARDED);
            emit_status_report(db, ctx, handle, flags, SrReason::None)?;
        }
        db.stats.xmit.add(class, payload_length);
        if let Some(outduct) = db.outducts.get_mut(outduct_handle) {
            outduct.stats.dequeued.add(payload_length);
        }
        stats::watch(db.watch, WatchMask::DEQUEUED, "dequeue", &id);

        match timeout {
            DequeueTimeout::Stewardship => {
                if let Some(bundle) = db.bundles.get_mut(handle) {
                    bundle.stewarded = true;
                }
            }
            DequeueTimeout::FireAndForget => {}
            DequeueTimeout::CustodyTimer(interval) => {
                if custodial {
                    install_ct_due(db, handle, ctx.now_unix + interval as i64);
                }
            }
        }
        if timeout != DequeueTimeout::Stewardship {
            // Gone from every queue; lives on only under custody or
            // another constraint.
            destroy_bundle(db, ctx, handle, false, SrReason::None)?;
        }
        return Ok(Some(result));
    }
}

impl Node {
    /// Pull the next bundle to transmit through an outduct
    ///
    /// Blocks on the transmit throttle, then on the transmit signal
    /// when all queues are empty. Returns `None` on cooperative
    /// interrupt. The returned ZCO is the complete catenated bundle.
    pub async fn dequeue(
        &self,
        protocol: &str,
        duct: &str,
        outflows: &mut [Outflow; 3],
        max_payload_len: Option<u64>,
        timeout: DequeueTimeout,
    ) -> BpResult<Option<DequeuedBundle>> {
        let voutduct = self
            .inner
            .vdb
            .outduct(protocol, duct)
            .ok_or_else(|| BpError::NoSuchDuct(format!("{protocol}/{duct}")))?;
        match voutduct.xmit_throttle.wait_ready().await {
            WaitOutcome::Posted => {}
            WaitOutcome::Interrupted => return Ok(None),
            WaitOutcome::Shutdown => return Err(BpError::ShuttingDown),
        }
        loop {
            let flows = *outflows;
            let dequeued = self.transact_ctx(|db, ctx| {
                dequeue_in_txn(db, ctx, voutduct.handle, &flows, max_payload_len, timeout)
            })?;
            if let Some(dequeued) = dequeued {
                let emitted = dequeued.zco.len();
                voutduct.xmit_throttle.debit(emitted);
                if let Some(outflow) = outflows.iter_mut().find(|f| f.class == dequeued.class) {
                    outflow.total_bytes_sent += emitted;
                }
                return Ok(Some(dequeued));
            }
            match voutduct.xmit.wait().await {
                WaitOutcome::Posted => continue,
                WaitOutcome::Interrupted => return Ok(None),
                WaitOutcome::Shutdown => return Err(BpError::ShuttingDown),
            }
        }
    }

    /// Unblock a CLA waiting in [`Node::dequeue`]
    pub fn interrupt_outduct(&self, protocol: &str, duct: &str) {
        if let Some(voutduct) = self.inner.vdb.outduct(protocol, duct) {
            voutduct.xmit.interrupt();
            voutduct.xmit_throttle.interrupt();
        }
    }

    /// Locate the stored bundle a catenated ZCO was serialized from
    ///
    /// Parses the identity fields out of the leading bytes; an
    /// incomplete primary block (or one larger than the scratch
    /// buffer) yields `None`.
    pub fn identify(&self, zco: &Zco) -> BpResult<Option<BundleHandle>> {
        let mut scratch = vec![0u8; 2048usize.min(zco.len() as usize)];
        let mut reader = zco.reader();
        let mut filled = 0;
        while filled < scratch.len() {
            let n = reader.read(&mut scratch[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        let Ok((primary, consumed)) = PrimaryBlock::parse(&scratch[..filled]) else {
            return Ok(None);
        };
        let fragment_length = if primary.flags.is_fragment {
            // Walk to the payload block header for the length.
            let mut cursor = consumed;
            loop {
                let Ok(header) = parse_block_header(&scratch[cursor..filled]) else {
                    return Ok(None);
                };
                if header.block_type == BLOCK_TYPE_PAYLOAD {
                    break header.data_length;
                }
                cursor += header.header_length + header.data_length as usize;
                if cursor >= filled {
                    return Ok(None);
                }
            }
        } else {
            0
        };
        let key = BundleKey {
            source: primary.source,
            creation: primary.creation,
            fragment_offset: primary.fragment_offset,
            fragment_length,
        };
        Ok(self.read(|db| db.find_bundle(&key)))
    }

    /// Report convergence-layer transmission success for a dequeued
    /// bundle
    ///
    /// Destroys the serialized ZCO. If custody was taken and `interval`
    /// is positive, custody failure is inferred after that many
    /// seconds.
    pub fn handle_xmit_success(&self, zco: Zco, interval: u64) -> BpResult<()> {
        let handle = self.identify(&zco)?;
        drop(zco);
        let Some(handle) = handle else {
            return Ok(());
        };
        self.transact_ctx(|db, ctx| {
            let Some(bundle) = db.bundles.get_mut(handle) else {
                return Ok(());
            };
            bundle.stewarded = false;
            let custodial = bundle.custody_taken;
            if custodial {
                if interval > 0 {
                    install_ct_due(db, handle, ctx.now_unix + interval as i64);
                }
            } else {
                destroy_bundle(db, ctx, handle, false, SrReason::None)?;
            }
            Ok(())
        })
    }

    /// Report convergence-layer transmission failure for a dequeued
    /// bundle: the stored bundle is re-forwarded
    pub fn handle_xmit_failure(&self, zco: Zco) -> BpResult<()> {
        let handle = self.identify(&zco)?;
        drop(zco);
        let Some(handle) = handle else {
            return Ok(());
        };
        self.transact_ctx(|db, ctx| {
            if let Some(bundle) = db.bundles.get_mut(handle) {
                bundle.stewarded = false;
            }
            reforward_bundle(db, ctx, handle)
        })
    }

    /// Re-forward a bundle whose transmission is overdue or failed
    pub fn reforward(&self, handle: BundleHandle) -> BpResult<()> {
        self.transact_ctx(|db, ctx| reforward_bundle(db, ctx, handle))
    }

    /// Install a custody-acceptance-due event for a bundle
    ///
    /// The clock re-forwards the bundle if it is still here when the
    /// moment arrives.
    pub fn memo(&self, handle: BundleHandle, interval: u64) -> BpResult<()> {
        self.transact_ctx(|db, ctx| {
            if !db.bundles.contains(handle) {
                return Err(BpError::StaleBundle);
            }
            install_ct_due(db, handle, ctx.now_unix + interval as i64);
            Ok(())
        })
    }

    /// Queue bytes that would go out ahead of a bundle of the given
    /// class and ordinal on this outduct
    pub fn applicable_backlog(
        &self,
        protocol: &str,
        duct: &str,
        class: ClassOfService,
        ordinal: u8,
    ) -> BpResult<u64> {
        self.read(|db| {
            let outduct = db
                .find_outduct(protocol, duct)
                .and_then(|h| db.outducts.get(h))
                .ok_or_else(|| BpError::NoSuchDuct(format!("{protocol}/{duct}")))?;
            Ok(compute_applicable_backlog(outduct, class, ordinal))
        })
    }
}

/// Abort current outduct queuing and queue for fresh forwarding; a
/// routeless bundle goes to limbo
pub(crate) fn reforward_bundle(
    db: &mut BpDb,
    ctx: &mut TxnCtx,
    handle: BundleHandle,
) -> Result<(), BpError> {
    if let Some(key) = db.bundles.get_mut(handle).and_then(|b| b.overdue_elt.take()) {
        db.timeline.remove(key);
    }
    detach_from_xmit(db, handle);
    detach_fwd_queue(db, handle);
    let Some(bundle) = db.bundles.get_mut(handle) else {
        return Ok(());
    };
    bundle.prox_node_eid = None;
    bundle.dest_duct_name = None;
    bundle.enqueue_unix = None;
    bundle.stations.clear();
    let destination = bundle.destination.clone();
    let payload_length = bundle.payload.length;
    db.stats.db.requeued_for_fwd.add(payload_length);

    if !forward_bundle(db, ctx, handle, destination)? {
        warn!(bundle = %handle, "No forwarding scheme on reforward; suspending");
        enqueue_to_limbo(db, ctx, handle)?;
    }
    Ok(())
}

/// Queue bytes ahead of a would-be arrival of the given class/ordinal
pub fn compute_applicable_backlog(outduct: &Outduct, class: ClassOfService, ordinal: u8) -> u64 {
    match class {
        ClassOfService::Expedited => outduct
            .ordinals
            .iter()
            .skip(ordinal as usize)
            .map(|state| state.backlog_bytes)
            .sum(),
        ClassOfService::Standard => outduct.urgent_backlog + outduct.std_backlog,
        ClassOfService::Bulk => {
            outduct.urgent_backlog + outduct.std_backlog + outduct.bulk_backlog
        }
    }
}

/// Estimated convergence-layer capacity consumption for a bundle of
/// the given serialized size: the size plus per-frame overhead
pub fn compute_eccc(size: u64, protocol: &ClProtocol) -> u64 {
    if protocol.payload_bytes_per_frame == 0 {
        return size;
    }
    let frames = size.div_ceil(protocol.payload_bytes_per_frame as u64).max(1);
    size + frames * protocol.overhead_per_frame as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use waystation_store::Arena;

    fn make_protocol(payload: u32, overhead: u32) -> ClProtocol {
        ClProtocol {
            name: "udp".to_string(),
            payload_bytes_per_frame: payload,
            overhead_per_frame: overhead,
            nominal_rate: 0,
            inducts: Vec::new(),
            outducts: Vec::new(),
        }
    }

    #[test]
    fn test_eccc_counts_frame_overhead() {
        let protocol = make_protocol(100, 20);
        // One frame.
        assert_eq!(compute_eccc(50, &protocol), 70);
        // Three frames.
        assert_eq!(compute_eccc(250, &protocol), 310);
        // Zero frame size means no framing model.
        assert_eq!(compute_eccc(50, &make_protocol(0, 20)), 50);
    }

    #[test]
    fn test_applicable_backlog_by_class() {
        let mut protocols: Arena<ClProtocol> = Arena::new();
        let protocol = protocols.insert(make_protocol(100, 20));
        let mut outduct = Outduct::new("wire".into(), "clo".into(), protocol);
        outduct.urgent_backlog = 100;
        outduct.std_backlog = 50;
        outduct.bulk_backlog = 25;
        outduct.ordinals[10].backlog_bytes = 60;
        outduct.ordinals[200].backlog_bytes = 40;

        assert_eq!(
            compute_applicable_backlog(&outduct, ClassOfService::Standard, 0),
            150
        );
        assert_eq!(
            compute_applicable_backlog(&outduct, ClassOfService::Bulk, 0),
            175
        );
        // Expedited at ordinal 100 waits only behind ordinals >= 100.
        assert_eq!(
            compute_applicable_backlog(&outduct, ClassOfService::Expedited, 100),
            40
        );
        assert_eq!(
            compute_applicable_backlog(&outduct, ClassOfService::Expedited, 0),
            100
        );
    }

    #[test]
    fn test_select_class_rotation() {
        let mut protocols: Arena<ClProtocol> = Arena::new();
        let protocol = protocols.insert(make_protocol(100, 20));
        let mut outduct = Outduct::new("wire".into(), "clo".into(), protocol);
        let mut bundles: Arena<crate::bundle::Bundle> = Arena::new();
        let primary = waystation_core::PrimaryBlock {
            flags: Default::default(),
            class: Default::default(),
            srr: Default::default(),
            destination: waystation_core::Eid::ipn(2, 1),
            source: waystation_core::Eid::ipn(1, 1),
            report_to: waystation_core::Eid::Null,
            custodian: waystation_core::Eid::Null,
            creation: waystation_core::CreationTimestamp::new(1, 1),
            lifetime_secs: 60,
            fragment_offset: 0,
            total_adu_length: 0,
        };
        let handle = bundles.insert(crate::bundle::Bundle::from_primary(
            primary,
            Default::default(),
            0,
        ));

        let mut outflows = Outflow::standard_set();
        assert_eq!(select_class(&outduct, &outflows), None);

        outduct.std_queue.push_back(handle);
        outduct.bulk_queue.push_back(handle);
        // Equal metrics: standard wins the tie.
        assert_eq!(
            select_class(&outduct, &outflows),
            Some(ClassOfService::Standard)
        );

        // Enough standard traffic sent shifts the rotation to bulk.
        outflows[1].total_bytes_sent = 100;
        assert_eq!(select_class(&outduct, &outflows), Some(ClassOfService::Bulk));

        // Expedited strictly precedes everything.
        outduct.urgent_queue.push_back(handle);
        assert_eq!(
            select_class(&outduct, &outflows),
            Some(ClassOfService::Expedited)
        );
    }
}
