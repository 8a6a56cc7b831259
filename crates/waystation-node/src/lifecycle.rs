//! Bundle lifecycle: accept, abandon, clone, destroy, deliver
//!
//! Every function here runs inside an open store transaction and takes
//! the working state plus the transaction context. Destruction honors
//! the retention-constraint discipline: a bundle with any outstanding
//! back-reference (or custody, or stewardship) stays allocated — at
//! most marked expired — until the last holder lets go.

use tracing::{debug, trace};

use waystation_core::{BpCtSignal, BundleKey, CtReason, Eid, SrReason, StatusFlags};

use crate::admin::{emit_ct_signal, emit_status_report, scheme_admin_eid};
use crate::bundle::{Bundle, Payload};
use crate::db::{
    BpDb, BpEvent, BpEventKind, BundleHandle, EventRef, Endpoint, IncompleteBundle, RecvRule,
};
use crate::error::BpError;
use crate::node::TxnCtx;
use crate::stats::{self, WatchMask};
use crate::vdb::Vdb;
use waystation_store::Handle;

/// Accept a bundle for forwarding or delivery
///
/// Idempotent: only the first call takes effect. Takes custody when the
/// bundle asks for it and storage permits, installing the custody-due
/// timer and signalling the prior custodian.
pub(crate) fn accept(db: &mut BpDb, ctx: &mut TxnCtx, handle: BundleHandle) -> Result<(), BpError> {
    let Some(bundle) = db.bundles.get(handle) else {
        return Err(BpError::StaleBundle);
    };
    if bundle.accepted {
        return Ok(());
    }
    let custodial = bundle.flags.custodial;
    let class = bundle.class;
    let payload_length = bundle.payload.length;
    let srr = bundle.srr;
    let was_acquired = bundle.arrival_unix.is_some();
    let prior_custodian = bundle.custodian.clone();
    let scheme_name = bundle.destination.scheme_name().to_string();

    if let Some(bundle) = db.bundles.get_mut(handle) {
        bundle.accepted = true;
    }
    if was_acquired {
        db.stats.recv.add(class, payload_length);
    }

    let mut report_flags = StatusFlags::default();
    if was_acquired && srr.contains(waystation_core::SrrFlags::RECEIVED) {
        report_flags.insert(StatusFlags::RECEIVED);
    }

    let storage_ok = !db.occupancy.would_exceed(0);
    if custodial && storage_ok {
        let cbhe = db
            .find_scheme(&scheme_name)
            .and_then(|h| db.schemes.get(h))
            .is_some_and(|s| s.cbhe);
        let own_admin = scheme_admin_eid(cbhe, &scheme_name, db.local_node_nbr);
        if let Some(bundle) = db.bundles.get_mut(handle) {
            bundle.custody_taken = true;
            bundle.custodian = own_admin;
        }
        let due = ctx.now_unix + db.ct_expired_timeout as i64;
        install_ct_due(db, handle, due);
        db.stats.ct.accepted.add(payload_length);
        if !prior_custodian.is_null() {
            emit_ct_signal(db, ctx, handle, &prior_custodian, true, CtReason::None)?;
        }
        if srr.contains(waystation_core::SrrFlags::CUSTODY_ACCEPTED) {
            report_flags.insert(StatusFlags::CUSTODY_ACCEPTED);
        }
        if let Some(bundle) = db.bundles.get(handle) {
            stats::watch(db.watch, WatchMask::CUSTODY_ACCEPTED, "custody-accept", &bundle.id);
        }
    }

    if report_flags != StatusFlags::default() {
        emit_status_report(db, ctx, handle, report_flags, SrReason::None)?;
    }
    Ok(())
}

/// Give up on a bundle that cannot be forwarded
///
/// Call at most once per bundle. Emits the deletion report and, for
/// custodial bundles, a custody-refusal signal, then destroys.
pub(crate) fn abandon(
    db: &mut BpDb,
    ctx: &mut TxnCtx,
    handle: BundleHandle,
    reason: SrReason,
) -> Result<(), BpError> {
    let Some(bundle) = db.bundles.get(handle) else {
        return Err(BpError::StaleBundle);
    };
    let custodial = bundle.flags.custodial;
    let custodian = bundle.custodian.clone();
    let class = bundle.class;
    let payload_length = bundle.payload.length;
    let srr = bundle.srr;
    let id = bundle.id.clone();

    if srr.contains(waystation_core::SrrFlags::DELETED) {
        let mut flags = StatusFlags::default();
        flags.insert(StatusFlags::DELETED);
        emit_status_report(db, ctx, handle, flags, reason)?;
    }
    if custodial && !custodian.is_null() {
        let ct_reason = match reason {
            SrReason::DepletedStorage => CtReason::DepletedStorage,
            SrReason::DestinationUnintelligible => CtReason::DestinationUnintelligible,
            _ => CtReason::NoKnownRoute,
        };
        emit_ct_signal(db, ctx, handle, &custodian, false, ct_reason)?;
        db.stats.ct.refused.add(payload_length);
    }
    db.stats.discard.add(class, payload_length);
    if let Some(endpoint) = db.eid_is_local(&id.source)
        && let Some(endpoint) = db.endpoints.get_mut(endpoint)
    {
        endpoint.stats.abandoned.add(payload_length);
    }
    stats::watch(db.watch, WatchMask::ABANDONED, "abandon", &id);

    detach_fwd_queue(db, handle);
    destroy_bundle(db, ctx, handle, false, reason)?;
    Ok(())
}

/// Copy all or part of a bundle
///
/// With `offset == 0` and `length` equal to the payload length (or
/// zero), the product is a full copy; otherwise it is a fragment whose
/// payload is the indicated range. Both products are catalogued.
pub(crate) fn clone_bundle(
    db: &mut BpDb,
    _ctx: &mut TxnCtx,
    handle: BundleHandle,
    offset: u64,
    length: u64,
) -> Result<BundleHandle, BpError> {
    let Some(original) = db.bundles.get(handle) else {
        return Err(BpError::StaleBundle);
    };
    let payload_length = original.payload.length;
    let (offset, length) = if offset == 0 && (length == 0 || length == payload_length) {
        (0, payload_length)
    } else {
        (offset, length)
    };
    let full_copy = offset == 0 && length == payload_length;

    let mut copy = original.clone();
    copy.payload = Payload {
        length,
        content: original.payload.content.clone_range(offset, length)?,
    };
    if !full_copy {
        if !copy.flags.is_fragment {
            copy.total_adu_length = payload_length;
            copy.flags.is_fragment = true;
        }
        copy.id.fragment_offset = original.id.fragment_offset + offset;
    }

    // The copy enters the store bare: no back-references, no custody,
    // no stewardship.
    copy.hash_entry = None;
    copy.ttl_elt = None;
    copy.overdue_elt = None;
    copy.ct_due_elt = None;
    copy.fwd_queue_ref = None;
    copy.fragment_elt = None;
    copy.dlv_queue_ref = None;
    copy.tracking_refs = Vec::new();
    copy.incomplete_ref = None;
    copy.duct_xmit = None;
    copy.custody_taken = false;
    copy.stewarded = false;
    copy.delivered = false;
    copy.suspended = false;

    copy.db_overhead = copy.guess_size();
    db.occupancy.increase(copy.db_overhead + length);
    let key = copy.key();
    copy.hash_entry = Some(key.clone());
    let expiration = copy.expiration_unix;
    let new_handle = db.bundles.insert(copy);
    db.catalogue_bundle(key, new_handle);

    let ttl_key = db.timeline.insert(
        expiration,
        BpEvent {
            kind: BpEventKind::ExpiredTtl,
            subject: EventRef::Bundle(new_handle),
        },
    );
    if let Some(copy) = db.bundles.get_mut(new_handle) {
        copy.ttl_elt = Some(ttl_key);
    }
    trace!(original = %handle, copy = %new_handle, offset, length, "Cloned bundle");
    Ok(new_handle)
}

/// Destroy a bundle if no retention constraint remains
///
/// Returns `true` only on actual destruction. With `expired` set, a
/// still-constrained bundle is marked expired and stays allocated; it
/// can no longer be delivered or forwarded.
pub(crate) fn destroy_bundle(
    db: &mut BpDb,
    ctx: &mut TxnCtx,
    handle: BundleHandle,
    expired: bool,
    reason: SrReason,
) -> Result<bool, BpError> {
    let Some(bundle) = db.bundles.get_mut(handle) else {
        return Ok(false);
    };
    if expired {
        bundle.expired = true;
    }
    if bundle.retained() {
        trace!(bundle = %handle, constraints = bundle.constraint_count(), "Destruction deferred");
        return Ok(false);
    }

    let ttl_elt = bundle.ttl_elt.take();
    let overdue_elt = bundle.overdue_elt.take();
    let was_expired = bundle.expired;
    let srr = bundle.srr;
    let payload_length = bundle.payload.length;
    let db_overhead = bundle.db_overhead;
    let class = bundle.class;
    let id = bundle.id.clone();

    if let Some(key) = ttl_elt {
        db.timeline.remove(key);
    }
    if let Some(key) = overdue_elt {
        db.timeline.remove(key);
    }

    if was_expired {
        if srr.contains(waystation_core::SrrFlags::DELETED) {
            let mut flags = StatusFlags::default();
            flags.insert(StatusFlags::DELETED);
            let reason = if reason == SrReason::None {
                SrReason::LifetimeExpired
            } else {
                reason
            };
            emit_status_report(db, ctx, handle, flags, reason)?;
        }
        db.stats.db.expired.add(payload_length);
        stats::watch(db.watch, WatchMask::EXPIRED, "expire", &id);
    }

    // Type-specific release hooks for every extension block.
    if let Some(bundle) = db.bundles.get(handle) {
        for block in bundle
            .pre_payload_blocks
            .iter()
            .chain(&bundle.post_payload_blocks)
            .chain(&bundle.collab_blocks)
        {
            ctx.extensions.release(block);
        }
    }

    if let Some(key) = db.bundles.get_mut(handle).and_then(|b| b.hash_entry.take()) {
        db.decatalogue_bundle(&key, handle);
    }
    db.occupancy.reduce(db_overhead + payload_length);
    db.bundles.remove(handle);
    debug!(bundle = %id, class = ?class, expired = was_expired, "Destroyed bundle");
    Ok(true)
}

/// Deliver a bundle to a local endpoint
///
/// Fragments are routed through reassembly; whole bundles join the
/// delivery queue (or are discarded when the endpoint has no consumer
/// and its rule says discard).
pub(crate) fn deliver(
    db: &mut BpDb,
    ctx: &mut TxnCtx,
    endpoint_handle: Handle<Endpoint>,
    handle: BundleHandle,
) -> Result<(), BpError> {
    let Some(bundle) = db.bundles.get(handle) else {
        return Err(BpError::StaleBundle);
    };
    if bundle.expired {
        destroy_bundle(db, ctx, handle, false, SrReason::None)?;
        return Ok(());
    }
    if bundle.flags.is_fragment {
        return insert_fragment(db, ctx, endpoint_handle, handle);
    }

    let class = bundle.class;
    let payload_length = bundle.payload.length;
    let srr = bundle.srr;

    let Some(endpoint) = db.endpoints.get(endpoint_handle) else {
        return Err(BpError::NoSuchEndpoint(format!("{endpoint_handle}")));
    };
    let nss = endpoint.nss.clone();
    let recv_rule = endpoint.recv_rule;
    let scheme_name = db
        .schemes
        .get(endpoint.scheme)
        .map(|s| s.name.clone())
        .unwrap_or_default();

    let consumer_present = consumer_open(&ctx.vdb, &scheme_name, &nss);
    if recv_rule == RecvRule::Discard && !consumer_present {
        db.stats.discard.add(class, payload_length);
        destroy_bundle(db, ctx, handle, false, SrReason::None)?;
        return Ok(());
    }

    if let Some(endpoint) = db.endpoints.get(endpoint_handle)
        && let Some(script) = &endpoint.recv_script
    {
        // Arrival scripts are a process-model concern; surface the
        // request and let the host environment run it.
        debug!(script = %script, endpoint = %nss, "Arrival script requested");
    }

    let Some(endpoint) = db.endpoints.get_mut(endpoint_handle) else {
        return Err(BpError::NoSuchEndpoint(format!("{endpoint_handle}")));
    };
    let elt = endpoint.delivery_queue.push_back(handle);
    endpoint.stats.queued.add(payload_length);
    if let Some(bundle) = db.bundles.get_mut(handle) {
        bundle.dlv_queue_ref = Some((endpoint_handle, elt));
    }

    if srr.contains(waystation_core::SrrFlags::DELIVERED) {
        let mut flags = StatusFlags::default();
        flags.insert(StatusFlags::DELIVERED);
        emit_status_report(db, ctx, handle, flags, SrReason::None)?;
    }
    ctx.wakeups.delivery.push((scheme_name, nss));
    Ok(())
}

fn consumer_open(vdb: &Vdb, scheme_name: &str, nss: &str) -> bool {
    vdb.endpoint(scheme_name, nss)
        .is_some_and(|v| v.app_open.load(std::sync::atomic::Ordering::SeqCst))
}

/// File a fragment with its ADU's reassembly state and complete the
/// ADU when coverage closes
fn insert_fragment(
    db: &mut BpDb,
    ctx: &mut TxnCtx,
    endpoint_handle: Handle<Endpoint>,
    handle: BundleHandle,
) -> Result<(), BpError> {
    let Some(bundle) = db.bundles.get(handle) else {
        return Err(BpError::StaleBundle);
    };
    let source = bundle.id.source.clone();
    let creation = bundle.id.creation;
    let offset = bundle.id.fragment_offset;
    let total_adu_length = bundle.total_adu_length;

    // Find or create the incomplete for this ADU.
    let existing = db
        .endpoints
        .get(endpoint_handle)
        .map(|endpoint| {
            endpoint
                .incompletes
                .iter()
                .copied()
                .find(|&inc_handle| {
                    db.incompletes
                        .get(inc_handle)
                        .is_some_and(|inc| inc.source == source && inc.creation == creation)
                })
        })
        .unwrap_or(None);
    let inc_handle = match existing {
        Some(inc_handle) => inc_handle,
        None => {
            let inc_handle = db.incompletes.insert(IncompleteBundle {
                source: source.clone(),
                creation,
                fragments: Default::default(),
                total_adu_length,
                endpoint: endpoint_handle,
                endpoint_elt: None,
            });
            if let Some(endpoint) = db.endpoints.get_mut(endpoint_handle) {
                let elt = endpoint.incompletes.push_back(inc_handle);
                if let Some(inc) = db.incompletes.get_mut(inc_handle) {
                    inc.endpoint_elt = Some(elt);
                }
            }
            inc_handle
        }
    };

    // Insert ordered by fragment offset: after the last fragment whose
    // offset does not exceed ours.
    let anchor = db.incompletes.get(inc_handle).map(|inc| {
        let mut anchor = None;
        for elt in inc.fragments.elts() {
            let frag_offset = inc
                .fragments
                .get(elt)
                .and_then(|&h| db.bundles.get(h))
                .map(|b| b.id.fragment_offset);
            match frag_offset {
                Some(o) if o <= offset => anchor = Some(elt),
                _ => break,
            }
        }
        anchor
    });
    let Some(inc) = db.incompletes.get_mut(inc_handle) else {
        return Err(BpError::StaleBundle);
    };
    inc.total_adu_length = inc.total_adu_length.max(total_adu_length);
    let elt = match anchor.flatten() {
        Some(anchor) => inc
            .fragments
            .insert_after(anchor, handle)
            .unwrap_or_else(|| inc.fragments.push_back(handle)),
        None => inc.fragments.push_front(handle),
    };
    if let Some(bundle) = db.bundles.get_mut(handle) {
        bundle.fragment_elt = Some(elt);
        bundle.incomplete_ref = Some(inc_handle);
    }

    if reassembly_complete(db, inc_handle) {
        reassemble(db, ctx, endpoint_handle, inc_handle)?;
    }
    Ok(())
}

/// Coverage test: offset zero start, no gaps, final fragment reaching
/// the total ADU length
fn reassembly_complete(db: &BpDb, inc_handle: Handle<IncompleteBundle>) -> bool {
    let Some(inc) = db.incompletes.get(inc_handle) else {
        return false;
    };
    if inc.total_adu_length == 0 {
        return false;
    }
    let mut covered: u64 = 0;
    let mut any = false;
    for &frag_handle in inc.fragments.iter() {
        let Some(fragment) = db.bundles.get(frag_handle) else {
            return false;
        };
        if fragment.id.fragment_offset > covered {
            return false;
        }
        covered = covered.max(fragment.id.fragment_offset + fragment.payload.length);
        any = true;
    }
    any && covered == inc.total_adu_length
}

/// Concatenate fragment payloads into one aggregate bundle, queue it
/// for delivery, and destroy every fragment
fn reassemble(
    db: &mut BpDb,
    ctx: &mut TxnCtx,
    endpoint_handle: Handle<Endpoint>,
    inc_handle: Handle<IncompleteBundle>,
) -> Result<(), BpError> {
    let Some(inc) = db.incompletes.get(inc_handle) else {
        return Ok(());
    };
    let total = inc.total_adu_length;
    let fragment_handles: Vec<BundleHandle> = inc.fragments.iter().copied().collect();
    let endpoint_elt = inc.endpoint_elt;

    // Overlapping coverage takes each byte from the earliest fragment
    // that carries it.
    let mut aggregate_payload = waystation_store::Zco::new();
    let mut covered: u64 = 0;
    let mut template: Option<Bundle> = None;
    for &frag_handle in &fragment_handles {
        let Some(fragment) = db.bundles.get(frag_handle) else {
            continue;
        };
        if template.is_none() {
            template = Some(fragment.clone());
        }
        let offset = fragment.id.fragment_offset;
        let length = fragment.payload.length;
        if offset + length <= covered {
            continue;
        }
        let skip = covered - offset;
        let piece = fragment.payload.content.clone_range(skip, length - skip)?;
        aggregate_payload.append_zco(piece);
        covered = offset + length;
    }
    let Some(template) = template else {
        return Ok(());
    };

    let mut aggregate = template;
    aggregate.flags.is_fragment = false;
    aggregate.id.fragment_offset = 0;
    aggregate.total_adu_length = 0;
    aggregate.payload = Payload {
        length: total,
        content: aggregate_payload,
    };
    aggregate.hash_entry = None;
    aggregate.ttl_elt = None;
    aggregate.overdue_elt = None;
    aggregate.ct_due_elt = None;
    aggregate.fwd_queue_ref = None;
    aggregate.fragment_elt = None;
    aggregate.dlv_queue_ref = None;
    aggregate.tracking_refs = Vec::new();
    aggregate.incomplete_ref = None;
    aggregate.duct_xmit = None;
    aggregate.custody_taken = false;
    aggregate.stewarded = false;
    aggregate.db_overhead = aggregate.guess_size();
    db.occupancy.increase(aggregate.db_overhead + total);

    let key = aggregate.key();
    aggregate.hash_entry = Some(key.clone());
    let expiration = aggregate.expiration_unix;
    let aggregate_handle = db.bundles.insert(aggregate);
    db.catalogue_bundle(key, aggregate_handle);
    let ttl_key = db.timeline.insert(
        expiration,
        BpEvent {
            kind: BpEventKind::ExpiredTtl,
            subject: EventRef::Bundle(aggregate_handle),
        },
    );
    if let Some(aggregate) = db.bundles.get_mut(aggregate_handle) {
        aggregate.ttl_elt = Some(ttl_key);
    }

    // Destroy the fragments: clear their reassembly references first.
    for &frag_handle in &fragment_handles {
        if let Some(inc) = db.incompletes.get_mut(inc_handle)
            && let Some(fragment) = db.bundles.get_mut(frag_handle)
        {
            if let Some(elt) = fragment.fragment_elt.take() {
                inc.fragments.remove(elt);
            }
            fragment.incomplete_ref = None;
        }
        destroy_bundle(db, ctx, frag_handle, false, SrReason::None)?;
    }
    if let Some(endpoint) = db.endpoints.get_mut(endpoint_handle)
        && let Some(elt) = endpoint_elt
    {
        endpoint.incompletes.remove(elt);
    }
    db.incompletes.remove(inc_handle);

    debug!(endpoint = %endpoint_handle, total, "Reassembled ADU");
    deliver(db, ctx, endpoint_handle, aggregate_handle)
}

/// Apply an inbound custody signal
///
/// An unmatched signal is a silent success (the bundle was already
/// retired). Acceptance releases custody and destroys; refusal cancels
/// the custody timer and re-forwards.
pub(crate) fn apply_ct_signal(
    db: &mut BpDb,
    ctx: &mut TxnCtx,
    signal: &BpCtSignal,
) -> Result<(), BpError> {
    let Ok(source) = Eid::parse_with(&signal.source_eid, &db.eid_limits) else {
        return Ok(());
    };
    let key = BundleKey {
        source,
        creation: signal.creation,
        fragment_offset: if signal.is_fragment {
            signal.fragment_offset
        } else {
            0
        },
        fragment_length: if signal.is_fragment {
            signal.fragment_length
        } else {
            0
        },
    };
    let Some(handle) = db.find_bundle(&key) else {
        return Ok(());
    };

    cancel_ct_due(db, handle);
    if signal.succeeded {
        let payload_length = db
            .bundles
            .get_mut(handle)
            .map(|bundle| {
                bundle.custody_taken = false;
                bundle.payload.length
            })
            .unwrap_or(0);
        db.stats.ct.released.add(payload_length);
        destroy_bundle(db, ctx, handle, false, SrReason::None)?;
    } else {
        if let Some(bundle) = db.bundles.get(handle) {
            stats::watch(db.watch, WatchMask::CUSTODY_REFUSED, "custody-refusal", &bundle.id);
        }
        crate::dequeue::reforward_bundle(db, ctx, handle)?;
    }
    Ok(())
}

/// Install the custody-due timer, replacing any previous one
///
/// At most one custody-due event exists per unreleased custodial
/// bundle.
pub(crate) fn install_ct_due(db: &mut BpDb, handle: BundleHandle, due_unix: i64) {
    cancel_ct_due(db, handle);
    let key = db.timeline.insert(
        due_unix,
        BpEvent {
            kind: BpEventKind::CtDue,
            subject: EventRef::Bundle(handle),
        },
    );
    if let Some(bundle) = db.bundles.get_mut(handle) {
        bundle.ct_due_elt = Some(key);
    }
}

/// Cancel the custody-due timer, if any
pub(crate) fn cancel_ct_due(db: &mut BpDb, handle: BundleHandle) {
    if let Some(key) = db.bundles.get_mut(handle).and_then(|b| b.ct_due_elt.take()) {
        db.timeline.remove(key);
    }
}

/// Detach a bundle from its scheme's forward queue, if queued
pub(crate) fn detach_fwd_queue(db: &mut BpDb, handle: BundleHandle) {
    if let Some((scheme_handle, elt)) = db.bundles.get_mut(handle).and_then(|b| b.fwd_queue_ref.take())
        && let Some(scheme) = db.schemes.get_mut(scheme_handle)
    {
        scheme.forward_queue.remove(elt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use waystation_core::{BundleFlags, ClassOfService, CreationTimestamp, PrimaryBlock, SrrFlags};
    use waystation_store::Zco;

    use crate::acquire::ExtensionRegistry;
    use crate::node::{NodeConfig, TxnCtx, new_db};

    const NOW: i64 = 1_700_000_000;

    fn make_db() -> BpDb {
        new_db(&NodeConfig::default())
    }

    fn insert_bundle(db: &mut BpDb, custodial: bool, payload: &[u8]) -> BundleHandle {
        let primary = PrimaryBlock {
            flags: BundleFlags {
                custodial,
                singleton_destination: true,
                ..Default::default()
            },
            class: ClassOfService::Standard,
            srr: SrrFlags::none(),
            destination: Eid::ipn(2, 1),
            source: Eid::ipn(9, 1),
            report_to: Eid::Null,
            custodian: Eid::Null,
            creation: CreationTimestamp::new(500_000, 3),
            lifetime_secs: 3600,
            fragment_offset: 0,
            total_adu_length: 0,
        };
        let mut bundle = Bundle::from_primary(
            primary,
            crate::bundle::Payload {
                length: payload.len() as u64,
                content: Zco::from_bytes(Bytes::copy_from_slice(payload)),
            },
            NOW + 3600,
        );
        bundle.arrival_unix = Some(NOW);
        let key = bundle.key();
        bundle.hash_entry = Some(key.clone());
        let handle = db.bundles.insert(bundle);
        db.catalogue_bundle(key, handle);
        handle
    }

    #[test]
    fn test_accept_is_idempotent() {
        let vdb = std::sync::Arc::new(Vdb::new());
        let registry = std::sync::Arc::new(ExtensionRegistry::standard());
        let mut ctx = TxnCtx::new(NOW, vdb.clone(), registry.clone());
        let mut db = make_db();
        let handle = insert_bundle(&mut db, true, b"payload");

        accept(&mut db, &mut ctx, handle).unwrap();
        accept(&mut db, &mut ctx, handle).unwrap();

        // Custody taken once, one custody-due event installed.
        assert_eq!(db.stats.ct.accepted.count, 1);
        assert_eq!(db.timeline.len(), 1);
        let bundle = db.bundles.get(handle).unwrap();
        assert!(bundle.accepted);
        assert!(bundle.custody_taken);
        assert!(bundle.ct_due_elt.is_some());
    }

    #[test]
    fn test_destroy_deferred_while_custody_held() {
        let vdb = std::sync::Arc::new(Vdb::new());
        let registry = std::sync::Arc::new(ExtensionRegistry::standard());
        let mut ctx = TxnCtx::new(NOW, vdb.clone(), registry.clone());
        let mut db = make_db();
        let handle = insert_bundle(&mut db, true, b"held");
        accept(&mut db, &mut ctx, handle).unwrap();

        assert!(!destroy_bundle(&mut db, &mut ctx, handle, false, SrReason::None).unwrap());
        assert!(db.bundles.contains(handle));

        // Releasing custody clears the last constraint.
        if let Some(bundle) = db.bundles.get_mut(handle) {
            bundle.custody_taken = false;
        }
        cancel_ct_due(&mut db, handle);
        assert!(destroy_bundle(&mut db, &mut ctx, handle, false, SrReason::None).unwrap());
        assert!(!db.bundles.contains(handle));
        assert!(db.bundle_index.is_empty());
    }

    #[test]
    fn test_clone_full_copy_preserves_payload() {
        let vdb = std::sync::Arc::new(Vdb::new());
        let registry = std::sync::Arc::new(ExtensionRegistry::standard());
        let mut ctx = TxnCtx::new(NOW, vdb.clone(), registry.clone());
        let mut db = make_db();
        let handle = insert_bundle(&mut db, false, b"full payload bytes");

        let copy = clone_bundle(&mut db, &mut ctx, handle, 0, 0).unwrap();
        let original = db.bundles.get(handle).unwrap();
        let cloned = db.bundles.get(copy).unwrap();
        assert_eq!(
            original.payload.content.read_all().unwrap(),
            cloned.payload.content.read_all().unwrap()
        );
        assert!(!cloned.flags.is_fragment);
        assert_eq!(cloned.id, original.id);
    }

    #[test]
    fn test_clone_fragment_offsets() {
        let vdb = std::sync::Arc::new(Vdb::new());
        let registry = std::sync::Arc::new(ExtensionRegistry::standard());
        let mut ctx = TxnCtx::new(NOW, vdb.clone(), registry.clone());
        let mut db = make_db();
        let handle = insert_bundle(&mut db, false, b"0123456789");

        let tail = clone_bundle(&mut db, &mut ctx, handle, 6, 4).unwrap();
        let fragment = db.bundles.get(tail).unwrap();
        assert!(fragment.flags.is_fragment);
        assert_eq!(fragment.id.fragment_offset, 6);
        assert_eq!(fragment.total_adu_length, 10);
        assert_eq!(fragment.payload.content.read_all().unwrap(), b"6789");
        // Both products are catalogued.
        assert!(db.find_bundle(&fragment.key()).is_some());
    }

    #[test]
    fn test_duplicate_keys_collapse_to_count() {
        let mut db = make_db();
        let first = insert_bundle(&mut db, false, b"dup");
        let second = insert_bundle(&mut db, false, b"dup");

        let key = db.bundles.get(first).unwrap().key();
        let entry = db.bundle_index.get(&key).copied().unwrap();
        assert_eq!(entry.count, 2);
        assert!(entry.bundle.is_none());

        // Removing one member restores the direct reference.
        db.decatalogue_bundle(&key, first);
        if let Some(bundle) = db.bundles.get_mut(first) {
            bundle.hash_entry = None;
        }
        db.bundles.remove(first);
        let entry = db.bundle_index.get(&key).copied().unwrap();
        assert_eq!(entry.count, 1);
        assert_eq!(entry.bundle, Some(second));
    }
}
