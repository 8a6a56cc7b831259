//! The forwarding bridge
//!
//! Bundles move from dispatch (local delivery or a scheme's forward
//! queue) through a scheme-specific forwarder's directive into an
//! outduct's priority queues. The forwarder itself is external: it pops
//! forwarding tasks, computes a [`FwdDirective`], and hands the bundle
//! back. Bundles with no current route wait on the limbo queue.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{instrument, trace, warn};

use waystation_core::{BundleId, ClassOfService, Eid, ExtendedCos, SrReason};
use waystation_store::Handle;

use crate::bundle::XmitRef;
use crate::db::{BpDb, BpEvent, BpEventKind, BundleHandle, EventRef, Outduct};
use crate::error::{BpError, BpResult};
use crate::lifecycle::{abandon, accept, deliver, destroy_bundle, detach_fwd_queue};
use crate::node::{Node, TxnCtx};
use crate::stats::{self, WatchMask};
use crate::vdb::WaitOutcome;

/// How dispatch disposed of a bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchOutcome {
    /// Delivered locally or queued for scheme-specific forwarding
    Dispatched,
    /// No local endpoint and no scheme to forward within
    NoScheme,
}

/// Route a bundle: deliver locally when the destination is registered
/// here, otherwise queue it for the destination scheme's forwarder
pub(crate) fn dispatch_bundle(
    db: &mut BpDb,
    ctx: &mut TxnCtx,
    handle: BundleHandle,
) -> Result<DispatchOutcome, BpError> {
    accept(db, ctx, handle)?;
    let Some(bundle) = db.bundles.get(handle) else {
        return Err(BpError::StaleBundle);
    };
    let destination = bundle.destination.clone();
    if let Some(endpoint) = db.eid_is_local(&destination) {
        deliver(db, ctx, endpoint, handle)?;
        return Ok(DispatchOutcome::Dispatched);
    }
    if forward_bundle(db, ctx, handle, destination)? {
        Ok(DispatchOutcome::Dispatched)
    } else {
        Ok(DispatchOutcome::NoScheme)
    }
}

/// Queue a bundle for forwarding toward a station EID
///
/// Pushes the station onto the bundle's itinerary and hands the bundle
/// to the station scheme's forwarder. Returns `false` when no such
/// scheme is registered (the bundle is left untouched).
pub(crate) fn forward_bundle(
    db: &mut BpDb,
    ctx: &mut TxnCtx,
    handle: BundleHandle,
    station: Eid,
) -> Result<bool, BpError> {
    let Some(bundle) = db.bundles.get(handle) else {
        return Err(BpError::StaleBundle);
    };
    let expired = bundle.expired;
    let payload_length = bundle.payload.length;
    let id = bundle.id.clone();
    if expired {
        destroy_bundle(db, ctx, handle, false, SrReason::None)?;
        return Ok(true);
    }
    let Some(scheme_handle) = db.find_scheme(station.scheme_name()) else {
        return Ok(false);
    };

    if let Some(bundle) = db.bundles.get_mut(handle) {
        bundle.stations.push(station);
    }
    let Some(scheme) = db.schemes.get_mut(scheme_handle) else {
        return Ok(false);
    };
    let scheme_name = scheme.name.clone();
    let elt = scheme.forward_queue.push_back(handle);
    if let Some(bundle) = db.bundles.get_mut(handle) {
        bundle.fwd_queue_ref = Some((scheme_handle, elt));
    }
    db.stats.db.queued_for_fwd.add(payload_length);
    stats::watch(db.watch, WatchMask::FORWARD_QUEUED, "forward", &id);
    ctx.wakeups.dispatch.push(scheme_name);
    Ok(true)
}

/// Append a bundle to an outduct queue per its class of service
///
/// Expedited traffic is additionally ordered by ordinal, newest bundle
/// of an ordinal immediately after that ordinal's previous last entry.
/// A blocked duct diverts to limbo instead.
#[instrument(skip(db, ctx), fields(bundle = %handle))]
pub(crate) fn enqueue_to_outduct(
    db: &mut BpDb,
    ctx: &mut TxnCtx,
    outduct_handle: Handle<Outduct>,
    dest_duct_name: Option<String>,
    handle: BundleHandle,
    prox_node: Eid,
) -> Result<(), BpError> {
    let Some(bundle) = db.bundles.get(handle) else {
        return Err(BpError::StaleBundle);
    };
    let expired = bundle.expired;
    let class = bundle.class;
    let ordinal = bundle.extended_cos.ordinal as usize;
    let payload_length = bundle.payload.length;
    let id = bundle.id.clone();
    if expired {
        detach_fwd_queue(db, handle);
        destroy_bundle(db, ctx, handle, false, SrReason::None)?;
        return Ok(());
    }

    let Some(outduct) = db.outducts.get(outduct_handle) else {
        return Err(BpError::NoSuchDuct(format!("{outduct_handle}")));
    };
    if outduct.blocked {
        return enqueue_to_limbo(db, ctx, handle);
    }
    let protocol_name = db
        .protocols
        .get(outduct.protocol)
        .map(|p| p.name.clone())
        .unwrap_or_default();
    let duct_name = outduct.name.clone();

    detach_fwd_queue(db, handle);

    let Some(outduct) = db.outducts.get_mut(outduct_handle) else {
        return Err(BpError::NoSuchDuct(format!("{outduct_handle}")));
    };
    let elt = match class {
        ClassOfService::Expedited => {
            // Insert after the last bundle whose ordinal is not below
            // ours: the marker of the smallest such ordinal.
            let anchor = (ordinal..=255)
                .find_map(|o| outduct.ordinals[o].last_for_ordinal);
            let elt = match anchor {
                Some(anchor) => outduct
                    .urgent_queue
                    .insert_after(anchor, handle)
                    .unwrap_or_else(|| outduct.urgent_queue.push_back(handle)),
                None => outduct.urgent_queue.push_front(handle),
            };
            outduct.ordinals[ordinal].last_for_ordinal = Some(elt);
            outduct.ordinals[ordinal].backlog_bytes += payload_length;
            elt
        }
        _ => outduct.queue_mut(class).push_back(handle),
    };
    *outduct.backlog_mut(class) += payload_length;
    outduct.stats.enqueued.add(payload_length);

    if let Some(bundle) = db.bundles.get_mut(handle) {
        bundle.duct_xmit = Some(XmitRef::Duct {
            outduct: outduct_handle,
            class,
            elt,
        });
        bundle.prox_node_eid = Some(prox_node);
        bundle.dest_duct_name = dest_duct_name;
        bundle.enqueue_unix = Some(ctx.now_unix);
    }
    if let Some(interval) = db.xmit_overdue_interval {
        let key = db.timeline.insert(
            ctx.now_unix + interval as i64,
            BpEvent {
                kind: BpEventKind::XmitOverdue,
                subject: EventRef::Bundle(handle),
            },
        );
        if let Some(bundle) = db.bundles.get_mut(handle) {
            bundle.overdue_elt = Some(key);
        }
    }

    db.stats.db.fwd_okay.add(payload_length);
    stats::watch(db.watch, WatchMask::XMIT_QUEUED, "enqueue", &id);
    ctx.wakeups.xmit.push((protocol_name, duct_name));
    Ok(())
}

/// Remove a bundle from its transmission queue (outduct or limbo),
/// maintaining backlogs and ordinal markers
pub(crate) fn detach_from_xmit(db: &mut BpDb, handle: BundleHandle) {
    let Some(bundle) = db.bundles.get_mut(handle) else {
        return;
    };
    let ordinal = bundle.extended_cos.ordinal as usize;
    let payload_length = bundle.payload.length;
    let Some(xmit) = bundle.duct_xmit.take() else {
        return;
    };
    match xmit {
        XmitRef::Limbo { elt } => {
            db.limbo_queue.remove(elt);
        }
        XmitRef::Duct {
            outduct: outduct_handle,
            class,
            elt,
        } => {
            // The previous same-ordinal neighbor (if any) inherits the
            // marker; same-ordinal bundles are contiguous in the queue.
            let prev = db
                .outducts
                .get(outduct_handle)
                .and_then(|outduct| outduct.queue(class).prev_elt(elt));
            let prev_same_ordinal = prev.filter(|&p| {
                db.outducts
                    .get(outduct_handle)
                    .and_then(|outduct| outduct.queue(class).get(p))
                    .and_then(|&h| db.bundles.get(h))
                    .is_some_and(|b| b.extended_cos.ordinal as usize == ordinal)
            });
            let Some(outduct) = db.outducts.get_mut(outduct_handle) else {
                return;
            };
            outduct.queue_mut(class).remove(elt);
            *outduct.backlog_mut(class) =
                outduct.backlog(class).saturating_sub(payload_length);
            if class == ClassOfService::Expedited {
                let state = &mut outduct.ordinals[ordinal];
                state.backlog_bytes = state.backlog_bytes.saturating_sub(payload_length);
                if state.last_for_ordinal == Some(elt) {
                    state.last_for_ordinal = prev_same_ordinal;
                }
            }
        }
    }
}

/// Suspend a bundle on the limbo queue
pub(crate) fn enqueue_to_limbo(
    db: &mut BpDb,
    _ctx: &mut TxnCtx,
    handle: BundleHandle,
) -> Result<(), BpError> {
    detach_from_xmit(db, handle);
    detach_fwd_queue(db, handle);
    let Some(bundle) = db.bundles.get_mut(handle) else {
        return Err(BpError::StaleBundle);
    };
    bundle.suspended = true;
    bundle.prox_node_eid = None;
    bundle.dest_duct_name = None;
    let payload_length = bundle.payload.length;
    let id = bundle.id.clone();
    let elt = db.limbo_queue.push_back(handle);
    if let Some(bundle) = db.bundles.get_mut(handle) {
        bundle.duct_xmit = Some(XmitRef::Limbo { elt });
    }
    db.stats.db.to_limbo.add(payload_length);
    stats::watch(db.watch, WatchMask::TO_LIMBO, "limbo", &id);
    trace!(bundle = %id, "Bundle suspended to limbo");
    Ok(())
}

/// Release a suspended bundle for fresh scheme-specific routing
///
/// The stations stack is emptied so routing starts over; `resume`
/// additionally clears the suspended mark.
pub(crate) fn release_from_limbo(
    db: &mut BpDb,
    ctx: &mut TxnCtx,
    handle: BundleHandle,
    resume: bool,
) -> Result<(), BpError> {
    let Some(bundle) = db.bundles.get(handle) else {
        return Err(BpError::StaleBundle);
    };
    if !matches!(bundle.duct_xmit, Some(XmitRef::Limbo { .. })) {
        return Err(BpError::InvalidOperation("bundle is not in limbo".into()));
    }
    detach_from_xmit(db, handle);
    let destination = {
        let Some(bundle) = db.bundles.get_mut(handle) else {
            return Err(BpError::StaleBundle);
        };
        if resume {
            bundle.suspended = false;
        }
        bundle.stations.clear();
        bundle.destination.clone()
    };
    let payload_length = db.bundles.get(handle).map(|b| b.payload.length).unwrap_or(0);
    db.stats.db.from_limbo.add(payload_length);
    if let Some(bundle) = db.bundles.get(handle) {
        stats::watch(db.watch, WatchMask::FROM_LIMBO, "delimbo", &bundle.id);
    }
    if !forward_bundle(db, ctx, handle, destination)? {
        enqueue_to_limbo(db, ctx, handle)?;
    }
    Ok(())
}

/// Pull a bundle back off an outduct queue on blockage or shutdown
pub(crate) fn reverse_enqueue(
    db: &mut BpDb,
    ctx: &mut TxnCtx,
    handle: BundleHandle,
    send_to_limbo: bool,
) -> Result<(), BpError> {
    detach_from_xmit(db, handle);
    if send_to_limbo {
        return enqueue_to_limbo(db, ctx, handle);
    }
    let destination = db
        .bundles
        .get(handle)
        .map(|b| b.destination.clone())
        .ok_or(BpError::StaleBundle)?;
    db.stats
        .db
        .requeued_for_fwd
        .add(db.bundles.get(handle).map(|b| b.payload.length).unwrap_or(0));
    if !forward_bundle(db, ctx, handle, destination)? {
        enqueue_to_limbo(db, ctx, handle)?;
    }
    Ok(())
}

/// What a forwarder tells the node to do with a bundle
#[derive(Debug, Clone)]
pub enum FwdDirective {
    /// Re-forward via another station EID
    Fwd { eid: Eid },
    /// Transmit through a concrete outduct
    Xmit {
        protocol: String,
        duct: String,
        /// Location within the duct's reach, when it matters
        dest_duct_name: Option<String>,
        /// The neighbor this transmission addresses
        prox_node: Eid,
    },
}

/// A forwarder's disposition for one bundle
#[derive(Debug, Clone)]
pub enum RouteDecision {
    Directive(FwdDirective),
    /// No route exists right now; suspend to limbo
    NoRoute,
    /// Give up on the bundle
    Abandon(SrReason),
}

/// One bundle popped from a scheme's forward queue
#[derive(Debug, Clone)]
pub struct ForwardingTask {
    pub bundle: BundleHandle,
    pub id: BundleId,
    pub destination: Eid,
    pub class: ClassOfService,
    pub extended_cos: ExtendedCos,
    pub payload_length: u64,
    pub stations: Vec<Eid>,
    pub custodial: bool,
}

/// Scheme-specific routing logic, supplied by the host
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn route(&self, task: &ForwardingTask) -> RouteDecision;
}

impl Node {
    /// Pop the next bundle awaiting scheme-specific routing, waiting
    /// on the dispatch signal as needed
    ///
    /// Returns `None` on cooperative interrupt.
    pub async fn next_forwarding_task(
        &self,
        scheme_name: &str,
    ) -> BpResult<Option<ForwardingTask>> {
        let vscheme = self
            .inner
            .vdb
            .scheme(scheme_name)
            .ok_or_else(|| BpError::NoSuchScheme(scheme_name.to_string()))?;
        loop {
            let task = self.transact_ctx(|db, ctx| {
                loop {
                    let Some(scheme) = db.schemes.get_mut(vscheme.handle) else {
                        return Err(BpError::NoSuchScheme(vscheme.name.clone()));
                    };
                    let Some(elt) = scheme.forward_queue.first_elt() else {
                        return Ok(None);
                    };
                    let Some(handle) = scheme.forward_queue.remove(elt) else {
                        return Ok(None);
                    };
                    let Some(bundle) = db.bundles.get_mut(handle) else {
                        continue;
                    };
                    bundle.fwd_queue_ref = None;
                    if bundle.expired {
                        destroy_bundle(db, ctx, handle, false, SrReason::None)?;
                        continue;
                    }
                    let bundle = db.bundles.get(handle).ok_or(BpError::StaleBundle)?;
                    return Ok(Some(ForwardingTask {
                        bundle: handle,
                        id: bundle.id.clone(),
                        destination: bundle.destination.clone(),
                        class: bundle.class,
                        extended_cos: bundle.extended_cos,
                        payload_length: bundle.payload.length,
                        stations: bundle.stations.clone(),
                        custodial: bundle.flags.custodial,
                    }));
                }
            })?;
            if task.is_some() {
                return Ok(task);
            }
            match vscheme.dispatch.wait().await {
                WaitOutcome::Posted => continue,
                WaitOutcome::Interrupted => return Ok(None),
                WaitOutcome::Shutdown => return Err(BpError::ShuttingDown),
            }
        }
    }

    /// Apply a forwarder's decision to a bundle it popped
    pub fn apply_route(&self, handle: BundleHandle, decision: RouteDecision) -> BpResult<()> {
        self.transact_ctx(|db, ctx| match decision {
            RouteDecision::Directive(FwdDirective::Fwd { eid }) => {
                if !forward_bundle(db, ctx, handle, eid)? {
                    enqueue_to_limbo(db, ctx, handle)?;
                }
                Ok(())
            }
            RouteDecision::Directive(FwdDirective::Xmit {
                protocol,
                duct,
                dest_duct_name,
                prox_node,
            }) => {
                let outduct = db
                    .find_outduct(&protocol, &duct)
                    .ok_or_else(|| BpError::NoSuchDuct(format!("{protocol}/{duct}")))?;
                enqueue_to_outduct(db, ctx, outduct, dest_duct_name, handle, prox_node)
            }
            RouteDecision::NoRoute => enqueue_to_limbo(db, ctx, handle),
            RouteDecision::Abandon(reason) => abandon(db, ctx, handle, reason),
        })
    }

    /// Interrupt a forwarder blocked in [`Node::next_forwarding_task`]
    pub fn interrupt_scheme(&self, scheme_name: &str) {
        if let Some(vscheme) = self.inner.vdb.scheme(scheme_name) {
            vscheme.dispatch.interrupt();
        }
    }

    /// Suspend a bundle to the limbo queue
    pub fn send_to_limbo(&self, handle: BundleHandle) -> BpResult<()> {
        self.transact_ctx(|db, ctx| enqueue_to_limbo(db, ctx, handle))
    }

    /// Release a bundle from limbo for fresh routing
    pub fn release_bundle_from_limbo(&self, handle: BundleHandle, resume: bool) -> BpResult<()> {
        self.transact_ctx(|db, ctx| release_from_limbo(db, ctx, handle, resume))
    }

    /// Bundles currently suspended in limbo
    pub fn limbo_bundles(&self) -> Vec<BundleHandle> {
        self.read(|db| db.limbo_queue.iter().copied().collect())
    }

    /// Abandon a bundle a forwarder cannot route
    pub fn abandon_bundle(&self, handle: BundleHandle, reason: SrReason) -> BpResult<()> {
        self.transact_ctx(|db, ctx| abandon(db, ctx, handle, reason))
    }

    /// Run a forwarder loop for a scheme until interrupt or shutdown
    pub fn run_forwarder(
        &self,
        scheme_name: String,
        forwarder: Arc<dyn Forwarder>,
    ) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            if let Some(vscheme) = node.inner.vdb.scheme(&scheme_name) {
                vscheme.forwarder_running.store(true, Ordering::SeqCst);
            }
            loop {
                match node.next_forwarding_task(&scheme_name).await {
                    Ok(Some(task)) => {
                        let decision = forwarder.route(&task).await;
                        if let Err(err) = node.apply_route(task.bundle, decision) {
                            warn!(scheme = %scheme_name, error = %err, "Routing application failed");
                        }
                    }
                    Ok(None) => break,
                    Err(BpError::ShuttingDown) => break,
                    Err(err) => {
                        warn!(scheme = %scheme_name, error = %err, "Forwarder loop error");
                        break;
                    }
                }
            }
            if let Some(vscheme) = node.inner.vdb.scheme(&scheme_name) {
                vscheme.forwarder_running.store(false, Ordering::SeqCst);
            }
        })
    }
}
