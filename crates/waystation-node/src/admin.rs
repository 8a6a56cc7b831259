//! Administrative records: emission and consumption
//!
//! Status reports and custody signals are ordinary bundles, admin-
//! flagged and addressed to the report-to or custodian EID; they go out
//! through the same send path as application traffic. One
//! administrative endpoint per scheme consumes inbound admin bundles
//! and feeds custody signals back into the lifecycle engine.

use std::sync::Arc;

use tracing::{debug, warn};

use waystation_core::{
    AdminRecord, BpCtSignal, BpStatusRpt, ClassOfService, CreationTimestamp, CtReason,
    CustodySwitch, DtnTime, Eid, ExtendedCos, SrReason, SrrFlags, StatusFlags,
};
use waystation_store::{ListElt, Zco};

use crate::db::{BpDb, BpEvent, BpEventKind, BundleHandle, EventRef, PendingCtSignal};
use crate::error::{BpError, BpResult};
use crate::lifecycle::apply_ct_signal;
use crate::node::{Delivery, Node, SendOutcome, SendSpec, TxnCtx, send_in_txn};

/// EID of a scheme's administrative endpoint on the given node
pub(crate) fn scheme_admin_eid(cbhe: bool, scheme_name: &str, node_nbr: u64) -> Eid {
    if cbhe {
        Eid::ipn(node_nbr, 0)
    } else {
        Eid::Dtn {
            scheme: scheme_name.to_string(),
            nss: format!("node{node_nbr}/admin"),
        }
    }
}

/// Emit a status report about a bundle, per its SRR request
///
/// Silently skipped for admin and anonymous bundles and when no
/// report-to endpoint was named.
pub(crate) fn emit_status_report(
    db: &mut BpDb,
    ctx: &mut TxnCtx,
    handle: BundleHandle,
    flags: StatusFlags,
    reason: SrReason,
) -> Result<(), BpError> {
    let Some(bundle) = db.bundles.get(handle) else {
        return Ok(());
    };
    if bundle.flags.is_admin || bundle.anonymous {
        return Ok(());
    }
    let report_to = bundle.report_to.clone();
    if report_to.is_null() {
        return Ok(());
    }

    let now = DtnTime::new(CreationTimestamp::seconds_from_unix(ctx.now_unix), 0);
    let set_if = |flag: StatusFlags| if flags.contains(flag) { now } else { DtnTime::default() };
    let rpt = BpStatusRpt {
        is_fragment: bundle.flags.is_fragment,
        flags,
        reason,
        fragment_offset: bundle.id.fragment_offset,
        fragment_length: if bundle.flags.is_fragment {
            bundle.payload.length
        } else {
            0
        },
        receipt_time: set_if(StatusFlags::RECEIVED),
        acceptance_time: set_if(StatusFlags::CUSTODY_ACCEPTED),
        forward_time: set_if(StatusFlags::FORWARDED),
        delivery_time: set_if(StatusFlags::DELIVERED),
        deletion_time: set_if(StatusFlags::DELETED),
        creation: bundle.id.creation,
        source_eid: bundle.id.source.to_string(),
    };
    let lifetime = bundle.lifetime_secs.max(60);
    let class = bundle.class;

    if flags.contains(StatusFlags::RECEIVED) {
        db.stats.rpt.received += 1;
    }
    if flags.contains(StatusFlags::CUSTODY_ACCEPTED) {
        db.stats.rpt.accepted += 1;
    }
    if flags.contains(StatusFlags::FORWARDED) {
        db.stats.rpt.forwarded += 1;
    }
    if flags.contains(StatusFlags::DELIVERED) {
        db.stats.rpt.delivered += 1;
    }
    if flags.contains(StatusFlags::DELETED) {
        db.stats.rpt.deleted += 1;
    }

    let source = scheme_admin_eid(
        report_to.is_cbhe(),
        report_to.scheme_name(),
        db.local_node_nbr,
    );
    let adu = Zco::from_bytes(AdminRecord::StatusReport(rpt).serialize().into());
    let outcome = send_in_txn(
        db,
        ctx,
        SendSpec {
            source,
            destination: report_to.clone(),
            report_to: Eid::Null,
            lifespan_secs: lifetime,
            class,
            custody: CustodySwitch::NoCustody,
            srr: SrrFlags::none(),
            ack_requested: false,
            extended_cos: ExtendedCos::default(),
            adu,
            is_admin: true,
        },
    )?;
    if outcome == SendOutcome::NoDestination {
        debug!(report_to = %report_to, "Status report undeliverable, dropped");
    }
    Ok(())
}

/// Emit a custody signal about a bundle to the given custodian
pub(crate) fn emit_ct_signal(
    db: &mut BpDb,
    ctx: &mut TxnCtx,
    handle: BundleHandle,
    to: &Eid,
    succeeded: bool,
    reason: CtReason,
) -> Result<(), BpError> {
    let Some(bundle) = db.bundles.get(handle) else {
        return Ok(());
    };
    if to.is_null() {
        return Ok(());
    }
    let signal = BpCtSignal {
        is_fragment: bundle.flags.is_fragment,
        succeeded,
        reason,
        fragment_offset: bundle.id.fragment_offset,
        fragment_length: if bundle.flags.is_fragment {
            bundle.payload.length
        } else {
            0
        },
        signal_time: DtnTime::new(CreationTimestamp::seconds_from_unix(ctx.now_unix), 0),
        creation: bundle.id.creation,
        source_eid: bundle.id.source.to_string(),
    };
    queue_ct_signal(db, ctx, to.clone(), signal)
}

/// Send a custody signal now, or park it for the csDue sweep
///
/// An identical signal already pending is not queued twice.
pub(crate) fn queue_ct_signal(
    db: &mut BpDb,
    ctx: &mut TxnCtx,
    to: Eid,
    signal: BpCtSignal,
) -> Result<(), BpError> {
    let duplicate = db.pending_ct_signals.iter().any(|pending| {
        pending.to == to
            && pending.signal.succeeded == signal.succeeded
            && pending.signal.creation == signal.creation
            && pending.signal.source_eid == signal.source_eid
            && pending.signal.fragment_offset == signal.fragment_offset
            && pending.signal.fragment_length == signal.fragment_length
    });
    if duplicate {
        return Ok(());
    }

    let adu = Zco::from_bytes(AdminRecord::CustodySignal(signal.clone()).serialize().into());
    let outcome = send_in_txn(
        db,
        ctx,
        SendSpec {
            source: scheme_admin_eid(to.is_cbhe(), to.scheme_name(), db.local_node_nbr),
            destination: to.clone(),
            report_to: Eid::Null,
            lifespan_secs: db.ct_expired_timeout.max(60),
            class: ClassOfService::Expedited,
            custody: CustodySwitch::NoCustody,
            srr: SrrFlags::none(),
            ack_requested: false,
            extended_cos: ExtendedCos::default(),
            adu,
            is_admin: true,
        },
    )?;
    if outcome == SendOutcome::NoDestination {
        // No path to the custodian right now; retry from the timeline.
        let elt = db.pending_ct_signals.push_back(PendingCtSignal { to, signal });
        db.timeline.insert(
            ctx.now_unix + db.ct_expired_timeout as i64,
            BpEvent {
                kind: BpEventKind::CsDue,
                subject: EventRef::Signal(elt),
            },
        );
    }
    Ok(())
}

/// Re-emit a parked custody signal when its csDue event fires
pub(crate) fn retry_pending_ct_signal(
    db: &mut BpDb,
    ctx: &mut TxnCtx,
    elt: ListElt<PendingCtSignal>,
) -> Result<(), BpError> {
    let Some(pending) = db.pending_ct_signals.remove(elt) else {
        return Ok(());
    };
    queue_ct_signal(db, ctx, pending.to, pending.signal)
}

/// Consumer hooks for inbound administrative records
pub trait AdminHandler: Send + Sync {
    fn on_status_report(&self, _rpt: &BpStatusRpt) {}
    fn on_custody_signal(&self, _signal: &BpCtSignal) {}
}

/// Handler that drops every record
pub struct NullAdminHandler;

impl AdminHandler for NullAdminHandler {}

impl Node {
    /// Apply one inbound custody signal
    pub fn apply_custody_signal(&self, signal: &BpCtSignal) -> BpResult<()> {
        self.transact_ctx(|db, ctx| apply_ct_signal(db, ctx, signal))
    }

    /// Parse and dispatch one delivery from an administrative endpoint
    ///
    /// Custody signals feed the lifecycle engine; status reports are
    /// surfaced to the handler unchanged. A non-admin or unparseable
    /// delivery is dropped with a warning.
    pub fn process_admin_delivery(
        &self,
        delivery: &Delivery,
        handler: &dyn AdminHandler,
    ) -> BpResult<()> {
        if !delivery.is_admin {
            warn!(source = %delivery.source, "Non-admin bundle at admin endpoint");
            return Ok(());
        }
        let bytes = delivery.adu.read_all()?;
        match AdminRecord::parse(&bytes) {
            Ok(AdminRecord::StatusReport(rpt)) => {
                handler.on_status_report(&rpt);
                Ok(())
            }
            Ok(AdminRecord::CustodySignal(signal)) => {
                self.apply_custody_signal(&signal)?;
                handler.on_custody_signal(&signal);
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "Malformed administrative record");
                Ok(())
            }
        }
    }

    /// Consume a scheme's administrative endpoint until interrupted or
    /// shut down
    ///
    /// The admin endpoint must have been registered like any other
    /// endpoint.
    pub async fn run_admin_endpoint(
        &self,
        scheme_name: &str,
        handler: Arc<dyn AdminHandler>,
    ) -> BpResult<()> {
        let vscheme = self
            .inner
            .vdb
            .scheme(scheme_name)
            .ok_or_else(|| BpError::NoSuchScheme(scheme_name.to_string()))?;
        let admin_eid = vscheme.admin_eid.clone();
        vscheme
            .admin_app_running
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let sap = self.open(&admin_eid)?;
        let result = loop {
            match self.receive(&sap).await {
                Ok(delivery) => self.process_admin_delivery(&delivery, handler.as_ref())?,
                Err(BpError::Interrupted) | Err(BpError::ShuttingDown) => break Ok(()),
                Err(err) => break Err(err),
            }
        };
        vscheme
            .admin_app_running
            .store(false, std::sync::atomic::Ordering::SeqCst);
        self.close(sap);
        result
    }
}
