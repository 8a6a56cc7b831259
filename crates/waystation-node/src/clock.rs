//! The clock task
//!
//! One periodic sweep (~1 Hz): credit every throttle, then pop and
//! process every timeline event that has come due. Events fire in time
//! order, ties in insertion order; a forward clock jump compresses
//! waits but never suppresses events.

use tokio::task::JoinHandle;
use tracing::{trace, warn};

use waystation_core::SrReason;

use crate::db::{BpDb, BpEvent, BpEventKind, EventKey, EventRef};
use crate::error::{BpError, BpResult};
use crate::lifecycle::destroy_bundle;
use crate::node::{Node, TxnCtx};
use crate::stats::{self, WatchMask};

impl Node {
    /// One clock sweep at the current time
    pub fn clock_tick(&self) -> BpResult<usize> {
        self.tick_at(self.now())
    }

    /// One clock sweep at an explicit time (the test seam)
    ///
    /// Returns the number of timeline events processed.
    pub fn tick_at(&self, now_unix: i64) -> BpResult<usize> {
        for vinduct in self.inner.vdb.all_inducts() {
            vinduct.acq_throttle.credit();
        }
        for voutduct in self.inner.vdb.all_outducts() {
            voutduct.xmit_throttle.credit();
        }

        let mut ctx_holder = TxnCtx::new(
            now_unix,
            self.inner.vdb.clone(),
            self.inner.extensions.clone(),
        );
        let result = self.inner.store.transact(|db| {
            let due = db.timeline.pop_due(now_unix);
            let count = due.len();
            for (key, event) in due {
                process_event(db, &mut ctx_holder, key, event)?;
            }
            Ok::<usize, BpError>(count)
        });
        if result.is_ok() {
            ctx_holder.wakeups.fire(&self.inner.vdb);
        }
        result
    }
}

/// Dispatch one due timeline event
fn process_event(
    db: &mut BpDb,
    ctx: &mut TxnCtx,
    key: EventKey,
    event: BpEvent,
) -> Result<(), BpError> {
    trace!(time = key.time, kind = ?event.kind, "Timeline event due");
    match (event.kind, event.subject) {
        (BpEventKind::ExpiredTtl, EventRef::Bundle(handle)) => {
            let Some(bundle) = db.bundles.get_mut(handle) else {
                return Ok(());
            };
            if bundle.ttl_elt == Some(key) {
                bundle.ttl_elt = None;
            }
            destroy_bundle(db, ctx, handle, true, SrReason::LifetimeExpired)?;
        }
        (BpEventKind::XmitOverdue, EventRef::Bundle(handle)) => {
            let Some(bundle) = db.bundles.get_mut(handle) else {
                return Ok(());
            };
            if bundle.overdue_elt == Some(key) {
                bundle.overdue_elt = None;
            }
            crate::dequeue::reforward_bundle(db, ctx, handle)?;
        }
        (BpEventKind::CtDue, EventRef::Bundle(handle)) => {
            let Some(bundle) = db.bundles.get_mut(handle) else {
                return Ok(());
            };
            if bundle.ct_due_elt == Some(key) {
                bundle.ct_due_elt = None;
            }
            if bundle.custody_taken {
                // Custody never acknowledged; try another route.
                let payload_length = bundle.payload.length;
                let id = bundle.id.clone();
                db.stats.ct.timed_out.add(payload_length);
                stats::watch(db.watch, WatchMask::CUSTODY_TIMEOUT, "ct-timeout", &id);
                crate::dequeue::reforward_bundle(db, ctx, handle)?;
            }
        }
        (BpEventKind::CsDue, EventRef::Signal(elt)) => {
            crate::admin::retry_pending_ct_signal(db, ctx, elt)?;
        }
        (kind, _) => {
            warn!(kind = ?kind, "Timeline event with mismatched subject");
        }
    }
    Ok(())
}

/// Launch the ~1 Hz clock task
pub(crate) fn run_clock(node: Node) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if node.inner.vdb.is_shutdown() {
                break;
            }
            if let Err(err) = node.clock_tick() {
                warn!(error = %err, "Clock sweep failed");
            }
        }
    })
}
