//! The volatile index
//!
//! Shared state that must not live in the persistent image: the
//! rendezvous signals (dispatch, delivery, transmit), the throttles,
//! and O(1) name lookups for schemes, endpoints, and ducts. The index
//! is rebuildable at any time by walking the persistent catalogues
//! ([`Vdb::raise`]); dropping it unblocks every waiter with the
//! shutdown sentinel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tokio::sync::{Notify, watch};
use tracing::debug;

use waystation_core::Eid;
use waystation_store::Handle;

use crate::db::{BpDb, Endpoint, Induct, Outduct, Scheme};
use crate::throttle::Throttle;

/// How a blocking wait resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The awaited condition may now hold; re-check it
    Posted,
    /// A cooperative interrupt unblocked this waiter
    Interrupted,
    /// The node is shutting down
    Shutdown,
}

/// An interruptible, shutdown-aware wait point
///
/// Semantics of the classic counting semaphore reduced to what the
/// engine needs: `post` stores one wakeup, `interrupt` unblocks a
/// single waiter with a sentinel, shutdown unblocks everyone for good.
#[derive(Debug)]
pub struct Signal {
    notify: Notify,
    interrupted: AtomicBool,
    shutdown: watch::Receiver<bool>,
}

impl Signal {
    fn new(shutdown: watch::Receiver<bool>) -> Self {
        Self {
            notify: Notify::new(),
            interrupted: AtomicBool::new(false),
            shutdown,
        }
    }

    /// Store one wakeup
    pub fn post(&self) {
        self.notify.notify_one();
    }

    /// Unblock a single waiter with [`WaitOutcome::Interrupted`]
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Wait for a post, an interrupt, or shutdown
    pub async fn wait(&self) -> WaitOutcome {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return WaitOutcome::Shutdown;
        }
        loop {
            tokio::select! {
                _ = self.notify.notified() => {
                    if self.interrupted.swap(false, Ordering::SeqCst) {
                        return WaitOutcome::Interrupted;
                    }
                    return WaitOutcome::Posted;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return WaitOutcome::Shutdown;
                    }
                }
            }
        }
    }
}

/// Volatile companion of a [`Scheme`]
#[derive(Debug)]
pub struct VScheme {
    pub handle: Handle<Scheme>,
    pub name: String,
    pub cbhe: bool,
    pub unicast: bool,
    /// EID of the scheme's administrative endpoint
    pub admin_eid: Eid,
    /// Posted when the forward queue becomes non-empty
    pub dispatch: Signal,
    pub forwarder_running: AtomicBool,
    pub admin_app_running: AtomicBool,
}

/// Volatile companion of an [`Endpoint`]
#[derive(Debug)]
pub struct VEndpoint {
    pub handle: Handle<Endpoint>,
    pub scheme_name: String,
    pub nss: String,
    /// Posted when the delivery queue becomes non-empty
    pub delivery: Signal,
    /// Whether an application currently has the endpoint open
    pub app_open: AtomicBool,
}

/// Volatile companion of an [`Induct`]
#[derive(Debug)]
pub struct VInduct {
    pub handle: Handle<Induct>,
    pub protocol_name: String,
    pub duct_name: String,
    pub acq_throttle: Throttle,
    pub cla_running: AtomicBool,
}

/// Volatile companion of an [`Outduct`]
#[derive(Debug)]
pub struct VOutduct {
    pub handle: Handle<Outduct>,
    pub protocol_name: String,
    pub duct_name: String,
    /// Posted when a transmission queue becomes non-empty
    pub xmit: Signal,
    pub xmit_throttle: Throttle,
    pub cla_running: AtomicBool,
}

fn duct_key(protocol_name: &str, duct_name: &str) -> String {
    format!("{protocol_name}/{duct_name}")
}

fn endpoint_key(scheme_name: &str, nss: &str) -> String {
    format!("{scheme_name}:{nss}")
}

/// The volatile index itself
#[derive(Debug)]
pub struct Vdb {
    shutdown_tx: watch::Sender<bool>,
    pub schemes: DashMap<String, Arc<VScheme>>,
    pub endpoints: DashMap<String, Arc<VEndpoint>>,
    pub inducts: DashMap<String, Arc<VInduct>>,
    pub outducts: DashMap<String, Arc<VOutduct>>,
}

impl Default for Vdb {
    fn default() -> Self {
        Self::new()
    }
}

impl Vdb {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            schemes: DashMap::new(),
            endpoints: DashMap::new(),
            inducts: DashMap::new(),
            outducts: DashMap::new(),
        }
    }

    /// Fresh signal bound to this index's shutdown channel
    pub fn signal(&self) -> Signal {
        Signal::new(self.shutdown_tx.subscribe())
    }

    /// Whether shutdown has been signalled
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Rebuild the index from the persistent catalogues
    ///
    /// Idempotent: existing entries (and their signals, with waiters
    /// parked on them) are kept; missing ones are added.
    pub fn raise(&self, db: &BpDb, local_node_nbr: u64) {
        for (handle, scheme) in db.schemes.iter() {
            self.raise_scheme(handle, scheme, local_node_nbr);
            for &endpoint_handle in &scheme.endpoints {
                if let Some(endpoint) = db.endpoints.get(endpoint_handle) {
                    self.raise_endpoint(endpoint_handle, &scheme.name, &endpoint.nss);
                }
            }
        }
        for (_, protocol) in db.protocols.iter() {
            for &induct_handle in &protocol.inducts {
                if let Some(induct) = db.inducts.get(induct_handle) {
                    self.raise_induct(induct_handle, &protocol.name, &induct.name, protocol.nominal_rate);
                }
            }
            for &outduct_handle in &protocol.outducts {
                if let Some(outduct) = db.outducts.get(outduct_handle) {
                    self.raise_outduct(outduct_handle, &protocol.name, &outduct.name, protocol.nominal_rate);
                }
            }
        }
        debug!(
            schemes = self.schemes.len(),
            endpoints = self.endpoints.len(),
            inducts = self.inducts.len(),
            outducts = self.outducts.len(),
            "Raised volatile index"
        );
    }

    pub(crate) fn raise_scheme(&self, handle: Handle<Scheme>, scheme: &Scheme, local_node_nbr: u64) {
        self.schemes.entry(scheme.name.clone()).or_insert_with(|| {
            let admin_eid = if scheme.cbhe {
                Eid::ipn(local_node_nbr, 0)
            } else {
                Eid::Dtn {
                    scheme: scheme.name.clone(),
                    nss: format!("node{local_node_nbr}/admin"),
                }
            };
            Arc::new(VScheme {
                handle,
                name: scheme.name.clone(),
                cbhe: scheme.cbhe,
                unicast: scheme.unicast,
                admin_eid,
                dispatch: self.signal(),
                forwarder_running: AtomicBool::new(false),
                admin_app_running: AtomicBool::new(false),
            })
        });
    }

    pub(crate) fn raise_endpoint(&self, handle: Handle<Endpoint>, scheme_name: &str, nss: &str) {
        self.endpoints
            .entry(endpoint_key(scheme_name, nss))
            .or_insert_with(|| {
                Arc::new(VEndpoint {
                    handle,
                    scheme_name: scheme_name.to_string(),
                    nss: nss.to_string(),
                    delivery: self.signal(),
                    app_open: AtomicBool::new(false),
                })
            });
    }

    pub(crate) fn raise_induct(
        &self,
        handle: Handle<Induct>,
        protocol_name: &str,
        duct_name: &str,
        nominal_rate: i64,
    ) {
        self.inducts
            .entry(duct_key(protocol_name, duct_name))
            .or_insert_with(|| {
                Arc::new(VInduct {
                    handle,
                    protocol_name: protocol_name.to_string(),
                    duct_name: duct_name.to_string(),
                    acq_throttle: Throttle::new(nominal_rate, self.signal()),
                    cla_running: AtomicBool::new(false),
                })
            });
    }

    pub(crate) fn raise_outduct(
        &self,
        handle: Handle<Outduct>,
        protocol_name: &str,
        duct_name: &str,
        nominal_rate: i64,
    ) {
        self.outducts
            .entry(duct_key(protocol_name, duct_name))
            .or_insert_with(|| {
                Arc::new(VOutduct {
                    handle,
                    protocol_name: protocol_name.to_string(),
                    duct_name: duct_name.to_string(),
                    xmit: self.signal(),
                    xmit_throttle: Throttle::new(nominal_rate, self.signal()),
                    cla_running: AtomicBool::new(false),
                })
            });
    }

    /// Look up a scheme companion by name
    pub fn scheme(&self, name: &str) -> Option<Arc<VScheme>> {
        self.schemes.get(name).map(|entry| entry.value().clone())
    }

    /// Look up an endpoint companion
    pub fn endpoint(&self, scheme_name: &str, nss: &str) -> Option<Arc<VEndpoint>> {
        self.endpoints
            .get(&endpoint_key(scheme_name, nss))
            .map(|entry| entry.value().clone())
    }

    /// Look up an induct companion
    pub fn induct(&self, protocol_name: &str, duct_name: &str) -> Option<Arc<VInduct>> {
        self.inducts
            .get(&duct_key(protocol_name, duct_name))
            .map(|entry| entry.value().clone())
    }

    /// Look up an outduct companion
    pub fn outduct(&self, protocol_name: &str, duct_name: &str) -> Option<Arc<VOutduct>> {
        self.outducts
            .get(&duct_key(protocol_name, duct_name))
            .map(|entry| entry.value().clone())
    }

    pub(crate) fn drop_scheme(&self, name: &str) {
        self.schemes.remove(name);
    }

    pub(crate) fn drop_endpoint(&self, scheme_name: &str, nss: &str) {
        self.endpoints.remove(&endpoint_key(scheme_name, nss));
    }

    pub(crate) fn drop_induct(&self, protocol_name: &str, duct_name: &str) {
        self.inducts.remove(&duct_key(protocol_name, duct_name));
    }

    pub(crate) fn drop_outduct(&self, protocol_name: &str, duct_name: &str) {
        self.outducts.remove(&duct_key(protocol_name, duct_name));
    }

    /// Every induct companion
    pub(crate) fn all_inducts(&self) -> Vec<Arc<VInduct>> {
        self.inducts.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Every outduct companion
    pub(crate) fn all_outducts(&self) -> Vec<Arc<VOutduct>> {
        self.outducts.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Signal shutdown and tear the index down
    ///
    /// Every parked waiter resolves to [`WaitOutcome::Shutdown`].
    pub fn drop_all(&self) {
        let _ = self.shutdown_tx.send(true);
        self.schemes.clear();
        self.endpoints.clear();
        self.inducts.clear();
        self.outducts.clear();
        debug!("Dropped volatile index");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_post_then_wait() {
        let vdb = Vdb::new();
        let signal = vdb.signal();
        signal.post();
        assert_eq!(signal.wait().await, WaitOutcome::Posted);
    }

    #[tokio::test]
    async fn test_interrupt_sentinel() {
        let vdb = Vdb::new();
        let signal = Arc::new(vdb.signal());
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        };
        tokio::task::yield_now().await;
        signal.interrupt();
        assert_eq!(waiter.await.unwrap(), WaitOutcome::Interrupted);
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_all_waiters() {
        let vdb = Vdb::new();
        let a = Arc::new(vdb.signal());
        let b = Arc::new(vdb.signal());
        let wa = {
            let a = a.clone();
            tokio::spawn(async move { a.wait().await })
        };
        let wb = {
            let b = b.clone();
            tokio::spawn(async move { b.wait().await })
        };
        tokio::task::yield_now().await;
        vdb.drop_all();
        assert_eq!(wa.await.unwrap(), WaitOutcome::Shutdown);
        assert_eq!(wb.await.unwrap(), WaitOutcome::Shutdown);
    }

    #[tokio::test]
    async fn test_wait_after_shutdown_returns_immediately() {
        let vdb = Vdb::new();
        let signal = vdb.signal();
        vdb.drop_all();
        assert_eq!(signal.wait().await, WaitOutcome::Shutdown);
    }
}
