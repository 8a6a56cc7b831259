//! # Waystation Node
//!
//! The bundle lifecycle engine: a store-and-forward Bundle Protocol
//! node core for delay-tolerant networks.
//!
//! A [`Node`] accepts application data units from local applications,
//! encapsulates them in bundles, and routes them by destination EID
//! toward neighbor nodes through convergence-layer adapters; inbound
//! bundles are acquired from CLAs and delivered locally or
//! re-forwarded. Bundles persist across arbitrary delays and link
//! outages; custody of a bundle may be transferred between nodes,
//! conferring a retransmission obligation.
//!
//! ## Architecture
//!
//! - [`db`]: the persistent data model (schemes, endpoints, protocols,
//!   ducts, bundles, timeline) held in a transactional store
//! - [`vdb`]: the volatile index — signals, throttles, name lookups
//! - [`acquire`]: byte-stream → bundle parsing and dispatch
//! - [`lifecycle`]: accept / abandon / clone / destroy and the
//!   retention-constraint discipline
//! - [`forward`]: scheme dispatch, outduct enqueue, limbo
//! - [`dequeue`]: QoS selection, fragmentation, catenation,
//!   stewardship
//! - [`clock`]: TTL expiry, custody timeout, transmission-overdue
//! - [`admin`]: status reports and custody signals
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use waystation_core::Eid;
//! use waystation_node::{Node, NodeConfig};
//!
//! let node = Node::init(NodeConfig::default());
//! node.add_scheme("ipn", "ipnfwd", "ipnadmin")?;
//! node.add_endpoint(&Eid::parse("ipn:1.1")?, Default::default(), None)?;
//! node.start();
//!
//! let sap = node.open(&Eid::parse("ipn:1.1")?)?;
//! ```

pub mod acquire;
pub mod admin;
pub mod bundle;
pub mod clock;
pub mod config;
pub mod db;
pub mod dequeue;
pub mod error;
pub mod forward;
pub mod lifecycle;
pub mod node;
pub mod stats;
pub mod throttle;
pub mod vdb;

pub use acquire::{AcqDecision, AcqOutcome, AcqRejection, AcqWorkArea, ExtensionHandler, ExtensionRegistry};
pub use admin::{AdminHandler, NullAdminHandler};
pub use bundle::{Bundle, Dossier, Payload, XmitRef};
pub use db::{
    BpDb, BpEvent, BpEventKind, BundleHandle, BundleSet, EventKey, EventRef, IncompleteBundle,
    RecvRule, Timeline,
};
pub use dequeue::{
    DequeueTimeout, DequeuedBundle, Outflow, compute_applicable_backlog, compute_eccc,
};
pub use error::{BpError, BpResult};
pub use forward::{Forwarder, ForwardingTask, FwdDirective, RouteDecision};
pub use node::{Delivery, Node, NodeClock, NodeConfig, Sap, SendOutcome, SystemClock};
pub use stats::{NodeStats, Tally, WatchMask};
pub use throttle::Throttle;
pub use vdb::{Signal, Vdb, WaitOutcome};
