//! Administrative configuration operations
//!
//! Schemes, endpoints, protocols, and ducts are created and removed
//! here. Every persistent mutation carries its volatile-index update:
//! the index entry is raised after the transaction commits and dropped
//! when the object goes away.

use tracing::info;

use waystation_core::{Eid, MAX_SCHEME_NAME_LEN};
use waystation_store::DlList;

use crate::db::{ClProtocol, Endpoint, Induct, Outduct, RecvRule, Scheme};
use crate::error::{BpError, BpResult};
use crate::forward::{release_from_limbo, reverse_enqueue};
use crate::node::Node;
use crate::stats::{EndpointStats, InductStats, WatchMask};

impl Node {
    /// Register a forwarding scheme
    pub fn add_scheme(&self, name: &str, fwd_cmd: &str, adm_app_cmd: &str) -> BpResult<()> {
        if name.is_empty() || name.len() > MAX_SCHEME_NAME_LEN {
            return Err(BpError::InvalidOperation(format!(
                "scheme name must be 1..={MAX_SCHEME_NAME_LEN} bytes"
            )));
        }
        let cbhe = name == waystation_core::CBHE_SCHEME_NAME;
        self.transact_ctx(|db, _ctx| {
            if db.find_scheme(name).is_some() {
                return Err(BpError::DuplicateName(name.to_string()));
            }
            db.schemes.insert(Scheme {
                name: name.to_string(),
                cbhe,
                unicast: true,
                fwd_cmd: fwd_cmd.to_string(),
                adm_app_cmd: adm_app_cmd.to_string(),
                forward_queue: DlList::new(),
                endpoints: Vec::new(),
            });
            Ok(())
        })?;
        self.raise_vdb();
        info!(scheme = name, "Added scheme");
        Ok(())
    }

    /// Update a scheme's commands
    pub fn update_scheme(&self, name: &str, fwd_cmd: &str, adm_app_cmd: &str) -> BpResult<()> {
        self.transact_ctx(|db, _ctx| {
            let handle = db
                .find_scheme(name)
                .ok_or_else(|| BpError::NoSuchScheme(name.to_string()))?;
            if let Some(scheme) = db.schemes.get_mut(handle) {
                scheme.fwd_cmd = fwd_cmd.to_string();
                scheme.adm_app_cmd = adm_app_cmd.to_string();
            }
            Ok(())
        })
    }

    /// Unregister a scheme; it must have no endpoints and an empty
    /// forward queue
    pub fn remove_scheme(&self, name: &str) -> BpResult<()> {
        self.transact_ctx(|db, _ctx| {
            let handle = db
                .find_scheme(name)
                .ok_or_else(|| BpError::NoSuchScheme(name.to_string()))?;
            let Some(scheme) = db.schemes.get(handle) else {
                return Err(BpError::NoSuchScheme(name.to_string()));
            };
            if !scheme.endpoints.is_empty() {
                return Err(BpError::InvalidOperation(format!(
                    "scheme {name} still has endpoints"
                )));
            }
            if !scheme.forward_queue.is_empty() {
                return Err(BpError::InvalidOperation(format!(
                    "scheme {name} has queued bundles"
                )));
            }
            db.schemes.remove(handle);
            Ok(())
        })?;
        self.inner.vdb.drop_scheme(name);
        info!(scheme = name, "Removed scheme");
        Ok(())
    }

    /// Register an endpoint; also called registering the EID
    pub fn add_endpoint(&self, eid: &Eid, recv_rule: RecvRule, recv_script: Option<&str>) -> BpResult<()> {
        let scheme_name = eid.scheme_name().to_string();
        let nss = eid.nss();
        self.transact_ctx(|db, _ctx| {
            let scheme_handle = db
                .find_scheme(&scheme_name)
                .ok_or_else(|| BpError::NoSuchScheme(scheme_name.clone()))?;
            if db.find_endpoint(&scheme_name, &nss).is_some() {
                return Err(BpError::DuplicateName(eid.to_string()));
            }
            let endpoint_handle = db.endpoints.insert(Endpoint {
                nss: nss.clone(),
                recv_rule,
                recv_script: recv_script.map(str::to_string),
                incompletes: DlList::new(),
                delivery_queue: DlList::new(),
                scheme: scheme_handle,
                stats: EndpointStats::default(),
            });
            if let Some(scheme) = db.schemes.get_mut(scheme_handle) {
                scheme.endpoints.push(endpoint_handle);
            }
            Ok(())
        })?;
        self.raise_vdb();
        info!(endpoint = %eid, "Registered endpoint");
        Ok(())
    }

    /// Update an endpoint's receive rule and script
    pub fn update_endpoint(&self, eid: &Eid, recv_rule: RecvRule, recv_script: Option<&str>) -> BpResult<()> {
        self.transact_ctx(|db, _ctx| {
            let handle = db
                .find_endpoint(eid.scheme_name(), &eid.nss())
                .ok_or_else(|| BpError::NoSuchEndpoint(eid.to_string()))?;
            if let Some(endpoint) = db.endpoints.get_mut(handle) {
                endpoint.recv_rule = recv_rule;
                endpoint.recv_script = recv_script.map(str::to_string);
            }
            Ok(())
        })
    }

    /// Unregister an endpoint; its delivery queue must be empty
    pub fn remove_endpoint(&self, eid: &Eid) -> BpResult<()> {
        let scheme_name = eid.scheme_name().to_string();
        let nss = eid.nss();
        self.transact_ctx(|db, _ctx| {
            let handle = db
                .find_endpoint(&scheme_name, &nss)
                .ok_or_else(|| BpError::NoSuchEndpoint(eid.to_string()))?;
            let Some(endpoint) = db.endpoints.get(handle) else {
                return Err(BpError::NoSuchEndpoint(eid.to_string()));
            };
            if !endpoint.delivery_queue.is_empty() || !endpoint.incompletes.is_empty() {
                return Err(BpError::InvalidOperation(format!(
                    "endpoint {eid} has undelivered bundles"
                )));
            }
            let scheme_handle = endpoint.scheme;
            if let Some(scheme) = db.schemes.get_mut(scheme_handle) {
                scheme.endpoints.retain(|&h| h != handle);
            }
            db.endpoints.remove(handle);
            Ok(())
        })?;
        self.inner.vdb.drop_endpoint(&scheme_name, &nss);
        info!(endpoint = %eid, "Unregistered endpoint");
        Ok(())
    }

    /// Register a convergence-layer protocol
    pub fn add_protocol(
        &self,
        name: &str,
        payload_bytes_per_frame: u32,
        overhead_per_frame: u32,
        nominal_rate: i64,
    ) -> BpResult<()> {
        self.transact_ctx(|db, _ctx| {
            if db.find_protocol(name).is_some() {
                return Err(BpError::DuplicateName(name.to_string()));
            }
            db.protocols.insert(ClProtocol {
                name: name.to_string(),
                payload_bytes_per_frame,
                overhead_per_frame,
                nominal_rate,
                inducts: Vec::new(),
                outducts: Vec::new(),
            });
            Ok(())
        })?;
        info!(protocol = name, "Added protocol");
        Ok(())
    }

    /// Unregister a protocol and its ducts' index entries; the ducts
    /// must be empty
    pub fn remove_protocol(&self, name: &str) -> BpResult<()> {
        let duct_names = self.transact_ctx(|db, _ctx| {
            let handle = db
                .find_protocol(name)
                .ok_or_else(|| BpError::NoSuchProtocol(name.to_string()))?;
            let Some(protocol) = db.protocols.get(handle) else {
                return Err(BpError::NoSuchProtocol(name.to_string()));
            };
            for &outduct_handle in &protocol.outducts {
                if let Some(outduct) = db.outducts.get(outduct_handle)
                    && (!outduct.bulk_queue.is_empty()
                        || !outduct.std_queue.is_empty()
                        || !outduct.urgent_queue.is_empty())
                {
                    return Err(BpError::InvalidOperation(format!(
                        "outduct {} has queued bundles",
                        outduct.name
                    )));
                }
            }
            let inducts = protocol.inducts.clone();
            let outducts = protocol.outducts.clone();
            let mut names = Vec::new();
            for handle in inducts {
                if let Some(induct) = db.inducts.remove(handle) {
                    names.push((true, induct.name));
                }
            }
            for handle in outducts {
                if let Some(outduct) = db.outducts.remove(handle) {
                    names.push((false, outduct.name));
                }
            }
            db.protocols.remove(handle);
            Ok(names)
        })?;
        for (is_induct, duct_name) in duct_names {
            if is_induct {
                self.inner.vdb.drop_induct(name, &duct_name);
            } else {
                self.inner.vdb.drop_outduct(name, &duct_name);
            }
        }
        info!(protocol = name, "Removed protocol");
        Ok(())
    }

    /// Register an inbound duct for a protocol
    pub fn add_induct(&self, protocol_name: &str, duct_name: &str, cli_cmd: &str) -> BpResult<()> {
        self.transact_ctx(|db, _ctx| {
            let protocol_handle = db
                .find_protocol(protocol_name)
                .ok_or_else(|| BpError::NoSuchProtocol(protocol_name.to_string()))?;
            if db.find_induct(protocol_name, duct_name).is_some() {
                return Err(BpError::DuplicateName(format!("{protocol_name}/{duct_name}")));
            }
            let induct_handle = db.inducts.insert(Induct {
                name: duct_name.to_string(),
                cli_cmd: cli_cmd.to_string(),
                protocol: protocol_handle,
                stats: InductStats::default(),
            });
            if let Some(protocol) = db.protocols.get_mut(protocol_handle) {
                protocol.inducts.push(induct_handle);
            }
            Ok(())
        })?;
        self.raise_vdb();
        info!(protocol = protocol_name, duct = duct_name, "Added induct");
        Ok(())
    }

    /// Update an induct's adapter command
    pub fn update_induct(&self, protocol_name: &str, duct_name: &str, cli_cmd: &str) -> BpResult<()> {
        self.transact_ctx(|db, _ctx| {
            let handle = db
                .find_induct(protocol_name, duct_name)
                .ok_or_else(|| BpError::NoSuchDuct(format!("{protocol_name}/{duct_name}")))?;
            if let Some(induct) = db.inducts.get_mut(handle) {
                induct.cli_cmd = cli_cmd.to_string();
            }
            Ok(())
        })
    }

    /// Unregister an induct
    pub fn remove_induct(&self, protocol_name: &str, duct_name: &str) -> BpResult<()> {
        self.transact_ctx(|db, _ctx| {
            let handle = db
                .find_induct(protocol_name, duct_name)
                .ok_or_else(|| BpError::NoSuchDuct(format!("{protocol_name}/{duct_name}")))?;
            let protocol_handle = db.inducts.get(handle).map(|d| d.protocol);
            if let Some(protocol_handle) = protocol_handle
                && let Some(protocol) = db.protocols.get_mut(protocol_handle)
            {
                protocol.inducts.retain(|&h| h != handle);
            }
            db.inducts.remove(handle);
            Ok(())
        })?;
        self.inner.vdb.drop_induct(protocol_name, duct_name);
        info!(protocol = protocol_name, duct = duct_name, "Removed induct");
        Ok(())
    }

    /// Register an outbound duct for a protocol
    pub fn add_outduct(
        &self,
        protocol_name: &str,
        duct_name: &str,
        clo_cmd: &str,
        max_payload_len: u64,
    ) -> BpResult<()> {
        self.transact_ctx(|db, _ctx| {
            let protocol_handle = db
                .find_protocol(protocol_name)
                .ok_or_else(|| BpError::NoSuchProtocol(protocol_name.to_string()))?;
            if db.find_outduct(protocol_name, duct_name).is_some() {
                return Err(BpError::DuplicateName(format!("{protocol_name}/{duct_name}")));
            }
            let mut outduct = Outduct::new(
                duct_name.to_string(),
                clo_cmd.to_string(),
                protocol_handle,
            );
            outduct.max_payload_len = max_payload_len;
            let outduct_handle = db.outducts.insert(outduct);
            if let Some(protocol) = db.protocols.get_mut(protocol_handle) {
                protocol.outducts.push(outduct_handle);
            }
            Ok(())
        })?;
        self.raise_vdb();
        info!(protocol = protocol_name, duct = duct_name, "Added outduct");
        Ok(())
    }

    /// Update an outduct's adapter command and payload ceiling
    pub fn update_outduct(
        &self,
        protocol_name: &str,
        duct_name: &str,
        clo_cmd: &str,
        max_payload_len: u64,
    ) -> BpResult<()> {
        self.transact_ctx(|db, _ctx| {
            let handle = db
                .find_outduct(protocol_name, duct_name)
                .ok_or_else(|| BpError::NoSuchDuct(format!("{protocol_name}/{duct_name}")))?;
            if let Some(outduct) = db.outducts.get_mut(handle) {
                outduct.clo_cmd = clo_cmd.to_string();
                outduct.max_payload_len = max_payload_len;
            }
            Ok(())
        })
    }

    /// Unregister an outduct; its queues must be empty
    pub fn remove_outduct(&self, protocol_name: &str, duct_name: &str) -> BpResult<()> {
        self.transact_ctx(|db, _ctx| {
            let handle = db
                .find_outduct(protocol_name, duct_name)
                .ok_or_else(|| BpError::NoSuchDuct(format!("{protocol_name}/{duct_name}")))?;
            let Some(outduct) = db.outducts.get(handle) else {
                return Err(BpError::NoSuchDuct(format!("{protocol_name}/{duct_name}")));
            };
            if !outduct.bulk_queue.is_empty()
                || !outduct.std_queue.is_empty()
                || !outduct.urgent_queue.is_empty()
            {
                return Err(BpError::InvalidOperation(format!(
                    "outduct {protocol_name}/{duct_name} has queued bundles"
                )));
            }
            let protocol_handle = outduct.protocol;
            if let Some(protocol) = db.protocols.get_mut(protocol_handle) {
                protocol.outducts.retain(|&h| h != handle);
            }
            db.outducts.remove(handle);
            Ok(())
        })?;
        self.inner.vdb.drop_outduct(protocol_name, duct_name);
        info!(protocol = protocol_name, duct = duct_name, "Removed outduct");
        Ok(())
    }

    /// Block an outduct: every queued bundle is pulled back and
    /// suspended to limbo
    pub fn block_outduct(&self, protocol_name: &str, duct_name: &str) -> BpResult<()> {
        self.transact_ctx(|db, ctx| {
            let handle = db
                .find_outduct(protocol_name, duct_name)
                .ok_or_else(|| BpError::NoSuchDuct(format!("{protocol_name}/{duct_name}")))?;
            let Some(outduct) = db.outducts.get_mut(handle) else {
                return Err(BpError::NoSuchDuct(format!("{protocol_name}/{duct_name}")));
            };
            outduct.blocked = true;
            let queued: Vec<_> = outduct
                .urgent_queue
                .iter()
                .chain(outduct.std_queue.iter())
                .chain(outduct.bulk_queue.iter())
                .copied()
                .collect();
            for bundle in queued {
                reverse_enqueue(db, ctx, bundle, true)?;
            }
            Ok(())
        })?;
        info!(protocol = protocol_name, duct = duct_name, "Blocked outduct");
        Ok(())
    }

    /// Unblock an outduct and release every limbo bundle for fresh
    /// routing
    pub fn unblock_outduct(&self, protocol_name: &str, duct_name: &str) -> BpResult<()> {
        self.transact_ctx(|db, ctx| {
            let handle = db
                .find_outduct(protocol_name, duct_name)
                .ok_or_else(|| BpError::NoSuchDuct(format!("{protocol_name}/{duct_name}")))?;
            if let Some(outduct) = db.outducts.get_mut(handle) {
                outduct.blocked = false;
            }
            let suspended: Vec<_> = db.limbo_queue.iter().copied().collect();
            for bundle in suspended {
                release_from_limbo(db, ctx, bundle, true)?;
            }
            Ok(())
        })?;
        info!(protocol = protocol_name, duct = duct_name, "Unblocked outduct");
        Ok(())
    }

    /// Change the custody-transfer countdown
    pub fn set_ct_countdown(&self, timeout_secs: u64) -> BpResult<()> {
        self.transact_ctx(|db, _ctx| {
            db.ct_expired_timeout = timeout_secs;
            Ok(())
        })
    }

    /// Change the activity watch mask
    pub fn set_watch(&self, mask: WatchMask) -> BpResult<()> {
        self.transact_ctx(|db, _ctx| {
            db.watch = mask;
            Ok(())
        })
    }
}
