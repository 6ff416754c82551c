// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present rinode Contributors

//! Per-node registries
//!
//! The [`Node`] owns everything with a dense id on this host: IPCPs, flows
//! (hashed by port and, for CEP-using engines, by CEP), DIFs, engine
//! factories and open control handles. All lifecycle decisions run here so
//! that reference counting and table membership stay consistent.
//!
//! Lock order, outermost first: per-IPCP config mutex, IPCP table, flow
//! table, per-flow DTP state, DIF list. The per-IPCP registration lock is
//! a peer of the config mutex and never nests inside it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bitmap::IdBitmap;
use crate::ctrl::CtrlHandleCore;
use crate::error::{Error, Result};
use crate::flow::{Flow, FlowState, RxSdu, Upper};
use crate::flowspec::{FlowConfig, FlowStats};
use crate::ipcp::{IPCP_F_ZOMBIE, Ipcp, IpcpOps, RegState, RegisteredAppl};
use crate::msg::{CtrlMsg, MsgBody, UpdateKind};
use crate::names::ApplName;
use crate::pci::{Addr, CepId, PortId};

/// Grace period before a flow with undrained send queues is freed.
pub const FLOW_TEARDOWN_GRACE: Duration = Duration::from_secs(2);

/// Default maximum PDU lifetime of a DIF, milliseconds.
pub const DIF_MPL_DEFAULT_MS: u32 = 1000;

/// A distributed IPC facility as seen by this node.
#[derive(Debug, Clone)]
pub struct Dif {
    pub name: String,
    pub dif_type: String,
    pub max_pdu_life_ms: u32,
}

struct DifEntry {
    dif: Arc<Dif>,
    refcnt: u32,
}

/// Context handed to an engine factory.
pub struct EngineCtx {
    pub node: Arc<Node>,
    pub ipcp_id: u16,
    pub dif_name: String,
}

type EngineCtor = Box<dyn Fn(&EngineCtx) -> Result<Box<dyn IpcpOps>> + Send + Sync>;

/// A registered engine factory.
pub struct Factory {
    pub dif_type: &'static str,
    pub uses_cep_ids: bool,
    pub ctor: EngineCtor,
}

/// Outcome of an application registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegOutcome {
    /// Registered and effective immediately.
    Complete,
    /// Waiting for the user-space IPCP to confirm.
    Pending,
    /// The same owner already held this registration.
    Duplicate,
}

/// Summary of one IPCP, as reported to administrative consumers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IpcpInfo {
    pub id: u16,
    pub name: String,
    pub dif_type: String,
    pub dif_name: String,
    pub addr: Addr,
    pub depth: u8,
}

/// The per-node registry and lifecycle authority.
pub struct Node {
    self_ref: Weak<Node>,
    ipcp_bitmap: Mutex<IdBitmap>,
    port_bitmap: Mutex<IdBitmap>,
    cep_bitmap: Mutex<IdBitmap>,
    ipcps: RwLock<HashMap<u16, Arc<Ipcp>>>,
    flows_by_port: RwLock<HashMap<PortId, Arc<Flow>>>,
    flows_by_cep: RwLock<HashMap<CepId, Arc<Flow>>>,
    difs: Mutex<Vec<DifEntry>>,
    factories: Mutex<Vec<Factory>>,
    handles: Mutex<HashMap<u64, Arc<CtrlHandleCore>>>,
    next_handle_id: Mutex<u64>,
}

impl Node {
    /// Creates an empty registry. Engine factories must be registered
    /// before any IPCP can be created.
    pub fn new() -> Arc<Self> {
        // Port and CEP id 0 mean "not valid" in flow entries and on the
        // wire, so bit 0 stays permanently taken.
        let mut port_bitmap = IdBitmap::new("port");
        let mut cep_bitmap = IdBitmap::new("cep");
        let _ = port_bitmap.alloc();
        let _ = cep_bitmap.alloc();
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            ipcp_bitmap: Mutex::new(IdBitmap::new("ipcp")),
            port_bitmap: Mutex::new(port_bitmap),
            cep_bitmap: Mutex::new(cep_bitmap),
            ipcps: RwLock::new(HashMap::new()),
            flows_by_port: RwLock::new(HashMap::new()),
            flows_by_cep: RwLock::new(HashMap::new()),
            difs: Mutex::new(Vec::new()),
            factories: Mutex::new(Vec::new()),
            handles: Mutex::new(HashMap::new()),
            next_handle_id: Mutex::new(1),
        })
    }

    /// The owning `Arc` of this registry; a running method implies one
    /// exists.
    fn arc(&self) -> Arc<Node> {
        self.self_ref.upgrade().expect("node self-reference")
    }

    /// Creates a registry with the built-in engine factories registered.
    pub fn with_builtin_factories() -> Arc<Self> {
        let node = Self::new();
        crate::normal::register(&node);
        crate::shim_loopback::register(&node);
        crate::shim_udp::register(&node);
        node
    }

    pub fn register_factory(&self, factory: Factory) {
        self.factories.lock().unwrap().push(factory);
    }

    // ---- DIF management -------------------------------------------------

    /// Gets or creates the DIF, taking one reference. A type mismatch on
    /// an existing DIF is an error.
    fn dif_get(&self, name: &str, dif_type: &str) -> Result<Arc<Dif>> {
        let mut difs = self.difs.lock().unwrap();
        if let Some(entry) = difs.iter_mut().find(|e| e.dif.name == name) {
            if entry.dif.dif_type != dif_type {
                return Err(Error::InvalidArgument(format!(
                    "DIF '{}' has type '{}', not '{}'",
                    name, entry.dif.dif_type, dif_type
                )));
            }
            entry.refcnt += 1;
            return Ok(entry.dif.clone());
        }
        let dif = Arc::new(Dif {
            name: name.to_string(),
            dif_type: dif_type.to_string(),
            max_pdu_life_ms: DIF_MPL_DEFAULT_MS,
        });
        difs.push(DifEntry {
            dif: dif.clone(),
            refcnt: 1,
        });
        Ok(dif)
    }

    fn dif_put(&self, name: &str) {
        let mut difs = self.difs.lock().unwrap();
        if let Some(pos) = difs.iter().position(|e| e.dif.name == name) {
            difs[pos].refcnt -= 1;
            if difs[pos].refcnt == 0 {
                difs.remove(pos);
            }
        }
    }

    pub fn dif_mpl_ms(&self, name: &str) -> u32 {
        self.difs
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.dif.name == name)
            .map(|e| e.dif.max_pdu_life_ms)
            .unwrap_or(DIF_MPL_DEFAULT_MS)
    }

    // ---- IPCP lifecycle -------------------------------------------------

    /// Creates an IPCP. Fails without side effects on duplicate names,
    /// unknown engine types or exhausted id space.
    pub fn ipcp_add(
        &self,
        name: &ApplName,
        dif_type: &str,
        dif_name: &str,
    ) -> Result<u16> {
        {
            let ipcps = self.ipcps.read().unwrap();
            if ipcps.values().any(|i| &i.name == name) {
                return Err(Error::Exists(format!("ipcp '{}'", name)));
            }
        }

        let dif = self.dif_get(dif_name, dif_type)?;

        let id = match self.ipcp_bitmap.lock().unwrap().alloc() {
            Ok(id) => id as u16,
            Err(e) => {
                self.dif_put(&dif.name);
                return Err(e);
            }
        };

        let uses_cep_ids = {
            let factories = self.factories.lock().unwrap();
            match factories.iter().find(|f| f.dif_type == dif_type) {
                Some(f) => f.uses_cep_ids,
                None => {
                    self.ipcp_bitmap.lock().unwrap().free(id as u32);
                    self.dif_put(&dif.name);
                    return Err(Error::NotFound(format!("engine type '{}'", dif_type)));
                }
            }
        };

        let ctx = EngineCtx {
            node: self.arc(),
            ipcp_id: id,
            dif_name: dif_name.to_string(),
        };
        let ops = {
            let factories = self.factories.lock().unwrap();
            let factory = factories.iter().find(|f| f.dif_type == dif_type).unwrap();
            match (factory.ctor)(&ctx) {
                Ok(ops) => ops,
                Err(e) => {
                    self.ipcp_bitmap.lock().unwrap().free(id as u32);
                    self.dif_put(&dif.name);
                    return Err(e);
                }
            }
        };

        let ipcp = Arc::new(Ipcp::new(
            id,
            name.clone(),
            dif_name.to_string(),
            dif_type.to_string(),
            ops,
        ));
        if uses_cep_ids {
            ipcp.set_flag(crate::ipcp::IPCP_F_USES_CEP_IDS);
        }

        self.ipcps.write().unwrap().insert(id, ipcp.clone());
        info!(id, name = %name, dif = dif_name, r#type = dif_type, "ipcp created");

        self.fanout_ipcp_update(UpdateKind::Add, &ipcp);
        Ok(id)
    }

    /// Logically deletes an IPCP: marks it zombie and drops the creator's
    /// reference. The destructor runs when the last reference goes.
    pub fn ipcp_del(&self, id: u16) -> Result<()> {
        let ipcp = {
            let ipcps = self.ipcps.read().unwrap();
            match ipcps.get(&id) {
                Some(ipcp) if !ipcp.is_zombie() => ipcp.clone(),
                _ => return Err(Error::NotFound(format!("ipcp {}", id))),
            }
        };
        ipcp.set_flag(IPCP_F_ZOMBIE);
        self.fanout_ipcp_update(UpdateKind::Del, &ipcp);
        self.ipcp_put(&ipcp);
        Ok(())
    }

    /// Takes a counted reference to an IPCP by id; zombies do not resolve.
    pub fn ipcp_get(&self, id: u16) -> Result<Arc<Ipcp>> {
        let ipcps = self.ipcps.read().unwrap();
        match ipcps.get(&id) {
            Some(ipcp) if !ipcp.is_zombie() => {
                ipcp.get();
                Ok(ipcp.clone())
            }
            _ => Err(Error::NotFound(format!("ipcp {}", id))),
        }
    }

    /// Uncounted lookup by id, zombies included; for engine-internal use
    /// where the caller's existence already pins the entity.
    pub(crate) fn ipcp_find(&self, id: u16) -> Option<Arc<Ipcp>> {
        self.ipcps.read().unwrap().get(&id).cloned()
    }

    /// Looks up an IPCP by name without taking a reference.
    pub fn ipcp_lookup_by_name(&self, name: &ApplName) -> Result<Arc<Ipcp>> {
        let ipcps = self.ipcps.read().unwrap();
        ipcps
            .values()
            .find(|i| &i.name == name && !i.is_zombie())
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("ipcp '{}'", name)))
    }

    /// Selects an IPCP by DIF name, or, with `None`, the normal IPCP of
    /// greatest depth. Takes a counted reference.
    pub fn ipcp_select_by_dif(&self, dif_name: Option<&str>) -> Result<Arc<Ipcp>> {
        let ipcps = self.ipcps.read().unwrap();
        let selected = match dif_name {
            Some(name) if !name.is_empty() => ipcps
                .values()
                .filter(|i| i.dif_name == name && !i.is_zombie())
                .min_by_key(|i| i.id)
                .cloned(),
            _ => ipcps
                .values()
                .filter(|i| i.dif_type == "normal" && !i.is_zombie())
                .max_by_key(|i| (i.depth(), u16::MAX - i.id))
                .cloned(),
        };
        match selected {
            Some(ipcp) => {
                ipcp.get();
                Ok(ipcp)
            }
            None => Err(Error::NotFound(format!(
                "no ipcp in DIF '{}'",
                dif_name.unwrap_or("<default>")
            ))),
        }
    }

    /// Drops a counted IPCP reference; the last one runs the destructor
    /// and releases the DIF.
    pub fn ipcp_put(&self, ipcp: &Arc<Ipcp>) {
        if ipcp.put() > 0 {
            return;
        }
        self.ipcps.write().unwrap().remove(&ipcp.id);
        ipcp.ops.destroy();
        self.ipcp_bitmap.lock().unwrap().free(ipcp.id as u32);
        self.dif_put(&ipcp.dif_name);
        info!(id = ipcp.id, name = %ipcp.name, "ipcp destroyed");
    }

    /// Applies a configuration parameter to an IPCP. The generic
    /// parameters (`address`, `depth`) are handled here; everything else
    /// goes to the engine.
    pub fn ipcp_config(&self, id: u16, name: &str, value: &str) -> Result<()> {
        let ipcp = self.ipcp_get(id)?;
        let _guard = ipcp.config_lock.lock().unwrap();
        let res = match name {
            "address" => value
                .parse::<Addr>()
                .map_err(|_| Error::InvalidArgument(format!("bad address '{}'", value)))
                .map(|addr| {
                    ipcp.set_addr(addr);
                    true
                }),
            "depth" => value
                .parse::<u8>()
                .map_err(|_| Error::InvalidArgument(format!("bad depth '{}'", value)))
                .map(|d| {
                    ipcp.set_depth(d);
                    true
                }),
            other => ipcp.ops.config(other, value),
        };
        drop(_guard);
        let res = match res {
            Ok(notify) => {
                if notify {
                    self.fanout_ipcp_update(UpdateKind::Upd, &ipcp);
                }
                Ok(())
            }
            Err(e) => Err(e),
        };
        self.ipcp_put(&ipcp);
        res
    }

    pub fn ipcps_show(&self) -> Vec<IpcpInfo> {
        let ipcps = self.ipcps.read().unwrap();
        let mut infos: Vec<IpcpInfo> = ipcps
            .values()
            .filter(|i| !i.is_zombie())
            .map(|i| IpcpInfo {
                id: i.id,
                name: i.name.to_string(),
                dif_type: i.dif_type.clone(),
                dif_name: i.dif_name.clone(),
                addr: i.addr(),
                depth: i.depth(),
            })
            .collect();
        infos.sort_by_key(|i| i.id);
        infos
    }

    // ---- Application registration ---------------------------------------

    /// Registers an application name on an IPCP on behalf of a handle.
    pub fn appl_add(
        &self,
        ipcp: &Arc<Ipcp>,
        name: &ApplName,
        handle_id: u64,
        event_id: u32,
    ) -> Result<RegOutcome> {
        let outcome = ipcp.with_registrations(|appls| {
            if let Some(existing) = appls.iter().find(|r| &r.name == name) {
                if existing.handle_id == handle_id {
                    return Ok(RegOutcome::Duplicate);
                }
                return Err(Error::Exists(format!(
                    "application '{}' registered by another owner",
                    name
                )));
            }
            appls.push(RegisteredAppl {
                name: name.clone(),
                handle_id,
                event_id,
                state: RegState::Complete,
            });
            Ok(RegOutcome::Complete)
        })?;
        if outcome == RegOutcome::Duplicate {
            return Ok(outcome);
        }

        // Ask the engine; a user-space registration policy leaves the
        // entry pending until the controller confirms.
        match ipcp.ops.appl_register(name, true) {
            Ok(true) => {
                ipcp.with_registrations(|appls| {
                    if let Some(r) = appls.iter_mut().find(|r| &r.name == name) {
                        r.state = RegState::Pending;
                    }
                });
                Ok(RegOutcome::Pending)
            }
            Ok(false) => Ok(RegOutcome::Complete),
            Err(e) => {
                ipcp.with_registrations(|appls| appls.retain(|r| &r.name != name));
                Err(e)
            }
        }
    }

    /// Completes or rejects a pending registration (driven by the
    /// user-space IPCP).
    pub fn appl_reg_complete(
        &self,
        ipcp: &Arc<Ipcp>,
        name: &ApplName,
        accepted: bool,
    ) -> Result<RegisteredAppl> {
        ipcp.with_registrations(|appls| {
            let pos = appls
                .iter()
                .position(|r| &r.name == name && r.state == RegState::Pending)
                .ok_or_else(|| Error::NotFound(format!("pending registration '{}'", name)))?;
            if accepted {
                appls[pos].state = RegState::Complete;
                Ok(appls[pos].clone())
            } else {
                Ok(appls.remove(pos))
            }
        })
    }

    /// Removes a registration owned by `handle_id`.
    pub fn appl_del(&self, ipcp: &Arc<Ipcp>, name: &ApplName, handle_id: u64) -> Result<()> {
        let removed = ipcp.with_registrations(|appls| {
            let pos = appls
                .iter()
                .position(|r| &r.name == name && r.handle_id == handle_id);
            pos.map(|p| appls.remove(p))
        });
        match removed {
            Some(r) => {
                // Engine notification runs outside the registration lock;
                // for user-space policies it is a queue push, never a wait.
                let _ = ipcp.ops.appl_register(&r.name, false);
                Ok(())
            }
            None => Err(Error::NotFound(format!("registration '{}'", name))),
        }
    }

    // ---- Flow lifecycle -------------------------------------------------

    /// Allocates identity bits and a flow entry in pending state, taking
    /// one IPCP reference. Rolls back on any failure.
    pub fn flow_add(
        &self,
        ipcp: &Arc<Ipcp>,
        upper: Upper,
        event_id: u32,
        local_appl: &ApplName,
        remote_appl: &ApplName,
        cfg: Option<FlowConfig>,
    ) -> Result<Arc<Flow>> {
        let port = self.port_bitmap.lock().unwrap().alloc()? as PortId;
        let cep = if ipcp.uses_cep_ids() {
            match self.cep_bitmap.lock().unwrap().alloc() {
                Ok(cep) => cep as CepId,
                Err(e) => {
                    self.port_bitmap.lock().unwrap().free(port as u32);
                    return Err(e);
                }
            }
        } else {
            0
        };

        ipcp.get();
        let flow = Arc::new(Flow::new(
            port,
            cep,
            ipcp.clone(),
            local_appl.clone(),
            remote_appl.clone(),
            upper,
            event_id,
            cfg.unwrap_or_default(),
        ));

        self.flows_by_port
            .write()
            .unwrap()
            .insert(port, flow.clone());
        if ipcp.uses_cep_ids() {
            self.flows_by_cep.write().unwrap().insert(cep, flow.clone());
        }
        debug!(port, cep, ipcp = ipcp.id, "flow added");
        Ok(flow)
    }

    /// Takes a counted reference to a flow by port id.
    pub fn flow_get(&self, port: PortId) -> Result<Arc<Flow>> {
        let flows = self.flows_by_port.read().unwrap();
        match flows.get(&port) {
            Some(flow) => {
                flow.mutable.lock().unwrap().refcnt += 1;
                Ok(flow.clone())
            }
            None => Err(Error::NotFound(format!("flow {}", port))),
        }
    }

    /// Takes a counted reference to a flow by CEP id.
    pub fn flow_get_by_cep(&self, cep: CepId) -> Result<Arc<Flow>> {
        let flows = self.flows_by_cep.read().unwrap();
        match flows.get(&cep) {
            Some(flow) => {
                flow.mutable.lock().unwrap().refcnt += 1;
                Ok(flow.clone())
            }
            None => Err(Error::NotFound(format!("cep {}", cep))),
        }
    }

    /// Uncounted lookup for read-only snapshots.
    pub fn flow_find(&self, port: PortId) -> Option<Arc<Flow>> {
        self.flows_by_port.read().unwrap().get(&port).cloned()
    }

    /// Marks the first user-space bind of a flow: clears `never_bound`
    /// and folds the existence reference into the binder's, so that
    /// closing the I/O handle destroys the flow.
    pub fn flow_make_mortal(&self, flow: &Arc<Flow>) {
        let mut m = flow.mutable.lock().unwrap();
        if m.never_bound {
            m.never_bound = false;
            m.refcnt -= 1;
        }
    }

    /// Drops one flow reference; at zero the flow is destroyed, possibly
    /// after a grace period that lets send queues drain.
    pub fn flow_put(&self, flow: &Arc<Flow>) {
        let deferred = {
            let mut m = flow.mutable.lock().unwrap();
            debug_assert!(m.refcnt > 0);
            m.refcnt -= 1;
            if m.refcnt > 0 {
                return;
            }
            m.teardown_deferred
        };

        if !deferred {
            flow.ipcp.ops.flow_deallocated(flow);

            let must_defer = {
                let dtp = flow.dtp.lock().unwrap();
                match dtp.as_ref() {
                    Some(dtp) => {
                        flow.cfg().dtcp_present && (dtp.cwq_len() > 0 || dtp.rtxq_len() > 0)
                    }
                    None => false,
                }
            };
            if must_defer {
                if let Ok(rt) = tokio::runtime::Handle::try_current() {
                    let mut m = flow.mutable.lock().unwrap();
                    m.teardown_deferred = true;
                    m.refcnt = 1;
                    drop(m);
                    debug!(port = flow.local_port, "flow teardown postponed");
                    let node = self.arc();
                    let flow = flow.clone();
                    rt.spawn(async move {
                        tokio::time::sleep(FLOW_TEARDOWN_GRACE).await;
                        node.flow_put(&flow);
                    });
                    return;
                }
                // No runtime to defer on; fall through and free now.
            }
        }

        self.flow_destroy(flow);
    }

    /// The destruction tail: sweeps forwarding rows, notifies the bound
    /// user-space IPCP, unhashes the identity and releases references.
    fn flow_destroy(&self, flow: &Arc<Flow>) {
        flow.shutdown();

        // Forwarding rows exiting through this flow die with it. The rows
        // live in the upper IPCP's table.
        let dsts = flow.pduft_take();
        if !dsts.is_empty() {
            if let Some(upper) = flow.upper().ipcp.and_then(|id| self.ipcp_find(id)) {
                for dst in dsts {
                    let _ = upper.ops.pduft_del(dst);
                }
            }
        }

        // Tell the user-space IPCP controlling the supporting IPCP.
        if let Some(uipcp_handle) = flow.ipcp.uipcp_handle() {
            let (remote_port, _, remote_addr) = flow.remote();
            let msg = CtrlMsg::notification(MsgBody::FlowDeallocated {
                ipcp_id: flow.ipcp.id,
                local_port: flow.local_port,
                remote_port,
                remote_addr,
            });
            let _ = self.push_to_handle(uipcp_handle, &msg);
        }

        self.flows_by_port.write().unwrap().remove(&flow.local_port);
        if flow.ipcp.uses_cep_ids() {
            self.flows_by_cep.write().unwrap().remove(&flow.local_cep);
            self.cep_bitmap.lock().unwrap().free(flow.local_cep);
        }
        self.port_bitmap.lock().unwrap().free(flow.local_port as u32);

        // Release the reference taken when the upper IPCP was bound, even
        // if it has gone zombie meanwhile.
        if let Some(upper) = flow.upper().ipcp.and_then(|id| self.ipcp_find(id)) {
            self.ipcp_put(&upper);
        }
        self.ipcp_put(&flow.ipcp);
        debug!(port = flow.local_port, "flow destroyed");
    }

    /// Explicit deallocation of a flow by its user. The second call on
    /// the same port reports not-found without side effects.
    pub fn flow_dealloc(&self, port: PortId) -> Result<()> {
        let flow = self.flow_get(port)?;
        if flow.state() == FlowState::Deallocated {
            self.flow_put(&flow);
            return Err(Error::NotFound(format!("flow {}", port)));
        }
        flow.shutdown();
        // A flow that never got an I/O binding has nobody left to release
        // its existence reference.
        self.flow_make_mortal(&flow);
        self.flow_put(&flow);
        Ok(())
    }

    /// Delivers an SDU arriving on a flow to whatever sits on top of it:
    /// the upper IPCP when one is bound, the reader queue otherwise.
    pub fn sdu_rx_up(&self, flow: &Arc<Flow>, sdu: RxSdu) -> Result<()> {
        match flow.upper().ipcp {
            Some(upper_id) => {
                // The flow's bind reference already pins the upper IPCP.
                let upper = self
                    .ipcp_find(upper_id)
                    .ok_or_else(|| Error::NotFound(format!("upper ipcp {}", upper_id)))?;
                upper.ops.sdu_rx(flow, sdu.data)
            }
            None => flow.rxq_push(sdu),
        }
    }

    /// Binds a flow to an upper IPCP that will use it as N-1 transport.
    pub fn upper_ipcp_flow_bind(&self, upper_ipcp_id: u16, flow: &Arc<Flow>) -> Result<()> {
        let upper = self.ipcp_get(upper_ipcp_id)?;
        flow.set_upper_ipcp(upper_ipcp_id);
        // Keep the reference taken by ipcp_get: the flow now pins its
        // upper IPCP until teardown.
        drop(upper);
        Ok(())
    }

    /// A flow allocation request reached this node (from a shim engine
    /// or relayed by a user-space IPCP): create the server-side pending
    /// flow and notify the application that registered the target name.
    /// Returns the new local port id.
    #[allow(clippy::too_many_arguments)]
    pub fn fa_req_arrived(
        &self,
        ipcp: &Arc<Ipcp>,
        kevent_id: u32,
        remote_port: PortId,
        remote_cep: CepId,
        remote_addr: Addr,
        local_appl: &ApplName,
        remote_appl: &ApplName,
        flowcfg: Option<FlowConfig>,
    ) -> Result<PortId> {
        let reg = ipcp
            .find_registration(local_appl)
            .filter(|r| r.state == RegState::Complete)
            .ok_or_else(|| {
                Error::NotFound(format!("application '{}' not registered here", local_appl))
            })?;

        let has_cfg = flowcfg.is_some();
        let flow = self.flow_add(
            ipcp,
            Upper::handle(reg.handle_id),
            0,
            local_appl,
            remote_appl,
            flowcfg,
        )?;
        flow.set_remote(remote_port, remote_cep, remote_addr);
        if has_cfg {
            ipcp.ops.flow_init(&flow);
        }

        let req = CtrlMsg::notification(MsgBody::FaReqArrived {
            kevent_id,
            ipcp_id: ipcp.id,
            port_id: flow.local_port,
            dif_name: ipcp.dif_name.clone(),
            local_appl: local_appl.clone(),
            remote_appl: remote_appl.clone(),
        });
        let port = flow.local_port;
        if let Err(e) = self.push_to_handle(reg.handle_id, &req) {
            self.flow_put(&flow);
            return Err(e);
        }
        info!(port, appl = %local_appl, "flow allocation request arrived");
        Ok(port)
    }

    /// A flow allocation response reached the initiator side: complete or
    /// destroy the pending flow and notify the requesting handle with the
    /// real port id, so the outcome can be correlated even when negative.
    #[allow(clippy::too_many_arguments)]
    pub fn fa_resp_arrived(
        &self,
        local_port: PortId,
        remote_port: PortId,
        remote_cep: CepId,
        remote_addr: Addr,
        response: u8,
        flowcfg: Option<FlowConfig>,
    ) -> Result<()> {
        let flow = self.flow_get(local_port)?;
        let res = (|| {
            if flow.state() != FlowState::Pending {
                return Err(Error::InvalidArgument(format!(
                    "flow {} is not pending",
                    local_port
                )));
            }
            flow.set_remote(remote_port, remote_cep, remote_addr);
            if response == 0 {
                flow.mark_allocated()?;
                if let Some(cfg) = flowcfg {
                    flow.set_cfg(cfg);
                    flow.ipcp.ops.flow_init(&flow);
                }
            }
            if let Some(owner) = flow.upper().handle {
                self.push_to_handle(
                    owner,
                    &CtrlMsg::new(
                        flow.event_id,
                        MsgBody::FaRespArrived {
                            port_id: local_port,
                            response,
                        },
                    ),
                )?;
            }
            Ok(())
        })();

        if response != 0 {
            // Nobody will ever bind a rejected flow.
            self.flow_make_mortal(&flow);
        }
        self.flow_put(&flow);
        res
    }

    pub fn flow_stats(&self, port: PortId) -> Result<FlowStats> {
        let flow = self.flow_find(port).ok_or_else(|| {
            Error::NotFound(format!("flow {}", port))
        })?;
        flow.ipcp.ops.flow_get_stats(&flow)
    }

    /// Snapshot of all flows for `flow-fetch` and administrative output.
    pub fn flows_snapshot(&self) -> Vec<MsgBody> {
        let flows = self.flows_by_port.read().unwrap();
        let mut out: Vec<MsgBody> = flows
            .values()
            .map(|f| {
                let (remote_port, remote_cep, remote_addr) = f.remote();
                MsgBody::FlowFetchResp {
                    end: false,
                    ipcp_id: f.ipcp.id,
                    local_port: f.local_port,
                    remote_port,
                    local_cep: f.local_cep,
                    remote_cep,
                    local_addr: f.ipcp.addr(),
                    remote_addr,
                    state: f.state() as u8,
                }
            })
            .collect();
        out.sort_by_key(|m| match m {
            MsgBody::FlowFetchResp { local_port, .. } => *local_port,
            _ => 0,
        });
        out
    }

    // ---- Control handles ------------------------------------------------

    pub(crate) fn alloc_handle_id(&self) -> u64 {
        let mut next = self.next_handle_id.lock().unwrap();
        let id = *next;
        *next += 1;
        id
    }

    pub(crate) fn register_handle(&self, core: Arc<CtrlHandleCore>) {
        self.handles.lock().unwrap().insert(core.id, core);
    }

    /// Detaches a handle: its pending flows die, its registrations are
    /// removed, its user-space IPCP bindings are released. Allocated
    /// flows survive until deallocated.
    pub(crate) fn unregister_handle(&self, handle_id: u64) {
        self.handles.lock().unwrap().remove(&handle_id);

        let ipcps: Vec<Arc<Ipcp>> = self.ipcps.read().unwrap().values().cloned().collect();
        for ipcp in &ipcps {
            let owned: Vec<ApplName> = ipcp.with_registrations(|appls| {
                appls
                    .iter()
                    .filter(|r| r.handle_id == handle_id)
                    .map(|r| r.name.clone())
                    .collect()
            });
            for name in owned {
                let _ = self.appl_del(ipcp, &name, handle_id);
            }
            ipcp.uipcp_clear(handle_id);
        }

        let owned: Vec<Arc<Flow>> = self
            .flows_by_port
            .read()
            .unwrap()
            .values()
            .filter(|f| f.upper().handle == Some(handle_id))
            .cloned()
            .collect();
        for flow in owned {
            if flow.state() == FlowState::Pending {
                // No way left to deliver the allocation response.
                warn!(
                    port = flow.local_port,
                    "destroying pending flow of closed handle"
                );
                self.flow_put(&flow);
            }
        }
    }

    pub(crate) fn handle_core(&self, handle_id: u64) -> Option<Arc<CtrlHandleCore>> {
        self.handles.lock().unwrap().get(&handle_id).cloned()
    }

    /// Enqueues a message to one handle's upqueue.
    pub fn push_to_handle(&self, handle_id: u64, msg: &CtrlMsg) -> Result<()> {
        let core = self
            .handle_core(handle_id)
            .ok_or_else(|| Error::NotFound(format!("control handle {}", handle_id)))?;
        core.upqueue.push(msg.serialize())
    }

    /// Fans an `ipcp-update` out to every handle that opted in.
    pub(crate) fn fanout_ipcp_update(&self, kind: UpdateKind, ipcp: &Arc<Ipcp>) {
        let msg = CtrlMsg::notification(MsgBody::IpcpUpdate {
            kind,
            ipcp_id: ipcp.id,
            ipcp_addr: ipcp.addr(),
            depth: ipcp.depth(),
            ipcp_name: ipcp.name.clone(),
            dif_type: ipcp.dif_type.clone(),
            dif_name: ipcp.dif_name.clone(),
        });
        let handles: Vec<Arc<CtrlHandleCore>> =
            self.handles.lock().unwrap().values().cloned().collect();
        for core in handles {
            if core.wants_ipcp_updates() {
                let _ = core.upqueue.push(msg.serialize());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> Arc<Node> {
        Node::with_builtin_factories()
    }

    #[tokio::test]
    async fn test_ipcp_add_del() {
        let node = node();
        let name: ApplName = "n/1".parse().unwrap();
        let id = node.ipcp_add(&name, "shim-loopback", "lo").unwrap();

        // Duplicate name rejected.
        assert!(matches!(
            node.ipcp_add(&name, "shim-loopback", "lo"),
            Err(Error::Exists(_))
        ));
        // Unknown engine type rejected.
        let other: ApplName = "m/1".parse().unwrap();
        assert!(matches!(
            node.ipcp_add(&other, "no-such-engine", "x"),
            Err(Error::NotFound(_))
        ));

        node.ipcp_del(id).unwrap();
        assert!(node.ipcp_get(id).is_err());
        // Deleting twice reports not-found.
        assert!(matches!(node.ipcp_del(id), Err(Error::NotFound(_))));
        assert!(node.ipcps_show().is_empty());
    }

    #[tokio::test]
    async fn test_dif_type_mismatch() {
        let node = node();
        let a: ApplName = "a/1".parse().unwrap();
        let b: ApplName = "b/1".parse().unwrap();
        node.ipcp_add(&a, "shim-loopback", "d").unwrap();
        assert!(matches!(
            node.ipcp_add(&b, "normal", "d"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_zombie_blocks_operations() {
        let node = node();
        let name: ApplName = "n/1".parse().unwrap();
        let id = node.ipcp_add(&name, "normal", "d").unwrap();
        // A held reference keeps the entity alive through deletion.
        let held = node.ipcp_get(id).unwrap();
        node.ipcp_del(id).unwrap();
        assert!(matches!(node.ipcp_get(id), Err(Error::NotFound(_))));
        assert!(matches!(
            node.ipcp_config(id, "address", "9"),
            Err(Error::NotFound(_))
        ));
        node.ipcp_put(&held);
    }

    #[tokio::test]
    async fn test_config_address_readback() {
        let node = node();
        let name: ApplName = "n/1".parse().unwrap();
        let id = node.ipcp_add(&name, "normal", "d").unwrap();
        node.ipcp_config(id, "address", "42").unwrap();
        let infos = node.ipcps_show();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].addr, 42);
    }

    #[tokio::test]
    async fn test_select_by_dif_prefers_deepest_normal() {
        let node = node();
        let a: ApplName = "a/1".parse().unwrap();
        let b: ApplName = "b/1".parse().unwrap();
        let ida = node.ipcp_add(&a, "normal", "d0").unwrap();
        let idb = node.ipcp_add(&b, "normal", "d1").unwrap();
        node.ipcp_config(ida, "depth", "1").unwrap();
        node.ipcp_config(idb, "depth", "3").unwrap();

        let sel = node.ipcp_select_by_dif(None).unwrap();
        assert_eq!(sel.id, idb);
        node.ipcp_put(&sel);

        let sel = node.ipcp_select_by_dif(Some("d0")).unwrap();
        assert_eq!(sel.id, ida);
        node.ipcp_put(&sel);
    }

    #[tokio::test]
    async fn test_appl_add_duplicate_rules() {
        let node = node();
        let name: ApplName = "n/1".parse().unwrap();
        let id = node.ipcp_add(&name, "shim-loopback", "lo").unwrap();
        let ipcp = node.ipcp_get(id).unwrap();
        let appl: ApplName = "server".parse().unwrap();

        assert_eq!(
            node.appl_add(&ipcp, &appl, 1, 10).unwrap(),
            RegOutcome::Complete
        );
        // Same owner: distinct success outcome.
        assert_eq!(
            node.appl_add(&ipcp, &appl, 1, 11).unwrap(),
            RegOutcome::Duplicate
        );
        // Different owner: error.
        assert!(matches!(
            node.appl_add(&ipcp, &appl, 2, 12),
            Err(Error::Exists(_))
        ));

        node.appl_del(&ipcp, &appl, 1).unwrap();
        assert!(matches!(
            node.appl_del(&ipcp, &appl, 1),
            Err(Error::NotFound(_))
        ));
        node.ipcp_put(&ipcp);
    }

    #[tokio::test]
    async fn test_flow_add_and_dealloc_idempotence() {
        let node = node();
        let name: ApplName = "n/1".parse().unwrap();
        let id = node.ipcp_add(&name, "shim-loopback", "lo").unwrap();
        let ipcp = node.ipcp_get(id).unwrap();

        let flow = node
            .flow_add(
                &ipcp,
                Upper::handle(1),
                5,
                &"a".parse().unwrap(),
                &"b".parse().unwrap(),
                None,
            )
            .unwrap();
        let port = flow.local_port;
        flow.mark_allocated().unwrap();

        node.flow_dealloc(port).unwrap();
        assert!(matches!(node.flow_dealloc(port), Err(Error::NotFound(_))));
        assert!(node.flow_find(port).is_none());
        node.ipcp_put(&ipcp);
    }

    #[tokio::test]
    async fn test_cep_uniqueness_across_normal_ipcps() {
        let node = node();
        let a: ApplName = "a/1".parse().unwrap();
        let b: ApplName = "b/1".parse().unwrap();
        let ida = node.ipcp_add(&a, "normal", "d0").unwrap();
        let idb = node.ipcp_add(&b, "normal", "d0").unwrap();
        let ipcp_a = node.ipcp_get(ida).unwrap();
        let ipcp_b = node.ipcp_get(idb).unwrap();

        let mut ceps = std::collections::HashSet::new();
        for ipcp in [&ipcp_a, &ipcp_b] {
            for _ in 0..4 {
                let flow = node
                    .flow_add(
                        ipcp,
                        Upper::handle(1),
                        0,
                        &"x".parse().unwrap(),
                        &"y".parse().unwrap(),
                        None,
                    )
                    .unwrap();
                assert!(ceps.insert(flow.local_cep), "duplicate cep id");
            }
        }
        node.ipcp_put(&ipcp_a);
        node.ipcp_put(&ipcp_b);
    }
}
