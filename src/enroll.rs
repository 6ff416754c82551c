// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present rinode Contributors

//! Neighbor enrollment
//!
//! The handshake by which two IPCPs establish a management flow, agree on
//! an address for the joining side and synchronize their databases. Each
//! neighbor flow runs an eight-state machine; the initiator retries a
//! failed handshake up to three times before giving up.
//!
//! ```text
//!  I: None -> IWaitConnectR -> IWaitStartR -> IWaitStop -> Enrolled
//!  S: None -> SWaitStart    -> SWaitStopR  -> Enrolled
//! ```
//!
//! The slave may defer the final `M_START` (no `start_early`), in which
//! case the initiator parks in `IWaitStart` until it arrives.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cdap::{CdapMessage, CdapOpCode, obj_class, obj_name};
use crate::error::{Error, Result};
use crate::msg::MsgBody;
use crate::names::ApplName;
use crate::pci::{Addr, PortId};
use crate::rib::{RibTimer, UipcpRib};
use crate::timer::TimerId;

/// Per-step handshake timeout.
pub const ENROLL_TIMEOUT: Duration = Duration::from_millis(1500);
/// Initiator attempts before the handshake is abandoned.
pub const ENROLL_MAX_ATTEMPTS: u32 = 3;
/// Keepalive probing period on enrolled flows.
pub const KEEPALIVE_INTVAL: Duration = Duration::from_millis(5000);
/// Unanswered keepalives tolerated before a flow is pruned.
pub const KEEPALIVE_THRESH: u32 = 3;

/// Enrollment state of one neighbor flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollState {
    None,
    IWaitConnectR,
    SWaitStart,
    IWaitStartR,
    SWaitStopR,
    IWaitStop,
    IWaitStart,
    Enrolled,
}

/// One N-1 flow toward a neighbor.
#[derive(Debug)]
pub struct NeighFlow {
    pub port: PortId,
    pub state: EnrollState,
    pub(crate) enroll_timer: Option<TimerId>,
    pub(crate) keepalive_timer: Option<TimerId>,
    pub pending_keepalive_reqs: u32,
    /// Callers blocked until the flow reaches `Enrolled` or `None`.
    pub(crate) waiters: Vec<mpsc::Sender<Result<()>>>,
}

impl NeighFlow {
    fn new(port: PortId) -> Self {
        Self {
            port,
            state: EnrollState::None,
            enroll_timer: None,
            keepalive_timer: None,
            pending_keepalive_reqs: 0,
            waiters: Vec::new(),
        }
    }
}

/// A neighbor IPCP and the flows toward it.
#[derive(Debug)]
pub struct Neighbor {
    pub name: String,
    /// We started the enrollment.
    pub initiator: bool,
    pub enroll_attempts: u32,
    pub flows: HashMap<PortId, NeighFlow>,
    pub mgmt_port: Option<PortId>,
}

impl Neighbor {
    fn new(name: String, initiator: bool) -> Self {
        Self {
            name,
            initiator,
            enroll_attempts: 0,
            flows: HashMap::new(),
            mgmt_port: None,
        }
    }
}

/// A DIF member we know about, whether or not we are enrolled to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborCandidate {
    pub name: String,
    pub address: Addr,
    pub lower_difs: Vec<String>,
}

/// The object exchanged in enrollment `M_START`/`M_STOP` messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrollmentInfo {
    /// Address assigned to the message receiver (0 when unassigned).
    pub address: Addr,
    /// The sender's own address.
    pub peer_address: Addr,
    pub lower_difs: Vec<String>,
    pub start_early: bool,
}

impl UipcpRib {
    // ---- timers ---------------------------------------------------------

    fn enroll_timer_arm(&mut self, neigh: &str, port: PortId) {
        let id = self.wheel.schedule(
            ENROLL_TIMEOUT,
            RibTimer::Enroll {
                neigh: neigh.to_string(),
                port,
            },
        );
        if let Some(nf) = self
            .neighbors
            .get_mut(neigh)
            .and_then(|n| n.flows.get_mut(&port))
        {
            if let Some(old) = nf.enroll_timer.replace(id) {
                self.wheel.cancel(old);
            }
        }
    }

    fn enroll_timer_stop(&mut self, neigh: &str, port: PortId) {
        if let Some(nf) = self
            .neighbors
            .get_mut(neigh)
            .and_then(|n| n.flows.get_mut(&port))
        {
            if let Some(id) = nf.enroll_timer.take() {
                self.wheel.cancel(id);
            }
        }
    }

    pub(crate) fn keepalive_timer_arm(&mut self, neigh: &str, port: PortId) {
        let id = self.wheel.schedule(
            KEEPALIVE_INTVAL,
            RibTimer::Keepalive {
                neigh: neigh.to_string(),
                port,
            },
        );
        if let Some(nf) = self
            .neighbors
            .get_mut(neigh)
            .and_then(|n| n.flows.get_mut(&port))
        {
            if let Some(old) = nf.keepalive_timer.replace(id) {
                self.wheel.cancel(old);
            }
        }
    }

    // ---- outward operations ---------------------------------------------

    /// Starts enrollment (or a bare lower-flow allocation) toward a
    /// neighbor over the given supporting DIF. The kernel's flow
    /// allocation response continues the work in
    /// [`UipcpRib::lower_flow_completed`].
    pub(crate) async fn enroll_start(
        &mut self,
        neigh_name: ApplName,
        supp_dif: String,
        enroll: bool,
        waiter: Option<mpsc::Sender<Result<()>>>,
    ) {
        let event_id = self.event_id();
        let req = crate::msg::CtrlMsg::new(
            event_id,
            MsgBody::FaReq {
                dif_name: supp_dif,
                upper_ipcp_id: self.ipcp_id,
                local_port: 0,
                local_cep: 0,
                local_appl: self.ipcp_name.clone(),
                remote_appl: neigh_name.clone(),
                flowspec: crate::flowspec::FlowSpec::unreliable(),
            },
        );
        self.pending_lower_flows.insert(
            event_id,
            crate::rib::PendingLowerFlow {
                neigh_name,
                enroll,
                waiter,
            },
        );
        if let Err(e) = self.kernel_send(req).await {
            warn!(error = %e, "lower flow request failed");
            if let Some(pending) = self.pending_lower_flows.remove(&event_id) {
                if let Some(waiter) = pending.waiter {
                    let _ = waiter
                        .send(Err(Error::Unreachable("no lower flow".to_string())))
                        .await;
                }
            }
        }
    }

    /// A lower-flow allocation completed (the kernel's
    /// `fa-resp-arrived` with our event id).
    pub(crate) async fn lower_flow_completed(
        &mut self,
        event_id: u32,
        port: PortId,
        response: u8,
    ) {
        let Some(pending) = self.pending_lower_flows.remove(&event_id) else {
            debug!(event_id, "flow response without a pending request");
            return;
        };
        if response != 0 {
            if let Some(waiter) = pending.waiter {
                let _ = waiter
                    .send(Err(Error::PeerRejected(format!(
                        "lower flow to '{}'",
                        pending.neigh_name
                    ))))
                    .await;
            }
            return;
        }

        let name = pending.neigh_name.to_string();
        let neigh = self
            .neighbors
            .entry(name.clone())
            .or_insert_with(|| Neighbor::new(name.clone(), true));
        neigh.initiator = true;
        let mut nf = NeighFlow::new(port);
        if let Some(waiter) = pending.waiter {
            nf.waiters.push(waiter);
        }
        neigh.flows.insert(port, nf);
        if neigh.mgmt_port.is_none() {
            neigh.mgmt_port = Some(port);
        }

        if pending.enroll {
            self.enroll_connect_tx(&name, port).await;
        } else {
            // Bare lower flow: immediately operational.
            if let Some(nf) = self
                .neighbors
                .get_mut(&name)
                .and_then(|n| n.flows.get_mut(&port))
            {
                nf.state = EnrollState::Enrolled;
                for waiter in nf.waiters.drain(..) {
                    let _ = waiter.try_send(Ok(()));
                }
            }
            self.keepalive_timer_arm(&name, port);
            self.routes_recompute().await;
        }
    }

    /// Sends `M_CONNECT` and enters `IWaitConnectR`.
    async fn enroll_connect_tx(&mut self, neigh: &str, port: PortId) {
        let invoke_id = self.invoke_id();
        let mut msg = CdapMessage::new(CdapOpCode::MConnect, "", "").with_invoke_id(invoke_id);
        msg.src_appl = Some(self.ipcp_name.clone());
        msg.dst_appl = neigh.parse().ok();
        if let Err(e) = self.mgmt_send_port(port, &msg) {
            warn!(port, error = %e, "could not send M_CONNECT");
        }
        if let Some(nf) = self
            .neighbors
            .get_mut(neigh)
            .and_then(|n| n.flows.get_mut(&port))
        {
            nf.state = EnrollState::IWaitConnectR;
        }
        self.enroll_timer_arm(neigh, port);
    }

    // ---- the state machine ----------------------------------------------

    /// Handles one enrollment-related CDAP message arriving on `port`.
    pub(crate) async fn enroll_rx(&mut self, msg: CdapMessage, port: PortId) -> Result<()> {
        if msg.op_code == CdapOpCode::MConnect {
            return self.connect_rx(msg, port).await;
        }

        let Some((neigh, state)) = self.neighflow_state(port) else {
            debug!(port, op = %msg.op_code, "enrollment message on unknown flow");
            return Ok(());
        };

        match (msg.op_code, state) {
            (CdapOpCode::MConnectR, EnrollState::IWaitConnectR) => {
                self.enroll_timer_stop(&neigh, port);
                let invoke_id = self.invoke_id();
                let info = EnrollmentInfo {
                    address: self.addr(),
                    peer_address: 0,
                    lower_difs: self.lower_difs.clone(),
                    start_early: false,
                };
                let start =
                    CdapMessage::new(CdapOpCode::MStart, obj_class::ENROLLMENT, obj_name::ENROLLMENT)
                        .with_invoke_id(invoke_id)
                        .with_obj(&info)?;
                self.mgmt_send_port(port, &start)?;
                self.set_neighflow_state(&neigh, port, EnrollState::IWaitStartR);
                self.enroll_timer_arm(&neigh, port);
                Ok(())
            }

            (CdapOpCode::MStart, EnrollState::SWaitStart) => {
                self.enroll_timer_stop(&neigh, port);
                let info: EnrollmentInfo = msg.obj()?;
                let addr = if info.address == 0 {
                    self.addr_allocate()
                } else {
                    info.address
                };
                let cand = NeighborCandidate {
                    name: neigh.clone(),
                    address: addr,
                    lower_difs: info.lower_difs,
                };
                self.candidates.insert(neigh.clone(), cand.clone());

                let reply = msg.response(0, None)?.with_obj(&EnrollmentInfo {
                    address: addr,
                    peer_address: self.addr(),
                    lower_difs: self.lower_difs.clone(),
                    start_early: false,
                })?;
                self.mgmt_send_port(port, &reply)?;

                // Other enrolled neighbors learn the newcomer right away.
                self.candidates_propagate(vec![cand], Some(port)).await;

                let invoke_id = self.invoke_id();
                let stop =
                    CdapMessage::new(CdapOpCode::MStop, obj_class::ENROLLMENT, obj_name::ENROLLMENT)
                        .with_invoke_id(invoke_id)
                        .with_obj(&EnrollmentInfo {
                            address: addr,
                            peer_address: self.addr(),
                            lower_difs: self.lower_difs.clone(),
                            start_early: true,
                        })?;
                self.mgmt_send_port(port, &stop)?;
                self.set_neighflow_state(&neigh, port, EnrollState::SWaitStopR);
                self.enroll_timer_arm(&neigh, port);
                Ok(())
            }

            (CdapOpCode::MStartR, EnrollState::IWaitStartR) => {
                self.enroll_timer_stop(&neigh, port);
                if !msg.is_success() {
                    warn!(neigh = %neigh, "enrollment rejected by peer");
                    self.enroll_abort(&neigh, port).await;
                    return Ok(());
                }
                let info: EnrollmentInfo = msg.obj()?;
                self.maybe_adopt_address(info.address).await;
                self.remember_peer(&neigh, info.peer_address, info.lower_difs);
                self.set_neighflow_state(&neigh, port, EnrollState::IWaitStop);
                self.enroll_timer_arm(&neigh, port);
                Ok(())
            }

            (CdapOpCode::MStop, EnrollState::IWaitStop | EnrollState::IWaitStartR) => {
                self.enroll_timer_stop(&neigh, port);
                let info: EnrollmentInfo = msg.obj()?;
                self.maybe_adopt_address(info.address).await;
                self.remember_peer(&neigh, info.peer_address, info.lower_difs.clone());

                let reply = msg.response(0, None)?;
                self.mgmt_send_port(port, &reply)?;

                if info.start_early {
                    self.enroll_commit(&neigh, port, info.peer_address).await;
                } else {
                    // Address assignment arrives later with M_START.
                    self.set_neighflow_state(&neigh, port, EnrollState::IWaitStart);
                    self.enroll_timer_arm(&neigh, port);
                }
                Ok(())
            }

            (CdapOpCode::MStart, EnrollState::IWaitStart) => {
                self.enroll_timer_stop(&neigh, port);
                let info: EnrollmentInfo = msg.obj()?;
                self.maybe_adopt_address(info.address).await;
                self.enroll_commit(&neigh, port, info.peer_address).await;
                Ok(())
            }

            (CdapOpCode::MStopR, EnrollState::SWaitStopR) => {
                self.enroll_timer_stop(&neigh, port);
                let invoke_id = self.invoke_id();
                let status =
                    CdapMessage::new(CdapOpCode::MStart, obj_class::STATUS, obj_name::STATUS)
                        .with_invoke_id(invoke_id);
                self.mgmt_send_port(port, &status)?;
                let peer_addr = self
                    .candidates
                    .get(&neigh)
                    .map(|c| c.address)
                    .unwrap_or(0);
                self.enroll_commit(&neigh, port, peer_addr).await;
                Ok(())
            }

            (CdapOpCode::MRelease, _) => {
                info!(neigh = %neigh, port, "peer released the enrollment flow");
                self.neighflow_remove(&neigh, port).await;
                Ok(())
            }

            (op, state) => {
                debug!(neigh = %neigh, ?state, op = %op, "message out of enrollment sequence");
                Ok(())
            }
        }
    }

    /// `M_CONNECT` handler: the slave side opens (or reopens) a handshake.
    async fn connect_rx(&mut self, msg: CdapMessage, port: PortId) -> Result<()> {
        let Some(src) = msg.src_appl.clone() else {
            return Err(Error::InvalidArgument(
                "M_CONNECT without a source application".to_string(),
            ));
        };
        let name = src.to_string();

        let was_enrolled = self
            .neighbors
            .get(&name)
            .map(|n| {
                n.flows
                    .values()
                    .any(|f| f.state == EnrollState::Enrolled && f.port != port)
            })
            .unwrap_or(false);

        let neigh = self
            .neighbors
            .entry(name.clone())
            .or_insert_with(|| Neighbor::new(name.clone(), false));
        neigh.flows.entry(port).or_insert_with(|| NeighFlow::new(port));
        if was_enrolled {
            // The peer evidently restarted: trust the new flow.
            info!(neigh = %name, port, "re-connect from enrolled neighbor, promoting flow");
            neigh.mgmt_port = Some(port);
        } else if neigh.mgmt_port.is_none() {
            neigh.mgmt_port = Some(port);
        }

        let reply = CdapMessage {
            op_code: CdapOpCode::MConnectR,
            invoke_id: msg.invoke_id,
            obj_class: String::new(),
            obj_name: String::new(),
            result: 0,
            result_reason: None,
            obj_value: None,
            src_appl: Some(self.ipcp_name.clone()),
            dst_appl: Some(src),
        };
        self.mgmt_send_port(port, &reply)?;
        self.set_neighflow_state(&name, port, EnrollState::SWaitStart);
        self.enroll_timer_arm(&name, port);
        Ok(())
    }

    /// Final transition to `Enrolled`: commit the link-state edge, start
    /// keepalive, push the initial database sync and wake waiters.
    async fn enroll_commit(&mut self, neigh: &str, port: PortId, peer_addr: Addr) {
        let my_addr = self.addr();
        if peer_addr != 0 {
            self.lfdb_commit_edge(my_addr, peer_addr).await;
        }
        if let Some(nf) = self
            .neighbors
            .get_mut(neigh)
            .and_then(|n| n.flows.get_mut(&port))
        {
            nf.state = EnrollState::Enrolled;
            for waiter in nf.waiters.drain(..) {
                let _ = waiter.try_send(Ok(()));
            }
        }
        if let Some(n) = self.neighbors.get_mut(neigh) {
            // Reset so earlier failed sessions do not eat into the
            // retries of a future one.
            n.enroll_attempts = 0;
        }
        self.keepalive_timer_arm(neigh, port);
        self.rib_sync_to(port).await;
        self.routes_recompute().await;
        info!(neigh = %neigh, port, "enrollment complete");
    }

    /// Aborts a handshake in progress; the initiator retries a few times.
    pub(crate) async fn enroll_abort(&mut self, neigh: &str, port: PortId) {
        self.enroll_timer_stop(neigh, port);
        let release = CdapMessage::new(CdapOpCode::MRelease, "", "");
        let _ = self.mgmt_send_port(port, &release);

        let retry = {
            let Some(n) = self.neighbors.get_mut(neigh) else {
                return;
            };
            if let Some(nf) = n.flows.get_mut(&port) {
                nf.state = EnrollState::None;
            }
            if n.initiator {
                n.enroll_attempts += 1;
                n.enroll_attempts < ENROLL_MAX_ATTEMPTS
            } else {
                false
            }
        };

        if retry {
            warn!(neigh = %neigh, port, "enrollment aborted, retrying");
            self.enroll_connect_tx(neigh, port).await;
        } else {
            warn!(neigh = %neigh, port, "enrollment failed");
            if let Some(nf) = self
                .neighbors
                .get_mut(neigh)
                .and_then(|n| n.flows.get_mut(&port))
            {
                for waiter in nf.waiters.drain(..) {
                    let _ = waiter.try_send(Err(Error::PeerRejected(format!(
                        "enrollment with '{}' failed",
                        neigh
                    ))));
                }
            }
        }
    }

    // ---- keepalive ------------------------------------------------------

    /// Keepalive timer fired for a neighbor flow.
    pub(crate) async fn keepalive_fire(&mut self, neigh: String, port: PortId) {
        let prune = {
            let Some(nf) = self
                .neighbors
                .get_mut(&neigh)
                .and_then(|n| n.flows.get_mut(&port))
            else {
                return;
            };
            nf.keepalive_timer = None;
            nf.pending_keepalive_reqs += 1;
            nf.pending_keepalive_reqs > KEEPALIVE_THRESH
        };

        if prune {
            warn!(neigh = %neigh, port, "keepalive expired, removing flow");
            self.neighflow_remove(&neigh, port).await;
            return;
        }

        let invoke_id = self.invoke_id();
        let probe = CdapMessage::new(CdapOpCode::MRead, obj_class::KEEPALIVE, obj_name::KEEPALIVE)
            .with_invoke_id(invoke_id);
        if let Err(e) = self.mgmt_send_port(port, &probe) {
            debug!(neigh = %neigh, port, error = %e, "keepalive probe failed");
        }
        self.keepalive_timer_arm(&neigh, port);
    }

    /// Peer probe: answer on the same flow.
    pub(crate) fn keepalive_rx(&mut self, msg: CdapMessage, port: PortId) -> Result<()> {
        let reply = msg.response(0, None)?;
        self.mgmt_send_port(port, &reply)
    }

    /// Peer answered our probe.
    pub(crate) fn keepalive_resp_rx(&mut self, port: PortId) -> Result<()> {
        for n in self.neighbors.values_mut() {
            if let Some(nf) = n.flows.get_mut(&port) {
                nf.pending_keepalive_reqs = 0;
            }
        }
        Ok(())
    }

    // ---- maintenance ----------------------------------------------------

    /// Removes one neighbor flow; promotes a survivor to management duty
    /// or deletes the neighbor when none is left.
    pub(crate) async fn neighflow_remove(&mut self, neigh: &str, port: PortId) {
        let (timers, empty, was_mgmt) = {
            let Some(n) = self.neighbors.get_mut(neigh) else {
                return;
            };
            let Some(nf) = n.flows.remove(&port) else {
                return;
            };
            let was_mgmt = n.mgmt_port == Some(port);
            if was_mgmt {
                n.mgmt_port = n.flows.keys().next().copied();
            }
            (
                (nf.enroll_timer, nf.keepalive_timer),
                n.flows.is_empty(),
                was_mgmt,
            )
        };
        if let Some(id) = timers.0 {
            self.wheel.cancel(id);
        }
        if let Some(id) = timers.1 {
            self.wheel.cancel(id);
        }
        if was_mgmt {
            debug!(neigh = %neigh, "management flow changed");
        }

        let peer_addr = self.candidates.get(neigh).map(|c| c.address);
        if empty {
            info!(neigh = %neigh, "last flow gone, deleting neighbor");
            self.neighbors.remove(neigh);
            if let Some(peer_addr) = peer_addr {
                let my_addr = self.addr();
                self.lfdb_remove_edge(my_addr, peer_addr).await;
            }
        }
    }

    fn neighflow_state(&self, port: PortId) -> Option<(String, EnrollState)> {
        for (name, n) in &self.neighbors {
            if let Some(nf) = n.flows.get(&port) {
                return Some((name.clone(), nf.state));
            }
        }
        None
    }

    fn set_neighflow_state(&mut self, neigh: &str, port: PortId, state: EnrollState) {
        if let Some(nf) = self
            .neighbors
            .get_mut(neigh)
            .and_then(|n| n.flows.get_mut(&port))
        {
            nf.state = state;
        }
    }

    /// Adopts an address assigned by the peer, pushing it down into the
    /// kernel entity.
    async fn maybe_adopt_address(&mut self, address: Addr) {
        if address == 0 || self.addr() != 0 {
            return;
        }
        info!(address, "adopting assigned address");
        let event_id = self.event_id();
        let res = self
            .kernel_send(crate::msg::CtrlMsg::new(
                event_id,
                MsgBody::IpcpConfig {
                    ipcp_id: self.ipcp_id,
                    name: "address".to_string(),
                    value: address.to_string(),
                },
            ))
            .await;
        if let Err(e) = res {
            warn!(error = %e, "could not install assigned address");
        }
    }

    fn remember_peer(&mut self, neigh: &str, peer_address: Addr, lower_difs: Vec<String>) {
        if peer_address == 0 {
            return;
        }
        self.candidates.insert(
            neigh.to_string(),
            NeighborCandidate {
                name: neigh.to_string(),
                address: peer_address,
                lower_difs,
            },
        );
    }

    /// Picks a fresh address for a joining neighbor: one past everything
    /// this node has seen. Address 0 stays reserved.
    fn addr_allocate(&self) -> Addr {
        let mut max = self.addr().max(1);
        for c in self.candidates.values() {
            max = max.max(c.address);
        }
        for lf in self.lfdb.values() {
            max = max.max(lf.local_addr).max(lf.remote_addr);
        }
        max + 1
    }

    /// Shares newly learned candidates with all enrolled neighbors except
    /// the flow they came from.
    pub(crate) async fn candidates_propagate(
        &mut self,
        cands: Vec<NeighborCandidate>,
        exclude_port: Option<PortId>,
    ) {
        if cands.is_empty() {
            return;
        }
        let invoke_id = self.invoke_id();
        let msg = match CdapMessage::new(
            CdapOpCode::MCreate,
            obj_class::NEIGHBORS,
            obj_name::NEIGHBORS,
        )
        .with_invoke_id(invoke_id)
        .with_obj(&cands)
        {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "could not encode neighbor candidates");
                return;
            }
        };
        for port in self.enrolled_mgmt_ports(exclude_port) {
            if let Err(e) = self.mgmt_send_port(port, &msg) {
                debug!(port, error = %e, "candidate propagation failed");
            }
        }
    }

    /// Incoming candidate gossip.
    pub(crate) fn neighbors_rx(&mut self, msg: CdapMessage) -> Result<()> {
        let cands: Vec<NeighborCandidate> = msg.obj()?;
        for cand in cands {
            if cand.name == self.ipcp_name.to_string() {
                continue;
            }
            self.candidates.insert(cand.name.clone(), cand);
        }
        Ok(())
    }

    /// Initial database push toward a freshly enrolled neighbor: lower
    /// flows, directory entries and the candidate set.
    pub(crate) async fn rib_sync_to(&mut self, port: PortId) {
        self.lfdb_sync_port(port).await;
        self.dft_sync_port(port).await;

        let mut cands: Vec<NeighborCandidate> = self.candidates.values().cloned().collect();
        cands.push(NeighborCandidate {
            name: self.ipcp_name.to_string(),
            address: self.addr(),
            lower_difs: self.lower_difs.clone(),
        });
        let invoke_id = self.invoke_id();
        if let Ok(msg) = CdapMessage::new(
            CdapOpCode::MCreate,
            obj_class::NEIGHBORS,
            obj_name::NEIGHBORS,
        )
        .with_invoke_id(invoke_id)
        .with_obj(&cands)
        {
            let _ = self.mgmt_send_port(port, &msg);
        }
    }
}
