// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present rinode Contributors

//! Resource information base of a user-space IPCP
//!
//! One [`UipcpRib`] holds everything a normal IPCP's controller knows:
//! its neighbors and their enrollment state, the candidate-neighbor set,
//! the directory forwarding table, the link-state lower-flow database and
//! the pending flow-allocation requests. A single event-loop task owns
//! the RIB, so every handler runs serialized; the enrollment, routing,
//! directory and flow-allocation handlers live in their own modules as
//! further `impl UipcpRib` blocks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cdap::{AData, CdapMessage, CdapOpCode, obj_class};
use crate::ctrl::CtrlHandle;
use crate::dft::DftEntry;
use crate::enroll::{EnrollState, Neighbor, NeighborCandidate};
use crate::error::{Error, Result};
use crate::fa::FlowRequest;
use crate::ipcp::MgmtMode;
use crate::lfdb::LowerFlow;
use crate::msg::CtrlMsg;
use crate::names::ApplName;
use crate::node::Node;
use crate::pci::{Addr, PortId};
use crate::timer::TimerWheel;

/// Timer payloads of the user-space event loop.
#[derive(Debug, Clone)]
pub(crate) enum RibTimer {
    Enroll { neigh: String, port: PortId },
    Keepalive { neigh: String, port: PortId },
}

/// A lower-flow allocation still waiting for its kernel response.
#[derive(Debug)]
pub(crate) struct PendingLowerFlow {
    pub neigh_name: ApplName,
    /// Start enrollment once the flow exists (as opposed to a bare
    /// lower-flow allocation).
    pub enroll: bool,
    pub waiter: Option<mpsc::Sender<Result<()>>>,
}

pub(crate) struct UipcpRib {
    pub(crate) node: Arc<Node>,
    pub(crate) ipcp_id: u16,
    pub(crate) ipcp_name: ApplName,
    pub(crate) dif_name: String,
    pub(crate) ctrl: Arc<CtrlHandle>,
    pub(crate) wheel: TimerWheel<RibTimer>,

    pub(crate) next_invoke_id: u32,
    pub(crate) next_kevent_id: u32,
    pub(crate) next_event_id: u32,

    /// Enrolled and enrolling neighbors, by name string.
    pub(crate) neighbors: HashMap<String, Neighbor>,
    /// Everything we know could be a neighbor, learned via enrollment
    /// and neighbor gossip.
    pub(crate) candidates: HashMap<String, NeighborCandidate>,
    /// Directory forwarding table: application name to address.
    pub(crate) dft: HashMap<String, DftEntry>,
    /// Link-state database of N-1 flows between DIF members.
    pub(crate) lfdb: HashMap<(Addr, Addr), LowerFlow>,

    /// Slave-side flow requests awaiting the local application, by
    /// kernel event id.
    pub(crate) flow_reqs_in: HashMap<u32, FlowRequest>,
    /// Initiator-side flow requests awaiting the remote `M_CREATE_R`,
    /// by local port id.
    pub(crate) flow_reqs_out: HashMap<PortId, FlowRequest>,

    /// Lower DIFs this IPCP registered its name in.
    pub(crate) lower_difs: Vec<String>,
    /// Lower-flow allocations in flight, by control event id.
    pub(crate) pending_lower_flows: HashMap<u32, PendingLowerFlow>,
}

/// JSON-facing snapshot of the RIB, for administrative consumers.
#[derive(Debug, Serialize)]
struct RibSnapshot {
    name: String,
    dif: String,
    address: Addr,
    lower_difs: Vec<String>,
    neighbors: Vec<NeighborSnapshot>,
    candidates: Vec<NeighborCandidate>,
    dft: Vec<DftEntry>,
    lower_flows: Vec<LowerFlow>,
}

#[derive(Debug, Serialize)]
struct NeighborSnapshot {
    name: String,
    initiator: bool,
    flows: Vec<(PortId, String)>,
    mgmt_port: Option<PortId>,
}

/// Milliseconds since the epoch, the timestamp base for directory
/// entries.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl UipcpRib {
    pub(crate) fn new(
        node: Arc<Node>,
        ipcp_id: u16,
        ipcp_name: ApplName,
        dif_name: String,
        ctrl: Arc<CtrlHandle>,
        wheel: TimerWheel<RibTimer>,
    ) -> Self {
        Self {
            node,
            ipcp_id,
            ipcp_name,
            dif_name,
            ctrl,
            wheel,
            next_invoke_id: 1,
            next_kevent_id: 1,
            next_event_id: 1,
            neighbors: HashMap::new(),
            candidates: HashMap::new(),
            dft: HashMap::new(),
            lfdb: HashMap::new(),
            flow_reqs_in: HashMap::new(),
            flow_reqs_out: HashMap::new(),
            lower_difs: Vec::new(),
            pending_lower_flows: HashMap::new(),
        }
    }

    pub(crate) fn addr(&self) -> Addr {
        self.node
            .ipcp_find(self.ipcp_id)
            .map(|i| i.addr())
            .unwrap_or(0)
    }

    pub(crate) fn invoke_id(&mut self) -> u32 {
        let id = self.next_invoke_id;
        self.next_invoke_id += 1;
        id
    }

    pub(crate) fn kevent_id(&mut self) -> u32 {
        let id = self.next_kevent_id;
        self.next_kevent_id += 1;
        id
    }

    pub(crate) fn event_id(&mut self) -> u32 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        id
    }

    /// Sends a control request into the kernel substrate.
    pub(crate) async fn kernel_send(&self, msg: CtrlMsg) -> Result<()> {
        self.ctrl.write_msg(&msg).await
    }

    /// Writes a CDAP message on a specific management flow.
    pub(crate) fn mgmt_send_port(&self, port: PortId, msg: &CdapMessage) -> Result<()> {
        let bytes = msg.serialize()?;
        let ipcp = self
            .node
            .ipcp_find(self.ipcp_id)
            .ok_or_else(|| Error::NotFound(format!("ipcp {}", self.ipcp_id)))?;
        ipcp.ops.mgmt_sdu_write(MgmtMode::Port(port), bytes)
    }

    /// Delivers a CDAP message to the IPCP with the given address, using
    /// the direct management flow when the destination is an adjacent
    /// neighbor and an `a_data` envelope through the forwarding table
    /// otherwise.
    pub(crate) fn send_to_dst_addr(&self, dst_addr: Addr, msg: &CdapMessage) -> Result<()> {
        if dst_addr == self.addr() {
            return Err(Error::InvalidArgument(
                "message addressed to self".to_string(),
            ));
        }
        let direct = self
            .neighbors
            .values()
            .find(|n| {
                n.mgmt_port.is_some()
                    && self
                        .candidates
                        .get(&n.name)
                        .is_some_and(|c| c.address == dst_addr)
            })
            .and_then(|n| n.mgmt_port);
        match direct {
            Some(port) => self.mgmt_send_port(port, msg),
            None => {
                let wrapped = AData::wrap(self.addr(), dst_addr, msg)?;
                let bytes = wrapped.serialize()?;
                let ipcp = self
                    .node
                    .ipcp_find(self.ipcp_id)
                    .ok_or_else(|| Error::NotFound(format!("ipcp {}", self.ipcp_id)))?;
                ipcp.ops.mgmt_sdu_write(MgmtMode::Addr(dst_addr), bytes)
            }
        }
    }

    /// Dispatches one management SDU from the data plane.
    pub(crate) async fn mgmt_rx(&mut self, port: PortId, src_addr: Addr, payload: Vec<u8>) {
        let msg = match CdapMessage::parse(&payload) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(port, error = %e, "undecodable management SDU");
                return;
            }
        };

        // Address-routed envelope: ours to open, or to relay onward.
        if let Some(env) = AData::unwrap(&msg) {
            let env = match env {
                Ok(env) => env,
                Err(e) => {
                    debug!(error = %e, "broken a_data envelope");
                    return;
                }
            };
            if env.dst_addr != self.addr() {
                if let Some(ipcp) = self.node.ipcp_find(self.ipcp_id) {
                    if let Ok(bytes) = msg.serialize() {
                        let _ = ipcp.ops.mgmt_sdu_write(MgmtMode::Addr(env.dst_addr), bytes);
                    }
                }
                return;
            }
            match env.inner() {
                Ok(inner) => self.cdap_dispatch(inner, 0, env.src_addr).await,
                Err(e) => debug!(error = %e, "broken a_data payload"),
            }
            return;
        }

        self.cdap_dispatch(msg, port, src_addr).await;
    }

    /// Routes a CDAP message to the subsystem that owns its object.
    pub(crate) async fn cdap_dispatch(&mut self, msg: CdapMessage, port: PortId, src_addr: Addr) {
        use CdapOpCode::*;
        let class = msg.obj_class.clone();
        let res = match (msg.op_code, class.as_str()) {
            (MConnect | MConnectR | MStart | MStartR | MStop | MStopR | MRelease, _)
                if self.is_enrollment_traffic(&msg, port) =>
            {
                self.enroll_rx(msg, port).await
            }
            (MRead, obj_class::KEEPALIVE) => self.keepalive_rx(msg, port),
            (MReadR, obj_class::KEEPALIVE) => self.keepalive_resp_rx(port),
            (MCreate, obj_class::DFT) => self.dft_create_rx(msg, port).await,
            (MDelete, obj_class::DFT) => self.dft_delete_rx(msg, port).await,
            (MCreate, obj_class::LFDB) => self.lfdb_create_rx(msg, port).await,
            (MCreate, obj_class::NEIGHBORS) => self.neighbors_rx(msg),
            (MCreate, obj_class::FLOW) => self.flow_create_rx(msg, src_addr).await,
            (MCreateR, obj_class::FLOW) => self.flow_create_resp_rx(msg, src_addr).await,
            (MDelete, obj_class::FLOW) => self.flow_delete_rx(msg).await,
            (MStart, obj_class::STATUS) => Ok(()),
            _ => {
                debug!(op = %msg.op_code, class = %msg.obj_class, "unhandled CDAP message");
                Ok(())
            }
        };
        if let Err(e) = res {
            warn!(error = %e, "CDAP handler failed");
        }
    }

    /// Whether a message belongs to the enrollment state machine rather
    /// than the post-enrollment RIB handlers.
    fn is_enrollment_traffic(&self, msg: &CdapMessage, port: PortId) -> bool {
        if matches!(msg.op_code, CdapOpCode::MConnect | CdapOpCode::MConnectR) {
            return true;
        }
        if msg.obj_class == obj_class::ENROLLMENT || msg.obj_class == obj_class::STATUS {
            // operational_status M_START from an enrolled peer is plain
            // RIB traffic; during the handshake it closes the FSM.
            if msg.obj_class == obj_class::STATUS {
                return self
                    .neighflow_by_port(port)
                    .is_some_and(|(_, state)| state != EnrollState::Enrolled);
            }
            return true;
        }
        matches!(msg.op_code, CdapOpCode::MRelease)
    }

    fn neighflow_by_port(&self, port: PortId) -> Option<(String, EnrollState)> {
        for (name, neigh) in &self.neighbors {
            if let Some(nf) = neigh.flows.get(&port) {
                return Some((name.clone(), nf.state));
            }
        }
        None
    }

    /// Ports of the management flows of all enrolled neighbors, except
    /// an optional excluded one.
    pub(crate) fn enrolled_mgmt_ports(&self, exclude_port: Option<PortId>) -> Vec<PortId> {
        self.neighbors
            .values()
            .filter_map(|n| {
                let port = n.mgmt_port?;
                let nf = n.flows.get(&port)?;
                if nf.state == EnrollState::Enrolled && Some(port) != exclude_port {
                    Some(port)
                } else {
                    None
                }
            })
            .collect()
    }

    /// Renders the RIB as JSON.
    pub(crate) fn show(&self) -> String {
        let snapshot = RibSnapshot {
            name: self.ipcp_name.to_string(),
            dif: self.dif_name.clone(),
            address: self.addr(),
            lower_difs: self.lower_difs.clone(),
            neighbors: self
                .neighbors
                .values()
                .map(|n| NeighborSnapshot {
                    name: n.name.clone(),
                    initiator: n.initiator,
                    flows: n
                        .flows
                        .values()
                        .map(|f| (f.port, format!("{:?}", f.state)))
                        .collect(),
                    mgmt_port: n.mgmt_port,
                })
                .collect(),
            candidates: self.candidates.values().cloned().collect(),
            dft: self.dft.values().cloned().collect(),
            lower_flows: self.lfdb.values().cloned().collect(),
        };
        serde_json::to_string_pretty(&snapshot).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
    }
}
