// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present rinode Contributors

//! User-space IPCP containers
//!
//! Every normal IPCP gets one [`Uipcp`]: a task owning the resource
//! information base and serializing all of its handlers. Inputs converge
//! on one event loop: commands from administrative callers, management
//! SDUs from the data plane, kernel notifications from the control
//! handle, timer expirations and the periodic aging/sync ticks.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::ctrl::CtrlHandle;
use crate::enroll::EnrollState;
use crate::error::{Error, Result};
use crate::ipcp::MgmtSdu;
use crate::lfdb::{AGE_INCR_INTERVAL, SYNC_INTERVAL};
use crate::msg::{CtrlMsg, MsgBody};
use crate::names::ApplName;
use crate::node::Node;
use crate::pci::Addr;
use crate::rib::{RibTimer, UipcpRib};
use crate::timer::TimerWheel;

/// Commands accepted by a running user-space IPCP.
enum UipcpCmd {
    Enroll {
        neigh: ApplName,
        supp_dif: String,
        resp: mpsc::Sender<Result<()>>,
    },
    LowerFlowAlloc {
        neigh: ApplName,
        supp_dif: String,
        resp: mpsc::Sender<Result<()>>,
    },
    RegisterLowerDif {
        dif: String,
        resp: mpsc::Sender<Result<()>>,
    },
    DftSet {
        appl: String,
        addr: Addr,
        resp: mpsc::Sender<Result<()>>,
    },
    RibShow {
        resp: mpsc::Sender<String>,
    },
}

/// Client handle to a user-space IPCP task.
#[derive(Clone)]
pub struct UipcpHandle {
    cmd_tx: mpsc::Sender<UipcpCmd>,
}

macro_rules! roundtrip {
    ($self:ident, $variant:ident { $($field:ident : $value:expr),* $(,)? }) => {{
        let (resp, mut rx) = mpsc::channel(1);
        $self
            .cmd_tx
            .send(UipcpCmd::$variant { $($field: $value,)* resp })
            .await
            .map_err(|_| Error::NotFound("uipcp is gone".to_string()))?;
        rx.recv()
            .await
            .ok_or_else(|| Error::NotFound("uipcp dropped the request".to_string()))
    }};
}

impl UipcpHandle {
    /// Enrolls with a neighbor over the supporting DIF; completes when
    /// the neighbor flow reaches `Enrolled` or the retries run out.
    pub async fn enroll(&self, neigh: &ApplName, supp_dif: &str) -> Result<()> {
        roundtrip!(self, Enroll {
            neigh: neigh.clone(),
            supp_dif: supp_dif.to_string(),
        })?
    }

    /// Allocates an additional N-1 flow toward an already known neighbor.
    pub async fn lower_flow_alloc(&self, neigh: &ApplName, supp_dif: &str) -> Result<()> {
        roundtrip!(self, LowerFlowAlloc {
            neigh: neigh.clone(),
            supp_dif: supp_dif.to_string(),
        })?
    }

    /// Registers this IPCP's name in a lower DIF so neighbors can
    /// allocate flows toward it.
    pub async fn register_lower_dif(&self, dif: &str) -> Result<()> {
        roundtrip!(self, RegisterLowerDif {
            dif: dif.to_string(),
        })?
    }

    /// Seeds or updates a directory mapping.
    pub async fn dft_set(&self, appl: &str, addr: Addr) -> Result<()> {
        roundtrip!(self, DftSet {
            appl: appl.to_string(),
            addr: addr,
        })?
    }

    /// Renders the RIB as JSON.
    pub async fn rib_show(&self) -> Result<String> {
        roundtrip!(self, RibShow {})
    }
}

/// Constructor namespace for user-space IPCPs.
pub struct Uipcp;

impl Uipcp {
    /// Binds a user-space controller to `ipcp_id` and spawns its event
    /// loop.
    pub async fn spawn(node: &Arc<Node>, ipcp_id: u16) -> Result<UipcpHandle> {
        let ipcp = node.ipcp_get(ipcp_id)?;
        let ipcp_name = ipcp.name.clone();
        let dif_name = ipcp.dif_name.clone();

        let ctrl = Arc::new(CtrlHandle::open(node));
        let bind = ctrl
            .write_msg(&CtrlMsg::new(1, MsgBody::IpcpUipcpSet { ipcp_id }))
            .await;
        if let Err(e) = bind {
            node.ipcp_put(&ipcp);
            return Err(e);
        }

        let (mgmt_tx, mgmt_rx) = mpsc::unbounded_channel::<MgmtSdu>();
        if let Err(e) = ipcp.ops.mgmt_sdu_bind(mgmt_tx) {
            node.ipcp_put(&ipcp);
            return Err(e);
        }
        node.ipcp_put(&ipcp);

        let (wheel, timer_rx) = TimerWheel::<RibTimer>::new();
        let rib = UipcpRib::new(
            node.clone(),
            ipcp_id,
            ipcp_name,
            dif_name,
            ctrl.clone(),
            wheel,
        );

        // Pump kernel notifications out of the control handle so the
        // event loop can select on a plain channel.
        let (kernel_tx, kernel_rx) = mpsc::unbounded_channel::<CtrlMsg>();
        tokio::spawn(async move {
            while let Some(msg) = ctrl.read_msg().await {
                if kernel_tx.send(msg).is_err() {
                    break;
                }
            }
        });

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        tokio::spawn(run(rib, cmd_rx, mgmt_rx, kernel_rx, timer_rx));
        info!(ipcp_id, "user-space IPCP started");
        Ok(UipcpHandle { cmd_tx })
    }
}

async fn run(
    mut rib: UipcpRib,
    mut cmd_rx: mpsc::Receiver<UipcpCmd>,
    mut mgmt_rx: mpsc::UnboundedReceiver<MgmtSdu>,
    mut kernel_rx: mpsc::UnboundedReceiver<CtrlMsg>,
    mut timer_rx: mpsc::UnboundedReceiver<RibTimer>,
) {
    let start = tokio::time::Instant::now();
    let mut age = tokio::time::interval_at(start + AGE_INCR_INTERVAL, AGE_INCR_INTERVAL);
    let mut sync = tokio::time::interval_at(start + SYNC_INTERVAL, SYNC_INTERVAL);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => handle_cmd(&mut rib, cmd).await,
                None => break,
            },
            Some(sdu) = mgmt_rx.recv() => {
                rib.mgmt_rx(sdu.local_port, sdu.src_addr, sdu.payload).await;
            }
            Some(msg) = kernel_rx.recv() => {
                handle_kernel(&mut rib, msg).await;
            }
            Some(timer) = timer_rx.recv() => {
                handle_timer(&mut rib, timer).await;
            }
            _ = age.tick() => {
                rib.lfdb_age_incr();
            }
            _ = sync.tick() => {
                rib.lfdb_sync().await;
            }
        }
    }
    debug!("user-space IPCP event loop finished");
}

async fn handle_cmd(rib: &mut UipcpRib, cmd: UipcpCmd) {
    match cmd {
        UipcpCmd::Enroll {
            neigh,
            supp_dif,
            resp,
        } => {
            rib.enroll_start(neigh, supp_dif, true, Some(resp)).await;
        }
        UipcpCmd::LowerFlowAlloc {
            neigh,
            supp_dif,
            resp,
        } => {
            rib.enroll_start(neigh, supp_dif, false, Some(resp)).await;
        }
        UipcpCmd::RegisterLowerDif { dif, resp } => {
            let event_id = rib.event_id();
            let res = rib
                .kernel_send(CtrlMsg::new(
                    event_id,
                    MsgBody::ApplRegister {
                        dif_name: dif.clone(),
                        reg: true,
                        appl_name: rib.ipcp_name.clone(),
                    },
                ))
                .await;
            if res.is_ok() && !rib.lower_difs.contains(&dif) {
                rib.lower_difs.push(dif);
            }
            let _ = resp.send(res).await;
        }
        UipcpCmd::DftSet { appl, addr, resp } => {
            rib.dft_set(&appl, addr, addr == rib.addr()).await;
            let _ = resp.send(Ok(())).await;
        }
        UipcpCmd::RibShow { resp } => {
            let _ = resp.send(rib.show()).await;
        }
    }
}

async fn handle_kernel(rib: &mut UipcpRib, msg: CtrlMsg) {
    let event_id = msg.event_id;
    match msg.body {
        // An application of ours asked for a flow.
        MsgBody::FaReq {
            local_port,
            local_cep,
            local_appl,
            remote_appl,
            flowspec,
            ..
        } => {
            rib.fa_req_rx(local_port, local_cep, local_appl, remote_appl, flowspec)
                .await;
        }
        // An application of ours answered a remote flow request.
        MsgBody::FaResp {
            kevent_id,
            port_id,
            response,
            cep_id,
            ..
        } => {
            rib.fa_resp_reflected(kevent_id, port_id, cep_id, response)
                .await;
        }
        // Outcome of one of our own lower-flow allocations.
        MsgBody::FaRespArrived { port_id, response } => {
            rib.lower_flow_completed(event_id, port_id, response).await;
        }
        // A neighbor allocates an N-1 flow toward us: accept it and bind
        // it under our data plane.
        MsgBody::FaReqArrived {
            kevent_id,
            port_id,
            remote_appl,
            ..
        } => {
            debug!(port = port_id, neigh = %remote_appl, "accepting lower flow");
            let ev = rib.event_id();
            let res = rib
                .kernel_send(CtrlMsg::new(
                    ev,
                    MsgBody::FaResp {
                        kevent_id,
                        upper_ipcp_id: rib.ipcp_id,
                        port_id,
                        response: 0,
                        cep_id: 0,
                    },
                ))
                .await;
            if let Err(e) = res {
                warn!(port = port_id, error = %e, "could not accept lower flow");
            }
        }
        // Registration policy: the kernel defers to us.
        MsgBody::ApplRegister {
            reg, appl_name, ..
        } => {
            let appl = appl_name.to_string();
            if reg {
                let addr = rib.addr();
                rib.dft_set(&appl, addr, true).await;
                // Complete the pending kernel-side registration.
                let ev = rib.event_id();
                let res = rib
                    .kernel_send(CtrlMsg::new(
                        ev,
                        MsgBody::ApplRegisterResp {
                            ipcp_id: rib.ipcp_id,
                            reg: true,
                            response: 0,
                            appl_name,
                        },
                    ))
                    .await;
                if let Err(e) = res {
                    warn!(appl = %appl, error = %e, "registration completion failed");
                }
            } else {
                // The kernel already dropped the entry; just retract the
                // directory mapping.
                rib.dft_remove(&appl).await;
            }
        }
        // Response to our own registration in a lower DIF.
        MsgBody::ApplRegisterResp {
            response,
            appl_name,
            ..
        } => {
            if response != 0 {
                warn!(appl = %appl_name, response, "lower DIF rejected our registration");
            }
        }
        MsgBody::FlowDeallocated {
            local_port,
            remote_port,
            remote_addr,
            ..
        } => {
            // A neighbor management flow dying takes the adjacency with
            // it; an application flow is announced to its peer.
            let neigh = rib
                .neighbors
                .iter()
                .find(|(_, n)| n.flows.contains_key(&local_port))
                .map(|(name, _)| name.clone());
            match neigh {
                Some(name) => rib.neighflow_remove(&name, local_port).await,
                None => {
                    rib.flow_deallocated_rx(local_port, remote_port, remote_addr)
                        .await;
                }
            }
        }
        other => {
            debug!(ty = ?other.msg_type(), "unhandled kernel notification");
        }
    }
}

async fn handle_timer(rib: &mut UipcpRib, timer: RibTimer) {
    match timer {
        RibTimer::Enroll { neigh, port } => {
            // Only a still-armed timer aborts; a completed step already
            // took the id out.
            let live = rib
                .neighbors
                .get_mut(&neigh)
                .and_then(|n| n.flows.get_mut(&port))
                .and_then(|nf| nf.enroll_timer.take())
                .is_some();
            if live {
                warn!(neigh = %neigh, port, "enrollment step timed out");
                rib.enroll_abort(&neigh, port).await;
            }
        }
        RibTimer::Keepalive { neigh, port } => {
            let enrolled = rib
                .neighbors
                .get(&neigh)
                .and_then(|n| n.flows.get(&port))
                .map(|nf| nf.state == EnrollState::Enrolled)
                .unwrap_or(false);
            if enrolled {
                rib.keepalive_fire(neigh, port).await;
            }
        }
    }
}
