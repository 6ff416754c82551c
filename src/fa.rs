// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present rinode Contributors

//! Flow allocation over the management plane
//!
//! The initiator's kernel reflects an application's flow request up to
//! its user-space IPCP, which resolves the destination application in
//! the directory and ships a `M_CREATE(flow)` to the IPCP serving it.
//! There the request goes down into the kernel, up to the target
//! application, and the verdict travels back as `M_CREATE_R(flow)`.
//! Deallocation is announced with `M_DELETE(flow)`.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cdap::{CdapMessage, CdapOpCode, obj_class, obj_name};
use crate::error::Result;
use crate::flowspec::{FlowConfig, FlowSpec};
use crate::msg::{CtrlMsg, MsgBody};
use crate::names::ApplName;
use crate::pci::{Addr, CepId, PortId};
use crate::rib::UipcpRib;

/// The object carried by flow-allocation CDAP messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRequest {
    pub src_appl: ApplName,
    pub dst_appl: ApplName,
    pub src_addr: Addr,
    pub dst_addr: Addr,
    pub src_port: PortId,
    pub dst_port: PortId,
    pub src_cep: CepId,
    pub dst_cep: CepId,
    pub flowcfg: FlowConfig,
    pub hop_cnt: u8,
    /// True on the side that initiated the allocation.
    pub initiator: bool,
}

/// The object carried by `M_DELETE(flow)`: the port id local to the
/// receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDeleteObj {
    pub local_port: PortId,
}

fn flow_obj_name(src_addr: Addr, src_port: PortId) -> String {
    format!("{}/{}-{}", obj_name::FLOWS, src_addr, src_port)
}

impl UipcpRib {
    /// An application on this node asked for a flow (the kernel
    /// reflected its `fa-req` to us).
    pub(crate) async fn fa_req_rx(
        &mut self,
        local_port: PortId,
        local_cep: CepId,
        local_appl: ApplName,
        remote_appl: ApplName,
        flowspec: FlowSpec,
    ) {
        let Some(dst_addr) = self.dft_lookup(&remote_appl.to_string()) else {
            info!(appl = %remote_appl, "no directory entry, rejecting flow request");
            self.fa_resp_down(local_port, 0, 0, 0, 1, FlowConfig::default())
                .await;
            return;
        };

        let freq = FlowRequest {
            src_appl: local_appl,
            dst_appl: remote_appl,
            src_addr: self.addr(),
            dst_addr,
            src_port: local_port,
            dst_port: 0,
            src_cep: local_cep,
            dst_cep: 0,
            flowcfg: FlowConfig::from_spec(&flowspec),
            hop_cnt: 0,
            initiator: true,
        };

        if dst_addr == self.addr() {
            // Both applications live on this IPCP: skip the CDAP leg and
            // go straight down to the kernel.
            let kevent_id = self.kevent_id();
            let down = CtrlMsg::new(
                self.event_id(),
                MsgBody::UipcpFaReqArrived {
                    ipcp_id: self.ipcp_id,
                    kevent_id,
                    remote_port: freq.src_port,
                    remote_cep: freq.src_cep,
                    remote_addr: freq.src_addr,
                    local_appl: freq.dst_appl.clone(),
                    remote_appl: freq.src_appl.clone(),
                    flowcfg: freq.flowcfg.clone(),
                },
            );
            match self.kernel_send(down).await {
                Ok(()) => {
                    let mut freq = freq;
                    freq.initiator = false;
                    self.flow_reqs_in.insert(kevent_id, freq);
                }
                Err(e) => {
                    info!(port = local_port, error = %e, "local flow request rejected");
                    self.fa_resp_down(local_port, 0, 0, 0, 1, FlowConfig::default())
                        .await;
                }
            }
            return;
        }

        let invoke_id = self.invoke_id();
        let msg = match CdapMessage::new(
            CdapOpCode::MCreate,
            obj_class::FLOW,
            &flow_obj_name(freq.src_addr, freq.src_port),
        )
        .with_invoke_id(invoke_id)
        .with_obj(&freq)
        {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "could not encode flow request");
                self.fa_resp_down(local_port, 0, 0, 0, 1, FlowConfig::default())
                    .await;
                return;
            }
        };

        if let Err(e) = self.send_to_dst_addr(dst_addr, &msg) {
            warn!(dst = dst_addr, error = %e, "flow request undeliverable");
            self.fa_resp_down(local_port, 0, 0, 0, 1, FlowConfig::default())
                .await;
            return;
        }
        debug!(port = local_port, dst = dst_addr, "flow request sent");
        self.flow_reqs_out.insert(local_port, freq);
    }

    /// Pushes a flow-allocation outcome into the kernel (initiator side).
    async fn fa_resp_down(
        &mut self,
        local_port: PortId,
        remote_port: PortId,
        remote_cep: CepId,
        remote_addr: Addr,
        response: u8,
        flowcfg: FlowConfig,
    ) {
        let event_id = self.event_id();
        let res = self
            .kernel_send(CtrlMsg::new(
                event_id,
                MsgBody::UipcpFaRespArrived {
                    ipcp_id: self.ipcp_id,
                    local_port,
                    remote_port,
                    remote_cep,
                    remote_addr,
                    response,
                    flowcfg,
                },
            ))
            .await;
        if let Err(e) = res {
            warn!(port = local_port, error = %e, "flow response rejected by kernel");
        }
    }

    /// `M_CREATE(flow)` from a remote initiator.
    pub(crate) async fn flow_create_rx(&mut self, msg: CdapMessage, src_addr: Addr) -> Result<()> {
        let freq: FlowRequest = msg.obj()?;
        let kevent_id = self.kevent_id();

        let down = CtrlMsg::new(
            self.event_id(),
            MsgBody::UipcpFaReqArrived {
                ipcp_id: self.ipcp_id,
                kevent_id,
                remote_port: freq.src_port,
                remote_cep: freq.src_cep,
                remote_addr: freq.src_addr,
                local_appl: freq.dst_appl.clone(),
                remote_appl: freq.src_appl.clone(),
                flowcfg: freq.flowcfg.clone(),
            },
        );

        match self.kernel_send(down).await {
            Ok(()) => {
                let mut freq = freq;
                freq.initiator = false;
                self.flow_reqs_in.insert(kevent_id, freq);
            }
            Err(e) => {
                // Nobody to serve the target application: answer now.
                info!(appl = %freq.dst_appl, error = %e, "rejecting remote flow request");
                let reply = msg.response(1, Some(e.to_string()))?.with_obj(&freq)?;
                let back = if src_addr != 0 { src_addr } else { freq.src_addr };
                self.send_to_dst_addr(back, &reply)?;
            }
        }
        Ok(())
    }

    /// The local application answered a remote flow request (the kernel
    /// reflected its `fa-resp`): complete the CDAP exchange.
    pub(crate) async fn fa_resp_reflected(
        &mut self,
        kevent_id: u32,
        port_id: PortId,
        cep_id: CepId,
        response: u8,
    ) {
        let Some(mut freq) = self.flow_reqs_in.remove(&kevent_id) else {
            debug!(kevent_id, "flow response without a pending request");
            return;
        };
        freq.dst_port = port_id;
        freq.dst_cep = cep_id;

        if freq.src_addr == self.addr() {
            // Local case: complete the initiator side directly.
            self.fa_resp_down(
                freq.src_port,
                freq.dst_port,
                freq.dst_cep,
                freq.dst_addr,
                response,
                freq.flowcfg.clone(),
            )
            .await;
            return;
        }

        let invoke_id = self.invoke_id();
        let reply = CdapMessage {
            op_code: CdapOpCode::MCreateR,
            invoke_id,
            obj_class: obj_class::FLOW.to_string(),
            obj_name: flow_obj_name(freq.src_addr, freq.src_port),
            result: response as i32,
            result_reason: None,
            obj_value: None,
            src_appl: None,
            dst_appl: None,
        };
        let reply = match reply.with_obj(&freq) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "could not encode flow response");
                return;
            }
        };
        if let Err(e) = self.send_to_dst_addr(freq.src_addr, &reply) {
            warn!(dst = freq.src_addr, error = %e, "flow response undeliverable");
        }
    }

    /// `M_CREATE_R(flow)` back at the initiator.
    pub(crate) async fn flow_create_resp_rx(
        &mut self,
        msg: CdapMessage,
        src_addr: Addr,
    ) -> Result<()> {
        let freq: FlowRequest = msg.obj()?;
        if self.flow_reqs_out.remove(&freq.src_port).is_none() {
            debug!(port = freq.src_port, "flow response for unknown request");
            return Ok(());
        }
        let remote_addr = if freq.dst_addr != 0 {
            freq.dst_addr
        } else {
            src_addr
        };
        self.fa_resp_down(
            freq.src_port,
            freq.dst_port,
            freq.dst_cep,
            remote_addr,
            if msg.is_success() { 0 } else { 1 },
            freq.flowcfg.clone(),
        )
        .await;
        Ok(())
    }

    /// The kernel told us one of our flows went away: tell the peer.
    pub(crate) async fn flow_deallocated_rx(
        &mut self,
        local_port: PortId,
        remote_port: PortId,
        remote_addr: Addr,
    ) {
        self.flow_reqs_out.remove(&local_port);
        if remote_addr == 0 || remote_port == 0 {
            return;
        }
        let invoke_id = self.invoke_id();
        let msg = match CdapMessage::new(CdapOpCode::MDelete, obj_class::FLOW, obj_name::FLOWS)
            .with_invoke_id(invoke_id)
            .with_obj(&FlowDeleteObj {
                local_port: remote_port,
            }) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "could not encode flow deletion");
                return;
            }
        };
        if let Err(e) = self.send_to_dst_addr(remote_addr, &msg) {
            debug!(dst = remote_addr, error = %e, "flow deletion undeliverable");
        }
    }

    /// `M_DELETE(flow)` from the peer: deallocate our end.
    pub(crate) async fn flow_delete_rx(&mut self, msg: CdapMessage) -> Result<()> {
        let obj: FlowDeleteObj = msg.obj()?;
        let event_id = self.event_id();
        let res = self
            .kernel_send(CtrlMsg::new(
                event_id,
                MsgBody::FlowDealloc {
                    ipcp_id: self.ipcp_id,
                    port_id: obj.local_port,
                },
            ))
            .await;
        match res {
            // The second deletion of a flow is expected when both ends
            // raced to announce it.
            Err(crate::error::Error::NotFound(_)) => Ok(()),
            other => other,
        }
    }
}
