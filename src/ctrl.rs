// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present rinode Contributors

//! Control handles and request dispatch
//!
//! A [`CtrlHandle`] is the per-client control endpoint: serialized
//! requests go down through [`CtrlHandle::write_bytes`], responses and
//! notifications come back up through the handle's upqueue. Dispatch
//! validates before mutating; an unknown or malformed message changes
//! nothing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};
use crate::flow::{Flow, FlowState, RxSdu, Upper};
use crate::msg::{CtrlMsg, IPCP_ID_NONE, MsgBody, MsgType, UpdateKind};
use crate::node::{Node, RegOutcome};
use crate::pci::PortId;
use crate::upqueue::Upqueue;

/// Handle flag: receive `ipcp-update` fan-outs.
pub const HANDLE_F_IPCP_UPDATES: u32 = 1 << 0;
/// Handle flag: allowed to issue privileged requests.
pub const HANDLE_F_PRIVILEGED: u32 = 1 << 1;

/// State shared between the handle object and the node registry.
pub struct CtrlHandleCore {
    pub id: u64,
    pub upqueue: Upqueue,
    flags: AtomicU32,
    /// In-progress `flow-fetch` snapshot; one entry pops per request.
    fetch_q: Mutex<Option<VecDeque<MsgBody>>>,
}

impl CtrlHandleCore {
    fn new(id: u64) -> Self {
        Self {
            id,
            upqueue: Upqueue::new(),
            flags: AtomicU32::new(HANDLE_F_PRIVILEGED),
            fetch_q: Mutex::new(None),
        }
    }

    pub fn wants_ipcp_updates(&self) -> bool {
        self.flags.load(Ordering::Acquire) & HANDLE_F_IPCP_UPDATES != 0
    }

    fn is_privileged(&self) -> bool {
        self.flags.load(Ordering::Acquire) & HANDLE_F_PRIVILEGED != 0
    }
}

/// One open control endpoint.
pub struct CtrlHandle {
    node: Arc<Node>,
    core: Arc<CtrlHandleCore>,
}

/// I/O binding to an allocated flow.
pub struct FlowHandle {
    node: Arc<Node>,
    flow: Arc<Flow>,
}

impl CtrlHandle {
    /// Opens a control handle on the node.
    pub fn open(node: &Arc<Node>) -> Self {
        let core = Arc::new(CtrlHandleCore::new(node.alloc_handle_id()));
        node.register_handle(core.clone());
        Self {
            node: node.clone(),
            core,
        }
    }

    pub fn id(&self) -> u64 {
        self.core.id
    }

    /// Drops the privileged flag; subsequent privileged requests fail.
    pub fn set_unprivileged(&self) {
        self.core
            .flags
            .fetch_and(!HANDLE_F_PRIVILEGED, Ordering::AcqRel);
    }

    /// Opts into `ipcp-update` fan-outs, with a retrospective `add` per
    /// IPCP that already exists.
    pub fn subscribe_ipcp_updates(&self) {
        self.core
            .flags
            .fetch_or(HANDLE_F_IPCP_UPDATES, Ordering::AcqRel);
        for info in self.node.ipcps_show() {
            let msg = CtrlMsg::notification(MsgBody::IpcpUpdate {
                kind: UpdateKind::Add,
                ipcp_id: info.id,
                ipcp_addr: info.addr,
                depth: info.depth,
                ipcp_name: info.name.parse().unwrap_or_default(),
                dif_type: info.dif_type,
                dif_name: info.dif_name,
            });
            let _ = self.core.upqueue.push(msg.serialize());
        }
    }

    /// Reads the next serialized message from the upqueue.
    pub async fn read_bytes(&self) -> Option<Vec<u8>> {
        self.core.upqueue.pop().await
    }

    pub fn try_read_bytes(&self) -> Option<Vec<u8>> {
        self.core.upqueue.try_pop()
    }

    /// Reads and parses the next upward message.
    pub async fn read_msg(&self) -> Option<CtrlMsg> {
        loop {
            let bytes = self.core.upqueue.pop().await?;
            match CtrlMsg::parse(&bytes) {
                Ok(msg) => return Some(msg),
                Err(e) => debug!(error = %e, "dropping unparseable upqueue record"),
            }
        }
    }

    pub fn try_read_msg(&self) -> Option<CtrlMsg> {
        let bytes = self.core.upqueue.try_pop()?;
        CtrlMsg::parse(&bytes).ok()
    }

    /// Submits one serialized request record.
    pub async fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        let msg = CtrlMsg::parse(bytes)?;
        self.dispatch(msg).await
    }

    /// Serializes and submits a request.
    pub async fn write_msg(&self, msg: &CtrlMsg) -> Result<()> {
        // Round-trip through the wire form so every caller exercises the
        // same boundary.
        self.write_bytes(&msg.serialize()).await
    }

    /// Binds an I/O handle to an allocated flow.
    pub fn open_flow(&self, port: PortId) -> Result<FlowHandle> {
        let flow = self.node.flow_get(port)?;
        if flow.state() != FlowState::Allocated {
            let state = flow.state();
            self.node.flow_put(&flow);
            return Err(Error::InvalidArgument(format!(
                "flow {} not allocated (state {:?})",
                port, state
            )));
        }
        self.node.flow_make_mortal(&flow);
        Ok(FlowHandle {
            node: self.node.clone(),
            flow,
        })
    }

    fn require_privilege(&self, ty: MsgType) -> Result<()> {
        if self.core.is_privileged() {
            return Ok(());
        }
        match ty {
            MsgType::IpcpCreate
            | MsgType::IpcpDestroy
            | MsgType::IpcpConfig
            | MsgType::IpcpPduftSet
            | MsgType::IpcpPduftFlush
            | MsgType::IpcpUipcpSet
            | MsgType::IpcpUipcpWait
            | MsgType::UipcpFaReqArrived
            | MsgType::UipcpFaRespArrived
            | MsgType::FlowDealloc
            | MsgType::FlowFetch
            | MsgType::FlowCfgUpdate => Err(Error::InvalidArgument(format!(
                "request {:?} requires a privileged handle",
                ty
            ))),
            _ => Ok(()),
        }
    }

    async fn dispatch(&self, msg: CtrlMsg) -> Result<()> {
        self.require_privilege(msg.body.msg_type())?;
        let event_id = msg.event_id;
        match msg.body {
            MsgBody::IpcpCreate {
                name,
                dif_type,
                dif_name,
            } => {
                let ipcp_id = self.node.ipcp_add(&name, &dif_type, &dif_name)?;
                self.push_own(CtrlMsg::new(event_id, MsgBody::IpcpCreateResp { ipcp_id }))
            }
            MsgBody::IpcpDestroy { ipcp_id } => self.node.ipcp_del(ipcp_id),
            MsgBody::IpcpConfig {
                ipcp_id,
                name,
                value,
            } => self.node.ipcp_config(ipcp_id, &name, &value),
            MsgBody::IpcpPduftSet {
                ipcp_id,
                dst_addr,
                local_port,
            } => self.pduft_set(ipcp_id, dst_addr, local_port),
            MsgBody::IpcpPduftFlush { ipcp_id } => {
                let ipcp = self.node.ipcp_get(ipcp_id)?;
                let _guard = ipcp.config_lock.lock().unwrap();
                let res = ipcp.ops.pduft_flush();
                drop(_guard);
                self.node.ipcp_put(&ipcp);
                res
            }
            MsgBody::IpcpUipcpSet { ipcp_id } => {
                let ipcp = self.node.ipcp_get(ipcp_id)?;
                let res = ipcp.uipcp_set(self.core.id);
                self.node.ipcp_put(&ipcp);
                res
            }
            MsgBody::IpcpUipcpWait { ipcp_id } => {
                let ipcp = self.node.ipcp_get(ipcp_id)?;
                ipcp.uipcp_wait().await;
                self.node.ipcp_put(&ipcp);
                Ok(())
            }
            MsgBody::ApplRegister {
                dif_name,
                reg,
                appl_name,
            } => self.appl_register(event_id, &dif_name, reg, &appl_name),
            MsgBody::ApplRegisterResp {
                ipcp_id,
                reg,
                response,
                appl_name,
            } => self.appl_register_resp(ipcp_id, reg, response, &appl_name),
            MsgBody::FaReq {
                dif_name,
                upper_ipcp_id,
                local_appl,
                remote_appl,
                flowspec,
                ..
            } => {
                self.fa_req(
                    event_id,
                    &dif_name,
                    upper_ipcp_id,
                    &local_appl,
                    &remote_appl,
                    flowspec,
                )
                .await
            }
            MsgBody::FaResp {
                kevent_id,
                upper_ipcp_id,
                port_id,
                response,
                ..
            } => self.fa_resp(kevent_id, upper_ipcp_id, port_id, response),
            MsgBody::UipcpFaReqArrived {
                ipcp_id,
                kevent_id,
                remote_port,
                remote_cep,
                remote_addr,
                local_appl,
                remote_appl,
                flowcfg,
            } => self.uipcp_fa_req_arrived(
                ipcp_id,
                kevent_id,
                remote_port,
                remote_cep,
                remote_addr,
                &local_appl,
                &remote_appl,
                flowcfg,
            ),
            MsgBody::UipcpFaRespArrived {
                ipcp_id: _,
                local_port,
                remote_port,
                remote_cep,
                remote_addr,
                response,
                flowcfg,
            } => self.uipcp_fa_resp_arrived(
                local_port,
                remote_port,
                remote_cep,
                remote_addr,
                response,
                flowcfg,
            ),
            MsgBody::FlowDealloc { ipcp_id: _, port_id } => self.node.flow_dealloc(port_id),
            MsgBody::FlowFetch => self.flow_fetch(event_id),
            MsgBody::FlowStatsReq { port_id } => {
                let stats = self.node.flow_stats(port_id)?;
                self.push_own(CtrlMsg::new(
                    event_id,
                    MsgBody::FlowStatsResp { port_id, stats },
                ))
            }
            MsgBody::FlowCfgUpdate {
                ipcp_id: _,
                port_id,
                flowcfg,
            } => {
                let flow = self.node.flow_get(port_id)?;
                let res = flow.ipcp.ops.flow_cfg_update(&flow, &flowcfg);
                self.node.flow_put(&flow);
                res
            }
            // Upward-only message types are not valid requests.
            MsgBody::IpcpCreateResp { .. }
            | MsgBody::IpcpUpdate { .. }
            | MsgBody::FaReqArrived { .. }
            | MsgBody::FaRespArrived { .. }
            | MsgBody::FlowDeallocated { .. }
            | MsgBody::FlowFetchResp { .. }
            | MsgBody::FlowStatsResp { .. } => Err(Error::InvalidArgument(
                "notification message type used as a request".to_string(),
            )),
        }
    }

    fn push_own(&self, msg: CtrlMsg) -> Result<()> {
        self.core.upqueue.push(msg.serialize())
    }

    fn pduft_set(&self, ipcp_id: u16, dst_addr: u64, local_port: PortId) -> Result<()> {
        if dst_addr == 0 {
            return Err(Error::InvalidArgument(
                "address 0 is not routable".to_string(),
            ));
        }
        let ipcp = self.node.ipcp_get(ipcp_id)?;
        let res = (|| {
            let flow = self.node.flow_get(local_port)?;
            // Only flows already bound to this IPCP may become exits;
            // anything else would leave a stale forwarding row.
            let res = if flow.upper().ipcp == Some(ipcp_id) {
                let _guard = ipcp.config_lock.lock().unwrap();
                ipcp.ops.pduft_set(dst_addr, &flow).map(|()| {
                    flow.pduft_link(dst_addr);
                })
            } else {
                Err(Error::InvalidArgument(format!(
                    "flow {} is not an N-1 flow of ipcp {}",
                    local_port, ipcp_id
                )))
            };
            self.node.flow_put(&flow);
            res
        })();
        self.node.ipcp_put(&ipcp);
        res
    }

    fn appl_register(
        &self,
        event_id: u32,
        dif_name: &str,
        reg: bool,
        appl_name: &crate::names::ApplName,
    ) -> Result<()> {
        let ipcp = self.node.ipcp_select_by_dif(if dif_name.is_empty() {
            None
        } else {
            Some(dif_name)
        })?;
        let res = if reg {
            match self.node.appl_add(&ipcp, appl_name, self.core.id, event_id) {
                Ok(RegOutcome::Pending) => Ok(()),
                Ok(_) => self.push_own(CtrlMsg::new(
                    event_id,
                    MsgBody::ApplRegisterResp {
                        ipcp_id: ipcp.id,
                        reg: true,
                        response: 0,
                        appl_name: appl_name.clone(),
                    },
                )),
                Err(e) => Err(e),
            }
        } else {
            self.node
                .appl_del(&ipcp, appl_name, self.core.id)
                .and_then(|()| {
                    self.push_own(CtrlMsg::new(
                        event_id,
                        MsgBody::ApplRegisterResp {
                            ipcp_id: ipcp.id,
                            reg: false,
                            response: 0,
                            appl_name: appl_name.clone(),
                        },
                    ))
                })
        };
        self.node.ipcp_put(&ipcp);
        res
    }

    /// A user-space IPCP resolved a pending registration.
    fn appl_register_resp(
        &self,
        ipcp_id: u16,
        reg: bool,
        response: u8,
        appl_name: &crate::names::ApplName,
    ) -> Result<()> {
        let ipcp = self.node.ipcp_get(ipcp_id)?;
        let res = self
            .node
            .appl_reg_complete(&ipcp, appl_name, response == 0)
            .and_then(|entry| {
                self.node.push_to_handle(
                    entry.handle_id,
                    &CtrlMsg::new(
                        entry.event_id,
                        MsgBody::ApplRegisterResp {
                            ipcp_id,
                            reg,
                            response,
                            appl_name: appl_name.clone(),
                        },
                    ),
                )
            });
        self.node.ipcp_put(&ipcp);
        res
    }

    async fn fa_req(
        &self,
        event_id: u32,
        dif_name: &str,
        upper_ipcp_id: u16,
        local_appl: &crate::names::ApplName,
        remote_appl: &crate::names::ApplName,
        flowspec: crate::flowspec::FlowSpec,
    ) -> Result<()> {
        let ipcp = self.node.ipcp_select_by_dif(if dif_name.is_empty() {
            None
        } else {
            Some(dif_name)
        })?;

        let mut allocated_port: PortId = 0;
        let result = (|| {
            let flow = self.node.flow_add(
                &ipcp,
                Upper::handle(self.core.id),
                event_id,
                local_appl,
                remote_appl,
                None,
            )?;
            allocated_port = flow.local_port;

            if upper_ipcp_id != IPCP_ID_NONE {
                if let Err(e) = self.node.upper_ipcp_flow_bind(upper_ipcp_id, &flow) {
                    self.node.flow_put(&flow);
                    return Err(e);
                }
            }

            if ipcp.ops.flow_allocator_in_kernel() {
                if let Err(e) = ipcp.ops.flow_allocate_req(&flow, &flowspec) {
                    self.node.flow_put(&flow);
                    return Err(e);
                }
                return Ok(flow.local_port);
            }

            match ipcp.uipcp_handle() {
                Some(uipcp) => {
                    let reflected = CtrlMsg::notification(MsgBody::FaReq {
                        dif_name: ipcp.dif_name.clone(),
                        upper_ipcp_id,
                        local_port: flow.local_port,
                        local_cep: flow.local_cep,
                        local_appl: local_appl.clone(),
                        remote_appl: remote_appl.clone(),
                        flowspec,
                    });
                    if let Err(e) = self.node.push_to_handle(uipcp, &reflected) {
                        self.node.flow_put(&flow);
                        return Err(e);
                    }
                    Ok(flow.local_port)
                }
                None => {
                    let port = flow.local_port;
                    self.node.flow_put(&flow);
                    Err(Error::Unreachable(format!(
                        "ipcp {} has no user-space controller (flow {} aborted)",
                        ipcp.id, port
                    )))
                }
            }
        })();

        self.node.ipcp_put(&ipcp);

        match result {
            Ok(port) => {
                debug!(port, "flow allocation requested");
                Ok(())
            }
            Err(e) => {
                // Deliver the negative outcome through the upqueue; the
                // port id is the real one when a flow got as far as being
                // allocated, so the requester can correlate.
                let _ = self.push_own(CtrlMsg::new(
                    event_id,
                    MsgBody::FaRespArrived {
                        port_id: allocated_port,
                        response: 1,
                    },
                ));
                Err(e)
            }
        }
    }

    fn fa_resp(
        &self,
        kevent_id: u32,
        upper_ipcp_id: u16,
        port_id: PortId,
        response: u8,
    ) -> Result<()> {
        let flow = self.node.flow_get(port_id)?;
        let res = (|| {
            if flow.state() != FlowState::Pending {
                return Err(Error::InvalidArgument(format!(
                    "flow {} is not pending",
                    port_id
                )));
            }
            if response == 0 {
                flow.mark_allocated()?;
                if upper_ipcp_id != IPCP_ID_NONE {
                    self.node.upper_ipcp_flow_bind(upper_ipcp_id, &flow)?;
                }
            }

            if flow.ipcp.ops.flow_allocator_in_kernel() {
                flow.ipcp.ops.flow_allocate_resp(&flow, response)
            } else {
                let uipcp = flow.ipcp.uipcp_handle().ok_or_else(|| {
                    Error::Unreachable(format!(
                        "ipcp {} has no user-space controller",
                        flow.ipcp.id
                    ))
                })?;
                self.node.push_to_handle(
                    uipcp,
                    &CtrlMsg::notification(MsgBody::FaResp {
                        kevent_id,
                        upper_ipcp_id,
                        port_id,
                        response,
                        cep_id: flow.local_cep,
                    }),
                )
            }
        })();

        if res.is_err() || response != 0 {
            self.node.flow_put(&flow);
        }
        self.node.flow_put(&flow);
        res
    }

    #[allow(clippy::too_many_arguments)]
    fn uipcp_fa_req_arrived(
        &self,
        ipcp_id: u16,
        kevent_id: u32,
        remote_port: PortId,
        remote_cep: u32,
        remote_addr: u64,
        local_appl: &crate::names::ApplName,
        remote_appl: &crate::names::ApplName,
        flowcfg: crate::flowspec::FlowConfig,
    ) -> Result<()> {
        let ipcp = self.node.ipcp_get(ipcp_id)?;
        let res = self.node.fa_req_arrived(
            &ipcp,
            kevent_id,
            remote_port,
            remote_cep,
            remote_addr,
            local_appl,
            remote_appl,
            Some(flowcfg),
        );
        self.node.ipcp_put(&ipcp);
        res.map(|_| ())
    }

    fn uipcp_fa_resp_arrived(
        &self,
        local_port: PortId,
        remote_port: PortId,
        remote_cep: u32,
        remote_addr: u64,
        response: u8,
        flowcfg: crate::flowspec::FlowConfig,
    ) -> Result<()> {
        self.node.fa_resp_arrived(
            local_port,
            remote_port,
            remote_cep,
            remote_addr,
            response,
            Some(flowcfg),
        )
    }

    fn flow_fetch(&self, event_id: u32) -> Result<()> {
        let mut fetch_q = self.core.fetch_q.lock().unwrap();
        let queue = fetch_q.get_or_insert_with(|| {
            let mut snapshot: VecDeque<MsgBody> = self.node.flows_snapshot().into();
            snapshot.push_back(MsgBody::FlowFetchResp {
                end: true,
                ipcp_id: 0,
                local_port: 0,
                remote_port: 0,
                local_cep: 0,
                remote_cep: 0,
                local_addr: 0,
                remote_addr: 0,
                state: 0,
            });
            snapshot
        });
        let Some(entry) = queue.pop_front() else {
            *fetch_q = None;
            return Err(Error::InvalidArgument("empty fetch snapshot".to_string()));
        };
        let ended = matches!(&entry, MsgBody::FlowFetchResp { end: true, .. });
        if ended {
            *fetch_q = None;
        }
        drop(fetch_q);
        self.push_own(CtrlMsg::new(event_id, entry))
    }
}

impl Drop for CtrlHandle {
    fn drop(&mut self) {
        self.core.upqueue.close();
        self.node.unregister_handle(self.core.id);
    }
}

impl FlowHandle {
    pub fn port(&self) -> PortId {
        self.flow.local_port
    }

    pub fn flow(&self) -> &Arc<Flow> {
        &self.flow
    }

    /// Writes one SDU, waiting out back-pressure and traffic shaping.
    pub async fn write(&self, sdu: &[u8]) -> Result<()> {
        let shaped = self.flow.cfg().dtcp.bandwidth > 0;
        loop {
            if self.flow.state() == FlowState::Deallocated {
                return Err(Error::NotFound(format!(
                    "flow {} is shut down",
                    self.flow.local_port
                )));
            }
            match self
                .flow
                .ipcp
                .ops
                .sdu_write(&self.flow, sdu.to_vec(), true)
            {
                Err(Error::WouldBlock) => {
                    let notified = self.flow.tx_event.notified();
                    if shaped {
                        // The bucket refills with wall time, not events.
                        let _ =
                            tokio::time::timeout(Duration::from_millis(TKBK_RETRY_MS), notified)
                                .await;
                    } else {
                        notified.await;
                    }
                }
                other => return other,
            }
        }
    }

    /// Non-blocking write attempt; surfaces `WouldBlock`.
    pub fn write_nonblock(&self, sdu: &[u8]) -> Result<()> {
        self.flow
            .ipcp
            .ops
            .sdu_write(&self.flow, sdu.to_vec(), false)
    }

    /// Reads one SDU; `None` is EOF after the flow shut down.
    pub async fn read(&self) -> Option<Vec<u8>> {
        let sdu: RxSdu = self.flow.rxq_pop().await?;
        if let Some(seqnum) = sdu.seqnum {
            self.flow.ipcp.ops.sdu_rx_consumed(&self.flow, seqnum);
        }
        Some(sdu.data)
    }

    /// Non-blocking read attempt.
    pub fn try_read(&self) -> Option<Vec<u8>> {
        let sdu = self.flow.rxq_try_pop()?;
        if let Some(seqnum) = sdu.seqnum {
            self.flow.ipcp.ops.sdu_rx_consumed(&self.flow, seqnum);
        }
        Some(sdu.data)
    }
}

/// Retry granularity for writers gated by the token bucket.
const TKBK_RETRY_MS: u64 = 2;

impl Drop for FlowHandle {
    fn drop(&mut self) {
        self.node.flow_put(&self.flow);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::CtrlMsg;
    use crate::names::ApplName;

    fn node() -> Arc<Node> {
        Node::with_builtin_factories()
    }

    async fn create_ipcp(ctrl: &CtrlHandle, name: &str, ty: &str, dif: &str) -> u16 {
        ctrl.write_msg(&CtrlMsg::new(
            7,
            MsgBody::IpcpCreate {
                name: name.parse().unwrap(),
                dif_type: ty.to_string(),
                dif_name: dif.to_string(),
            },
        ))
        .await
        .unwrap();
        match ctrl.read_msg().await.unwrap().body {
            MsgBody::IpcpCreateResp { ipcp_id } => ipcp_id,
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_config_destroy_cycle() {
        let node = node();
        let ctrl = CtrlHandle::open(&node);

        let id = create_ipcp(&ctrl, "n/1", "normal", "d0").await;
        ctrl.write_msg(&CtrlMsg::new(
            8,
            MsgBody::IpcpConfig {
                ipcp_id: id,
                name: "address".to_string(),
                value: "42".to_string(),
            },
        ))
        .await
        .unwrap();
        assert_eq!(node.ipcps_show()[0].addr, 42);

        ctrl.write_msg(&CtrlMsg::new(9, MsgBody::IpcpDestroy { ipcp_id: id }))
            .await
            .unwrap();
        assert!(node.ipcps_show().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_message_rejected_without_mutation() {
        let node = node();
        let ctrl = CtrlHandle::open(&node);
        // A valid prefix with a truncated body.
        let mut bytes = CtrlMsg::new(
            1,
            MsgBody::IpcpCreate {
                name: "x".parse().unwrap(),
                dif_type: "normal".to_string(),
                dif_name: "d".to_string(),
            },
        )
        .serialize();
        bytes.truncate(bytes.len() - 3);
        assert!(ctrl.write_bytes(&bytes).await.is_err());
        assert!(node.ipcps_show().is_empty());
    }

    #[tokio::test]
    async fn test_unprivileged_handle_gated() {
        let node = node();
        let ctrl = CtrlHandle::open(&node);
        ctrl.set_unprivileged();
        let res = ctrl
            .write_msg(&CtrlMsg::new(
                1,
                MsgBody::IpcpCreate {
                    name: "x".parse().unwrap(),
                    dif_type: "normal".to_string(),
                    dif_name: "d".to_string(),
                },
            ))
            .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_ipcp_update_subscription_retrospective() {
        let node = node();
        let admin = CtrlHandle::open(&node);
        create_ipcp(&admin, "a/1", "normal", "d0").await;

        let observer = CtrlHandle::open(&node);
        observer.subscribe_ipcp_updates();
        match observer.read_msg().await.unwrap().body {
            MsgBody::IpcpUpdate { kind, .. } => assert_eq!(kind, UpdateKind::Add),
            other => panic!("unexpected message {:?}", other),
        }

        // Subsequent creations fan out live.
        create_ipcp(&admin, "b/1", "normal", "d0").await;
        match observer.read_msg().await.unwrap().body {
            MsgBody::IpcpUpdate {
                kind, ipcp_name, ..
            } => {
                assert_eq!(kind, UpdateKind::Add);
                assert_eq!(ipcp_name, "b/1".parse::<ApplName>().unwrap());
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_flow_fetch_snapshot_protocol() {
        let node = node();
        let ctrl = CtrlHandle::open(&node);
        let id = create_ipcp(&ctrl, "n/1", "shim-loopback", "lo").await;
        let ipcp = node.ipcp_get(id).unwrap();
        let flow = node
            .flow_add(
                &ipcp,
                crate::flow::Upper::handle(ctrl.id()),
                0,
                &"a".parse().unwrap(),
                &"b".parse().unwrap(),
                None,
            )
            .unwrap();
        let port = flow.local_port;
        node.ipcp_put(&ipcp);

        // First fetch pops the one flow, second pops the sentinel.
        ctrl.write_msg(&CtrlMsg::new(1, MsgBody::FlowFetch))
            .await
            .unwrap();
        match ctrl.read_msg().await.unwrap().body {
            MsgBody::FlowFetchResp {
                end, local_port, ..
            } => {
                assert!(!end);
                assert_eq!(local_port, port);
            }
            other => panic!("unexpected {:?}", other),
        }
        ctrl.write_msg(&CtrlMsg::new(2, MsgBody::FlowFetch))
            .await
            .unwrap();
        match ctrl.read_msg().await.unwrap().body {
            MsgBody::FlowFetchResp { end, .. } => assert!(end),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_uipcp_wait_unblocks_on_set() {
        let node = node();
        let ctrl = CtrlHandle::open(&node);
        let id = create_ipcp(&ctrl, "n/1", "normal", "d0").await;

        let node2 = node.clone();
        let waiter = tokio::spawn(async move {
            let w = CtrlHandle::open(&node2);
            w.write_msg(&CtrlMsg::new(1, MsgBody::IpcpUipcpWait { ipcp_id: id }))
                .await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        ctrl.write_msg(&CtrlMsg::new(2, MsgBody::IpcpUipcpSet { ipcp_id: id }))
            .await
            .unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_uipcp_set_is_exclusive() {
        let node = node();
        let a = CtrlHandle::open(&node);
        let b = CtrlHandle::open(&node);
        let id = create_ipcp(&a, "n/1", "normal", "d0").await;

        a.write_msg(&CtrlMsg::new(1, MsgBody::IpcpUipcpSet { ipcp_id: id }))
            .await
            .unwrap();
        let res = b
            .write_msg(&CtrlMsg::new(2, MsgBody::IpcpUipcpSet { ipcp_id: id }))
            .await;
        assert!(matches!(res, Err(Error::Busy(_))));
    }
}
