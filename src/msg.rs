// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present rinode Contributors

//! Serialized control-plane protocol
//!
//! Every request and notification crossing the control boundary is a
//! length-delimited record: a fixed `(msg_type: u16, event_id: u32)` prefix
//! followed by the message body. Scalars are little endian, application
//! names are four length-prefixed strings, free-form strings are
//! length-prefixed UTF-8. Serialization round-trips byte-identically.

use crate::error::{Error, Result};
use crate::flowspec::{FlowConfig, FlowSpec, FlowStats};
use crate::names::ApplName;
use crate::pci::{Addr, CepId, PortId};
use crate::wire::{WireReader, WireWriter};

/// Sentinel for "no upper IPCP" in flow-allocation messages.
pub const IPCP_ID_NONE: u16 = u16::MAX;

/// Message type identifiers. Stable wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MsgType {
    IpcpCreate = 1,
    IpcpCreateResp = 2,
    IpcpDestroy = 3,
    IpcpConfig = 4,
    IpcpPduftSet = 5,
    IpcpPduftFlush = 6,
    IpcpUipcpSet = 7,
    IpcpUipcpWait = 8,
    IpcpUpdate = 9,
    ApplRegister = 10,
    ApplRegisterResp = 11,
    FaReq = 12,
    FaResp = 13,
    FaReqArrived = 14,
    FaRespArrived = 15,
    UipcpFaReqArrived = 16,
    UipcpFaRespArrived = 17,
    FlowDealloc = 18,
    FlowDeallocated = 19,
    FlowFetch = 20,
    FlowFetchResp = 21,
    FlowStatsReq = 22,
    FlowStatsResp = 23,
    FlowCfgUpdate = 24,
}

impl TryFrom<u16> for MsgType {
    type Error = Error;

    fn try_from(v: u16) -> Result<Self> {
        use MsgType::*;
        Ok(match v {
            1 => IpcpCreate,
            2 => IpcpCreateResp,
            3 => IpcpDestroy,
            4 => IpcpConfig,
            5 => IpcpPduftSet,
            6 => IpcpPduftFlush,
            7 => IpcpUipcpSet,
            8 => IpcpUipcpWait,
            9 => IpcpUpdate,
            10 => ApplRegister,
            11 => ApplRegisterResp,
            12 => FaReq,
            13 => FaResp,
            14 => FaReqArrived,
            15 => FaRespArrived,
            16 => UipcpFaReqArrived,
            17 => UipcpFaRespArrived,
            18 => FlowDealloc,
            19 => FlowDeallocated,
            20 => FlowFetch,
            21 => FlowFetchResp,
            22 => FlowStatsReq,
            23 => FlowStatsResp,
            24 => FlowCfgUpdate,
            other => {
                return Err(Error::InvalidArgument(format!(
                    "unknown control message type {}",
                    other
                )));
            }
        })
    }
}

/// Kind carried inside an `IpcpUpdate` notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UpdateKind {
    Add = 1,
    Del = 2,
    Upd = 3,
}

impl TryFrom<u8> for UpdateKind {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            1 => Ok(UpdateKind::Add),
            2 => Ok(UpdateKind::Del),
            3 => Ok(UpdateKind::Upd),
            other => Err(Error::InvalidArgument(format!(
                "unknown ipcp-update kind {}",
                other
            ))),
        }
    }
}

/// Body of a control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsgBody {
    IpcpCreate {
        name: ApplName,
        dif_type: String,
        dif_name: String,
    },
    IpcpCreateResp {
        ipcp_id: u16,
    },
    IpcpDestroy {
        ipcp_id: u16,
    },
    IpcpConfig {
        ipcp_id: u16,
        name: String,
        value: String,
    },
    IpcpPduftSet {
        ipcp_id: u16,
        dst_addr: Addr,
        local_port: PortId,
    },
    IpcpPduftFlush {
        ipcp_id: u16,
    },
    IpcpUipcpSet {
        ipcp_id: u16,
    },
    IpcpUipcpWait {
        ipcp_id: u16,
    },
    IpcpUpdate {
        kind: UpdateKind,
        ipcp_id: u16,
        ipcp_addr: Addr,
        depth: u8,
        ipcp_name: ApplName,
        dif_type: String,
        dif_name: String,
    },
    ApplRegister {
        /// Empty string selects the default DIF.
        dif_name: String,
        reg: bool,
        appl_name: ApplName,
    },
    ApplRegisterResp {
        ipcp_id: u16,
        reg: bool,
        response: u8,
        appl_name: ApplName,
    },
    FaReq {
        dif_name: String,
        upper_ipcp_id: u16,
        /// Filled in by the registry when the request is reflected upward.
        local_port: PortId,
        local_cep: CepId,
        local_appl: ApplName,
        remote_appl: ApplName,
        flowspec: FlowSpec,
    },
    FaResp {
        kevent_id: u32,
        upper_ipcp_id: u16,
        port_id: PortId,
        response: u8,
        /// Filled in by the registry when the response is reflected upward.
        cep_id: CepId,
    },
    FaReqArrived {
        kevent_id: u32,
        ipcp_id: u16,
        port_id: PortId,
        dif_name: String,
        local_appl: ApplName,
        remote_appl: ApplName,
    },
    FaRespArrived {
        port_id: PortId,
        response: u8,
    },
    UipcpFaReqArrived {
        ipcp_id: u16,
        kevent_id: u32,
        remote_port: PortId,
        remote_cep: CepId,
        remote_addr: Addr,
        local_appl: ApplName,
        remote_appl: ApplName,
        flowcfg: FlowConfig,
    },
    UipcpFaRespArrived {
        ipcp_id: u16,
        local_port: PortId,
        remote_port: PortId,
        remote_cep: CepId,
        remote_addr: Addr,
        response: u8,
        flowcfg: FlowConfig,
    },
    FlowDealloc {
        ipcp_id: u16,
        port_id: PortId,
    },
    FlowDeallocated {
        ipcp_id: u16,
        local_port: PortId,
        remote_port: PortId,
        remote_addr: Addr,
    },
    FlowFetch,
    FlowFetchResp {
        end: bool,
        ipcp_id: u16,
        local_port: PortId,
        remote_port: PortId,
        local_cep: CepId,
        remote_cep: CepId,
        local_addr: Addr,
        remote_addr: Addr,
        state: u8,
    },
    FlowStatsReq {
        port_id: PortId,
    },
    FlowStatsResp {
        port_id: PortId,
        stats: FlowStats,
    },
    FlowCfgUpdate {
        ipcp_id: u16,
        port_id: PortId,
        flowcfg: FlowConfig,
    },
}

impl MsgBody {
    pub fn msg_type(&self) -> MsgType {
        use MsgBody::*;
        match self {
            IpcpCreate { .. } => MsgType::IpcpCreate,
            IpcpCreateResp { .. } => MsgType::IpcpCreateResp,
            IpcpDestroy { .. } => MsgType::IpcpDestroy,
            IpcpConfig { .. } => MsgType::IpcpConfig,
            IpcpPduftSet { .. } => MsgType::IpcpPduftSet,
            IpcpPduftFlush { .. } => MsgType::IpcpPduftFlush,
            IpcpUipcpSet { .. } => MsgType::IpcpUipcpSet,
            IpcpUipcpWait { .. } => MsgType::IpcpUipcpWait,
            IpcpUpdate { .. } => MsgType::IpcpUpdate,
            ApplRegister { .. } => MsgType::ApplRegister,
            ApplRegisterResp { .. } => MsgType::ApplRegisterResp,
            FaReq { .. } => MsgType::FaReq,
            FaResp { .. } => MsgType::FaResp,
            FaReqArrived { .. } => MsgType::FaReqArrived,
            FaRespArrived { .. } => MsgType::FaRespArrived,
            UipcpFaReqArrived { .. } => MsgType::UipcpFaReqArrived,
            UipcpFaRespArrived { .. } => MsgType::UipcpFaRespArrived,
            FlowDealloc { .. } => MsgType::FlowDealloc,
            FlowDeallocated { .. } => MsgType::FlowDeallocated,
            FlowFetch => MsgType::FlowFetch,
            FlowFetchResp { .. } => MsgType::FlowFetchResp,
            FlowStatsReq { .. } => MsgType::FlowStatsReq,
            FlowStatsResp { .. } => MsgType::FlowStatsResp,
            FlowCfgUpdate { .. } => MsgType::FlowCfgUpdate,
        }
    }
}

/// A control message: routing prefix plus body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtrlMsg {
    /// Correlates responses with requests; 0 for unsolicited notifications.
    pub event_id: u32,
    pub body: MsgBody,
}

impl CtrlMsg {
    pub fn new(event_id: u32, body: MsgBody) -> Self {
        Self { event_id, body }
    }

    pub fn notification(body: MsgBody) -> Self {
        Self { event_id: 0, body }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u16(self.body.msg_type() as u16);
        w.put_u32(self.event_id);
        encode_body(&mut w, &self.body);
        w.into_vec()
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(buf);
        let ty = MsgType::try_from(r.get_u16()?)?;
        let event_id = r.get_u32()?;
        let body = decode_body(ty, &mut r)?;
        if r.remaining() != 0 {
            return Err(Error::InvalidArgument(format!(
                "{} trailing bytes after control message",
                r.remaining()
            )));
        }
        Ok(Self { event_id, body })
    }
}

fn put_name(w: &mut WireWriter, name: &ApplName) {
    for c in name.components() {
        w.put_str(c);
    }
}

fn get_name(r: &mut WireReader<'_>) -> Result<ApplName> {
    Ok(ApplName {
        apn: r.get_str()?,
        api: r.get_str()?,
        aen: r.get_str()?,
        aei: r.get_str()?,
    })
}

fn put_flowspec(w: &mut WireWriter, s: &FlowSpec) {
    w.put_u64(s.max_sdu_gap);
    w.put_u8(s.in_order_delivery as u8);
    w.put_u64(s.avg_bandwidth);
    w.put_u8(s.flow_control as u8);
    w.put_u32(s.max_delay);
    w.put_u32(s.max_jitter);
}

fn get_flowspec(r: &mut WireReader<'_>) -> Result<FlowSpec> {
    Ok(FlowSpec {
        max_sdu_gap: r.get_u64()?,
        in_order_delivery: r.get_u8()? != 0,
        avg_bandwidth: r.get_u64()?,
        flow_control: r.get_u8()? != 0,
        max_delay: r.get_u32()?,
        max_jitter: r.get_u32()?,
    })
}

fn put_flowcfg(w: &mut WireWriter, c: &FlowConfig) {
    w.put_u64(c.max_sdu_gap);
    w.put_u8(c.in_order_delivery as u8);
    w.put_u8(c.msg_boundaries as u8);
    w.put_u8(c.dtcp_present as u8);
    w.put_u8(c.dtcp.flow_control as u8);
    w.put_u8(c.dtcp.rtx_control as u8);
    w.put_u32(c.dtcp.initial_a);
    w.put_u64(c.dtcp.bandwidth);
    w.put_u32(c.dtcp.win.max_cwq_len);
    w.put_u64(c.dtcp.win.initial_credit);
    w.put_u32(c.dtcp.rtx.max_time_to_retry);
    w.put_u32(c.dtcp.rtx.data_rxms_max);
    w.put_u32(c.dtcp.rtx.initial_tr);
}

fn get_flowcfg(r: &mut WireReader<'_>) -> Result<FlowConfig> {
    let mut cfg = FlowConfig {
        max_sdu_gap: r.get_u64()?,
        in_order_delivery: r.get_u8()? != 0,
        msg_boundaries: r.get_u8()? != 0,
        dtcp_present: r.get_u8()? != 0,
        ..Default::default()
    };
    cfg.dtcp.flow_control = r.get_u8()? != 0;
    cfg.dtcp.rtx_control = r.get_u8()? != 0;
    cfg.dtcp.initial_a = r.get_u32()?;
    cfg.dtcp.bandwidth = r.get_u64()?;
    cfg.dtcp.win.max_cwq_len = r.get_u32()?;
    cfg.dtcp.win.initial_credit = r.get_u64()?;
    cfg.dtcp.rtx.max_time_to_retry = r.get_u32()?;
    cfg.dtcp.rtx.data_rxms_max = r.get_u32()?;
    cfg.dtcp.rtx.initial_tr = r.get_u32()?;
    Ok(cfg)
}

fn put_stats(w: &mut WireWriter, s: &FlowStats) {
    w.put_u64(s.tx_pdu);
    w.put_u64(s.tx_byte);
    w.put_u64(s.tx_err);
    w.put_u64(s.rx_pdu);
    w.put_u64(s.rx_byte);
    w.put_u64(s.rx_err);
}

fn get_stats(r: &mut WireReader<'_>) -> Result<FlowStats> {
    Ok(FlowStats {
        tx_pdu: r.get_u64()?,
        tx_byte: r.get_u64()?,
        tx_err: r.get_u64()?,
        rx_pdu: r.get_u64()?,
        rx_byte: r.get_u64()?,
        rx_err: r.get_u64()?,
    })
}

fn encode_body(w: &mut WireWriter, body: &MsgBody) {
    use MsgBody::*;
    match body {
        IpcpCreate {
            name,
            dif_type,
            dif_name,
        } => {
            put_name(w, name);
            w.put_str(dif_type);
            w.put_str(dif_name);
        }
        IpcpCreateResp { ipcp_id } => {
            w.put_u16(*ipcp_id);
        }
        IpcpDestroy { ipcp_id } => {
            w.put_u16(*ipcp_id);
        }
        IpcpConfig {
            ipcp_id,
            name,
            value,
        } => {
            w.put_u16(*ipcp_id);
            w.put_str(name);
            w.put_str(value);
        }
        IpcpPduftSet {
            ipcp_id,
            dst_addr,
            local_port,
        } => {
            w.put_u16(*ipcp_id);
            w.put_u64(*dst_addr);
            w.put_u16(*local_port);
        }
        IpcpPduftFlush { ipcp_id }
        | IpcpUipcpSet { ipcp_id }
        | IpcpUipcpWait { ipcp_id } => {
            w.put_u16(*ipcp_id);
        }
        IpcpUpdate {
            kind,
            ipcp_id,
            ipcp_addr,
            depth,
            ipcp_name,
            dif_type,
            dif_name,
        } => {
            w.put_u8(*kind as u8);
            w.put_u16(*ipcp_id);
            w.put_u64(*ipcp_addr);
            w.put_u8(*depth);
            put_name(w, ipcp_name);
            w.put_str(dif_type);
            w.put_str(dif_name);
        }
        ApplRegister {
            dif_name,
            reg,
            appl_name,
        } => {
            w.put_str(dif_name);
            w.put_u8(*reg as u8);
            put_name(w, appl_name);
        }
        ApplRegisterResp {
            ipcp_id,
            reg,
            response,
            appl_name,
        } => {
            w.put_u16(*ipcp_id);
            w.put_u8(*reg as u8);
            w.put_u8(*response);
            put_name(w, appl_name);
        }
        FaReq {
            dif_name,
            upper_ipcp_id,
            local_port,
            local_cep,
            local_appl,
            remote_appl,
            flowspec,
        } => {
            w.put_str(dif_name);
            w.put_u16(*upper_ipcp_id);
            w.put_u16(*local_port);
            w.put_u32(*local_cep);
            put_name(w, local_appl);
            put_name(w, remote_appl);
            put_flowspec(w, flowspec);
        }
        FaResp {
            kevent_id,
            upper_ipcp_id,
            port_id,
            response,
            cep_id,
        } => {
            w.put_u32(*kevent_id);
            w.put_u16(*upper_ipcp_id);
            w.put_u16(*port_id);
            w.put_u8(*response);
            w.put_u32(*cep_id);
        }
        FaReqArrived {
            kevent_id,
            ipcp_id,
            port_id,
            dif_name,
            local_appl,
            remote_appl,
        } => {
            w.put_u32(*kevent_id);
            w.put_u16(*ipcp_id);
            w.put_u16(*port_id);
            w.put_str(dif_name);
            put_name(w, local_appl);
            put_name(w, remote_appl);
        }
        FaRespArrived { port_id, response } => {
            w.put_u16(*port_id);
            w.put_u8(*response);
        }
        UipcpFaReqArrived {
            ipcp_id,
            kevent_id,
            remote_port,
            remote_cep,
            remote_addr,
            local_appl,
            remote_appl,
            flowcfg,
        } => {
            w.put_u16(*ipcp_id);
            w.put_u32(*kevent_id);
            w.put_u16(*remote_port);
            w.put_u32(*remote_cep);
            w.put_u64(*remote_addr);
            put_name(w, local_appl);
            put_name(w, remote_appl);
            put_flowcfg(w, flowcfg);
        }
        UipcpFaRespArrived {
            ipcp_id,
            local_port,
            remote_port,
            remote_cep,
            remote_addr,
            response,
            flowcfg,
        } => {
            w.put_u16(*ipcp_id);
            w.put_u16(*local_port);
            w.put_u16(*remote_port);
            w.put_u32(*remote_cep);
            w.put_u64(*remote_addr);
            w.put_u8(*response);
            put_flowcfg(w, flowcfg);
        }
        FlowDealloc { ipcp_id, port_id } => {
            w.put_u16(*ipcp_id);
            w.put_u16(*port_id);
        }
        FlowDeallocated {
            ipcp_id,
            local_port,
            remote_port,
            remote_addr,
        } => {
            w.put_u16(*ipcp_id);
            w.put_u16(*local_port);
            w.put_u16(*remote_port);
            w.put_u64(*remote_addr);
        }
        FlowFetch => {}
        FlowFetchResp {
            end,
            ipcp_id,
            local_port,
            remote_port,
            local_cep,
            remote_cep,
            local_addr,
            remote_addr,
            state,
        } => {
            w.put_u8(*end as u8);
            w.put_u16(*ipcp_id);
            w.put_u16(*local_port);
            w.put_u16(*remote_port);
            w.put_u32(*local_cep);
            w.put_u32(*remote_cep);
            w.put_u64(*local_addr);
            w.put_u64(*remote_addr);
            w.put_u8(*state);
        }
        FlowStatsReq { port_id } => {
            w.put_u16(*port_id);
        }
        FlowStatsResp { port_id, stats } => {
            w.put_u16(*port_id);
            put_stats(w, stats);
        }
        FlowCfgUpdate {
            ipcp_id,
            port_id,
            flowcfg,
        } => {
            w.put_u16(*ipcp_id);
            w.put_u16(*port_id);
            put_flowcfg(w, flowcfg);
        }
    }
}

fn decode_body(ty: MsgType, r: &mut WireReader<'_>) -> Result<MsgBody> {
    Ok(match ty {
        MsgType::IpcpCreate => MsgBody::IpcpCreate {
            name: get_name(r)?,
            dif_type: r.get_str()?,
            dif_name: r.get_str()?,
        },
        MsgType::IpcpCreateResp => MsgBody::IpcpCreateResp {
            ipcp_id: r.get_u16()?,
        },
        MsgType::IpcpDestroy => MsgBody::IpcpDestroy {
            ipcp_id: r.get_u16()?,
        },
        MsgType::IpcpConfig => MsgBody::IpcpConfig {
            ipcp_id: r.get_u16()?,
            name: r.get_str()?,
            value: r.get_str()?,
        },
        MsgType::IpcpPduftSet => MsgBody::IpcpPduftSet {
            ipcp_id: r.get_u16()?,
            dst_addr: r.get_u64()?,
            local_port: r.get_u16()?,
        },
        MsgType::IpcpPduftFlush => MsgBody::IpcpPduftFlush {
            ipcp_id: r.get_u16()?,
        },
        MsgType::IpcpUipcpSet => MsgBody::IpcpUipcpSet {
            ipcp_id: r.get_u16()?,
        },
        MsgType::IpcpUipcpWait => MsgBody::IpcpUipcpWait {
            ipcp_id: r.get_u16()?,
        },
        MsgType::IpcpUpdate => MsgBody::IpcpUpdate {
            kind: UpdateKind::try_from(r.get_u8()?)?,
            ipcp_id: r.get_u16()?,
            ipcp_addr: r.get_u64()?,
            depth: r.get_u8()?,
            ipcp_name: get_name(r)?,
            dif_type: r.get_str()?,
            dif_name: r.get_str()?,
        },
        MsgType::ApplRegister => MsgBody::ApplRegister {
            dif_name: r.get_str()?,
            reg: r.get_u8()? != 0,
            appl_name: get_name(r)?,
        },
        MsgType::ApplRegisterResp => MsgBody::ApplRegisterResp {
            ipcp_id: r.get_u16()?,
            reg: r.get_u8()? != 0,
            response: r.get_u8()?,
            appl_name: get_name(r)?,
        },
        MsgType::FaReq => MsgBody::FaReq {
            dif_name: r.get_str()?,
            upper_ipcp_id: r.get_u16()?,
            local_port: r.get_u16()?,
            local_cep: r.get_u32()?,
            local_appl: get_name(r)?,
            remote_appl: get_name(r)?,
            flowspec: get_flowspec(r)?,
        },
        MsgType::FaResp => MsgBody::FaResp {
            kevent_id: r.get_u32()?,
            upper_ipcp_id: r.get_u16()?,
            port_id: r.get_u16()?,
            response: r.get_u8()?,
            cep_id: r.get_u32()?,
        },
        MsgType::FaReqArrived => MsgBody::FaReqArrived {
            kevent_id: r.get_u32()?,
            ipcp_id: r.get_u16()?,
            port_id: r.get_u16()?,
            dif_name: r.get_str()?,
            local_appl: get_name(r)?,
            remote_appl: get_name(r)?,
        },
        MsgType::FaRespArrived => MsgBody::FaRespArrived {
            port_id: r.get_u16()?,
            response: r.get_u8()?,
        },
        MsgType::UipcpFaReqArrived => MsgBody::UipcpFaReqArrived {
            ipcp_id: r.get_u16()?,
            kevent_id: r.get_u32()?,
            remote_port: r.get_u16()?,
            remote_cep: r.get_u32()?,
            remote_addr: r.get_u64()?,
            local_appl: get_name(r)?,
            remote_appl: get_name(r)?,
            flowcfg: get_flowcfg(r)?,
        },
        MsgType::UipcpFaRespArrived => MsgBody::UipcpFaRespArrived {
            ipcp_id: r.get_u16()?,
            local_port: r.get_u16()?,
            remote_port: r.get_u16()?,
            remote_cep: r.get_u32()?,
            remote_addr: r.get_u64()?,
            response: r.get_u8()?,
            flowcfg: get_flowcfg(r)?,
        },
        MsgType::FlowDealloc => MsgBody::FlowDealloc {
            ipcp_id: r.get_u16()?,
            port_id: r.get_u16()?,
        },
        MsgType::FlowDeallocated => MsgBody::FlowDeallocated {
            ipcp_id: r.get_u16()?,
            local_port: r.get_u16()?,
            remote_port: r.get_u16()?,
            remote_addr: r.get_u64()?,
        },
        MsgType::FlowFetch => MsgBody::FlowFetch,
        MsgType::FlowFetchResp => MsgBody::FlowFetchResp {
            end: r.get_u8()? != 0,
            ipcp_id: r.get_u16()?,
            local_port: r.get_u16()?,
            remote_port: r.get_u16()?,
            local_cep: r.get_u32()?,
            remote_cep: r.get_u32()?,
            local_addr: r.get_u64()?,
            remote_addr: r.get_u64()?,
            state: r.get_u8()?,
        },
        MsgType::FlowStatsReq => MsgBody::FlowStatsReq {
            port_id: r.get_u16()?,
        },
        MsgType::FlowStatsResp => MsgBody::FlowStatsResp {
            port_id: r.get_u16()?,
            stats: get_stats(r)?,
        },
        MsgType::FlowCfgUpdate => MsgBody::FlowCfgUpdate {
            ipcp_id: r.get_u16()?,
            port_id: r.get_u16()?,
            flowcfg: get_flowcfg(r)?,
        },
    })
}
