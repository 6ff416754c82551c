// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present rinode Contributors

//! Flow specifications and flow configurations
//!
//! Applications request a flow with a [`FlowSpec`] (what they need); the
//! flow allocator derives a [`FlowConfig`] from it (how the data transfer
//! protocol is parameterized). The derivation is deterministic so both ends
//! of a flow compute the same configuration.

use serde::{Deserialize, Serialize};

/// Default retransmission interval, milliseconds.
pub const RTX_MSECS_DEFAULT: u32 = 1000;
/// Default maximum number of retransmissions per PDU.
pub const DATA_RXMS_MAX_DEFAULT: u32 = 10;
/// Default maximum PDU lifetime, milliseconds.
pub const MPL_MSECS_DEFAULT: u32 = 1000;
/// Default delayed-ack (A timer) value, milliseconds. Zero disables it.
pub const A_MSECS_DEFAULT: u32 = 0;

/// What an application asks of a flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSpec {
    /// Maximum tolerated gap between consecutively delivered SDUs.
    /// `u64::MAX` means "any loss is fine".
    pub max_sdu_gap: u64,
    /// Deliver SDUs in the order they were sent.
    pub in_order_delivery: bool,
    /// Average bandwidth in bits per second; 0 means unshaped.
    pub avg_bandwidth: u64,
    /// Ask for window flow control.
    pub flow_control: bool,
    /// Maximum delay in microseconds; currently unused by the derivation.
    pub max_delay: u32,
    /// Maximum jitter in microseconds; currently unused by the derivation.
    pub max_jitter: u32,
}

impl FlowSpec {
    /// A fully reliable flow: no gaps, in order.
    pub fn reliable() -> Self {
        Self {
            max_sdu_gap: 0,
            in_order_delivery: true,
            ..Default::default()
        }
    }

    /// A best-effort flow: unlimited gap, unordered.
    pub fn unreliable() -> Self {
        Self {
            max_sdu_gap: u64::MAX,
            ..Default::default()
        }
    }
}

/// Window flow-control parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowCfg {
    /// Maximum length of the closed-window queue.
    pub max_cwq_len: u32,
    /// Initial sender/receiver credit in PDUs.
    pub initial_credit: u64,
}

/// Retransmission-control parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtxCfg {
    /// Upper bound on the time spent retrying, seconds. Currently advisory.
    pub max_time_to_retry: u32,
    /// Maximum number of retransmissions of a single PDU.
    pub data_rxms_max: u32,
    /// Retransmission timer interval, milliseconds.
    pub initial_tr: u32,
}

/// DTCP parameterization of a flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtcpCfg {
    pub flow_control: bool,
    pub rtx_control: bool,
    /// Delayed-ack timer, milliseconds; 0 disables it.
    pub initial_a: u32,
    /// Shaped bandwidth in bits per second; 0 disables the token bucket.
    pub bandwidth: u64,
    pub win: WindowCfg,
    pub rtx: RtxCfg,
}

/// The installed configuration of a flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowConfig {
    pub max_sdu_gap: u64,
    pub in_order_delivery: bool,
    pub msg_boundaries: bool,
    pub dtcp_present: bool,
    pub dtcp: DtcpCfg,
}

/// Per-flow data-path counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStats {
    pub tx_pdu: u64,
    pub tx_byte: u64,
    pub tx_err: u64,
    pub rx_pdu: u64,
    pub rx_byte: u64,
    pub rx_err: u64,
}

impl FlowConfig {
    /// Derives the flow configuration from a flow specification.
    ///
    /// A zero maximum SDU gap implies retransmission control; an explicit
    /// flow-control request turns on windowing with fixed credit.
    pub fn from_spec(spec: &FlowSpec) -> Self {
        let mut cfg = FlowConfig {
            max_sdu_gap: spec.max_sdu_gap,
            in_order_delivery: spec.in_order_delivery,
            msg_boundaries: true,
            ..Default::default()
        };
        cfg.dtcp.bandwidth = spec.avg_bandwidth;

        if spec.max_sdu_gap == 0 {
            cfg.dtcp_present = true;
            cfg.in_order_delivery = true;
            cfg.dtcp.rtx_control = true;
            cfg.dtcp.rtx.max_time_to_retry = 15;
            cfg.dtcp.rtx.data_rxms_max = DATA_RXMS_MAX_DEFAULT;
            cfg.dtcp.rtx.initial_tr = RTX_MSECS_DEFAULT;
            cfg.dtcp.initial_a = A_MSECS_DEFAULT;
        }

        if spec.flow_control {
            cfg.dtcp_present = true;
            cfg.dtcp.flow_control = true;
            cfg.dtcp.win.max_cwq_len = 100;
            cfg.dtcp.win.initial_credit = 60;
            cfg.dtcp.initial_a = A_MSECS_DEFAULT;
        }

        if spec.avg_bandwidth > 0 {
            cfg.dtcp_present = true;
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reliable_spec_enables_rtx() {
        let cfg = FlowConfig::from_spec(&FlowSpec::reliable());
        assert!(cfg.dtcp_present);
        assert!(cfg.dtcp.rtx_control);
        assert!(cfg.in_order_delivery);
        assert_eq!(cfg.dtcp.rtx.initial_tr, RTX_MSECS_DEFAULT);
    }

    #[test]
    fn test_unreliable_spec_is_plain() {
        let cfg = FlowConfig::from_spec(&FlowSpec::unreliable());
        assert!(!cfg.dtcp_present);
        assert!(!cfg.dtcp.rtx_control);
        assert!(!cfg.dtcp.flow_control);
    }

    #[test]
    fn test_flow_control_window() {
        let spec = FlowSpec {
            flow_control: true,
            max_sdu_gap: u64::MAX,
            ..Default::default()
        };
        let cfg = FlowConfig::from_spec(&spec);
        assert!(cfg.dtcp_present);
        assert!(cfg.dtcp.flow_control);
        assert!(!cfg.dtcp.rtx_control);
        assert_eq!(cfg.dtcp.win.initial_credit, 60);
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let spec = FlowSpec::reliable();
        assert_eq!(FlowConfig::from_spec(&spec), FlowConfig::from_spec(&spec));
    }
}
