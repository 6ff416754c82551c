// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present rinode Contributors

//! Flow entities
//!
//! A flow is one end of a channel between two applications or two IPCPs.
//! It is identified by its local port id (and, on normal IPCPs, a CEP id),
//! carries a receive queue toward its upper user and tracks the logical
//! references that drive teardown: the registry holds one, a pending
//! allocation holds one, and an unbound I/O handle holds the extra
//! reference that the first bind releases.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::dtp::Dtp;
use crate::error::{Error, Result};
use crate::flowspec::{FlowConfig, FlowStats};
use crate::ipcp::Ipcp;
use crate::names::ApplName;
use crate::pci::{Addr, CepId, PortId, SeqNum};

/// Cap on SDUs buffered toward a user-space reader.
pub const RXQ_MAX_LEN: usize = 1024;

/// Allocation state of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Pending = 1,
    Allocated = 2,
    Deallocated = 3,
}

/// Who sits on top of a flow: the control handle that owns it, and, for
/// N-1 flows, the upper IPCP using it as transport. Both can be present
/// at once (a user-space IPCP allocates lower flows for its data plane).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Upper {
    pub handle: Option<u64>,
    pub ipcp: Option<u16>,
}

impl Upper {
    pub fn handle(handle_id: u64) -> Self {
        Self {
            handle: Some(handle_id),
            ipcp: None,
        }
    }

    pub fn ipcp(ipcp_id: u16) -> Self {
        Self {
            handle: None,
            ipcp: Some(ipcp_id),
        }
    }
}

/// An SDU delivered upward, with the sequence number that produced it
/// when the supporting engine tracks one.
#[derive(Debug, Clone)]
pub struct RxSdu {
    pub seqnum: Option<SeqNum>,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub(crate) struct FlowMut {
    pub state: FlowState,
    pub remote_port: PortId,
    pub remote_cep: CepId,
    pub remote_addr: Addr,
    pub cfg: FlowConfig,
    pub upper: Upper,
    pub never_bound: bool,
    pub refcnt: u32,
    /// Destruction already postponed once for draining queues.
    pub teardown_deferred: bool,
}

#[derive(Debug, Default)]
struct RxQueue {
    queue: VecDeque<RxSdu>,
    eof: bool,
}

/// One flow endpoint.
pub struct Flow {
    pub local_port: PortId,
    /// Zero when the supporting IPCP does not use CEP ids.
    pub local_cep: CepId,
    pub ipcp: Arc<Ipcp>,
    pub local_appl: ApplName,
    pub remote_appl: ApplName,
    /// Event id the allocation outcome is delivered with.
    pub event_id: u32,
    pub(crate) mutable: Mutex<FlowMut>,
    /// Data-transfer state; installed by engines that run a DTP.
    pub dtp: Mutex<Option<Dtp>>,
    rxq: Mutex<RxQueue>,
    rx_event: Notify,
    /// Writers blocked on this flow's transmit path.
    pub tx_event: Notify,
    pub stats: Mutex<FlowStats>,
    /// Destination addresses of forwarding rows this flow is the exit of,
    /// kept so teardown can sweep the rows without a table scan.
    pduft_entries: Mutex<Vec<Addr>>,
}

impl Flow {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        local_port: PortId,
        local_cep: CepId,
        ipcp: Arc<Ipcp>,
        local_appl: ApplName,
        remote_appl: ApplName,
        upper: Upper,
        event_id: u32,
        cfg: FlowConfig,
    ) -> Self {
        Self {
            local_port,
            local_cep,
            ipcp,
            local_appl,
            remote_appl,
            event_id,
            mutable: Mutex::new(FlowMut {
                state: FlowState::Pending,
                remote_port: 0,
                remote_cep: 0,
                remote_addr: 0,
                cfg,
                upper,
                never_bound: true,
                // The existence reference. An I/O bind takes its own and
                // converts this one (see `Node::flow_make_mortal`).
                refcnt: 1,
                teardown_deferred: false,
            }),
            dtp: Mutex::new(None),
            rxq: Mutex::new(RxQueue::default()),
            rx_event: Notify::new(),
            tx_event: Notify::new(),
            stats: Mutex::new(FlowStats::default()),
            pduft_entries: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> FlowState {
        self.mutable.lock().unwrap().state
    }

    pub fn upper(&self) -> Upper {
        self.mutable.lock().unwrap().upper
    }

    /// Binds the upper IPCP, keeping the owning handle.
    pub fn set_upper_ipcp(&self, ipcp_id: u16) {
        self.mutable.lock().unwrap().upper.ipcp = Some(ipcp_id);
    }

    pub fn cfg(&self) -> FlowConfig {
        self.mutable.lock().unwrap().cfg.clone()
    }

    pub fn set_cfg(&self, cfg: FlowConfig) {
        self.mutable.lock().unwrap().cfg = cfg;
    }

    pub fn remote(&self) -> (PortId, CepId, Addr) {
        let m = self.mutable.lock().unwrap();
        (m.remote_port, m.remote_cep, m.remote_addr)
    }

    pub fn set_remote(&self, port: PortId, cep: CepId, addr: Addr) {
        let mut m = self.mutable.lock().unwrap();
        m.remote_port = port;
        m.remote_cep = cep;
        m.remote_addr = addr;
    }

    /// Transition `pending -> allocated`. Any other starting state is an
    /// illegal transition.
    pub fn mark_allocated(&self) -> Result<()> {
        let mut m = self.mutable.lock().unwrap();
        if m.state != FlowState::Pending {
            return Err(Error::InvalidArgument(format!(
                "flow {} is not pending",
                self.local_port
            )));
        }
        m.state = FlowState::Allocated;
        Ok(())
    }

    /// Idempotent transition to `deallocated`; wakes all readers so they
    /// observe EOF. Returns whether the call made the transition.
    pub fn shutdown(&self) -> bool {
        let transitioned = {
            let mut m = self.mutable.lock().unwrap();
            if m.state == FlowState::Deallocated {
                false
            } else {
                m.state = FlowState::Deallocated;
                true
            }
        };
        self.rxq.lock().unwrap().eof = true;
        self.rx_event.notify_waiters();
        self.tx_event.notify_waiters();
        transitioned
    }

    /// Delivers one SDU toward the upper reader.
    pub fn rxq_push(&self, sdu: RxSdu) -> Result<()> {
        {
            let mut rxq = self.rxq.lock().unwrap();
            if rxq.eof {
                return Err(Error::NotFound(format!(
                    "flow {} is shut down",
                    self.local_port
                )));
            }
            if rxq.queue.len() >= RXQ_MAX_LEN {
                self.stats.lock().unwrap().rx_err += 1;
                return Err(Error::NoSpace(format!(
                    "rx queue overrun on flow {}",
                    self.local_port
                )));
            }
            rxq.queue.push_back(sdu);
        }
        self.rx_event.notify_waiters();
        Ok(())
    }

    /// Waits for the next SDU; `None` signals EOF after shutdown.
    pub async fn rxq_pop(&self) -> Option<RxSdu> {
        loop {
            let notified = self.rx_event.notified();
            {
                let mut rxq = self.rxq.lock().unwrap();
                if let Some(sdu) = rxq.queue.pop_front() {
                    return Some(sdu);
                }
                if rxq.eof {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Non-blocking read attempt.
    pub fn rxq_try_pop(&self) -> Option<RxSdu> {
        self.rxq.lock().unwrap().queue.pop_front()
    }

    pub fn rxq_len(&self) -> usize {
        self.rxq.lock().unwrap().queue.len()
    }

    /// Links a forwarding row `dst -> self` for sweep at teardown.
    pub fn pduft_link(&self, dst_addr: Addr) {
        self.pduft_entries.lock().unwrap().push(dst_addr);
    }

    /// Unlinks one forwarding row.
    pub fn pduft_unlink(&self, dst_addr: Addr) {
        self.pduft_entries.lock().unwrap().retain(|a| *a != dst_addr);
    }

    /// Removes and returns all linked forwarding rows.
    pub fn pduft_take(&self) -> Vec<Addr> {
        std::mem::take(&mut *self.pduft_entries.lock().unwrap())
    }

    pub fn add_stats(&self, delta: &crate::dtp::StatsDelta) {
        let mut s = self.stats.lock().unwrap();
        s.tx_pdu = s.tx_pdu.wrapping_add(delta.tx_pdu);
        s.tx_byte = s.tx_byte.wrapping_add(delta.tx_byte);
        s.tx_err = s.tx_err.wrapping_add(delta.tx_err);
        s.rx_pdu = s.rx_pdu.wrapping_add(delta.rx_pdu);
        s.rx_byte = s.rx_byte.wrapping_add(delta.rx_byte);
        s.rx_err = s.rx_err.wrapping_add(delta.rx_err);
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let m = self.mutable.lock().unwrap();
        f.debug_struct("Flow")
            .field("local_port", &self.local_port)
            .field("local_cep", &self.local_cep)
            .field("state", &m.state)
            .field("remote_port", &m.remote_port)
            .field("remote_addr", &m.remote_addr)
            .field("refcnt", &m.refcnt)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipcp::IpcpOps;

    struct NullOps;

    impl IpcpOps for NullOps {
        fn destroy(&self) {}
        fn sdu_write(&self, _f: &Arc<Flow>, _s: Vec<u8>, _m: bool) -> Result<()> {
            Ok(())
        }
        fn sdu_rx(&self, _f: &Arc<Flow>, _s: Vec<u8>) -> Result<()> {
            Ok(())
        }
    }

    fn test_flow() -> Flow {
        let ipcp = Arc::new(Ipcp::new(
            0,
            ApplName::from_apn("i"),
            "d".to_string(),
            "shim-loopback".to_string(),
            Box::new(NullOps),
        ));
        Flow::new(
            1,
            0,
            ipcp,
            ApplName::from_apn("a"),
            ApplName::from_apn("b"),
            Upper::handle(1),
            7,
            FlowConfig::default(),
        )
    }

    #[test]
    fn test_initial_state() {
        let flow = test_flow();
        assert_eq!(flow.state(), FlowState::Pending);
        let m = flow.mutable.lock().unwrap();
        assert!(m.never_bound);
        assert_eq!(m.refcnt, 1);
    }

    #[test]
    fn test_state_transitions() {
        let flow = test_flow();
        flow.mark_allocated().unwrap();
        assert_eq!(flow.state(), FlowState::Allocated);
        assert!(flow.mark_allocated().is_err());
        assert!(flow.shutdown());
        assert!(!flow.shutdown());
        assert_eq!(flow.state(), FlowState::Deallocated);
    }

    #[tokio::test]
    async fn test_rx_queue_eof_after_shutdown() {
        let flow = test_flow();
        flow.rxq_push(RxSdu {
            seqnum: None,
            data: vec![1],
        })
        .unwrap();
        flow.shutdown();
        // Queued data drains before EOF.
        assert_eq!(flow.rxq_pop().await.unwrap().data, vec![1]);
        assert!(flow.rxq_pop().await.is_none());
        assert!(flow
            .rxq_push(RxSdu {
                seqnum: None,
                data: vec![2],
            })
            .is_err());
    }

    #[test]
    fn test_rxq_cap() {
        let flow = test_flow();
        for _ in 0..RXQ_MAX_LEN {
            flow.rxq_push(RxSdu {
                seqnum: None,
                data: Vec::new(),
            })
            .unwrap();
        }
        assert!(matches!(
            flow.rxq_push(RxSdu {
                seqnum: None,
                data: Vec::new(),
            }),
            Err(Error::NoSpace(_))
        ));
        assert_eq!(flow.stats.lock().unwrap().rx_err, 1);
    }

    #[test]
    fn test_pduft_links() {
        let flow = test_flow();
        flow.pduft_link(10);
        flow.pduft_link(11);
        flow.pduft_unlink(10);
        assert_eq!(flow.pduft_take(), vec![11]);
        assert!(flow.pduft_take().is_empty());
    }
}
