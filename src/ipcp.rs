// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present rinode Contributors

//! IPC process entities and the engine capability interface
//!
//! An [`Ipcp`] is one participant in a DIF. Its data plane is provided by
//! an engine implementing [`IpcpOps`]; engines are produced by factories
//! registered against DIF type names ("normal", "shim-loopback",
//! "shim-udp4"). Optional capabilities have default implementations that
//! report the operation as unsupported.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::flow::Flow;
use crate::flowspec::{FlowConfig, FlowSpec, FlowStats};
use crate::names::ApplName;
use crate::pci::{Addr, PortId};

/// The IPCP multiplexes flows over CEP ids (normal engines do).
pub const IPCP_F_USES_CEP_IDS: u32 = 1 << 0;
/// Logical delete happened; the entity only lingers for live references.
pub const IPCP_F_ZOMBIE: u32 = 1 << 1;

/// Hard cap on PDUs parked in the per-IPCP RMT back-pressure queue.
pub const RMTQ_MAX_LEN: usize = 64;

/// Registration state of an application name on an IPCP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegState {
    /// Waiting for the user-space IPCP to confirm.
    Pending,
    Complete,
}

/// An application name registered on an IPCP.
#[derive(Debug, Clone)]
pub struct RegisteredAppl {
    pub name: ApplName,
    /// Control handle that owns the registration.
    pub handle_id: u64,
    /// Event id of the registration request, echoed in the response.
    pub event_id: u32,
    pub state: RegState,
}

/// Addressing mode of an outgoing management SDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MgmtMode {
    /// Send on a specific N-1 flow of this IPCP.
    Port(PortId),
    /// Route by destination address through the forwarding table.
    Addr(Addr),
}

/// A management SDU delivered up to the user-space IPCP.
#[derive(Debug, Clone)]
pub struct MgmtSdu {
    /// N-1 flow the SDU arrived on.
    pub local_port: PortId,
    pub src_addr: Addr,
    pub payload: Vec<u8>,
}

/// A PDU parked on an IPCP waiting for transmit space.
#[derive(Debug)]
pub struct RmtqEntry {
    pub lower_port: PortId,
    pub sdu: Vec<u8>,
}

/// Engine capability interface.
///
/// `destroy`, `sdu_write` and `sdu_rx` are the required surface; the rest
/// are capabilities an engine may advertise by overriding the default.
pub trait IpcpOps: Send + Sync {
    /// Releases engine resources. Called exactly once, after the owning
    /// IPCP's last reference is dropped.
    fn destroy(&self);

    /// Transmits one SDU on a flow supported by this IPCP. `maysleep`
    /// distinguishes contexts that may block from those that must return
    /// `WouldBlock`.
    fn sdu_write(&self, flow: &Arc<Flow>, sdu: Vec<u8>, maysleep: bool) -> Result<()>;

    /// Handles an SDU arriving on an N-1 flow bound to this IPCP.
    fn sdu_rx(&self, lower_flow: &Arc<Flow>, sdu: Vec<u8>) -> Result<()>;

    /// Engine-specific flow initialization, run when a flow switches to
    /// allocated with a known configuration.
    fn flow_init(&self, _flow: &Arc<Flow>) {}

    /// Whether this engine resolves flow allocations itself (shims do;
    /// normal engines defer to their user-space controller).
    fn flow_allocator_in_kernel(&self) -> bool {
        false
    }

    /// The upper layer consumed a delivered SDU carrying `seqnum`.
    fn sdu_rx_consumed(&self, _flow: &Arc<Flow>, _seqnum: crate::pci::SeqNum) {}

    /// Kernel-space flow allocation (shim engines).
    fn flow_allocate_req(&self, _flow: &Arc<Flow>, _spec: &FlowSpec) -> Result<()> {
        Err(Error::InvalidArgument(
            "engine does not allocate flows".to_string(),
        ))
    }

    /// Kernel-space flow allocation response (shim engines).
    fn flow_allocate_resp(&self, _flow: &Arc<Flow>, _response: u8) -> Result<()> {
        Err(Error::InvalidArgument(
            "engine does not allocate flows".to_string(),
        ))
    }

    /// Applies an engine-specific configuration parameter. Returns `true`
    /// when the change should be fanned out as an `ipcp-update`.
    fn config(&self, name: &str, _value: &str) -> Result<bool> {
        Err(Error::InvalidArgument(format!(
            "unhandled configuration parameter '{}'",
            name
        )))
    }

    /// Installs a forwarding row `dst_addr -> lower flow`.
    fn pduft_set(&self, _dst_addr: Addr, _flow: &Arc<Flow>) -> Result<()> {
        Err(Error::InvalidArgument(
            "engine has no forwarding table".to_string(),
        ))
    }

    /// Removes one forwarding row.
    fn pduft_del(&self, _dst_addr: Addr) -> Result<()> {
        Err(Error::InvalidArgument(
            "engine has no forwarding table".to_string(),
        ))
    }

    /// Drops every forwarding row.
    fn pduft_flush(&self) -> Result<()> {
        Err(Error::InvalidArgument(
            "engine has no forwarding table".to_string(),
        ))
    }

    /// Notifies the engine of an application (un)registration. Engines
    /// with a user-space registration policy return `Ok(true)` to leave
    /// the registration pending.
    fn appl_register(&self, _appl: &ApplName, _reg: bool) -> Result<bool> {
        Ok(false)
    }

    /// Sends a management SDU, prepending the MGMT PCI.
    fn mgmt_sdu_write(&self, _mode: MgmtMode, _sdu: Vec<u8>) -> Result<()> {
        Err(Error::InvalidArgument(
            "engine has no management path".to_string(),
        ))
    }

    /// Binds the sink receiving inbound management SDUs.
    fn mgmt_sdu_bind(&self, _tx: tokio::sync::mpsc::UnboundedSender<MgmtSdu>) -> Result<()> {
        Err(Error::InvalidArgument(
            "engine has no management path".to_string(),
        ))
    }

    /// Reads engine-side counters of a flow.
    fn flow_get_stats(&self, flow: &Arc<Flow>) -> Result<FlowStats> {
        Ok(*flow.stats.lock().unwrap())
    }

    /// Installs an updated flow configuration.
    fn flow_cfg_update(&self, _flow: &Arc<Flow>, _cfg: &FlowConfig) -> Result<()> {
        Err(Error::InvalidArgument(
            "engine does not support flow reconfiguration".to_string(),
        ))
    }

    /// Hook invoked while a flow supported by this IPCP is torn down.
    fn flow_deallocated(&self, _flow: &Arc<Flow>) {}
}

/// One IPC process.
pub struct Ipcp {
    pub id: u16,
    pub name: ApplName,
    pub dif_name: String,
    pub dif_type: String,
    /// Node identifier inside the DIF; 0 means unassigned.
    addr: AtomicU64,
    /// Recursion height above the lowest shim.
    depth: AtomicU8,
    flags: AtomicU32,
    /// Engine providing the data plane.
    pub ops: Box<dyn IpcpOps>,
    /// Logical reference count; the table holds one reference.
    refcnt: Mutex<u32>,
    /// Control handle of the bound user-space IPCP, if any.
    uipcp: Mutex<Option<u64>>,
    uipcp_bound: Notify,
    /// Registration lock: guards the registered-application list and is
    /// never nested inside the per-IPCP config mutex.
    registered_appls: Mutex<Vec<RegisteredAppl>>,
    /// Per-IPCP mutex serializing reconfiguration.
    pub config_lock: Mutex<()>,
    /// Back-pressure queue of PDUs waiting for transmit space downstream.
    rmtq: Mutex<VecDeque<RmtqEntry>>,
    /// Writers sleeping on this IPCP's transmit path.
    pub tx_event: Notify,
}

impl Ipcp {
    pub fn new(
        id: u16,
        name: ApplName,
        dif_name: String,
        dif_type: String,
        ops: Box<dyn IpcpOps>,
    ) -> Self {
        Self {
            id,
            name,
            dif_name,
            dif_type,
            addr: AtomicU64::new(0),
            depth: AtomicU8::new(0),
            flags: AtomicU32::new(0),
            ops,
            refcnt: Mutex::new(1),
            uipcp: Mutex::new(None),
            uipcp_bound: Notify::new(),
            registered_appls: Mutex::new(Vec::new()),
            config_lock: Mutex::new(()),
            rmtq: Mutex::new(VecDeque::new()),
            tx_event: Notify::new(),
        }
    }

    pub fn addr(&self) -> Addr {
        self.addr.load(Ordering::Acquire)
    }

    pub fn set_addr(&self, addr: Addr) {
        self.addr.store(addr, Ordering::Release);
    }

    pub fn depth(&self) -> u8 {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn set_depth(&self, depth: u8) {
        self.depth.store(depth, Ordering::Relaxed);
    }

    pub fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    pub fn uses_cep_ids(&self) -> bool {
        self.has_flag(IPCP_F_USES_CEP_IDS)
    }

    pub fn is_zombie(&self) -> bool {
        self.has_flag(IPCP_F_ZOMBIE)
    }

    /// Takes one logical reference. Returns the new count.
    pub fn get(&self) -> u32 {
        let mut cnt = self.refcnt.lock().unwrap();
        *cnt += 1;
        *cnt
    }

    /// Drops one logical reference. Returns the new count; at zero the
    /// caller (the registry) runs the destructor.
    pub fn put(&self) -> u32 {
        let mut cnt = self.refcnt.lock().unwrap();
        debug_assert!(*cnt > 0);
        *cnt -= 1;
        *cnt
    }

    /// Binds a user-space controller handle. At most one at a time.
    pub fn uipcp_set(&self, handle_id: u64) -> Result<()> {
        let mut uipcp = self.uipcp.lock().unwrap();
        if uipcp.is_some() {
            return Err(Error::Busy(format!(
                "ipcp {} already has a user-space controller",
                self.id
            )));
        }
        *uipcp = Some(handle_id);
        drop(uipcp);
        self.uipcp_bound.notify_waiters();
        Ok(())
    }

    /// Unbinds the controller if `handle_id` owns it.
    pub fn uipcp_clear(&self, handle_id: u64) {
        let mut uipcp = self.uipcp.lock().unwrap();
        if *uipcp == Some(handle_id) {
            *uipcp = None;
        }
    }

    pub fn uipcp_handle(&self) -> Option<u64> {
        *self.uipcp.lock().unwrap()
    }

    /// Waits until a user-space controller binds. Interruptible by the
    /// caller dropping the future.
    pub async fn uipcp_wait(&self) {
        loop {
            let bound = self.uipcp_bound.notified();
            if self.uipcp_handle().is_some() {
                return;
            }
            bound.await;
        }
    }

    /// Runs `f` under the registration lock.
    pub fn with_registrations<R>(&self, f: impl FnOnce(&mut Vec<RegisteredAppl>) -> R) -> R {
        let mut appls = self.registered_appls.lock().unwrap();
        f(&mut appls)
    }

    /// Finds a complete or pending registration by name.
    pub fn find_registration(&self, name: &ApplName) -> Option<RegisteredAppl> {
        self.registered_appls
            .lock()
            .unwrap()
            .iter()
            .find(|r| &r.name == name)
            .cloned()
    }

    /// Parks an SDU waiting for transmit space downstream. Overrun drops
    /// the SDU and reports `NoSpace`.
    pub fn rmtq_push(&self, entry: RmtqEntry) -> Result<()> {
        let mut q = self.rmtq.lock().unwrap();
        if q.len() >= RMTQ_MAX_LEN {
            return Err(Error::NoSpace(format!(
                "rmt queue overrun on ipcp {}",
                self.id
            )));
        }
        q.push_back(entry);
        Ok(())
    }

    /// Drains the back-pressure queue for another transmit attempt.
    pub fn rmtq_drain(&self) -> Vec<RmtqEntry> {
        self.rmtq.lock().unwrap().drain(..).collect()
    }

    pub fn rmtq_len(&self) -> usize {
        self.rmtq.lock().unwrap().len()
    }
}

impl std::fmt::Debug for Ipcp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ipcp")
            .field("id", &self.id)
            .field("name", &self.name.to_string())
            .field("dif", &self.dif_name)
            .field("type", &self.dif_type)
            .field("addr", &self.addr())
            .field("depth", &self.depth())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullOps;

    impl IpcpOps for NullOps {
        fn destroy(&self) {}
        fn sdu_write(&self, _flow: &Arc<Flow>, _sdu: Vec<u8>, _maysleep: bool) -> Result<()> {
            Ok(())
        }
        fn sdu_rx(&self, _flow: &Arc<Flow>, _sdu: Vec<u8>) -> Result<()> {
            Ok(())
        }
    }

    fn test_ipcp() -> Ipcp {
        Ipcp::new(
            0,
            ApplName::from_apn("x"),
            "d".to_string(),
            "normal".to_string(),
            Box::new(NullOps),
        )
    }

    #[test]
    fn test_refcnt() {
        let ipcp = test_ipcp();
        assert_eq!(ipcp.get(), 2);
        assert_eq!(ipcp.put(), 1);
        assert_eq!(ipcp.put(), 0);
    }

    #[test]
    fn test_uipcp_single_owner() {
        let ipcp = test_ipcp();
        ipcp.uipcp_set(10).unwrap();
        assert!(matches!(ipcp.uipcp_set(11), Err(Error::Busy(_))));
        ipcp.uipcp_clear(11);
        assert_eq!(ipcp.uipcp_handle(), Some(10));
        ipcp.uipcp_clear(10);
        assert_eq!(ipcp.uipcp_handle(), None);
    }

    #[test]
    fn test_rmtq_cap() {
        let ipcp = test_ipcp();
        for _ in 0..RMTQ_MAX_LEN {
            ipcp.rmtq_push(RmtqEntry {
                lower_port: 1,
                sdu: vec![0],
            })
            .unwrap();
        }
        assert!(matches!(
            ipcp.rmtq_push(RmtqEntry {
                lower_port: 1,
                sdu: vec![0],
            }),
            Err(Error::NoSpace(_))
        ));
        assert_eq!(ipcp.rmtq_drain().len(), RMTQ_MAX_LEN);
        assert_eq!(ipcp.rmtq_len(), 0);
    }

    #[tokio::test]
    async fn test_uipcp_wait() {
        let ipcp = Arc::new(test_ipcp());
        let waiter = {
            let ipcp = ipcp.clone();
            tokio::spawn(async move { ipcp.uipcp_wait().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        ipcp.uipcp_set(5).unwrap();
        waiter.await.unwrap();
    }
}
