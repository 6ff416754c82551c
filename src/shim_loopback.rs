// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present rinode Contributors

//! Loopback shim engine
//!
//! Bridges pairs of flows inside the same node: what one endpoint writes,
//! the peer endpoint receives. Optionally the delivery detours through a
//! bounded queue drained by a background task, and a configurable drop
//! fraction discards every Nth SDU to exercise retransmission upstairs.

use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::flow::{Flow, RxSdu};
use crate::flowspec::FlowSpec;
use crate::ipcp::{Ipcp, IpcpOps};
use crate::node::{EngineCtx, Factory, Node};

pub const DIF_TYPE: &str = "shim-loopback";

/// Capacity of the optional receive ring.
const RX_ENTRIES: usize = 128;

/// Registers the loopback engine factory on a node.
pub fn register(node: &Arc<Node>) {
    node.register_factory(Factory {
        dif_type: DIF_TYPE,
        uses_cep_ids: false,
        ctor: Box::new(|ctx: &EngineCtx| Ok(ShimLoopback::create(ctx))),
    });
}

#[derive(Debug, Default)]
struct DropState {
    /// Drop every `fract`th SDU; 0 disables dropping.
    fract: u32,
    cdown: u32,
}

struct QueuedSdu {
    tx_flow: Arc<Flow>,
    rx_flow: Arc<Flow>,
    data: Vec<u8>,
}

struct LoopbackInner {
    node: Weak<Node>,
    ipcp_id: u16,
    drop: Mutex<DropState>,
    /// Receive ring for queued mode; `None` when delivery is inline.
    rx_tx: Mutex<Option<mpsc::Sender<QueuedSdu>>>,
}

pub struct ShimLoopback {
    inner: Arc<LoopbackInner>,
}

impl ShimLoopback {
    fn create(ctx: &EngineCtx) -> Box<dyn IpcpOps> {
        Box::new(ShimLoopback {
            inner: Arc::new(LoopbackInner {
                node: Arc::downgrade(&ctx.node),
                ipcp_id: ctx.ipcp_id,
                drop: Mutex::new(DropState::default()),
                rx_tx: Mutex::new(None),
            }),
        })
    }
}

impl LoopbackInner {
    fn node(&self) -> Result<Arc<Node>> {
        self.node
            .upgrade()
            .ok_or_else(|| Error::NotFound("node is shut down".to_string()))
    }

    /// Applies the drop policy: true means this SDU dies here.
    fn should_drop(&self) -> bool {
        let mut drop = self.drop.lock().unwrap();
        if drop.fract == 0 {
            return false;
        }
        drop.cdown -= 1;
        if drop.cdown == 0 {
            drop.cdown = drop.fract;
            return true;
        }
        false
    }

    fn deliver(node: &Arc<Node>, rx_flow: &Arc<Flow>, data: Vec<u8>) {
        let len = data.len() as u64;
        match node.sdu_rx_up(
            rx_flow,
            RxSdu {
                seqnum: None,
                data,
            },
        ) {
            Ok(()) => {
                let mut s = rx_flow.stats.lock().unwrap();
                s.rx_pdu += 1;
                s.rx_byte += len;
            }
            Err(e) => {
                debug!(port = rx_flow.local_port, error = %e, "loopback delivery failed");
                rx_flow.stats.lock().unwrap().rx_err += 1;
            }
        }
    }

    /// Switches queued delivery on or off.
    fn set_queued(&self, queued: bool) {
        let mut rx_tx = self.rx_tx.lock().unwrap();
        if !queued {
            *rx_tx = None;
            return;
        }
        if rx_tx.is_some() {
            return;
        }
        let (tx, mut rx) = mpsc::channel::<QueuedSdu>(RX_ENTRIES);
        let node = self.node.clone();
        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                let Some(node) = node.upgrade() else { break };
                Self::deliver(&node, &entry.rx_flow, entry.data);
                // The drained slot may unblock a writer.
                entry.tx_flow.tx_event.notify_waiters();
            }
        });
        *rx_tx = Some(tx);
    }
}

impl IpcpOps for ShimLoopback {
    fn destroy(&self) {
        *self.inner.rx_tx.lock().unwrap() = None;
    }

    fn flow_allocator_in_kernel(&self) -> bool {
        true
    }

    fn sdu_write(&self, tx_flow: &Arc<Flow>, sdu: Vec<u8>, _maysleep: bool) -> Result<()> {
        if self.inner.should_drop() {
            debug!(port = tx_flow.local_port, "loopback dropped SDU");
            return Ok(());
        }

        let node = self.inner.node()?;
        let (remote_port, _, _) = tx_flow.remote();
        let rx_flow = node.flow_get(remote_port)?;
        let len = sdu.len() as u64;

        let queued = self.inner.rx_tx.lock().unwrap().clone();
        let res = match queued {
            Some(tx) => tx
                .try_send(QueuedSdu {
                    tx_flow: tx_flow.clone(),
                    rx_flow: rx_flow.clone(),
                    data: sdu,
                })
                .map_err(|e| match e {
                    mpsc::error::TrySendError::Full(_) => Error::WouldBlock,
                    mpsc::error::TrySendError::Closed(_) => {
                        Error::NotFound("receive ring is gone".to_string())
                    }
                }),
            None => {
                LoopbackInner::deliver(&node, &rx_flow, sdu);
                Ok(())
            }
        };

        {
            let mut s = tx_flow.stats.lock().unwrap();
            match &res {
                Ok(()) => {
                    s.tx_pdu += 1;
                    s.tx_byte += len;
                }
                Err(_) => s.tx_err += 1,
            }
        }
        node.flow_put(&rx_flow);
        res
    }

    fn sdu_rx(&self, _lower_flow: &Arc<Flow>, _sdu: Vec<u8>) -> Result<()> {
        // The loopback sits at the bottom of the recursion; nothing feeds
        // it from below.
        Err(Error::InvalidArgument(
            "loopback engine has no lower flows".to_string(),
        ))
    }

    /// Initiator side: reflect the request onto the registered target
    /// application of the same IPCP, with the roles mirrored.
    fn flow_allocate_req(&self, flow: &Arc<Flow>, _spec: &FlowSpec) -> Result<()> {
        let node = self.inner.node()?;
        let ipcp: Arc<Ipcp> = node
            .ipcp_find(self.inner.ipcp_id)
            .ok_or_else(|| Error::NotFound(format!("ipcp {}", self.inner.ipcp_id)))?;
        node.fa_req_arrived(
            &ipcp,
            0,
            flow.local_port,
            0,
            0,
            &flow.remote_appl,
            &flow.local_appl,
            None,
        )
        .map(|_| ())
    }

    /// Responder side: relay the application's verdict back to the
    /// initiator flow, linking the two port ids.
    fn flow_allocate_resp(&self, flow: &Arc<Flow>, response: u8) -> Result<()> {
        let node = self.inner.node()?;
        let (initiator_port, _, _) = flow.remote();
        node.fa_resp_arrived(initiator_port, flow.local_port, 0, 0, response, None)
    }

    fn config(&self, name: &str, value: &str) -> Result<bool> {
        match name {
            "queued" => {
                let queued: u32 = value.parse().map_err(|_| {
                    Error::InvalidArgument(format!("bad queued value '{}'", value))
                })?;
                self.inner.set_queued(queued != 0);
                Ok(false)
            }
            "drop_fract" => {
                let fract: u32 = value.parse().map_err(|_| {
                    Error::InvalidArgument(format!("bad drop_fract value '{}'", value))
                })?;
                let mut drop = self.inner.drop.lock().unwrap();
                drop.fract = fract;
                drop.cdown = fract;
                Ok(false)
            }
            other => Err(Error::InvalidArgument(format!(
                "unhandled configuration parameter '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Upper;

    fn setup() -> (Arc<Node>, Arc<Ipcp>) {
        let node = Node::with_builtin_factories();
        let id = node
            .ipcp_add(&"lo/1".parse().unwrap(), "shim-loopback", "lo")
            .unwrap();
        let ipcp = node.ipcp_get(id).unwrap();
        (node, ipcp)
    }

    fn paired_flows(node: &Arc<Node>, ipcp: &Arc<Ipcp>) -> (Arc<Flow>, Arc<Flow>) {
        let a = node
            .flow_add(
                ipcp,
                Upper::handle(1),
                0,
                &"a".parse().unwrap(),
                &"b".parse().unwrap(),
                None,
            )
            .unwrap();
        let b = node
            .flow_add(
                ipcp,
                Upper::handle(1),
                0,
                &"b".parse().unwrap(),
                &"a".parse().unwrap(),
                None,
            )
            .unwrap();
        a.set_remote(b.local_port, 0, 0);
        b.set_remote(a.local_port, 0, 0);
        a.mark_allocated().unwrap();
        b.mark_allocated().unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn test_inline_bridging() {
        let (node, ipcp) = setup();
        let (a, b) = paired_flows(&node, &ipcp);

        ipcp.ops.sdu_write(&a, b"ping".to_vec(), true).unwrap();
        assert_eq!(b.rxq_try_pop().unwrap().data, b"ping");

        ipcp.ops.sdu_write(&b, b"pong".to_vec(), true).unwrap();
        assert_eq!(a.rxq_try_pop().unwrap().data, b"pong");

        assert_eq!(a.stats.lock().unwrap().tx_pdu, 1);
        assert_eq!(a.stats.lock().unwrap().rx_pdu, 1);
        node.ipcp_put(&ipcp);
    }

    #[tokio::test]
    async fn test_drop_fract() {
        let (node, ipcp) = setup();
        let (a, b) = paired_flows(&node, &ipcp);

        ipcp.ops.config("drop_fract", "2").unwrap();
        for i in 0..4u8 {
            ipcp.ops.sdu_write(&a, vec![i], true).unwrap();
        }
        // Writes 2 and 4 were dropped.
        assert_eq!(b.rxq_len(), 2);
        assert_eq!(b.rxq_try_pop().unwrap().data, vec![0]);
        assert_eq!(b.rxq_try_pop().unwrap().data, vec![2]);
        node.ipcp_put(&ipcp);
    }

    #[tokio::test]
    async fn test_queued_mode_delivers_async() {
        let (node, ipcp) = setup();
        let (a, b) = paired_flows(&node, &ipcp);

        ipcp.ops.config("queued", "1").unwrap();
        ipcp.ops.sdu_write(&a, b"later".to_vec(), true).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert_eq!(b.rxq_try_pop().unwrap().data, b"later");
        node.ipcp_put(&ipcp);
    }

    #[tokio::test]
    async fn test_write_to_unlinked_flow_fails() {
        let (node, ipcp) = setup();
        let a = node
            .flow_add(
                &ipcp,
                Upper::handle(1),
                0,
                &"a".parse().unwrap(),
                &"b".parse().unwrap(),
                None,
            )
            .unwrap();
        a.mark_allocated().unwrap();
        // remote_port 0 does not resolve to a flow.
        assert!(ipcp.ops.sdu_write(&a, b"x".to_vec(), true).is_err());
        node.ipcp_put(&ipcp);
    }
}
