// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present rinode Contributors

//! UDP shim engine
//!
//! Carries flows of the lowest DIF over UDP datagrams. Peer applications
//! are resolved through a static table configured per IPCP (`peer.<name>`
//! parameters); there is no hostname resolution. Each datagram carries a
//! small postcard-encoded header linking it to a flow endpoint pair, so
//! many flows share the one socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::flow::{Flow, RxSdu};
use crate::flowspec::FlowSpec;
use crate::ipcp::IpcpOps;
use crate::names::ApplName;
use crate::node::{EngineCtx, Factory, Node};
use crate::pci::PortId;

pub const DIF_TYPE: &str = "shim-udp4";

/// Maximum datagram accepted from the socket.
const MAX_DGRAM: usize = 65536;

/// Registers the UDP shim factory on a node.
pub fn register(node: &Arc<Node>) {
    node.register_factory(Factory {
        dif_type: DIF_TYPE,
        uses_cep_ids: false,
        ctor: Box::new(|ctx: &EngineCtx| Ok(ShimUdp::create(ctx))),
    });
}

/// On-wire header of every shim datagram.
#[derive(Debug, Serialize, Deserialize)]
enum ShimMsg {
    FaReq {
        src_port: PortId,
        local_appl: ApplName,
        remote_appl: ApplName,
    },
    FaResp {
        src_port: PortId,
        dst_port: PortId,
        response: u8,
    },
    Data {
        src_port: PortId,
        dst_port: PortId,
        payload: Vec<u8>,
    },
}

struct UdpInner {
    node: Weak<Node>,
    ipcp_id: u16,
    socket: OnceLock<Arc<UdpSocket>>,
    /// Static directory: application name to peer socket address.
    peers: Mutex<HashMap<String, SocketAddr>>,
    /// Local flow endpoint to the peer carrying it.
    flow_peers: Mutex<HashMap<PortId, SocketAddr>>,
}

pub struct ShimUdp {
    inner: Arc<UdpInner>,
}

impl ShimUdp {
    fn create(ctx: &EngineCtx) -> Box<dyn IpcpOps> {
        Box::new(ShimUdp {
            inner: Arc::new(UdpInner {
                node: Arc::downgrade(&ctx.node),
                ipcp_id: ctx.ipcp_id,
                socket: OnceLock::new(),
                peers: Mutex::new(HashMap::new()),
                flow_peers: Mutex::new(HashMap::new()),
            }),
        })
    }
}

impl UdpInner {
    fn node(&self) -> Result<Arc<Node>> {
        self.node
            .upgrade()
            .ok_or_else(|| Error::NotFound("node is shut down".to_string()))
    }

    fn socket(&self) -> Result<Arc<UdpSocket>> {
        self.socket
            .get()
            .cloned()
            .ok_or_else(|| Error::InvalidArgument("shim socket not bound".to_string()))
    }

    fn bind(this: &Arc<Self>, addr: &str) -> Result<()> {
        if this.socket.get().is_some() {
            return Err(Error::Busy("shim socket already bound".to_string()));
        }
        let std_sock = std::net::UdpSocket::bind(addr)?;
        std_sock.set_nonblocking(true)?;
        let socket = Arc::new(UdpSocket::from_std(std_sock)?);
        let _ = this.socket.set(socket.clone());

        let inner = Arc::downgrade(this);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DGRAM];
            loop {
                let (len, src) = match socket.recv_from(&mut buf).await {
                    Ok(ok) => ok,
                    Err(e) => {
                        warn!(error = %e, "shim socket receive failed");
                        break;
                    }
                };
                let Some(inner) = inner.upgrade() else { break };
                inner.datagram_rx(&buf[..len], src);
            }
        });
        Ok(())
    }

    fn send(&self, msg: &ShimMsg, dst: SocketAddr) -> Result<()> {
        let bytes = postcard::to_allocvec(msg)?;
        match self.socket()?.try_send_to(&bytes, dst) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(Error::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }

    fn datagram_rx(&self, bytes: &[u8], src: SocketAddr) {
        let msg: ShimMsg = match postcard::from_bytes(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(from = %src, error = %e, "undecodable shim datagram");
                return;
            }
        };
        let Ok(node) = self.node() else { return };

        match msg {
            ShimMsg::FaReq {
                src_port,
                local_appl,
                remote_appl,
            } => {
                let Some(ipcp) = node.ipcp_find(self.ipcp_id) else {
                    return;
                };
                match node.fa_req_arrived(
                    &ipcp, 0, src_port, 0, 0, &local_appl, &remote_appl, None,
                ) {
                    Ok(new_port) => {
                        self.flow_peers.lock().unwrap().insert(new_port, src);
                    }
                    Err(e) => {
                        debug!(appl = %local_appl, error = %e, "rejecting shim flow request");
                        let _ = self.send(
                            &ShimMsg::FaResp {
                                src_port: 0,
                                dst_port: src_port,
                                response: 1,
                            },
                            src,
                        );
                    }
                }
            }
            ShimMsg::FaResp {
                src_port,
                dst_port,
                response,
            } => {
                if response == 0 {
                    self.flow_peers.lock().unwrap().insert(dst_port, src);
                }
                if let Err(e) = node.fa_resp_arrived(dst_port, src_port, 0, 0, response, None) {
                    debug!(port = dst_port, error = %e, "shim flow response mismatch");
                }
            }
            ShimMsg::Data {
                src_port,
                dst_port,
                payload,
            } => {
                let Ok(flow) = node.flow_get(dst_port) else {
                    debug!(port = dst_port, "shim data for unknown flow");
                    return;
                };
                let (expected_remote, _, _) = flow.remote();
                let len = payload.len() as u64;
                if expected_remote == src_port {
                    match node.sdu_rx_up(
                        &flow,
                        RxSdu {
                            seqnum: None,
                            data: payload,
                        },
                    ) {
                        Ok(()) => {
                            let mut s = flow.stats.lock().unwrap();
                            s.rx_pdu += 1;
                            s.rx_byte += len;
                        }
                        Err(_) => flow.stats.lock().unwrap().rx_err += 1,
                    }
                }
                node.flow_put(&flow);
            }
        }
    }
}

impl IpcpOps for ShimUdp {
    fn destroy(&self) {
        self.inner.flow_peers.lock().unwrap().clear();
    }

    fn flow_allocator_in_kernel(&self) -> bool {
        true
    }

    fn sdu_write(&self, flow: &Arc<Flow>, sdu: Vec<u8>, _maysleep: bool) -> Result<()> {
        let peer = {
            let flow_peers = self.inner.flow_peers.lock().unwrap();
            flow_peers.get(&flow.local_port).copied()
        }
        .ok_or_else(|| Error::Unreachable(format!("flow {} has no peer", flow.local_port)))?;

        let (remote_port, _, _) = flow.remote();
        let len = sdu.len() as u64;
        let res = self.inner.send(
            &ShimMsg::Data {
                src_port: flow.local_port,
                dst_port: remote_port,
                payload: sdu,
            },
            peer,
        );
        let mut s = flow.stats.lock().unwrap();
        match &res {
            Ok(()) => {
                s.tx_pdu += 1;
                s.tx_byte += len;
            }
            Err(_) => s.tx_err += 1,
        }
        res
    }

    fn sdu_rx(&self, _lower_flow: &Arc<Flow>, _sdu: Vec<u8>) -> Result<()> {
        Err(Error::InvalidArgument(
            "udp shim has no lower flows".to_string(),
        ))
    }

    fn flow_allocate_req(&self, flow: &Arc<Flow>, _spec: &FlowSpec) -> Result<()> {
        let peer = {
            let peers = self.inner.peers.lock().unwrap();
            peers.get(&flow.remote_appl.to_string()).copied()
        }
        .ok_or_else(|| {
            Error::Unreachable(format!("no peer mapping for '{}'", flow.remote_appl))
        })?;

        self.inner
            .flow_peers
            .lock()
            .unwrap()
            .insert(flow.local_port, peer);
        self.inner.send(
            &ShimMsg::FaReq {
                src_port: flow.local_port,
                // Mirror the roles for the remote side.
                local_appl: flow.remote_appl.clone(),
                remote_appl: flow.local_appl.clone(),
            },
            peer,
        )
    }

    fn flow_allocate_resp(&self, flow: &Arc<Flow>, response: u8) -> Result<()> {
        let peer = {
            let flow_peers = self.inner.flow_peers.lock().unwrap();
            flow_peers.get(&flow.local_port).copied()
        }
        .ok_or_else(|| Error::Unreachable(format!("flow {} has no peer", flow.local_port)))?;
        let (initiator_port, _, _) = flow.remote();
        self.inner.send(
            &ShimMsg::FaResp {
                src_port: flow.local_port,
                dst_port: initiator_port,
                response,
            },
            peer,
        )
    }

    fn config(&self, name: &str, value: &str) -> Result<bool> {
        if name == "local-addr" {
            UdpInner::bind(&self.inner, value)?;
            return Ok(false);
        }
        if let Some(appl) = name.strip_prefix("peer.") {
            let addr: SocketAddr = value.parse().map_err(|_| {
                Error::InvalidArgument(format!("bad socket address '{}'", value))
            })?;
            self.inner.peers.lock().unwrap().insert(appl.to_string(), addr);
            return Ok(false);
        }
        Err(Error::InvalidArgument(format!(
            "unhandled configuration parameter '{}'",
            name
        )))
    }

    fn flow_deallocated(&self, flow: &Arc<Flow>) {
        self.inner.flow_peers.lock().unwrap().remove(&flow.local_port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shim_msg_round_trip() {
        let msg = ShimMsg::Data {
            src_port: 3,
            dst_port: 4,
            payload: vec![1, 2, 3],
        };
        let bytes = postcard::to_allocvec(&msg).unwrap();
        match postcard::from_bytes::<ShimMsg>(&bytes).unwrap() {
            ShimMsg::Data {
                src_port,
                dst_port,
                payload,
            } => {
                assert_eq!(src_port, 3);
                assert_eq!(dst_port, 4);
                assert_eq!(payload, vec![1, 2, 3]);
            }
            other => panic!("unexpected decode {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_config_peer_table() {
        let node = Node::with_builtin_factories();
        let id = node
            .ipcp_add(&"u/1".parse().unwrap(), "shim-udp4", "udp")
            .unwrap();
        node.ipcp_config(id, "peer.server/1", "127.0.0.1:9700")
            .unwrap();
        assert!(node.ipcp_config(id, "peer.bad", "not-an-addr").is_err());
    }

    #[tokio::test]
    async fn test_bind_twice_is_busy() {
        let node = Node::with_builtin_factories();
        let id = node
            .ipcp_add(&"u/1".parse().unwrap(), "shim-udp4", "udp")
            .unwrap();
        node.ipcp_config(id, "local-addr", "127.0.0.1:0").unwrap();
        assert!(matches!(
            node.ipcp_config(id, "local-addr", "127.0.0.1:0"),
            Err(Error::Busy(_))
        ));
    }
}
