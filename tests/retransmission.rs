// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present rinode Contributors

//! Integration test: DTP retransmission over a lossy loopback.
//!
//! Two normal IPCPs are wired back to back through loopback N-1 flows.
//! A reliable flow between them survives a dropped data PDU through the
//! retransmission timer, delivering exactly once.

use std::sync::Arc;
use std::time::Duration;

use rinode::flow::Upper;
use rinode::flowspec::{FlowConfig, FlowSpec};
use rinode::msg::{CtrlMsg, MsgBody};
use rinode::{CtrlHandle, Flow, Node};

struct Testbed {
    node: Arc<Node>,
    lo_id: u16,
    client: CtrlHandle,
    server: CtrlHandle,
    flow_a: Arc<Flow>,
    flow_b: Arc<Flow>,
}

/// Builds two normal IPCPs (addresses 1 and 2) joined by a loopback
/// flow pair, with forwarding rows and one reliable flow between them.
async fn testbed(cfg: FlowConfig) -> Testbed {
    let node = Node::with_builtin_factories();
    let admin = CtrlHandle::open(&node);

    let lo_id = node
        .ipcp_add(&"lo.IPCP/1".parse().unwrap(), "shim-loopback", "lo.DIF")
        .unwrap();
    let a_id = node
        .ipcp_add(&"a.IPCP/1".parse().unwrap(), "normal", "n.DIF")
        .unwrap();
    let b_id = node
        .ipcp_add(&"b.IPCP/1".parse().unwrap(), "normal", "n.DIF")
        .unwrap();
    node.ipcp_config(a_id, "address", "1").unwrap();
    node.ipcp_config(b_id, "address", "2").unwrap();

    // Loopback N-1 flows, one per side, bridged to each other.
    let lo = node.ipcp_get(lo_id).unwrap();
    let lower_a = node
        .flow_add(
            &lo,
            Upper::default(),
            0,
            &"a.IPCP/1".parse().unwrap(),
            &"b.IPCP/1".parse().unwrap(),
            None,
        )
        .unwrap();
    let lower_b = node
        .flow_add(
            &lo,
            Upper::default(),
            0,
            &"b.IPCP/1".parse().unwrap(),
            &"a.IPCP/1".parse().unwrap(),
            None,
        )
        .unwrap();
    lower_a.set_remote(lower_b.local_port, 0, 0);
    lower_b.set_remote(lower_a.local_port, 0, 0);
    lower_a.mark_allocated().unwrap();
    lower_b.mark_allocated().unwrap();
    node.upper_ipcp_flow_bind(a_id, &lower_a).unwrap();
    node.upper_ipcp_flow_bind(b_id, &lower_b).unwrap();
    node.ipcp_put(&lo);

    // Forwarding rows through the control protocol.
    admin
        .write_msg(&CtrlMsg::new(
            1,
            MsgBody::IpcpPduftSet {
                ipcp_id: a_id,
                dst_addr: 2,
                local_port: lower_a.local_port,
            },
        ))
        .await
        .unwrap();
    admin
        .write_msg(&CtrlMsg::new(
            2,
            MsgBody::IpcpPduftSet {
                ipcp_id: b_id,
                dst_addr: 1,
                local_port: lower_b.local_port,
            },
        ))
        .await
        .unwrap();

    // One reliable flow between the two normal IPCPs, wired directly.
    let client = CtrlHandle::open(&node);
    let server = CtrlHandle::open(&node);
    let ipcp_a = node.ipcp_get(a_id).unwrap();
    let ipcp_b = node.ipcp_get(b_id).unwrap();
    let flow_a = node
        .flow_add(
            &ipcp_a,
            Upper::handle(client.id()),
            0,
            &"cli".parse().unwrap(),
            &"srv".parse().unwrap(),
            Some(cfg.clone()),
        )
        .unwrap();
    let flow_b = node
        .flow_add(
            &ipcp_b,
            Upper::handle(server.id()),
            0,
            &"srv".parse().unwrap(),
            &"cli".parse().unwrap(),
            Some(cfg),
        )
        .unwrap();
    flow_a.set_remote(flow_b.local_port, flow_b.local_cep, 2);
    flow_b.set_remote(flow_a.local_port, flow_a.local_cep, 1);
    ipcp_a.ops.flow_init(&flow_a);
    ipcp_b.ops.flow_init(&flow_b);
    flow_a.mark_allocated().unwrap();
    flow_b.mark_allocated().unwrap();
    node.ipcp_put(&ipcp_a);
    node.ipcp_put(&ipcp_b);

    Testbed {
        node,
        lo_id,
        client,
        server,
        flow_a,
        flow_b,
    }
}

fn rtx_cfg() -> FlowConfig {
    let mut cfg = FlowConfig::from_spec(&FlowSpec::reliable());
    cfg.dtcp.rtx.initial_tr = 200;
    cfg.dtcp.rtx.data_rxms_max = 3;
    cfg
}

#[tokio::test]
async fn test_retransmission_recovers_one_loss() {
    let tb = testbed(rtx_cfg()).await;
    let a = tb.client.open_flow(tb.flow_a.local_port).unwrap();
    let b = tb.server.open_flow(tb.flow_b.local_port).unwrap();

    // Clean exchange first.
    a.write(b"one").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(b.read().await.unwrap(), b"one");

    // Drop everything on the wire, send, then heal the link.
    tb.node.ipcp_config(tb.lo_id, "drop_fract", "1").unwrap();
    a.write(b"two").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(b.try_read().is_none(), "PDU survived a full-loss link");
    tb.node.ipcp_config(tb.lo_id, "drop_fract", "0").unwrap();

    // The retransmission timer (200 ms) recovers the loss.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(b.read().await.unwrap(), b"two");
    // Exactly once.
    assert!(b.try_read().is_none());

    // The peer's ack emptied the retransmission queue.
    tokio::time::sleep(Duration::from_millis(100)).await;
    {
        let dtp = tb.flow_a.dtp.lock().unwrap();
        assert_eq!(dtp.as_ref().unwrap().rtxq_len(), 0);
    }
}

#[tokio::test]
async fn test_in_order_end_to_end() {
    let tb = testbed(rtx_cfg()).await;
    let a = tb.client.open_flow(tb.flow_a.local_port).unwrap();
    let b = tb.server.open_flow(tb.flow_b.local_port).unwrap();

    for i in 0..10u8 {
        a.write(&[i]).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    for i in 0..10u8 {
        assert_eq!(b.read().await.unwrap(), vec![i]);
    }
}
