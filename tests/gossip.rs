// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present rinode Contributors

//! Integration tests: directory gossip convergence over an enrolled
//! three-node chain, and flow allocation across it.

use std::sync::Arc;
use std::time::Duration;

use rinode::msg::{CtrlMsg, IPCP_ID_NONE, MsgBody};
use rinode::uipcp::{Uipcp, UipcpHandle};
use rinode::{ApplName, CtrlHandle, FlowSpec, Node};

struct Chain {
    node: Arc<Node>,
    x_id: u16,
    z_id: u16,
    hx: UipcpHandle,
    hy: UipcpHandle,
    hz: UipcpHandle,
}

/// Builds the enrolled chain X(1) - Y - Z over one loopback lower DIF.
async fn chain() -> Chain {
    let node = Node::with_builtin_factories();
    node.ipcp_add(&"lo.IPCP/1".parse().unwrap(), "shim-loopback", "lo.DIF")
        .unwrap();

    let mut ids = Vec::new();
    let mut handles = Vec::new();
    for (name, addr) in [("x.IPCP/1", Some(1u64)), ("y.IPCP/1", None), ("z.IPCP/1", None)] {
        let id = node
            .ipcp_add(&name.parse().unwrap(), "normal", "n.DIF")
            .unwrap();
        if let Some(addr) = addr {
            node.ipcp_config(id, "address", &addr.to_string()).unwrap();
        }
        let handle = Uipcp::spawn(&node, id).await.unwrap();
        handle.register_lower_dif("lo.DIF").await.unwrap();
        ids.push(id);
        handles.push(handle);
    }
    let (hx, hy, hz) = (
        handles.remove(0),
        handles.remove(0),
        handles.remove(0),
    );

    hy.enroll(&"x.IPCP/1".parse::<ApplName>().unwrap(), "lo.DIF")
        .await
        .unwrap();
    hz.enroll(&"y.IPCP/1".parse::<ApplName>().unwrap(), "lo.DIF")
        .await
        .unwrap();
    // Let link-state gossip and route computation settle.
    tokio::time::sleep(Duration::from_millis(400)).await;

    Chain {
        node,
        x_id: ids[0],
        z_id: ids[2],
        hx,
        hy,
        hz,
    }
}

fn dft_value(rib: &serde_json::Value, appl: &str) -> Option<u64> {
    rib["dft"]
        .as_array()?
        .iter()
        .find(|e| e["appl_name"] == appl)
        .and_then(|e| e["address"].as_u64())
}

#[tokio::test]
async fn test_dft_gossip_converges_and_newest_wins() {
    let chain = chain().await;

    // A mapping set at one end of the chain reaches the other end.
    chain.hx.dft_set("app1", 100).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    for handle in [&chain.hx, &chain.hy, &chain.hz] {
        let rib: serde_json::Value =
            serde_json::from_str(&handle.rib_show().await.unwrap()).unwrap();
        assert_eq!(dft_value(&rib, "app1"), Some(100), "rib: {}", rib);
    }

    // A later write from the far end overrides everywhere; the old
    // mapping is never reinstated.
    tokio::time::sleep(Duration::from_millis(10)).await;
    chain.hz.dft_set("app1", 101).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    for handle in [&chain.hx, &chain.hy, &chain.hz] {
        let rib: serde_json::Value =
            serde_json::from_str(&handle.rib_show().await.unwrap()).unwrap();
        assert_eq!(dft_value(&rib, "app1"), Some(101), "rib: {}", rib);
    }
}

#[tokio::test]
async fn test_flow_allocation_across_the_chain() {
    let chain = chain().await;
    let node = &chain.node;

    // The server registers on Z's IPCP; the registration completes once
    // Z's controller confirms and gossips the directory entry.
    let server = CtrlHandle::open(node);
    let ipcp_z = node.ipcp_get(chain.z_id).unwrap();
    node.appl_add(&ipcp_z, &"srv".parse().unwrap(), server.id(), 77)
        .unwrap();
    node.ipcp_put(&ipcp_z);
    match server.read_msg().await.unwrap().body {
        MsgBody::ApplRegisterResp { response: 0, .. } => {}
        other => panic!("registration not confirmed: {:?}", other),
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    // A client on X allocates a reliable flow to the server on Z. The
    // n.DIF request lands on X, the lowest-id IPCP of that DIF.
    assert_eq!(chain.x_id, node.ipcp_select_by_dif(Some("n.DIF")).map(|i| {
        let id = i.id;
        node.ipcp_put(&i);
        id
    }).unwrap());

    let client = CtrlHandle::open(node);
    client
        .write_msg(&CtrlMsg::new(
            9,
            MsgBody::FaReq {
                dif_name: "n.DIF".to_string(),
                upper_ipcp_id: IPCP_ID_NONE,
                local_port: 0,
                local_cep: 0,
                local_appl: "cli".parse().unwrap(),
                remote_appl: "srv".parse().unwrap(),
                flowspec: FlowSpec::reliable(),
            },
        ))
        .await
        .unwrap();

    // The request crosses the chain and surfaces at the server.
    let (kevent_id, server_port) = match server.read_msg().await.unwrap().body {
        MsgBody::FaReqArrived {
            kevent_id, port_id, ..
        } => (kevent_id, port_id),
        other => panic!("unexpected event {:?}", other),
    };
    server
        .write_msg(&CtrlMsg::new(
            10,
            MsgBody::FaResp {
                kevent_id,
                upper_ipcp_id: IPCP_ID_NONE,
                port_id: server_port,
                response: 0,
                cep_id: 0,
            },
        ))
        .await
        .unwrap();

    let client_port = match client.read_msg().await.unwrap().body {
        MsgBody::FaRespArrived { port_id, response } => {
            assert_eq!(response, 0, "allocation rejected");
            port_id
        }
        other => panic!("unexpected event {:?}", other),
    };

    // Data crosses X -> Y -> Z and back.
    let cflow = client.open_flow(client_port).unwrap();
    let sflow = server.open_flow(server_port).unwrap();
    cflow.write(b"ping").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sflow.read().await.unwrap(), b"ping");
    sflow.write(b"pong").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cflow.read().await.unwrap(), b"pong");

    // Deallocation propagates to the far end: the server observes EOF.
    drop(cflow);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(sflow.read().await.is_none());
}
