// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present rinode Contributors

//! Integration test: two nodes talking over the UDP shim.

use std::time::Duration;

use rinode::msg::{CtrlMsg, IPCP_ID_NONE, MsgBody};
use rinode::{CtrlHandle, FlowSpec, Node};

#[tokio::test]
async fn test_udp_shim_flow_between_nodes() {
    // Two independent nodes in one process, joined only by UDP.
    let node1 = Node::with_builtin_factories();
    let node2 = Node::with_builtin_factories();

    let u1 = node1
        .ipcp_add(&"u1.IPCP/1".parse().unwrap(), "shim-udp4", "udp.DIF")
        .unwrap();
    let u2 = node2
        .ipcp_add(&"u2.IPCP/1".parse().unwrap(), "shim-udp4", "udp.DIF")
        .unwrap();

    node1
        .ipcp_config(u1, "local-addr", "127.0.0.1:9400")
        .unwrap();
    node2
        .ipcp_config(u2, "local-addr", "127.0.0.1:9401")
        .unwrap();
    // Static directory: the server application lives behind node2.
    node1
        .ipcp_config(u1, "peer.srv", "127.0.0.1:9401")
        .unwrap();

    // The server registers on node2.
    let server = CtrlHandle::open(&node2);
    server
        .write_msg(&CtrlMsg::new(
            1,
            MsgBody::ApplRegister {
                dif_name: "udp.DIF".to_string(),
                reg: true,
                appl_name: "srv".parse().unwrap(),
            },
        ))
        .await
        .unwrap();
    match server.read_msg().await.unwrap().body {
        MsgBody::ApplRegisterResp { response: 0, .. } => {}
        other => panic!("registration failed: {:?}", other),
    }

    // The client on node1 allocates a flow to it.
    let client = CtrlHandle::open(&node1);
    client
        .write_msg(&CtrlMsg::new(
            2,
            MsgBody::FaReq {
                dif_name: "udp.DIF".to_string(),
                upper_ipcp_id: IPCP_ID_NONE,
                local_port: 0,
                local_cep: 0,
                local_appl: "cli".parse().unwrap(),
                remote_appl: "srv".parse().unwrap(),
                flowspec: FlowSpec::unreliable(),
            },
        ))
        .await
        .unwrap();

    let (kevent_id, server_port) = match server.read_msg().await.unwrap().body {
        MsgBody::FaReqArrived {
            kevent_id, port_id, ..
        } => (kevent_id, port_id),
        other => panic!("unexpected event {:?}", other),
    };
    server
        .write_msg(&CtrlMsg::new(
            3,
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
            assert_eq!(response, 0);
            port_id
        }
        other => panic!("unexpected event {:?}", other),
    };

    let cflow = client.open_flow(client_port).unwrap();
    let sflow = server.open_flow(server_port).unwrap();

    cflow.write(b"over udp").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sflow.read().await.unwrap(), b"over udp");

    sflow.write(b"and back").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cflow.read().await.unwrap(), b"and back");
}
