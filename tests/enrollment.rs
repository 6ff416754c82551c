// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present rinode Contributors

//! Integration tests: neighbor enrollment over a loopback lower DIF.

use std::sync::Arc;
use std::time::Duration;

use rinode::msg::{CtrlMsg, IPCP_ID_NONE, MsgBody};
use rinode::uipcp::{Uipcp, UipcpHandle};
use rinode::{ApplName, CtrlHandle, Node};

async fn normal_with_uipcp(
    node: &Arc<Node>,
    name: &str,
    addr: Option<u64>,
) -> (u16, UipcpHandle) {
    let id = node
        .ipcp_add(&name.parse().unwrap(), "normal", "n.DIF")
        .unwrap();
    if let Some(addr) = addr {
        node.ipcp_config(id, "address", &addr.to_string()).unwrap();
    }
    let handle = Uipcp::spawn(node, id).await.unwrap();
    handle.register_lower_dif("lo.DIF").await.unwrap();
    (id, handle)
}

fn loopback(node: &Arc<Node>) {
    node.ipcp_add(&"lo.IPCP/1".parse().unwrap(), "shim-loopback", "lo.DIF")
        .unwrap();
}

#[tokio::test]
async fn test_enrollment_assigns_address_and_commits_state() {
    let node = Node::with_builtin_factories();
    loopback(&node);

    let (a_id, ha) = normal_with_uipcp(&node, "a.IPCP/1", Some(1)).await;
    let (b_id, hb) = normal_with_uipcp(&node, "b.IPCP/1", None).await;

    let a_name: ApplName = "a.IPCP/1".parse().unwrap();
    hb.enroll(&a_name, "lo.DIF").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The joiner adopted an address assigned by the peer.
    let infos = node.ipcps_show();
    let addr_a = infos.iter().find(|i| i.id == a_id).unwrap().addr;
    let addr_b = infos.iter().find(|i| i.id == b_id).unwrap().addr;
    assert_eq!(addr_a, 1);
    assert_ne!(addr_b, 0);
    assert_ne!(addr_b, addr_a);

    // Both sides consider each other enrolled and share the link-state
    // edge pair.
    for handle in [&ha, &hb] {
        let rib: serde_json::Value =
            serde_json::from_str(&handle.rib_show().await.unwrap()).unwrap();
        let neighbors = rib["neighbors"].as_array().unwrap();
        assert_eq!(neighbors.len(), 1, "rib: {}", rib);
        let flows = neighbors[0]["flows"].as_array().unwrap();
        assert_eq!(flows[0][1], "Enrolled");
        let lower_flows = rib["lower_flows"].as_array().unwrap();
        assert_eq!(lower_flows.len(), 2, "rib: {}", rib);
    }
}

#[tokio::test]
async fn test_enrollment_times_out_after_three_attempts() {
    let node = Node::with_builtin_factories();
    loopback(&node);

    let (_b_id, hb) = normal_with_uipcp(&node, "b.IPCP/1", None).await;

    // A mute peer: accepts the lower flow, never speaks CDAP.
    let mute = CtrlHandle::open(&node);
    mute.write_msg(&CtrlMsg::new(
        1,
        MsgBody::ApplRegister {
            dif_name: "lo.DIF".to_string(),
            reg: true,
            appl_name: "mute.IPCP/1".parse().unwrap(),
        },
    ))
    .await
    .unwrap();
    let mute = Arc::new(mute);
    {
        let mute = mute.clone();
        tokio::spawn(async move {
            while let Some(msg) = mute.read_msg().await {
                if let MsgBody::FaReqArrived {
                    kevent_id, port_id, ..
                } = msg.body
                {
                    let _ = mute
                        .write_msg(&CtrlMsg::new(
                            2,
                            MsgBody::FaResp {
                                kevent_id,
                                upper_ipcp_id: IPCP_ID_NONE,
                                port_id,
                                response: 0,
                                cep_id: 0,
                            },
                        ))
                        .await;
                }
            }
        });
    }

    // Three 1.5-second steps, then the condition signals failure.
    let start = std::time::Instant::now();
    let res = hb.enroll(&"mute.IPCP/1".parse().unwrap(), "lo.DIF").await;
    assert!(res.is_err());
    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_millis(4000),
        "gave up too early: {:?}",
        elapsed
    );

    // The neighbor flow fell back to its ground state.
    let rib: serde_json::Value = serde_json::from_str(&hb.rib_show().await.unwrap()).unwrap();
    let neighbors = rib["neighbors"].as_array().unwrap();
    assert_eq!(neighbors.len(), 1);
    let flows = neighbors[0]["flows"].as_array().unwrap();
    assert_eq!(flows[0][1], "None");
}

#[tokio::test]
async fn test_enrollment_to_unknown_neighbor_fails_fast() {
    let node = Node::with_builtin_factories();
    loopback(&node);
    let (_b_id, hb) = normal_with_uipcp(&node, "b.IPCP/1", None).await;

    let res = hb.enroll(&"ghost.IPCP/1".parse().unwrap(), "lo.DIF").await;
    assert!(res.is_err());
}
