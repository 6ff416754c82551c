// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present rinode Contributors

//! Link-state lower-flow database and route computation
//!
//! Every enrolled pair of IPCPs contributes a pair of directed edges to
//! the database. Entries age until refreshed by the periodic sync, which
//! rebroadcasts the locally rooted edges with bumped sequence numbers.
//! After every change a shortest-path run over the symmetric subgraph
//! yields next hops, which are resolved to management-flow ports and
//! installed into the kernel forwarding table.

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cdap::{CdapMessage, CdapOpCode, obj_class, obj_name};
use crate::error::Result;
use crate::msg::{CtrlMsg, MsgBody};
use crate::pci::{Addr, PortId};
use crate::rib::UipcpRib;

/// Period of the age increment task.
pub const AGE_INCR_INTERVAL: Duration = Duration::from_secs(2);
/// Period of the lower-flow rebroadcast task.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(30);
/// Entries per sync message.
pub const ENTRIES_PER_MSG: usize = 10;

/// One directed edge of the link-state graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LowerFlow {
    pub local_addr: Addr,
    pub remote_addr: Addr,
    pub cost: u32,
    pub seqnum: u64,
    pub up: bool,
    /// Seconds since the entry was last refreshed; local bookkeeping,
    /// reset on reception.
    pub age: u64,
}

impl UipcpRib {
    /// Commits the edge pair for a freshly enrolled adjacency.
    pub(crate) async fn lfdb_commit_edge(&mut self, a: Addr, b: Addr) {
        for (local, remote) in [(a, b), (b, a)] {
            let entry = self
                .lfdb
                .entry((local, remote))
                .or_insert_with(|| LowerFlow {
                    local_addr: local,
                    remote_addr: remote,
                    cost: 1,
                    seqnum: 0,
                    up: true,
                    age: 0,
                });
            entry.seqnum += 1;
            entry.up = true;
            entry.age = 0;
        }
        debug!(a, b, "lower flow committed");
        self.lfdb_broadcast(None).await;
        self.routes_recompute().await;
    }

    /// Drops both directions of an adjacency.
    pub(crate) async fn lfdb_remove_edge(&mut self, a: Addr, b: Addr) {
        self.lfdb.remove(&(a, b));
        self.lfdb.remove(&(b, a));
        self.routes_recompute().await;
    }

    /// The 2-second aging tick.
    pub(crate) fn lfdb_age_incr(&mut self) {
        for lf in self.lfdb.values_mut() {
            lf.age += AGE_INCR_INTERVAL.as_secs();
        }
    }

    /// The 30-second sync tick: refresh and rebroadcast the edges rooted
    /// at this node.
    pub(crate) async fn lfdb_sync(&mut self) {
        let my_addr = self.addr();
        if my_addr == 0 {
            return;
        }
        let mut refreshed = Vec::new();
        for lf in self.lfdb.values_mut() {
            if lf.local_addr == my_addr {
                lf.seqnum += 1;
                lf.age = 0;
                refreshed.push(lf.clone());
            }
        }
        if refreshed.is_empty() {
            return;
        }
        for port in self.enrolled_mgmt_ports(None) {
            self.lfdb_send_entries(port, &refreshed).await;
        }
    }

    /// Pushes the whole database to one management flow, in batches.
    pub(crate) async fn lfdb_sync_port(&mut self, port: PortId) {
        let all: Vec<LowerFlow> = self.lfdb.values().cloned().collect();
        self.lfdb_send_entries(port, &all).await;
    }

    async fn lfdb_send_entries(&mut self, port: PortId, entries: &[LowerFlow]) {
        for chunk in entries.chunks(ENTRIES_PER_MSG) {
            let invoke_id = self.invoke_id();
            let msg = match CdapMessage::new(CdapOpCode::MCreate, obj_class::LFDB, obj_name::LFDB)
                .with_invoke_id(invoke_id)
                .with_obj(&chunk.to_vec())
            {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(error = %e, "could not encode lower-flow batch");
                    return;
                }
            };
            if let Err(e) = self.mgmt_send_port(port, &msg) {
                debug!(port, error = %e, "lower-flow sync failed");
                return;
            }
        }
    }

    /// Broadcast the whole database to every enrolled neighbor, except
    /// the given flow.
    async fn lfdb_broadcast(&mut self, exclude_port: Option<PortId>) {
        let all: Vec<LowerFlow> = self.lfdb.values().cloned().collect();
        for port in self.enrolled_mgmt_ports(exclude_port) {
            self.lfdb_send_entries(port, &all).await;
        }
    }

    /// Incoming link-state gossip: last-writer-wins by sequence number,
    /// with propagation of genuine updates.
    pub(crate) async fn lfdb_create_rx(&mut self, msg: CdapMessage, port: PortId) -> Result<()> {
        let entries: Vec<LowerFlow> = msg.obj()?;
        let mut updated = Vec::new();
        for mut lf in entries {
            let key = (lf.local_addr, lf.remote_addr);
            let fresh = match self.lfdb.get(&key) {
                Some(existing) => lf.seqnum > existing.seqnum,
                None => true,
            };
            if fresh {
                lf.age = 0;
                self.lfdb.insert(key, lf.clone());
                updated.push(lf);
            }
        }
        if updated.is_empty() {
            // Stale gossip dies here.
            return Ok(());
        }
        for other in self.enrolled_mgmt_ports(Some(port)) {
            self.lfdb_send_entries(other, &updated).await;
        }
        self.routes_recompute().await;
        Ok(())
    }

    // ---- route computation ----------------------------------------------

    /// Shortest paths over edges whose inverse is present, then push the
    /// resulting next hops into the kernel forwarding table.
    pub(crate) async fn routes_recompute(&mut self) {
        let my_addr = self.addr();
        if my_addr == 0 {
            return;
        }
        let next_hops = compute_next_hops(&self.lfdb, my_addr);

        // Resolve each next hop to the management flow of that neighbor.
        let mut port_of_addr: HashMap<Addr, PortId> = HashMap::new();
        for n in self.neighbors.values() {
            let Some(port) = n.mgmt_port else { continue };
            if let Some(c) = self.candidates.get(&n.name) {
                port_of_addr.insert(c.address, port);
            }
        }

        let mut rows: Vec<(Addr, PortId)> = Vec::new();
        for (dst, hop) in &next_hops {
            match port_of_addr.get(hop) {
                Some(port) => rows.push((*dst, *port)),
                None => debug!(dst, hop, "next hop has no management flow yet"),
            }
        }
        rows.sort_unstable();

        let event_id = self.event_id();
        if let Err(e) = self
            .kernel_send(CtrlMsg::new(
                event_id,
                MsgBody::IpcpPduftFlush {
                    ipcp_id: self.ipcp_id,
                },
            ))
            .await
        {
            warn!(error = %e, "forwarding table flush failed");
            return;
        }
        for (dst, port) in rows {
            let event_id = self.event_id();
            if let Err(e) = self
                .kernel_send(CtrlMsg::new(
                    event_id,
                    MsgBody::IpcpPduftSet {
                        ipcp_id: self.ipcp_id,
                        dst_addr: dst,
                        local_port: port,
                    },
                ))
                .await
            {
                warn!(dst, port, error = %e, "forwarding row install failed");
            }
        }
    }
}

/// Dijkstra from `src` over the symmetric subgraph. Returns, per
/// reachable destination, the first hop on a shortest path.
pub(crate) fn compute_next_hops(
    lfdb: &HashMap<(Addr, Addr), LowerFlow>,
    src: Addr,
) -> HashMap<Addr, Addr> {
    // Only edges whose inverse is also advertised count.
    let mut adj: HashMap<Addr, Vec<(Addr, u64)>> = HashMap::new();
    for lf in lfdb.values() {
        if !lf.up {
            continue;
        }
        if lfdb
            .get(&(lf.remote_addr, lf.local_addr))
            .is_some_and(|rev| rev.up)
        {
            adj.entry(lf.local_addr)
                .or_default()
                .push((lf.remote_addr, lf.cost as u64));
        }
    }

    #[derive(PartialEq, Eq)]
    struct Visit {
        dist: u64,
        addr: Addr,
    }
    impl Ord for Visit {
        fn cmp(&self, other: &Self) -> std::cmp::Ordering {
            // Min-heap by distance.
            other
                .dist
                .cmp(&self.dist)
                .then_with(|| other.addr.cmp(&self.addr))
        }
    }
    impl PartialOrd for Visit {
        fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
            Some(self.cmp(other))
        }
    }

    let mut dist: HashMap<Addr, u64> = HashMap::new();
    let mut first_hop: HashMap<Addr, Addr> = HashMap::new();
    let mut visited: HashSet<Addr> = HashSet::new();
    let mut heap = BinaryHeap::new();

    dist.insert(src, 0);
    heap.push(Visit {
        dist: 0,
        addr: src,
    });

    while let Some(Visit { dist: d, addr }) = heap.pop() {
        if !visited.insert(addr) {
            continue;
        }
        let Some(edges) = adj.get(&addr) else { continue };
        for &(next, cost) in edges {
            let nd = d + cost;
            if dist.get(&next).is_none_or(|&cur| nd < cur) {
                dist.insert(next, nd);
                // The first hop is inherited along the path.
                let hop = if addr == src {
                    next
                } else {
                    match first_hop.get(&addr) {
                        Some(hop) => *hop,
                        None => continue,
                    }
                };
                first_hop.insert(next, hop);
                heap.push(Visit {
                    dist: nd,
                    addr: next,
                });
            }
        }
    }

    first_hop.remove(&src);
    first_hop
}
