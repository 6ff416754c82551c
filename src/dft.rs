// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present rinode Contributors

//! Directory forwarding table
//!
//! Maps application names to the address of the IPCP they are registered
//! on. Entries gossip between enrolled neighbors and converge under
//! last-writer-wins by timestamp; deletions are propagated
//! unconditionally.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cdap::{CdapMessage, CdapOpCode, obj_class, obj_name};
use crate::error::Result;
use crate::pci::{Addr, PortId};
use crate::rib::{UipcpRib, now_ms};

/// One directory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DftEntry {
    pub appl_name: String,
    pub address: Addr,
    /// Milliseconds since the epoch; newer wins.
    pub timestamp: u64,
    /// The application is registered on this node.
    pub local: bool,
}

impl UipcpRib {
    /// Upserts an entry (locally triggered, e.g. by an application
    /// registration) and tells every enrolled neighbor.
    pub(crate) async fn dft_set(&mut self, appl_name: &str, address: Addr, local: bool) {
        let entry = DftEntry {
            appl_name: appl_name.to_string(),
            address,
            timestamp: now_ms(),
            local,
        };
        info!(appl = appl_name, address, "directory entry set");
        self.dft.insert(appl_name.to_string(), entry.clone());
        self.dft_broadcast(CdapOpCode::MCreate, vec![entry], None).await;
    }

    /// Removes an entry and propagates the deletion.
    pub(crate) async fn dft_remove(&mut self, appl_name: &str) {
        if let Some(entry) = self.dft.remove(appl_name) {
            info!(appl = appl_name, "directory entry removed");
            self.dft_broadcast(CdapOpCode::MDelete, vec![entry], None)
                .await;
        }
    }

    /// Resolves a name to the address it is registered at.
    pub(crate) fn dft_lookup(&self, appl_name: &str) -> Option<Addr> {
        self.dft.get(appl_name).map(|e| e.address)
    }

    /// Pushes the whole table to one flow (initial sync).
    pub(crate) async fn dft_sync_port(&mut self, port: PortId) {
        let entries: Vec<DftEntry> = self.dft.values().cloned().collect();
        if entries.is_empty() {
            return;
        }
        let invoke_id = self.invoke_id();
        if let Ok(msg) = CdapMessage::new(CdapOpCode::MCreate, obj_class::DFT, obj_name::DFT)
            .with_invoke_id(invoke_id)
            .with_obj(&entries)
        {
            let _ = self.mgmt_send_port(port, &msg);
        }
    }

    async fn dft_broadcast(
        &mut self,
        op: CdapOpCode,
        entries: Vec<DftEntry>,
        exclude_port: Option<PortId>,
    ) {
        if entries.is_empty() {
            return;
        }
        let invoke_id = self.invoke_id();
        let msg = match CdapMessage::new(op, obj_class::DFT, obj_name::DFT)
            .with_invoke_id(invoke_id)
            .with_obj(&entries)
        {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "could not encode directory slice");
                return;
            }
        };
        for port in self.enrolled_mgmt_ports(exclude_port) {
            if let Err(e) = self.mgmt_send_port(port, &msg) {
                debug!(port, error = %e, "directory gossip failed");
            }
        }
    }

    /// Incoming `M_CREATE(dft)`: merge newer entries, forward what
    /// actually changed to the other neighbors.
    pub(crate) async fn dft_create_rx(&mut self, msg: CdapMessage, port: PortId) -> Result<()> {
        let entries: Vec<DftEntry> = msg.obj()?;
        let mut updated = Vec::new();
        for mut entry in entries {
            entry.local = false;
            let fresh = match self.dft.get(&entry.appl_name) {
                Some(existing) => entry.timestamp > existing.timestamp,
                None => true,
            };
            if fresh {
                self.dft.insert(entry.appl_name.clone(), entry.clone());
                updated.push(entry);
            }
        }
        // Stale replays never reinstate an overwritten mapping, and do
        // not propagate further.
        if !updated.is_empty() {
            self.dft_broadcast(CdapOpCode::MCreate, updated, Some(port))
                .await;
        }
        Ok(())
    }

    /// Incoming `M_DELETE(dft)`: drop unconditionally and propagate.
    pub(crate) async fn dft_delete_rx(&mut self, msg: CdapMessage, port: PortId) -> Result<()> {
        let entries: Vec<DftEntry> = msg.obj()?;
        let mut removed = Vec::new();
        for entry in entries {
            if self.dft.remove(&entry.appl_name).is_some() {
                removed.push(entry);
            }
        }
        if !removed.is_empty() {
            self.dft_broadcast(CdapOpCode::MDelete, removed, Some(port))
                .await;
        }
        Ok(())
    }
}
