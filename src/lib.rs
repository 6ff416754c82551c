// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present rinode Contributors

//! rinode: a recursive inter-process communication substrate.
//!
//! Applications bind names and receive flows; flows are carried by IPC
//! processes grouped into DIFs, each possibly stacked on flows of a lower
//! DIF, down to a shim over loopback or UDP. The crate provides the
//! per-node registries and control protocol, the "normal" data-transfer
//! engine with flow control and retransmission, the shim engines, and
//! the user-space enrollment/routing/directory machinery driven by a
//! CDAP-like protocol.

pub mod bitmap;
pub mod cdap;
pub mod config;
pub mod ctrl;
pub mod dft;
pub mod dtp;
pub mod enroll;
pub mod error;
pub mod fa;
pub mod flow;
pub mod flowspec;
pub mod ipcp;
pub mod lfdb;
pub mod msg;
pub mod names;
pub mod node;
pub mod normal;
pub mod pci;
mod rib;
pub mod shim_loopback;
pub mod shim_udp;
pub mod timer;
pub mod uipcp;
pub mod upqueue;
mod wire;

pub use cdap::{AData, CdapMessage, CdapOpCode};
pub use ctrl::{CtrlHandle, FlowHandle};
pub use error::{Error, Result};
pub use flow::{Flow, FlowState, Upper};
pub use flowspec::{FlowConfig, FlowSpec, FlowStats};
pub use ipcp::{Ipcp, IpcpOps};
pub use msg::{CtrlMsg, MsgBody, MsgType, UpdateKind};
pub use names::ApplName;
pub use node::{Dif, IpcpInfo, Node};
pub use pci::{Addr, CepId, Pdu, PortId, SeqNum};
pub use uipcp::{Uipcp, UipcpHandle};
