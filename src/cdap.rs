// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present rinode Contributors

//! CDAP-like application protocol
//!
//! Peer IPCPs talk over management flows with a small object-oriented
//! protocol: an operation code, an invoke id for request/response
//! matching, an object class and name, a result, and an optional nested
//! object value. The nested encoding is postcard throughout; the
//! messages themselves travel as postcard records inside management
//! PDUs.
//!
//! Messages between IPCPs that do not share a direct management flow are
//! wrapped in an `a_data` envelope carrying the source and destination
//! addresses, and relayed hop by hop.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};
use crate::names::ApplName;
use crate::pci::Addr;

/// CDAP operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CdapOpCode {
    MConnect,
    MConnectR,
    MStart,
    MStartR,
    MStop,
    MStopR,
    MCreate,
    MCreateR,
    MDelete,
    MDeleteR,
    MRead,
    MReadR,
    MWrite,
    MRelease,
}

impl CdapOpCode {
    /// The response code matching a request code, if the operation is
    /// confirmed.
    pub fn response(self) -> Option<CdapOpCode> {
        use CdapOpCode::*;
        match self {
            MConnect => Some(MConnectR),
            MStart => Some(MStartR),
            MStop => Some(MStopR),
            MCreate => Some(MCreateR),
            MDelete => Some(MDeleteR),
            MRead => Some(MReadR),
            _ => None,
        }
    }

    pub fn is_response(self) -> bool {
        use CdapOpCode::*;
        matches!(self, MConnectR | MStartR | MStopR | MCreateR | MDeleteR | MReadR)
    }
}

impl fmt::Display for CdapOpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use CdapOpCode::*;
        let s = match self {
            MConnect => "M_CONNECT",
            MConnectR => "M_CONNECT_R",
            MStart => "M_START",
            MStartR => "M_START_R",
            MStop => "M_STOP",
            MStopR => "M_STOP_R",
            MCreate => "M_CREATE",
            MCreateR => "M_CREATE_R",
            MDelete => "M_DELETE",
            MDeleteR => "M_DELETE_R",
            MRead => "M_READ",
            MReadR => "M_READ_R",
            MWrite => "M_WRITE",
            MRelease => "M_RELEASE",
        };
        write!(f, "{}", s)
    }
}

/// Well-known object classes.
pub mod obj_class {
    pub const ADATA: &str = "a_data";
    pub const DFT: &str = "dft";
    pub const NEIGHBORS: &str = "neighbors";
    pub const ENROLLMENT: &str = "enrollment";
    pub const STATUS: &str = "operational_status";
    pub const ADDRESS: &str = "address";
    /// Lower Flow DB.
    pub const LFDB: &str = "fsodb";
    /// Supported flows.
    pub const FLOWS: &str = "flows";
    pub const FLOW: &str = "flow";
    pub const KEEPALIVE: &str = "keepalive";
}

/// Well-known object names.
pub mod obj_name {
    pub const ADATA: &str = "a_data";
    pub const DFT: &str = "/dif/mgmt/fa/dft";
    pub const NEIGHBORS: &str = "/daf/mgmt/neighbors";
    pub const ENROLLMENT: &str = "/daf/mgmt/enrollment";
    pub const STATUS: &str = "/daf/mgmt/operational_status";
    pub const ADDRESS: &str = "/daf/mgmt/naming/address";
    pub const LFDB: &str = "/dif/mgmt/pduft/linkstate/fsodb";
    pub const FLOWS: &str = "/dif/ra/fa/flows";
    pub const KEEPALIVE: &str = "/daf/mgmt/keepalive";
}

/// One CDAP message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdapMessage {
    pub op_code: CdapOpCode,
    /// Request/response correlation; 0 for unconfirmed operations.
    pub invoke_id: u32,
    pub obj_class: String,
    pub obj_name: String,
    /// 0 is success.
    pub result: i32,
    pub result_reason: Option<String>,
    /// Nested object value, postcard-encoded by the caller.
    pub obj_value: Option<Vec<u8>>,
    /// Source application name; meaningful on M_CONNECT.
    pub src_appl: Option<ApplName>,
    /// Destination application name; meaningful on M_CONNECT.
    pub dst_appl: Option<ApplName>,
}

impl CdapMessage {
    pub fn new(op_code: CdapOpCode, obj_class: &str, obj_name: &str) -> Self {
        Self {
            op_code,
            invoke_id: 0,
            obj_class: obj_class.to_string(),
            obj_name: obj_name.to_string(),
            result: 0,
            result_reason: None,
            obj_value: None,
            src_appl: None,
            dst_appl: None,
        }
    }

    pub fn with_invoke_id(mut self, invoke_id: u32) -> Self {
        self.invoke_id = invoke_id;
        self
    }

    /// Attaches a postcard-encoded object value.
    pub fn with_obj<T: Serialize>(mut self, obj: &T) -> Result<Self> {
        self.obj_value = Some(postcard::to_allocvec(obj)?);
        Ok(self)
    }

    /// Decodes the nested object value.
    pub fn obj<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        let bytes = self.obj_value.as_deref().ok_or_else(|| {
            Error::InvalidArgument(format!(
                "{} on '{}' carries no object value",
                self.op_code, self.obj_name
            ))
        })?;
        Ok(postcard::from_bytes(bytes)?)
    }

    /// Builds the response message for this request.
    pub fn response(&self, result: i32, reason: Option<String>) -> Result<Self> {
        let op_code = self.op_code.response().ok_or_else(|| {
            Error::InvalidArgument(format!("{} is not a confirmed operation", self.op_code))
        })?;
        Ok(Self {
            op_code,
            invoke_id: self.invoke_id,
            obj_class: self.obj_class.clone(),
            obj_name: self.obj_name.clone(),
            result,
            result_reason: reason,
            obj_value: None,
            src_appl: None,
            dst_appl: None,
        })
    }

    pub fn is_success(&self) -> bool {
        self.result == 0
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// Envelope for address-routed CDAP messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AData {
    pub src_addr: Addr,
    pub dst_addr: Addr,
    pub cdap: Vec<u8>,
}

impl AData {
    /// Wraps an inner message for address routing.
    pub fn wrap(src_addr: Addr, dst_addr: Addr, inner: &CdapMessage) -> Result<CdapMessage> {
        let env = AData {
            src_addr,
            dst_addr,
            cdap: inner.serialize()?,
        };
        CdapMessage::new(CdapOpCode::MWrite, obj_class::ADATA, obj_name::ADATA).with_obj(&env)
    }

    /// Returns the envelope if `msg` is an a_data wrapper.
    pub fn unwrap(msg: &CdapMessage) -> Option<Result<AData>> {
        if msg.obj_class == obj_class::ADATA && msg.obj_name == obj_name::ADATA {
            Some(msg.obj::<AData>())
        } else {
            None
        }
    }

    pub fn inner(&self) -> Result<CdapMessage> {
        CdapMessage::parse(&self.cdap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_round_trip() {
        let msg = CdapMessage::new(CdapOpCode::MCreate, obj_class::DFT, obj_name::DFT)
            .with_invoke_id(9)
            .with_obj(&vec![1u32, 2, 3])
            .unwrap();
        let bytes = msg.serialize().unwrap();
        let parsed = CdapMessage::parse(&bytes).unwrap();
        assert_eq!(parsed.op_code, CdapOpCode::MCreate);
        assert_eq!(parsed.invoke_id, 9);
        assert_eq!(parsed.obj::<Vec<u32>>().unwrap(), vec![1, 2, 3]);
        // Byte-stable across a decode/encode cycle.
        assert_eq!(parsed.serialize().unwrap(), bytes);
    }

    #[test]
    fn test_response_builder() {
        let req = CdapMessage::new(CdapOpCode::MStart, obj_class::ENROLLMENT, obj_name::ENROLLMENT)
            .with_invoke_id(4);
        let resp = req.response(0, None).unwrap();
        assert_eq!(resp.op_code, CdapOpCode::MStartR);
        assert_eq!(resp.invoke_id, 4);
        assert!(resp.is_success());

        let rejected = req.response(-1, Some("nope".to_string())).unwrap();
        assert!(!rejected.is_success());

        // Unconfirmed operations have no response form.
        let rel = CdapMessage::new(CdapOpCode::MRelease, "", "");
        assert!(rel.response(0, None).is_err());
    }

    #[test]
    fn test_adata_wrap_unwrap() {
        let inner = CdapMessage::new(CdapOpCode::MCreate, obj_class::FLOW, obj_name::FLOWS)
            .with_invoke_id(11);
        let wrapped = AData::wrap(5, 9, &inner).unwrap();
        let env = AData::unwrap(&wrapped).unwrap().unwrap();
        assert_eq!(env.src_addr, 5);
        assert_eq!(env.dst_addr, 9);
        let unwrapped = env.inner().unwrap();
        assert_eq!(unwrapped.op_code, CdapOpCode::MCreate);
        assert_eq!(unwrapped.invoke_id, 11);

        // A non-envelope message does not unwrap.
        assert!(AData::unwrap(&inner).is_none());
    }

    #[test]
    fn test_missing_obj_value() {
        let msg = CdapMessage::new(CdapOpCode::MRead, obj_class::KEEPALIVE, obj_name::KEEPALIVE);
        assert!(msg.obj::<u32>().is_err());
    }
}
