// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present rinode Contributors

//! Protocol control information and PDU framing
//!
//! Every PDU travelling between normal IPCPs carries a fixed PCI header;
//! control PDUs extend it with window and acknowledgement state. The wire
//! layout is little endian and round-trips byte-identically.

use crate::error::{Error, Result};
use crate::wire::{WireReader, WireWriter};

/// Node address inside a DIF. Zero means "no address".
pub type Addr = u64;
/// Per-flow port identifier, local to a node.
pub type PortId = u16;
/// Connection endpoint identifier, local to a normal IPCP pair.
pub type CepId = u32;
/// Data-transfer sequence number.
pub type SeqNum = u64;

/// Data transfer PDU.
pub const PDU_T_DT: u8 = 0x80;
/// Management PDU, delivered to the user-space IPCP.
pub const PDU_T_MGMT: u8 = 0x40;
/// Control PDU family marker; subtypes live in the low bits.
pub const PDU_T_CTRL_MASK: u8 = 0x10;
/// Control subtype: carries an acknowledgement field.
pub const PDU_T_ACK_BIT: u8 = 0x08;
/// Control subtype: carries flow-control window updates.
pub const PDU_T_FC_BIT: u8 = 0x04;
/// Selector for the ack flavor under [`PDU_T_ACK_BIT`].
pub const PDU_T_ACK_MASK: u8 = 0x03;
pub const PDU_T_ACK: u8 = 0x00;
pub const PDU_T_NACK: u8 = 0x01;
pub const PDU_T_SACK: u8 = 0x02;
pub const PDU_T_SNACK: u8 = 0x03;

/// Data-run flag: the sender started a new run, receiver state resets.
pub const PDU_F_DRF: u8 = 0x01;

/// Size of the fixed PCI header on the wire.
pub const PCI_LEN: usize = 38;
/// Additional bytes carried by control PDUs.
pub const PCI_CTRL_LEN: usize = 48;

/// The fixed header prefixed to every PDU.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pci {
    pub dst_addr: Addr,
    pub src_addr: Addr,
    pub qos_id: u16,
    pub dst_cep: CepId,
    pub src_cep: CepId,
    pub pdu_type: u8,
    pub pdu_flags: u8,
    /// Total PDU length, header included.
    pub pdu_len: u16,
    pub seqnum: SeqNum,
}

/// The extension header carried by control PDUs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PciCtrl {
    pub last_ctrl_seq_rcvd: SeqNum,
    pub ack_nack_seq: SeqNum,
    pub new_lwe: SeqNum,
    pub new_rwe: SeqNum,
    pub my_lwe: SeqNum,
    pub my_rwe: SeqNum,
}

/// A full PDU: PCI, optional control extension, payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pdu {
    pub pci: Pci,
    /// Present exactly when `pci.pdu_type` has [`PDU_T_CTRL_MASK`] set.
    pub ctrl: Option<PciCtrl>,
    pub payload: Vec<u8>,
}

impl Pdu {
    /// Builds a data PDU. The length field is filled in.
    pub fn new_data(
        src_addr: Addr,
        dst_addr: Addr,
        src_cep: CepId,
        dst_cep: CepId,
        seqnum: SeqNum,
        payload: Vec<u8>,
    ) -> Self {
        let mut pdu = Pdu {
            pci: Pci {
                dst_addr,
                src_addr,
                qos_id: 0,
                dst_cep,
                src_cep,
                pdu_type: PDU_T_DT,
                pdu_flags: 0,
                pdu_len: 0,
                seqnum,
            },
            ctrl: None,
            payload,
        };
        pdu.pci.pdu_len = pdu.wire_len() as u16;
        pdu
    }

    /// Builds a management PDU. Management PDUs carry no meaningful
    /// sequence number.
    pub fn new_mgmt(src_addr: Addr, dst_addr: Addr, payload: Vec<u8>) -> Self {
        let mut pdu = Pdu {
            pci: Pci {
                dst_addr,
                src_addr,
                pdu_type: PDU_T_MGMT,
                ..Default::default()
            },
            ctrl: None,
            payload,
        };
        pdu.pci.pdu_len = pdu.wire_len() as u16;
        pdu
    }

    /// Builds a control PDU of the given subtype.
    pub fn new_ctrl(
        src_addr: Addr,
        dst_addr: Addr,
        src_cep: CepId,
        dst_cep: CepId,
        pdu_type: u8,
        ctrl: PciCtrl,
    ) -> Self {
        debug_assert!(pdu_type & PDU_T_CTRL_MASK != 0);
        let mut pdu = Pdu {
            pci: Pci {
                dst_addr,
                src_addr,
                qos_id: 0,
                dst_cep,
                src_cep,
                pdu_type,
                pdu_flags: 0,
                pdu_len: 0,
                seqnum: 0,
            },
            ctrl: Some(ctrl),
            payload: Vec::new(),
        };
        pdu.pci.pdu_len = pdu.wire_len() as u16;
        pdu
    }

    pub fn is_data(&self) -> bool {
        self.pci.pdu_type == PDU_T_DT
    }

    pub fn is_mgmt(&self) -> bool {
        self.pci.pdu_type == PDU_T_MGMT
    }

    pub fn is_ctrl(&self) -> bool {
        self.pci.pdu_type & PDU_T_CTRL_MASK != 0
    }

    pub fn has_drf(&self) -> bool {
        self.pci.pdu_flags & PDU_F_DRF != 0
    }

    pub fn set_drf(&mut self) {
        self.pci.pdu_flags |= PDU_F_DRF;
    }

    /// Length of the serialized PDU.
    pub fn wire_len(&self) -> usize {
        let mut len = PCI_LEN + self.payload.len();
        if self.is_ctrl() {
            len += PCI_CTRL_LEN;
        }
        len
    }

    /// Serializes PCI, control extension and payload.
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u64(self.pci.dst_addr);
        w.put_u64(self.pci.src_addr);
        w.put_u16(self.pci.qos_id);
        w.put_u32(self.pci.dst_cep);
        w.put_u32(self.pci.src_cep);
        w.put_u8(self.pci.pdu_type);
        w.put_u8(self.pci.pdu_flags);
        w.put_u16(self.pci.pdu_len);
        w.put_u64(self.pci.seqnum);
        if let Some(c) = &self.ctrl {
            w.put_u64(c.last_ctrl_seq_rcvd);
            w.put_u64(c.ack_nack_seq);
            w.put_u64(c.new_lwe);
            w.put_u64(c.new_rwe);
            w.put_u64(c.my_lwe);
            w.put_u64(c.my_rwe);
        }
        w.put_bytes(&self.payload);
        w.into_vec()
    }

    /// Parses a PDU from the wire. The declared length must match the
    /// buffer length.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(buf);
        let pci = Pci {
            dst_addr: r.get_u64()?,
            src_addr: r.get_u64()?,
            qos_id: r.get_u16()?,
            dst_cep: r.get_u32()?,
            src_cep: r.get_u32()?,
            pdu_type: r.get_u8()?,
            pdu_flags: r.get_u8()?,
            pdu_len: r.get_u16()?,
            seqnum: r.get_u64()?,
        };
        if pci.pdu_len as usize != buf.len() {
            return Err(Error::InvalidArgument(format!(
                "PDU length field {} does not match buffer length {}",
                pci.pdu_len,
                buf.len()
            )));
        }
        let ctrl = if pci.pdu_type & PDU_T_CTRL_MASK != 0 {
            Some(PciCtrl {
                last_ctrl_seq_rcvd: r.get_u64()?,
                ack_nack_seq: r.get_u64()?,
                new_lwe: r.get_u64()?,
                new_rwe: r.get_u64()?,
                my_lwe: r.get_u64()?,
                my_rwe: r.get_u64()?,
            })
        } else {
            None
        };
        let payload = r.rest().to_vec();
        Ok(Pdu { pci, ctrl, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_pdu_round_trip() {
        let pdu = Pdu::new_data(1, 2, 10, 20, 7, b"hello".to_vec());
        let bytes = pdu.serialize();
        assert_eq!(bytes.len(), PCI_LEN + 5);
        let parsed = Pdu::parse(&bytes).unwrap();
        assert_eq!(parsed, pdu);
        assert_eq!(parsed.serialize(), bytes);
    }

    #[test]
    fn test_ctrl_pdu_round_trip() {
        let ctrl = PciCtrl {
            last_ctrl_seq_rcvd: 3,
            ack_nack_seq: 41,
            new_lwe: 42,
            new_rwe: 100,
            my_lwe: 5,
            my_rwe: 6,
        };
        let pdu = Pdu::new_ctrl(
            9,
            8,
            1,
            2,
            PDU_T_CTRL_MASK | PDU_T_ACK_BIT | PDU_T_ACK | PDU_T_FC_BIT,
            ctrl.clone(),
        );
        let bytes = pdu.serialize();
        assert_eq!(bytes.len(), PCI_LEN + PCI_CTRL_LEN);
        let parsed = Pdu::parse(&bytes).unwrap();
        assert!(parsed.is_ctrl());
        assert_eq!(parsed.ctrl.as_ref().unwrap(), &ctrl);
        assert_eq!(parsed, pdu);
    }

    #[test]
    fn test_mgmt_pdu() {
        let pdu = Pdu::new_mgmt(1, 2, vec![1, 2, 3]);
        assert!(pdu.is_mgmt());
        let parsed = Pdu::parse(&pdu.serialize()).unwrap();
        assert_eq!(parsed.payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let pdu = Pdu::new_data(1, 2, 10, 20, 7, b"hello".to_vec());
        let mut bytes = pdu.serialize();
        bytes.push(0xff);
        assert!(Pdu::parse(&bytes).is_err());
    }

    #[test]
    fn test_truncated_header_rejected() {
        let pdu = Pdu::new_data(1, 2, 10, 20, 7, Vec::new());
        let bytes = pdu.serialize();
        assert!(Pdu::parse(&bytes[..PCI_LEN - 1]).is_err());
    }

    #[test]
    fn test_drf_flag() {
        let mut pdu = Pdu::new_data(1, 2, 10, 20, 0, Vec::new());
        assert!(!pdu.has_drf());
        pdu.set_drf();
        assert!(pdu.has_drf());
        let parsed = Pdu::parse(&pdu.serialize()).unwrap();
        assert!(parsed.has_drf());
    }
}
