// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present rinode Contributors

//! Data Transfer Protocol state machine
//!
//! One [`Dtp`] instance lives inside every flow of a normal IPCP. It is a
//! pure synchronous state machine: callers pass the current time in and
//! get back an [`Effects`] describing what to transmit, what to deliver
//! upward, which timers to (re)arm and whether blocked writers should be
//! woken. The async shell in the normal engine performs those effects.
//!
//! State variables follow the classic split: `snd_lwe`/`snd_rwe` bound the
//! sender window, `rcv_lwe_priv` tracks what has been delivered to the
//! upper layer while `rcv_lwe` tracks what the upper layer consumed, and
//! three queues absorb irregularities: the closed-window queue (PDUs
//! beyond the sender window), the retransmission queue (sorted by
//! sequence number) and the sequencing queue (out-of-order arrivals).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::flowspec::{
    DATA_RXMS_MAX_DEFAULT, FlowConfig, MPL_MSECS_DEFAULT, RTX_MSECS_DEFAULT,
};
use crate::pci::{
    Addr, CepId, PDU_T_ACK, PDU_T_ACK_BIT, PDU_T_ACK_MASK, PDU_T_CTRL_MASK, PDU_T_DT,
    PDU_T_FC_BIT, Pci, PciCtrl, Pdu, SeqNum,
};

/// Cap on the sequencing queue.
pub const SEQQ_MAX_LEN: usize = 64;
/// Cap on the retransmission queue.
pub const RTXQ_MAX_LEN: usize = 64;
/// Token bucket refill granularity, milliseconds.
pub const TKBK_INTVAL_MSEC: u64 = 2;

/// Timer instructions for the async shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOp {
    /// (Re)arm the retransmission timer to fire at the given instant.
    ArmRtx(Instant),
    StopRtx,
    /// (Re)arm the sender inactivity timer.
    ArmSndInact(Duration),
    StopSndInact,
    /// (Re)arm the receiver inactivity timer.
    ArmRcvInact(Duration),
}

/// Counter deltas produced by one DTP operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsDelta {
    pub tx_pdu: u64,
    pub tx_byte: u64,
    pub tx_err: u64,
    pub rx_pdu: u64,
    pub rx_byte: u64,
    pub rx_err: u64,
}

/// What the shell must do after a DTP operation.
#[derive(Debug, Default)]
pub struct Effects {
    /// PDUs to hand to the relaying stage, in order.
    pub transmit: Vec<Pdu>,
    /// Data PDUs to deliver upward, in sequence order.
    pub deliver: Vec<Pdu>,
    pub timers: Vec<TimerOp>,
    /// Writers blocked on the window may make progress.
    pub wake_writers: bool,
    pub stats: StatsDelta,
}

/// Outcome of a write attempt.
#[derive(Debug)]
pub enum WriteOutcome {
    Accepted(Effects),
    /// The write cannot proceed right now. `wait` carries the shaping
    /// interval when the token bucket gated the write; `None` means the
    /// caller must wait for a window/queue update.
    WouldBlock {
        effects: Effects,
        wait: Option<Duration>,
    },
}

#[derive(Debug)]
struct RtxEntry {
    pdu: Pdu,
    /// Next retransmission deadline.
    rtx_time: Instant,
}

#[derive(Debug)]
struct TokenBucket {
    bucket: u64,
    bucket_size: u64,
    intval: Duration,
    last_refill: Instant,
    /// Bytes per second after the minimum-rate clamp.
    byte_rate: u64,
}

/// Per-flow data transfer state.
#[derive(Debug)]
pub struct Dtp {
    cfg: FlowConfig,

    local_addr: Addr,
    remote_addr: Addr,
    local_cep: CepId,
    remote_cep: CepId,

    drf_set: bool,
    drf_expected: bool,

    // Send side.
    next_seq_num_to_send: SeqNum,
    snd_lwe: SeqNum,
    snd_rwe: SeqNum,
    last_seq_num_sent: Option<SeqNum>,
    next_snd_ctl_seq: SeqNum,
    cwq: VecDeque<Pdu>,
    rtxq: Vec<RtxEntry>,

    // Receive side.
    rcv_lwe: SeqNum,
    rcv_lwe_priv: SeqNum,
    rcv_rwe: SeqNum,
    max_seq_num_rcvd: Option<SeqNum>,
    last_snd_data_ack: SeqNum,
    last_ctrl_seq_num_rcvd: Option<SeqNum>,
    seqq: Vec<Pdu>,

    // Derived configuration.
    mpl_r_a: Duration,
    rtx_int: Duration,
    max_cwq_len: usize,
    max_rtxq_len: usize,
    tkbk: Option<TokenBucket>,

    rtx_armed: bool,
}

impl Dtp {
    /// Initializes data transfer state from the flow configuration.
    /// `max_pdu_life_ms` comes from the DIF; zero selects the default.
    pub fn new(cfg: FlowConfig, max_pdu_life_ms: u32, now: Instant) -> Self {
        let mut cfg = cfg;
        let mpl = if max_pdu_life_ms > 0 {
            max_pdu_life_ms
        } else {
            MPL_MSECS_DEFAULT
        };
        if cfg.dtcp.rtx_control && cfg.dtcp.rtx.initial_tr == 0 {
            cfg.dtcp.rtx.initial_tr = RTX_MSECS_DEFAULT;
        }
        if cfg.dtcp.rtx_control && cfg.dtcp.rtx.data_rxms_max == 0 {
            cfg.dtcp.rtx.data_rxms_max = DATA_RXMS_MAX_DEFAULT;
        }
        let r = cfg.dtcp.rtx.initial_tr as u64 * cfg.dtcp.rtx.data_rxms_max as u64;
        let mpl_r_a = Duration::from_millis(mpl as u64 + r + cfg.dtcp.initial_a as u64);

        let tkbk = if cfg.dtcp.bandwidth > 0 {
            // M := refill interval, R := rate. The bucket holds R*M worth
            // of bytes; very low rates stretch the interval instead.
            let mut bw = cfg.dtcp.bandwidth;
            if bw < 4000 {
                bw = 4000;
            }
            let intval_ms = if bw < 2_000_000 / TKBK_INTVAL_MSEC {
                2_000_000 / bw
            } else {
                TKBK_INTVAL_MSEC
            };
            let bucket_size = (bw / 8) * intval_ms / 1000;
            Some(TokenBucket {
                bucket: bucket_size.max(1),
                bucket_size: bucket_size.max(1),
                intval: Duration::from_millis(intval_ms),
                last_refill: now,
                byte_rate: bw / 8,
            })
        } else {
            None
        };

        let max_cwq_len = if cfg.dtcp.win.max_cwq_len > 0 {
            cfg.dtcp.win.max_cwq_len as usize
        } else {
            RTXQ_MAX_LEN
        };

        let rtx_int = Duration::from_millis(cfg.dtcp.rtx.initial_tr as u64);
        let mut dtp = Self {
            cfg,
            local_addr: 0,
            remote_addr: 0,
            local_cep: 0,
            remote_cep: 0,
            drf_set: false,
            drf_expected: false,
            next_seq_num_to_send: 0,
            snd_lwe: 0,
            snd_rwe: 0,
            last_seq_num_sent: None,
            next_snd_ctl_seq: 0,
            cwq: VecDeque::new(),
            rtxq: Vec::new(),
            rcv_lwe: 0,
            rcv_lwe_priv: 0,
            rcv_rwe: 0,
            max_seq_num_rcvd: None,
            last_snd_data_ack: 0,
            last_ctrl_seq_num_rcvd: None,
            seqq: Vec::new(),
            mpl_r_a,
            rtx_int,
            max_cwq_len,
            max_rtxq_len: RTXQ_MAX_LEN,
            tkbk,
            rtx_armed: false,
        };
        dtp.snd_reset();
        dtp.rcv_reset();
        dtp
    }

    /// Records the addressing endpoints used to build PCI headers.
    pub fn set_endpoints(
        &mut self,
        local_addr: Addr,
        remote_addr: Addr,
        local_cep: CepId,
        remote_cep: CepId,
    ) {
        self.local_addr = local_addr;
        self.remote_addr = remote_addr;
        self.local_cep = local_cep;
        self.remote_cep = remote_cep;
    }

    pub fn cfg(&self) -> &FlowConfig {
        &self.cfg
    }

    pub fn cwq_len(&self) -> usize {
        self.cwq.len()
    }

    pub fn rtxq_len(&self) -> usize {
        self.rtxq.len()
    }

    pub fn seqq_len(&self) -> usize {
        self.seqq.len()
    }

    pub fn snd_state(&self) -> (SeqNum, Option<SeqNum>, SeqNum) {
        (self.snd_lwe, self.last_seq_num_sent, self.snd_rwe)
    }

    fn snd_reset(&mut self) {
        self.drf_set = true;
        self.next_seq_num_to_send = 0;
        self.snd_lwe = 0;
        self.snd_rwe = 0;
        self.last_seq_num_sent = None;
        self.next_snd_ctl_seq = 0;
        if self.cfg.dtcp.flow_control {
            self.snd_rwe += self.cfg.dtcp.win.initial_credit;
        }
    }

    fn rcv_reset(&mut self) {
        self.drf_expected = true;
        self.rcv_lwe = 0;
        self.rcv_lwe_priv = 0;
        self.rcv_rwe = 0;
        self.max_seq_num_rcvd = None;
        self.last_snd_data_ack = 0;
        self.last_ctrl_seq_num_rcvd = None;
        if self.cfg.dtcp.flow_control {
            self.rcv_rwe += self.cfg.dtcp.win.initial_credit;
        }
    }

    /// Builds a control PDU snapshotting the receive state.
    fn ctrl_pdu(&mut self, pdu_type: u8, ack_nack_seq: SeqNum) -> Pdu {
        let seqnum = self.next_snd_ctl_seq;
        self.next_snd_ctl_seq += 1;
        let mut pdu = Pdu::new_ctrl(
            self.local_addr,
            self.remote_addr,
            self.local_cep,
            self.remote_cep,
            pdu_type,
            PciCtrl {
                last_ctrl_seq_rcvd: self.last_ctrl_seq_num_rcvd.unwrap_or(0),
                ack_nack_seq,
                new_lwe: self.rcv_lwe,
                new_rwe: self.rcv_rwe,
                my_lwe: self.snd_lwe,
                my_rwe: self.snd_rwe,
            },
        );
        pdu.pci.seqnum = seqnum;
        pdu
    }

    /// Receive-state update: refreshes the advertised window and decides
    /// whether an acknowledgement or flow-control PDU is due. Placeholder
    /// buffer management: the credit simply slides with `rcv_lwe`.
    fn sv_update(&mut self) -> Option<Pdu> {
        if self.cfg.dtcp.flow_control {
            self.rcv_rwe = self.rcv_lwe + self.cfg.dtcp.win.initial_credit;
        }
        if self.cfg.dtcp.rtx_control {
            let ack = self.rcv_lwe.saturating_sub(1);
            let mut ty = PDU_T_CTRL_MASK | PDU_T_ACK_BIT | PDU_T_ACK;
            if self.cfg.dtcp.flow_control {
                ty |= PDU_T_FC_BIT;
            }
            Some(self.ctrl_pdu(ty, ack))
        } else if self.cfg.dtcp.flow_control {
            Some(self.ctrl_pdu(PDU_T_CTRL_MASK | PDU_T_FC_BIT, 0))
        } else {
            None
        }
    }

    fn rtxq_push(&mut self, pdu: Pdu, now: Instant, effects: &mut Effects) -> Result<()> {
        if self.rtxq.len() >= self.max_rtxq_len {
            return Err(Error::NoSpace("rtxq overrun".to_string()));
        }
        let rtx_time = now + self.rtx_int;
        if !self.rtx_armed {
            effects.timers.push(TimerOp::ArmRtx(rtx_time));
            self.rtx_armed = true;
        }
        // Entries stay sorted because sequence numbers only grow.
        self.rtxq.push(RtxEntry { pdu, rtx_time });
        Ok(())
    }

    /// Attempts to send one SDU.
    pub fn sdu_write(&mut self, now: Instant, sdu: Vec<u8>) -> WriteOutcome {
        let mut effects = Effects::default();

        // Token-bucket shaping gate.
        if let Some(tkbk) = &mut self.tkbk {
            let need = sdu.len() as u64;
            if tkbk.bucket < need {
                let elapsed = now.duration_since(tkbk.last_refill);
                if elapsed >= tkbk.intval {
                    tkbk.bucket = (tkbk.bucket
                        + tkbk.byte_rate * elapsed.as_micros() as u64 / 1_000_000)
                        .min(tkbk.bucket_size.max(need));
                    tkbk.last_refill = now;
                }
            }
            if tkbk.bucket < need {
                let wait = tkbk.intval;
                effects.timers.push(TimerOp::StopSndInact);
                return WriteOutcome::WouldBlock {
                    effects,
                    wait: Some(wait),
                };
            }
            tkbk.bucket -= need;
        }

        // Back-pressure gate: a full closed-window queue or a full
        // retransmission queue pushes back instead of dropping.
        let windowed = self.cfg.dtcp.flow_control;
        if (windowed
            && self.next_seq_num_to_send >= self.snd_rwe
            && self.cwq.len() >= self.max_cwq_len)
            || (self.cfg.dtcp.rtx_control && self.rtxq.len() >= self.max_rtxq_len)
        {
            return WriteOutcome::WouldBlock {
                effects,
                wait: None,
            };
        }

        let seqnum = self.next_seq_num_to_send;
        self.next_seq_num_to_send += 1;

        let mut pdu = Pdu {
            pci: Pci {
                dst_addr: self.remote_addr,
                src_addr: self.local_addr,
                qos_id: 0,
                dst_cep: self.remote_cep,
                src_cep: self.local_cep,
                pdu_type: PDU_T_DT,
                pdu_flags: 0,
                pdu_len: 0,
                seqnum,
            },
            ctrl: None,
            payload: sdu,
        };
        pdu.pci.pdu_len = pdu.wire_len() as u16;

        effects.stats.tx_pdu += 1;
        effects.stats.tx_byte += pdu.payload.len() as u64;

        if self.drf_set {
            self.drf_set = false;
            pdu.set_drf();
        }

        if !self.cfg.dtcp_present {
            self.snd_lwe = self.next_seq_num_to_send;
            self.last_seq_num_sent = Some(seqnum);
            effects.transmit.push(pdu);
        } else {
            let mut owned = Some(pdu);
            if windowed {
                if seqnum >= self.snd_rwe {
                    // Outside the sender window: park in the closed-window
                    // queue, ownership transfers.
                    self.cwq.push_back(owned.take().unwrap());
                } else {
                    self.snd_lwe = self.next_seq_num_to_send;
                    self.last_seq_num_sent = Some(seqnum);
                }
            }
            if let Some(pdu) = owned {
                if self.cfg.dtcp.rtx_control {
                    if let Err(_e) = self.rtxq_push(pdu.clone(), now, &mut effects) {
                        effects.stats.tx_pdu -= 1;
                        effects.stats.tx_byte -= pdu.payload.len() as u64;
                        effects.stats.tx_err += 1;
                        return WriteOutcome::WouldBlock {
                            effects,
                            wait: None,
                        };
                    }
                }
                effects.transmit.push(pdu);
            }
            if !self.rtx_armed {
                effects.timers.push(TimerOp::ArmSndInact(3 * self.mpl_r_a));
            }
        }

        WriteOutcome::Accepted(effects)
    }

    /// Handles an incoming PDU addressed to this flow.
    ///
    /// `upper_is_ipcp` selects immediate advancement of the consumed
    /// watermark: an upper IPCP consumes deliveries synchronously, an
    /// application consumes them later through `sdu_rx_consumed`.
    pub fn sdu_rx(&mut self, now: Instant, pdu: Pdu, upper_is_ipcp: bool) -> Effects {
        if pdu.is_ctrl() {
            return self.sdu_rx_ctrl(now, pdu);
        }
        let mut effects = Effects::default();
        let seqnum = pdu.pci.seqnum;

        if self.cfg.dtcp_present {
            effects.timers.push(TimerOp::ArmRcvInact(2 * self.mpl_r_a));
        }

        if self.drf_expected || pdu.has_drf() {
            // Start of a new run: even a lost DRF PDU must not strand the
            // PDUs sent after it, so an expected DRF counts as present.
            self.drf_expected = false;
            self.rcv_lwe = seqnum + 1;
            self.rcv_lwe_priv = seqnum + 1;
            self.max_seq_num_rcvd = Some(seqnum);
            self.seqq.clear();
            effects.stats.rx_pdu += 1;
            effects.stats.rx_byte += pdu.payload.len() as u64;
            effects.deliver.push(pdu);
            if let Some(crb) = self.sv_update() {
                effects.transmit.push(crb);
            }
            return effects;
        }

        if seqnum < self.rcv_lwe_priv {
            // Duplicate.
            effects.stats.rx_err += 1;
            if self.cfg.dtcp.flow_control && self.rcv_lwe >= self.last_snd_data_ack {
                let crb = self.ctrl_pdu(
                    PDU_T_CTRL_MASK | PDU_T_ACK_BIT | PDU_T_ACK | PDU_T_FC_BIT,
                    self.rcv_lwe,
                );
                self.last_snd_data_ack = self.rcv_lwe;
                effects.transmit.push(crb);
            }
            return effects;
        }

        if self.max_seq_num_rcvd.is_none_or(|m| seqnum > m) {
            self.max_seq_num_rcvd = Some(seqnum);
        }

        let gap = seqnum - self.rcv_lwe_priv;

        // A PDU that misses the gap constraint is still never dropped
        // when retransmission can fill the gap, when the A timer allows
        // late arrivals, or when the flow is completely unreliable; those
        // wait in the sequencing queue instead.
        let drop = self.cfg.dtcp_present
            && self.cfg.dtcp.initial_a == 0
            && !self.cfg.dtcp.rtx_control
            && gap > self.cfg.max_sdu_gap;
        let deliver = !drop && gap <= self.cfg.max_sdu_gap;

        if deliver {
            self.rcv_lwe_priv = seqnum + 1;
            effects.stats.rx_pdu += 1;
            effects.stats.rx_byte += pdu.payload.len() as u64;
            effects.deliver.push(pdu);
            self.seqq_pop_many(&mut effects);
            if upper_is_ipcp {
                self.rcv_lwe = self.rcv_lwe_priv;
            }
            if let Some(crb) = self.sv_update() {
                effects.transmit.push(crb);
            }
            return effects;
        }

        if drop {
            effects.stats.rx_err += 1;
        } else {
            effects.stats.rx_pdu += 1;
            effects.stats.rx_byte += pdu.payload.len() as u64;
            self.seqq_push(pdu, &mut effects);
        }
        if let Some(crb) = self.sv_update() {
            effects.transmit.push(crb);
        }
        effects
    }

    /// Sorted insert into the sequencing queue; duplicates among the gaps
    /// and overruns are dropped.
    fn seqq_push(&mut self, pdu: Pdu, effects: &mut Effects) {
        if self.seqq.len() >= SEQQ_MAX_LEN {
            effects.stats.rx_pdu -= 1;
            effects.stats.rx_byte -= pdu.payload.len() as u64;
            effects.stats.rx_err += 1;
            return;
        }
        let seqnum = pdu.pci.seqnum;
        let mut pos = self.seqq.len();
        for (i, cur) in self.seqq.iter().enumerate() {
            if seqnum < cur.pci.seqnum {
                pos = i;
                break;
            }
            if seqnum == cur.pci.seqnum {
                effects.stats.rx_pdu -= 1;
                effects.stats.rx_byte -= pdu.payload.len() as u64;
                effects.stats.rx_err += 1;
                return;
            }
        }
        self.seqq.insert(pos, pdu);
    }

    /// Pops every prefix of the sequencing queue that now satisfies the
    /// gap constraint, in sequence order.
    fn seqq_pop_many(&mut self, effects: &mut Effects) {
        let mut i = 0;
        while i < self.seqq.len() {
            if self.seqq[i].pci.seqnum - self.rcv_lwe_priv <= self.cfg.max_sdu_gap {
                let pdu = self.seqq.remove(i);
                self.rcv_lwe_priv = pdu.pci.seqnum + 1;
                effects.deliver.push(pdu);
                // Restart: earlier entries may have become eligible.
                i = 0;
            } else {
                i += 1;
            }
        }
    }

    /// Handles a control PDU.
    fn sdu_rx_ctrl(&mut self, now: Instant, pdu: Pdu) -> Effects {
        let mut effects = Effects::default();
        let Some(ctrl) = pdu.ctrl.clone() else {
            effects.stats.rx_err += 1;
            return effects;
        };
        let seqnum = pdu.pci.seqnum;

        match self.last_ctrl_seq_num_rcvd {
            Some(last) if seqnum <= last => {
                // Duplicated control PDU.
                effects.stats.rx_err += 1;
                return effects;
            }
            Some(last) if seqnum > last + 1 => {
                tracing::debug!(from = last, to = seqnum, "lost control PDUs");
            }
            _ => {}
        }
        self.last_ctrl_seq_num_rcvd = Some(seqnum);

        if pdu.pci.pdu_type & PDU_T_FC_BIT != 0 {
            if ctrl.new_rwe < self.snd_rwe {
                tracing::debug!(
                    cur = self.snd_rwe,
                    new = ctrl.new_rwe,
                    "peer moved the send window backward, ignoring"
                );
            } else {
                self.snd_rwe = ctrl.new_rwe;
                // The wider window may release parked PDUs.
                loop {
                    if self.snd_lwe >= self.snd_rwe {
                        break;
                    }
                    let Some(pdu) = self.cwq.pop_front() else { break };
                    let seq = pdu.pci.seqnum;
                    self.last_seq_num_sent = Some(seq);
                    self.snd_lwe = seq + 1;
                    if self.cfg.dtcp.rtx_control {
                        if self.rtxq_push(pdu.clone(), now, &mut effects).is_err() {
                            effects.stats.tx_err += 1;
                            continue;
                        }
                    }
                    effects.transmit.push(pdu);
                }
            }
        }

        if pdu.pci.pdu_type & PDU_T_ACK_BIT != 0 {
            match pdu.pci.pdu_type & PDU_T_ACK_MASK {
                PDU_T_ACK => {
                    let before = self.rtxq.len();
                    self.rtxq.retain(|e| e.pdu.pci.seqnum > ctrl.ack_nack_seq);
                    if self.rtxq.len() != before {
                        match self.rtxq.iter().map(|e| e.rtx_time).min() {
                            Some(next) => {
                                effects.timers.push(TimerOp::ArmRtx(next));
                                self.rtx_armed = true;
                            }
                            None => {
                                effects.timers.push(TimerOp::StopRtx);
                                self.rtx_armed = false;
                            }
                        }
                    }
                }
                other => {
                    tracing::debug!(subtype = other, "unsupported selective ack variant");
                }
            }
        }

        effects.wake_writers = true;
        effects
    }

    /// Called when the upper layer consumed a delivered SDU.
    pub fn sdu_rx_consumed(&mut self, seqnum: SeqNum) -> Effects {
        let mut effects = Effects::default();
        self.rcv_lwe = seqnum + 1;
        if let Some(crb) = self.sv_update() {
            effects.transmit.push(crb);
        }
        effects
    }

    /// Retransmission timer expiry: clone and resend everything due,
    /// then re-arm to the next pending deadline.
    pub fn rtx_timer_expired(&mut self, now: Instant) -> Effects {
        let mut effects = Effects::default();
        self.rtx_armed = false;
        let mut next: Option<Instant> = None;
        for entry in self.rtxq.iter_mut() {
            if now >= entry.rtx_time {
                entry.rtx_time += self.rtx_int;
                effects.transmit.push(entry.pdu.clone());
            }
            next = Some(match next {
                Some(n) => n.min(entry.rtx_time),
                None => entry.rtx_time,
            });
        }
        if let Some(next) = next {
            effects.timers.push(TimerOp::ArmRtx(next));
            self.rtx_armed = true;
        }
        effects.timers.push(TimerOp::ArmSndInact(3 * self.mpl_r_a));
        effects
    }

    /// Sender inactivity: reset send state and flush both send queues.
    pub fn snd_inact_expired(&mut self) -> Effects {
        let mut effects = Effects::default();
        self.snd_reset();
        self.rtxq.clear();
        self.cwq.clear();
        if self.rtx_armed {
            effects.timers.push(TimerOp::StopRtx);
            self.rtx_armed = false;
        }
        effects.wake_writers = true;
        effects
    }

    /// Receiver inactivity: reset receive state and flush the sequencing
    /// queue.
    pub fn rcv_inact_expired(&mut self) -> Effects {
        self.rcv_reset();
        self.seqq.clear();
        Effects::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowspec::FlowSpec;

    fn plain_cfg() -> FlowConfig {
        FlowConfig::from_spec(&FlowSpec::unreliable())
    }

    fn inorder_no_dtcp_cfg() -> FlowConfig {
        FlowConfig {
            max_sdu_gap: 0,
            in_order_delivery: true,
            msg_boundaries: true,
            dtcp_present: false,
            ..Default::default()
        }
    }

    fn rtx_cfg(initial_tr: u32, rxms_max: u32) -> FlowConfig {
        let mut cfg = FlowConfig::from_spec(&FlowSpec::reliable());
        cfg.dtcp.rtx.initial_tr = initial_tr;
        cfg.dtcp.rtx.data_rxms_max = rxms_max;
        cfg
    }

    fn fc_cfg(credit: u64, max_cwq: u32) -> FlowConfig {
        let mut cfg = FlowConfig::from_spec(&FlowSpec {
            flow_control: true,
            max_sdu_gap: u64::MAX,
            ..Default::default()
        });
        cfg.dtcp.win.initial_credit = credit;
        cfg.dtcp.win.max_cwq_len = max_cwq;
        cfg
    }

    fn mk(cfg: FlowConfig) -> Dtp {
        let mut dtp = Dtp::new(cfg, 0, Instant::now());
        dtp.set_endpoints(1, 2, 10, 20);
        dtp
    }

    fn write(dtp: &mut Dtp, payload: &[u8]) -> Effects {
        match dtp.sdu_write(Instant::now(), payload.to_vec()) {
            WriteOutcome::Accepted(e) => e,
            other => panic!("unexpected write outcome: {:?}", other),
        }
    }

    fn data_pdu(seqnum: SeqNum, drf: bool) -> Pdu {
        // Arrives at the receiver: src/dst mirrored.
        let mut pdu = Pdu::new_data(2, 1, 20, 10, seqnum, vec![seqnum as u8]);
        if drf {
            pdu.set_drf();
        }
        pdu
    }

    #[test]
    fn test_seqnums_increase_and_drf_once() {
        let mut dtp = mk(plain_cfg());
        let e0 = write(&mut dtp, b"a");
        let e1 = write(&mut dtp, b"b");
        assert_eq!(e0.transmit[0].pci.seqnum, 0);
        assert!(e0.transmit[0].has_drf());
        assert_eq!(e1.transmit[0].pci.seqnum, 1);
        assert!(!e1.transmit[0].has_drf());
    }

    #[test]
    fn test_in_order_delivery() {
        let mut dtp = mk(inorder_no_dtcp_cfg());
        for seq in 0..4 {
            let e = dtp.sdu_rx(Instant::now(), data_pdu(seq, seq == 0), false);
            assert_eq!(e.deliver.len(), 1);
            assert_eq!(e.deliver[0].pci.seqnum, seq);
        }
    }

    #[test]
    fn test_out_of_order_held_in_seqq() {
        // Arrival order 1,3,2,4 with max_sdu_gap=0 and no DTCP: 3 waits in
        // the sequencing queue until 2 fills the gap.
        let mut dtp = mk(inorder_no_dtcp_cfg());

        let e = dtp.sdu_rx(Instant::now(), data_pdu(1, true), false);
        assert_eq!(e.deliver.len(), 1);

        let e = dtp.sdu_rx(Instant::now(), data_pdu(3, false), false);
        assert!(e.deliver.is_empty());
        assert_eq!(dtp.seqq_len(), 1);

        let e = dtp.sdu_rx(Instant::now(), data_pdu(2, false), false);
        let seqs: Vec<SeqNum> = e.deliver.iter().map(|p| p.pci.seqnum).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert_eq!(dtp.seqq_len(), 0);

        let e = dtp.sdu_rx(Instant::now(), data_pdu(4, false), false);
        assert_eq!(e.deliver.len(), 1);
        assert_eq!(e.deliver[0].pci.seqnum, 4);
    }

    #[test]
    fn test_delivered_seqnums_strictly_increase() {
        let mut dtp = mk(inorder_no_dtcp_cfg());
        let mut seen = Vec::new();
        for seq in [0u64, 2, 1, 5, 4, 3] {
            let e = dtp.sdu_rx(Instant::now(), data_pdu(seq, seq == 0), false);
            seen.extend(e.deliver.iter().map(|p| p.pci.seqnum));
        }
        for w in seen.windows(2) {
            assert!(w[0] < w[1]);
            assert!(w[1] - w[0] <= 1);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_duplicate_dropped() {
        let mut dtp = mk(inorder_no_dtcp_cfg());
        dtp.sdu_rx(Instant::now(), data_pdu(0, true), false);
        dtp.sdu_rx(Instant::now(), data_pdu(1, false), false);
        let e = dtp.sdu_rx(Instant::now(), data_pdu(0, false), false);
        assert!(e.deliver.is_empty());
        assert_eq!(e.stats.rx_err, 1);
    }

    #[test]
    fn test_seqq_overflow_drops() {
        let mut dtp = mk(inorder_no_dtcp_cfg());
        dtp.sdu_rx(Instant::now(), data_pdu(0, true), false);
        // Fill the sequencing queue with distinct out-of-order PDUs.
        for seq in 0..SEQQ_MAX_LEN as u64 {
            dtp.sdu_rx(Instant::now(), data_pdu(seq + 2, false), false);
        }
        assert_eq!(dtp.seqq_len(), SEQQ_MAX_LEN);
        let e = dtp.sdu_rx(
            Instant::now(),
            data_pdu(SEQQ_MAX_LEN as u64 + 2, false),
            false,
        );
        assert_eq!(e.stats.rx_err, 1);
        assert_eq!(dtp.seqq_len(), SEQQ_MAX_LEN);
    }

    #[test]
    fn test_window_fills_then_parks_in_cwq() {
        let mut dtp = mk(fc_cfg(2, 8));
        // Window credit 2: seqnums 0 and 1 fit, 2 parks.
        for i in 0..2 {
            let e = write(&mut dtp, &[i]);
            assert_eq!(e.transmit.len(), 1);
        }
        let e = write(&mut dtp, &[2]);
        assert!(e.transmit.is_empty());
        assert_eq!(dtp.cwq_len(), 1);

        // Sender window invariant: snd_lwe <= last_sent + 1 <= snd_rwe.
        let (lwe, last_sent, rwe) = dtp.snd_state();
        assert!(lwe <= last_sent.unwrap() + 1);
        assert!(last_sent.unwrap() + 1 <= rwe);
    }

    #[test]
    fn test_fc_update_pops_cwq_in_order() {
        let mut dtp = mk(fc_cfg(2, 8));
        for i in 0..5 {
            write(&mut dtp, &[i]);
        }
        assert_eq!(dtp.cwq_len(), 3);

        // Peer advances our send window.
        let fc = Pdu::new_ctrl(
            2,
            1,
            20,
            10,
            PDU_T_CTRL_MASK | PDU_T_FC_BIT,
            PciCtrl {
                new_rwe: 10,
                ..Default::default()
            },
        );
        let e = dtp.sdu_rx(Instant::now(), fc, false);
        let seqs: Vec<SeqNum> = e.transmit.iter().map(|p| p.pci.seqnum).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
        assert!(e.wake_writers);
        assert_eq!(dtp.cwq_len(), 0);

        let (lwe, last_sent, rwe) = dtp.snd_state();
        assert!(lwe <= last_sent.unwrap() + 1);
        assert!(last_sent.unwrap() + 1 <= rwe);
    }

    #[test]
    fn test_cwq_backpressure() {
        let mut dtp = mk(fc_cfg(1, 2));
        // seqnum 0 sendable; then the cwq absorbs 2 PDUs; then WouldBlock.
        for i in 0..3 {
            write(&mut dtp, &[i]);
        }
        assert_eq!(dtp.cwq_len(), 2);
        match dtp.sdu_write(Instant::now(), vec![9]) {
            WriteOutcome::WouldBlock { wait: None, .. } => {}
            other => panic!("expected backpressure, got {:?}", other),
        }
    }

    #[test]
    fn test_ack_clears_rtxq_and_stops_timer() {
        let mut dtp = mk(rtx_cfg(200, 3));
        let e = write(&mut dtp, b"x");
        assert!(matches!(e.timers[0], TimerOp::ArmRtx(_)));
        assert_eq!(dtp.rtxq_len(), 1);

        let ack = Pdu::new_ctrl(
            2,
            1,
            20,
            10,
            PDU_T_CTRL_MASK | PDU_T_ACK_BIT | PDU_T_ACK,
            PciCtrl {
                ack_nack_seq: 0,
                ..Default::default()
            },
        );
        let e = dtp.sdu_rx(Instant::now(), ack, false);
        assert_eq!(dtp.rtxq_len(), 0);
        assert!(e.timers.contains(&TimerOp::StopRtx));
    }

    #[test]
    fn test_rtx_timer_retransmits_due_entries() {
        let mut dtp = mk(rtx_cfg(200, 3));
        write(&mut dtp, b"x");
        write(&mut dtp, b"y");

        // Before the interval nothing is due.
        let e = dtp.rtx_timer_expired(Instant::now());
        assert!(e.transmit.is_empty());

        let later = Instant::now() + Duration::from_millis(250);
        let e = dtp.rtx_timer_expired(later);
        assert_eq!(e.transmit.len(), 2);
        assert_eq!(e.transmit[0].pci.seqnum, 0);
        assert_eq!(e.transmit[1].pci.seqnum, 1);
        // Still armed for the next round.
        assert!(e.timers.iter().any(|t| matches!(t, TimerOp::ArmRtx(_))));
    }

    #[test]
    fn test_rtxq_sorted_by_seqnum() {
        let mut dtp = mk(rtx_cfg(200, 3));
        for i in 0..5 {
            write(&mut dtp, &[i]);
        }
        let seqs: Vec<SeqNum> = dtp.rtxq.iter().map(|e| e.pdu.pci.seqnum).collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted);
    }

    #[test]
    fn test_receiver_acks_with_rtx_control() {
        let mut dtp = mk(rtx_cfg(200, 3));
        let e = dtp.sdu_rx(Instant::now(), data_pdu(0, true), false);
        assert_eq!(e.transmit.len(), 1);
        let ack = &e.transmit[0];
        assert!(ack.is_ctrl());
        assert_eq!(ack.ctrl.as_ref().unwrap().ack_nack_seq, 0);
    }

    #[test]
    fn test_ctrl_seq_strictly_increases_and_dups_dropped() {
        let mut dtp = mk(rtx_cfg(200, 3));
        // Produce two control PDUs from the receive side.
        let e0 = dtp.sdu_rx(Instant::now(), data_pdu(0, true), false);
        let e1 = dtp.sdu_rx(Instant::now(), data_pdu(1, false), false);
        let s0 = e0.transmit[0].pci.seqnum;
        let s1 = e1.transmit[0].pci.seqnum;
        assert!(s1 > s0);

        // Feed the same control PDU twice into a fresh sender.
        let mut snd = mk(rtx_cfg(200, 3));
        write(&mut snd, b"x");
        let ack = Pdu::new_ctrl(
            2,
            1,
            20,
            10,
            PDU_T_CTRL_MASK | PDU_T_ACK_BIT | PDU_T_ACK,
            PciCtrl {
                ack_nack_seq: 0,
                ..Default::default()
            },
        );
        snd.sdu_rx(Instant::now(), ack.clone(), false);
        let e = snd.sdu_rx(Instant::now(), ack, false);
        assert_eq!(e.stats.rx_err, 1);
    }

    #[test]
    fn test_snd_inact_flushes_queues() {
        let mut dtp = mk(rtx_cfg(200, 3));
        write(&mut dtp, b"x");
        assert_eq!(dtp.rtxq_len(), 1);
        let e = dtp.snd_inact_expired();
        assert_eq!(dtp.rtxq_len(), 0);
        assert!(e.wake_writers);
        // A fresh run starts with DRF again.
        let e = write(&mut dtp, b"y");
        assert!(e.transmit[0].has_drf());
        assert_eq!(e.transmit[0].pci.seqnum, 0);
    }

    #[test]
    fn test_rcv_inact_resets_receiver() {
        let mut dtp = mk(inorder_no_dtcp_cfg());
        dtp.sdu_rx(Instant::now(), data_pdu(0, true), false);
        dtp.sdu_rx(Instant::now(), data_pdu(3, false), false);
        assert_eq!(dtp.seqq_len(), 1);
        dtp.rcv_inact_expired();
        assert_eq!(dtp.seqq_len(), 0);
        // Next PDU starts a new run regardless of its seqnum.
        let e = dtp.sdu_rx(Instant::now(), data_pdu(7, false), false);
        assert_eq!(e.deliver.len(), 1);
    }

    #[test]
    fn test_token_bucket_gates_writes() {
        let mut cfg = plain_cfg();
        cfg.dtcp_present = true;
        cfg.dtcp.bandwidth = 8000; // 1000 bytes/s, 250 ms refill interval
        let now = Instant::now();
        let mut dtp = Dtp::new(cfg, 0, now);
        dtp.set_endpoints(1, 2, 10, 20);

        // Drain the bucket.
        let mut accepted = 0;
        loop {
            match dtp.sdu_write(now, vec![0u8; 100]) {
                WriteOutcome::Accepted(_) => accepted += 1,
                WriteOutcome::WouldBlock {
                    wait: Some(wait), ..
                } => {
                    assert!(wait > Duration::ZERO);
                    break;
                }
                other => panic!("unexpected outcome {:?}", other),
            }
            assert!(accepted < 1000, "token bucket never blocked");
        }

        // After enough wall time the bucket refills.
        let later = now + Duration::from_secs(1);
        match dtp.sdu_write(later, vec![0u8; 100]) {
            WriteOutcome::Accepted(_) => {}
            other => panic!("expected refill to admit write, got {:?}", other),
        }
    }
}
