// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: GPL-3.0-only

//! Minimal userspace TCP endpoint, one per flow.
//!
//! This is not a full RFC 793 implementation: the link to the client is a
//! local TUN hop with no loss, so there is no retransmission queue and
//! out-of-order segments are dropped for the client to resend. What remains
//! is sequence bookkeeping and the open/close handshakes.

use crate::packet::{TcpFlags, TcpSegment};

pub(crate) const RECV_WINDOW: u16 = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TcpState {
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    LastAck,
    Closed,
}

/// A reply segment to inject back into the TUN device. Payload-free; data
/// toward the client goes through [`TcpFlowState::next_data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Reply {
    pub flags: TcpFlags,
    pub seq: u32,
    pub ack: u32,
}

/// What the dispatcher must do after feeding a segment to the state machine.
#[derive(Debug, Default)]
pub(crate) struct SegmentOutcome {
    pub replies: Vec<Reply>,
    pub deliver: Option<Vec<u8>>,
    pub client_eof: bool,
    pub closed: bool,
}

#[derive(Debug)]
pub(crate) struct TcpFlowState {
    state: TcpState,
    /// Next sequence number we will send toward the client.
    snd_nxt: u32,
    /// Next sequence number we expect from the client.
    rcv_nxt: u32,
    /// Whether the admitting SYN-ACK has been sent.
    admitted: bool,
}

impl TcpFlowState {
    pub fn new(client_seq: u32) -> Self {
        let iss: u32 = rand::random();
        Self {
            state: TcpState::SynReceived,
            snd_nxt: iss,
            rcv_nxt: client_seq.wrapping_add(1),
            admitted: false,
        }
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    /// The SYN-ACK admitting the connection, sent once the upstream leg is
    /// up. Consumes one sequence number for the SYN.
    pub fn syn_ack(&mut self) -> Reply {
        let reply = Reply {
            flags: TcpFlags::syn_ack(),
            seq: self.snd_nxt,
            ack: self.rcv_nxt,
        };
        self.snd_nxt = self.snd_nxt.wrapping_add(1);
        self.admitted = true;
        reply
    }

    /// Abort the connection.
    pub fn rst(&mut self) -> Reply {
        self.state = TcpState::Closed;
        Reply {
            flags: TcpFlags::rst_ack(),
            seq: self.snd_nxt,
            ack: self.rcv_nxt,
        }
    }

    /// Header fields for a data segment toward the client; advances snd_nxt.
    pub fn next_data(&mut self, len: usize) -> Reply {
        let reply = Reply {
            flags: TcpFlags::psh_ack(),
            seq: self.snd_nxt,
            ack: self.rcv_nxt,
        };
        self.snd_nxt = self.snd_nxt.wrapping_add(len as u32);
        reply
    }

    /// Close our sending direction (upstream hit EOF). Consumes one sequence
    /// number for the FIN.
    pub fn fin(&mut self) -> Reply {
        self.state = match self.state {
            TcpState::CloseWait => TcpState::LastAck,
            TcpState::Closed => TcpState::Closed,
            _ => TcpState::FinWait1,
        };
        let reply = Reply {
            flags: TcpFlags::fin_ack(),
            seq: self.snd_nxt,
            ack: self.rcv_nxt,
        };
        self.snd_nxt = self.snd_nxt.wrapping_add(1);
        reply
    }

    pub fn on_segment(&mut self, segment: &TcpSegment) -> SegmentOutcome {
        let mut outcome = SegmentOutcome::default();

        if segment.flags.rst {
            self.state = TcpState::Closed;
            outcome.closed = true;
            outcome.client_eof = true;
            return outcome;
        }

        match self.state {
            TcpState::SynReceived => {
                if segment.flags.syn && !segment.flags.ack {
                    // Retransmitted SYN. Before admission there is nothing
                    // to repeat; the upstream leg is still being set up.
                    if self.admitted {
                        outcome.replies.push(Reply {
                            flags: TcpFlags::syn_ack(),
                            seq: self.snd_nxt.wrapping_sub(1),
                            ack: self.rcv_nxt,
                        });
                    }
                    return outcome;
                }
                if segment.flags.ack {
                    self.state = TcpState::Established;
                    self.handle_data(segment, &mut outcome);
                }
                outcome
            }
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2 => {
                if segment.flags.ack && self.state == TcpState::FinWait1 && segment.ack == self.snd_nxt
                {
                    self.state = TcpState::FinWait2;
                }
                self.handle_data(segment, &mut outcome);
                outcome
            }
            TcpState::CloseWait => {
                // Client already sent its FIN; nothing left to receive.
                outcome
            }
            TcpState::LastAck => {
                if segment.flags.ack && segment.ack == self.snd_nxt {
                    self.state = TcpState::Closed;
                    outcome.closed = true;
                }
                outcome
            }
            TcpState::Closed => outcome,
        }
    }

    fn handle_data(&mut self, segment: &TcpSegment, outcome: &mut SegmentOutcome) {
        let payload_len = segment.payload.len() as u32;

        if !segment.payload.is_empty() {
            if segment.seq == self.rcv_nxt {
                self.rcv_nxt = self.rcv_nxt.wrapping_add(payload_len);
                outcome.deliver = Some(segment.payload.clone());
            }
            // In-order data is acked; anything else gets a duplicate ack at
            // rcv_nxt so the client retransmits from there.
            outcome.replies.push(Reply {
                flags: TcpFlags::ack_only(),
                seq: self.snd_nxt,
                ack: self.rcv_nxt,
            });
        }

        if segment.flags.fin {
            let fin_seq = segment.seq.wrapping_add(payload_len);
            if fin_seq == self.rcv_nxt {
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
                outcome.client_eof = true;
                self.state = match self.state {
                    TcpState::FinWait1 | TcpState::FinWait2 => {
                        // Both directions are now closed; no TIME_WAIT in the
                        // shim, the table entry is released immediately.
                        outcome.closed = true;
                        TcpState::Closed
                    }
                    _ => TcpState::CloseWait,
                };
            }
            outcome.replies.push(Reply {
                flags: TcpFlags::ack_only(),
                seq: self.snd_nxt,
                ack: self.rcv_nxt,
            });
        }
    }
}
