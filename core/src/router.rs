//! Packet Router
//!
//! Sits between a round and its transport:
//!
//! ```text
//!   transport ──▶ validate ──┬── expected phase / Blame ──▶ history ──▶ round
//!                            ├── other phase ─────────────▶ delivered (parked)
//!                            ├── later attempt ───────────▶ ahead (next round)
//!                            └── earlier attempt ─────────▶ dropped
//! ```
//!
//! `delivered` and `history` together only ever grow during a round; the
//! blame evaluator re-reads both.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, trace};

use crate::error::{Result, ShuffleError};
use crate::message::Message;
use crate::packet::Packet;
use crate::phase::Phase;
use crate::players::PlayerOrder;
use crate::transport::{Transport, TransportError};
use crate::types::{SessionId, VerificationKey};

pub struct PacketRouter<'a> {
    transport: &'a mut dyn Transport,
    session: SessionId,
    attempt: u32,
    me: VerificationKey,
    players: BTreeSet<VerificationKey>,
    delivered: VecDeque<Packet>,
    history: Vec<Packet>,
    ahead: Vec<Packet>,
    blame_received: bool,
}

impl<'a> PacketRouter<'a> {
    pub fn new(
        transport: &'a mut dyn Transport,
        session: SessionId,
        attempt: u32,
        me: VerificationKey,
        players: &PlayerOrder,
    ) -> Self {
        Self {
            transport,
            session,
            attempt,
            me,
            players: players.all(),
            delivered: VecDeque::new(),
            history: Vec::new(),
            ahead: Vec::new(),
            blame_received: false,
        }
    }

    /// Seed the router with packets that arrived during an earlier round
    pub fn preload(&mut self, packets: Vec<Packet>) {
        for packet in packets {
            if packet.attempt == self.attempt {
                self.delivered.push_back(packet);
            } else if packet.attempt > self.attempt {
                self.ahead.push(packet);
            }
        }
    }

    /// Packets addressed to a later attempt than this router's
    pub fn take_ahead(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.ahead)
    }

    pub fn blame_received(&self) -> bool {
        self.blame_received
    }

    pub fn history(&self) -> &[Packet] {
        &self.history
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Record and transmit a packet.
    ///
    /// Every attempt lands in `history`; only packets for another member of
    /// the player set reach the transport.
    pub fn send(&mut self, packet: Packet) -> Result<()> {
        self.history.push(packet.clone());

        if packet.recipient == self.me || !self.players.contains(&packet.recipient) {
            trace!("not transmitting {} packet to {}", packet.phase, packet.recipient);
            return Ok(());
        }

        self.transport.send_to(&packet.recipient, &packet)?;
        Ok(())
    }

    /// Send the same message to every other player
    pub fn broadcast(&mut self, message: &Message, phase: Phase) -> Result<()> {
        let recipients: Vec<VerificationKey> = self
            .players
            .iter()
            .filter(|key| **key != self.me)
            .copied()
            .collect();

        for recipient in recipients {
            let packet = self.packet(message.clone(), phase, recipient);
            self.send(packet)?;
        }
        Ok(())
    }

    pub fn packet(&self, message: Message, phase: Phase, recipient: VerificationKey) -> Packet {
        Packet::new(message, self.session, self.attempt, phase, self.me, recipient)
    }

    // ========================================================================
    // Receiving
    // ========================================================================

    /// Next packet for `expected`, or the first Blame packet to arrive.
    ///
    /// Parked packets are checked first. Packets for other phases are
    /// parked; a packet for the wrong session or recipient is fatal.
    pub fn receive_next_packet(&mut self, expected: Phase) -> Result<Packet> {
        if let Some(position) = self.delivered.iter().position(|p| p.phase == expected) {
            if let Some(packet) = self.delivered.remove(position) {
                self.history.push(packet.clone());
                return Ok(packet);
            }
        }

        loop {
            let packet = match self.transport.receive() {
                Ok(packet) => packet,
                Err(TransportError::Timeout) => {
                    return Err(ShuffleError::Timeout { phase: expected });
                }
                Err(e) => return Err(e.into()),
            };

            if packet.session != self.session {
                return Err(ShuffleError::Mismatch {
                    field: "session",
                    expected: self.session.to_string(),
                    found: packet.session.to_string(),
                });
            }
            if packet.recipient != self.me {
                return Err(ShuffleError::Mismatch {
                    field: "recipient",
                    expected: self.me.to_string(),
                    found: packet.recipient.to_string(),
                });
            }

            if packet.attempt < self.attempt {
                debug!(
                    "dropping stale {} packet from {} (attempt {})",
                    packet.phase, packet.sender, packet.attempt
                );
                continue;
            }
            if packet.attempt > self.attempt {
                self.ahead.push(packet);
                continue;
            }
            if !self.players.contains(&packet.sender) {
                debug!("dropping packet from non-player {}", packet.sender);
                continue;
            }

            if packet.phase == expected || packet.is_blame() {
                if packet.is_blame() {
                    self.blame_received = true;
                }
                self.history.push(packet.clone());
                return Ok(packet);
            }

            trace!("parking {} packet from {}", packet.phase, packet.sender);
            self.delivered.push_back(packet);
        }
    }

    /// The next `expected` packet, which must come from `from`
    pub fn receive_from(&mut self, from: &VerificationKey, expected: Phase) -> Result<Packet> {
        let packet = self.receive_next_packet(expected)?;

        if packet.is_blame() && expected != Phase::Blame {
            return Err(ShuffleError::BlameReceived {
                expected,
                packet: Box::new(packet),
            });
        }
        if packet.sender != *from {
            return Err(ShuffleError::Mismatch {
                field: "sender",
                expected: from.to_string(),
                found: packet.sender.to_string(),
            });
        }

        Ok(packet)
    }

    /// One `expected` packet from each key in `from`, excluding ourselves.
    ///
    /// With `blame_interrupt` a Blame packet aborts the wait with
    /// [`ShuffleError::BlameReceived`]. Without it the blamer is simply no
    /// longer waited for and [`blame_received`](Self::blame_received) is set.
    pub fn receive_from_multiple(
        &mut self,
        from: &BTreeSet<VerificationKey>,
        expected: Phase,
        blame_interrupt: bool,
    ) -> Result<BTreeMap<VerificationKey, Packet>> {
        let mut pending = from.clone();
        pending.remove(&self.me);
        let mut received = BTreeMap::new();

        while !pending.is_empty() {
            let packet = self.receive_next_packet(expected)?;

            if packet.is_blame() && expected != Phase::Blame {
                if blame_interrupt {
                    return Err(ShuffleError::BlameReceived {
                        expected,
                        packet: Box::new(packet),
                    });
                }
                pending.remove(&packet.sender);
                continue;
            }

            if received.contains_key(&packet.sender) {
                return Err(ShuffleError::ProtocolViolation {
                    sender: packet.sender,
                    phase: expected,
                });
            }
            if !pending.remove(&packet.sender) {
                return Err(ShuffleError::Mismatch {
                    field: "sender",
                    expected: format!("one of {} players", from.len()),
                    found: packet.sender.to_string(),
                });
            }

            received.insert(packet.sender, packet);
        }

        Ok(received)
    }

    /// Every Blame packet seen so far plus all that arrive before the
    /// transport times out, grouped by sender. Identical messages from the
    /// same sender (our own broadcasts, in particular) count once.
    pub fn receive_all_blame(&mut self) -> Result<BTreeMap<VerificationKey, Vec<Packet>>> {
        let mut reports: BTreeMap<VerificationKey, Vec<Packet>> = BTreeMap::new();
        let seen: Vec<Packet> = self.history.iter().filter(|p| p.is_blame()).cloned().collect();
        for packet in seen {
            add_report(&mut reports, packet);
        }

        loop {
            match self.receive_next_packet(Phase::Blame) {
                Ok(packet) => add_report(&mut reports, packet),
                Err(ShuffleError::Timeout { .. }) => break,
                Err(e) => return Err(e),
            }
        }

        debug!(
            "collected blame from {} player(s): {} record(s)",
            reports.len(),
            reports.values().map(Vec::len).sum::<usize>()
        );
        Ok(reports)
    }

    /// All packets of `phase`, history first, then parked ones
    pub fn packets_by_phase(&self, phase: Phase) -> Vec<Packet> {
        self.history
            .iter()
            .chain(self.delivered.iter())
            .filter(|p| p.phase == phase)
            .cloned()
            .collect()
    }
}

fn add_report(reports: &mut BTreeMap<VerificationKey, Vec<Packet>>, packet: Packet) {
    let entry = reports.entry(packet.sender).or_default();
    if !entry.iter().any(|p| p.message == packet.message) {
        entry.push(packet);
    }
}
