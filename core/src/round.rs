//! Round Engine
//!
//! One attempt at the protocol for a fixed player set.
//!
//! ```text
//! ┌──────────────┐   ┌───────────┐   ┌─────────────────┐   ┌──────────────────┐   ┌──────────────┐
//! │ Announcement │──▶│ Shuffling │──▶│ BroadcastOutput │──▶│ EquivocationCheck│──▶│ Verification │──▶ Completed
//! └──────┬───────┘   └─────┬─────┘   └────────┬────────┘   └────────┬─────────┘   └──────┬───────┘
//!        │                 │                  │                     │                    │
//!        └─────────────────┴──────────────────┴─────────────────────┴────────────────────┘
//!                                             ▼
//!                                           Blame ──▶ BlameMatrix
//! ```
//!
//! Player numbers are 1-based in the protocol; every per-player vector
//! here is indexed by the zero-based slot from [`PlayerOrder::index_of`].

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::blame::{Blame, BlameMatrix, Detail, Evaluator, Evidence, Reason};
use crate::crypto::Crypto;
use crate::error::{Result, ShuffleError};
use crate::ledger::{Ledger, Transaction};
use crate::message::Message;
use crate::packet::Packet;
use crate::phase::{Phase, PhaseMonitor};
use crate::players::PlayerOrder;
use crate::router::PacketRouter;
use crate::shuffle::{decrypt_all, encrypt_layers, shuffle};
use crate::transport::Transport;
use crate::types::{
    Address, DecryptionKey, EncryptionKey, SessionId, Signature, SigningKey, VerificationKey,
};

// ============================================================================
// Context & Outcome
// ============================================================================

/// Everything a round borrows from its session
pub struct RoundContext<'a> {
    pub session: SessionId,
    pub attempt: u32,
    pub amount: u64,
    pub signing_key: &'a SigningKey,
    pub change: Option<&'a Address>,
    pub crypto: &'a dyn Crypto,
    pub ledger: &'a dyn Ledger,
    pub monitor: &'a PhaseMonitor,
}

#[derive(Debug, Clone)]
pub enum RoundOutcome {
    /// Transaction submitted; `output_key` controls our new address
    Completed {
        transaction: Transaction,
        output_key: SigningKey,
    },
    Blamed(BlameMatrix),
}

// ============================================================================
// Round
// ============================================================================

pub struct Round<'a> {
    session: SessionId,
    attempt: u32,
    amount: u64,
    signing_key: &'a SigningKey,
    change: Option<&'a Address>,
    crypto: &'a dyn Crypto,
    ledger: &'a dyn Ledger,
    monitor: &'a PhaseMonitor,

    me: VerificationKey,
    /// Our 1-based player number
    number: usize,
    players: PlayerOrder,
    router: PacketRouter<'a>,
    matrix: BlameMatrix,

    encryption_keys: Vec<Option<EncryptionKey>>,
    change_addresses: Vec<Option<Address>>,
    signatures: Vec<Option<Signature>>,

    decryption_key: Option<DecryptionKey>,
    output_key: Option<SigningKey>,
    new_address: Option<Address>,
    outputs: Vec<Address>,
    commitment: Option<Message>,
    commitment_sent: bool,
    transaction: Option<Transaction>,
}

impl<'a> Round<'a> {
    /// Number `players` and attach to `transport`.
    ///
    /// Fails with [`ShuffleError::InvalidParticipantSet`] if our own key is
    /// not among the players.
    pub fn new(
        context: RoundContext<'a>,
        players: &BTreeSet<VerificationKey>,
        transport: &'a mut dyn Transport,
    ) -> Result<Self> {
        let me = context.crypto.verification_key(context.signing_key);
        let order = PlayerOrder::new(players);
        let number = order
            .number_of(&me)
            .ok_or(ShuffleError::InvalidParticipantSet)?;
        let n = order.len();

        let router = PacketRouter::new(transport, context.session, context.attempt, me, &order);

        Ok(Self {
            session: context.session,
            attempt: context.attempt,
            amount: context.amount,
            signing_key: context.signing_key,
            change: context.change,
            crypto: context.crypto,
            ledger: context.ledger,
            monitor: context.monitor,
            me,
            number,
            players: order,
            router,
            matrix: BlameMatrix::new(),
            encryption_keys: vec![None; n],
            change_addresses: vec![None; n],
            signatures: vec![None; n],
            decryption_key: None,
            output_key: None,
            new_address: None,
            outputs: Vec::new(),
            commitment: None,
            commitment_sent: false,
            transaction: None,
        })
    }

    /// Hand packets from an earlier round's router to this one
    pub fn preload(&mut self, packets: Vec<Packet>) {
        self.router.preload(packets);
    }

    /// Packets that arrived for a later attempt
    pub fn take_ahead(&mut self) -> Vec<Packet> {
        self.router.take_ahead()
    }

    pub fn players(&self) -> &PlayerOrder {
        &self.players
    }

    /// Run every phase in order until the round completes or ends in blame
    pub fn run(&mut self) -> Result<RoundOutcome> {
        info!(
            "session {} attempt {}: starting round as player {} of {}",
            self.session,
            self.attempt,
            self.number,
            self.players.len()
        );

        if let Some(matrix) = self.announcement()? {
            return Ok(RoundOutcome::Blamed(matrix));
        }
        if let Some(matrix) = self.shuffling()? {
            return Ok(RoundOutcome::Blamed(matrix));
        }
        if let Some(matrix) = self.broadcast_output()? {
            return Ok(RoundOutcome::Blamed(matrix));
        }
        if let Some(matrix) = self.equivocation_check()? {
            return Ok(RoundOutcome::Blamed(matrix));
        }
        self.verification_and_submission()
    }

    // ========================================================================
    // Phases
    // ========================================================================

    fn announcement(&mut self) -> Result<Option<BlameMatrix>> {
        self.set_phase(Phase::Announcement);

        let mut accusations = Message::new();
        let mut short = false;
        let players: Vec<VerificationKey> = self.players.iter().copied().collect();
        for player in players {
            let address = self.crypto.address(&player);
            if self.ledger.value_held(&address)? >= self.amount {
                continue;
            }
            if player == self.me {
                warn!("our own input {} holds less than {}", address, self.amount);
                short = true;
                continue;
            }

            let blame = match self.ledger.conflicting_transaction(&address, self.amount) {
                Some(transaction) => Blame::InsufficientFunds {
                    accused: player,
                    transaction,
                },
                None => Blame::NoFundsAtAll { accused: player },
            };
            warn!("player {} lacks funds: {}", player, blame.reason());
            let detail = match &blame {
                Blame::InsufficientFunds { transaction, .. } => Detail::Transaction(transaction.clone()),
                _ => Detail::None,
            };
            self.matrix
                .record(self.me, player, Evidence::new(blame.reason(), true, detail));
            accusations.push(blame);
        }

        if short || !accusations.is_empty() {
            self.set_phase(Phase::Blame);
            if !accusations.is_empty() {
                self.router.broadcast(&accusations, Phase::Blame)?;
            }
            return self.fill().map(Some);
        }

        if self.number != 1 {
            let decryption_key = self.crypto.make_decryption_key();
            let encryption_key = self.crypto.encryption_key(&decryption_key);
            self.encryption_keys[self.number - 1] = Some(encryption_key);
            self.change_addresses[self.number - 1] = self.change.cloned();
            self.decryption_key = Some(decryption_key);

            let mut message = Message::new().attach(encryption_key);
            if let Some(change) = self.change {
                message.push(change.clone());
            }
            self.router.broadcast(&message, Phase::Announcement)?;
        }

        let announcers = self.players.set(2, self.players.len());
        let packets = match self
            .router
            .receive_from_multiple(&announcers, Phase::Announcement, true)
        {
            Ok(packets) => packets,
            Err(e) if e.is_blame() => return self.fill().map(Some),
            Err(e) => return Err(e),
        };

        for (sender, packet) in packets {
            let mut reader = packet.message.reader();
            let encryption_key = reader.read_encryption_key()?;
            let change = if reader.is_empty() {
                None
            } else {
                Some(reader.read_address()?)
            };
            let slot = self.slot(&sender)?;
            self.encryption_keys[slot] = Some(encryption_key);
            self.change_addresses[slot] = change;
        }

        debug!("collected {} encryption key(s)", self.players.len() - 1);
        Ok(None)
    }

    fn shuffling(&mut self) -> Result<Option<BlameMatrix>> {
        self.set_phase(Phase::Shuffling);

        let output_key = self.crypto.make_signing_key();
        let new_address = self
            .crypto
            .address(&self.crypto.verification_key(&output_key));
        self.output_key = Some(output_key);
        self.new_address = Some(new_address.clone());

        let n = self.players.len();
        let mut addresses = if self.number == 1 {
            Vec::new()
        } else {
            let previous = self.player(self.number - 1)?;
            let packet = match self.router.receive_from(&previous, Phase::Shuffling) {
                Ok(packet) => packet,
                Err(e) if e.is_blame() => return self.reveal_shuffle_evidence().map(Some),
                Err(e) => return Err(e),
            };
            let layered = packet.message.addresses()?;
            let decryption_key = self.decryption_key.as_ref().ok_or(ShuffleError::Format {
                expected: "decryption key",
                found: "none".to_string(),
            })?;

            match decrypt_all(self.crypto, decryption_key, &layered, self.number - 1) {
                Ok(addresses) => addresses,
                Err(fault) => {
                    warn!("shuffle input from player {} rejected: {:?}", self.number - 1, fault);
                    let last = self.player(n)?;
                    self.set_phase(Phase::Blame);
                    let accusation = Message::new().attach(fault.accusation(last));
                    self.router.broadcast(&accusation, Phase::Blame)?;
                    return self.blame_shuffle_misbehavior().map(Some);
                }
            }
        };

        let mut layers = Vec::with_capacity(n - self.number);
        for number in (self.number + 1..=n).rev() {
            layers.push(self.encryption_keys[number - 1].ok_or(ShuffleError::Format {
                expected: "encryption key",
                found: format!("nothing announced by player {number}"),
            })?);
        }
        addresses.push(encrypt_layers(self.crypto, &new_address, &layers)?);
        let shuffled = shuffle(self.crypto, addresses);

        if self.number == n {
            self.outputs = shuffled;
        } else {
            let next = self.player(self.number + 1)?;
            let message: Message = shuffled.into_iter().collect();
            let packet = self.router.packet(message, Phase::Shuffling, next);
            self.router.send(packet)?;
        }
        Ok(None)
    }

    fn broadcast_output(&mut self) -> Result<Option<BlameMatrix>> {
        self.set_phase(Phase::BroadcastOutput);
        let last = self.player(self.players.len())?;

        if self.me == last {
            let message: Message = self.outputs.iter().cloned().collect();
            self.router.broadcast(&message, Phase::BroadcastOutput)?;
        } else {
            let packet = match self.router.receive_from(&last, Phase::BroadcastOutput) {
                Ok(packet) => packet,
                Err(e) if e.is_blame() => return self.reveal_shuffle_evidence().map(Some),
                Err(e) => return Err(e),
            };
            self.outputs = packet.message.addresses()?;
        }

        let present = self
            .new_address
            .as_ref()
            .is_some_and(|address| self.outputs.contains(address));
        if !present {
            warn!("our new address is missing from the output of {}", last);
            self.set_phase(Phase::Blame);
            let accusation = Message::new().attach(Blame::MissingOutput { accused: last });
            self.router.broadcast(&accusation, Phase::Blame)?;
            self.matrix
                .record(self.me, last, Evidence::credible(Reason::MissingOutput));
            return self.blame_shuffle_misbehavior().map(Some);
        }
        Ok(None)
    }

    fn equivocation_check(&mut self) -> Result<Option<BlameMatrix>> {
        self.set_phase(Phase::EquivocationCheck);

        let mut keys = Message::new();
        for number in 2..=self.players.len() {
            keys.push(self.encryption_keys[number - 1].ok_or(ShuffleError::Format {
                expected: "encryption key",
                found: format!("nothing announced by player {number}"),
            })?);
        }
        let digest = self.crypto.hash(&keys);
        self.commitment = Some(digest.clone());

        if !self.commitment_sent {
            self.router.broadcast(&digest, Phase::EquivocationCheck)?;
            self.commitment_sent = true;
        }

        let packets = match self.router.receive_from_multiple(
            &self.players.all(),
            Phase::EquivocationCheck,
            true,
        ) {
            Ok(packets) => packets,
            Err(e) if e.is_blame() => return self.reveal_shuffle_evidence().map(Some),
            Err(e) => return Err(e),
        };

        if packets.values().all(|packet| packet.message == digest) {
            debug!("all {} equivocation digests agree", self.players.len());
            return Ok(None);
        }

        warn!("equivocation digests disagree");
        self.set_phase(Phase::Blame);
        let mut evidence = self.router.packets_by_phase(Phase::Announcement);
        evidence.extend(self.router.packets_by_phase(Phase::BroadcastOutput));
        let blame = Message::new().attach(Blame::EquivocationFailure { packets: evidence });
        self.router.broadcast(&blame, Phase::Blame)?;
        self.fill().map(Some)
    }

    fn verification_and_submission(&mut self) -> Result<RoundOutcome> {
        self.set_phase(Phase::VerificationAndSubmission);

        let players: Vec<VerificationKey> = self.players.iter().copied().collect();
        let inputs: Vec<Address> = players.iter().map(|p| self.crypto.address(p)).collect();
        let change: BTreeMap<Address, Address> = inputs
            .iter()
            .zip(&self.change_addresses)
            .filter_map(|(input, change)| change.as_ref().map(|c| (input.clone(), c.clone())))
            .collect();

        let transaction =
            match self
                .ledger
                .shuffle_transaction(self.amount, &inputs, &self.outputs, &change)
            {
                Ok(transaction) => transaction,
                Err(e) => {
                    warn!("transaction construction failed: {}", e);
                    let mut accusations = Message::new();
                    let mut found = false;
                    for (player, input) in players.iter().zip(&inputs) {
                        let Some(conflict) = self.ledger.conflicting_transaction(input, self.amount)
                        else {
                            continue;
                        };
                        found = true;
                        if *player == self.me {
                            warn!("our own input {} has a conflicting spend", input);
                            continue;
                        }
                        self.matrix.record(
                            self.me,
                            *player,
                            Evidence::new(
                                Reason::DoubleSpend,
                                true,
                                Detail::Transaction(conflict.clone()),
                            ),
                        );
                        accusations.push(Blame::DoubleSpend {
                            accused: *player,
                            transaction: conflict,
                        });
                    }

                    if !found {
                        return Err(e.into());
                    }
                    self.set_phase(Phase::Blame);
                    if !accusations.is_empty() {
                        self.router.broadcast(&accusations, Phase::Blame)?;
                    }
                    return self.fill().map(RoundOutcome::Blamed);
                }
            };

        let signature = self.crypto.sign(self.signing_key, &transaction)?;
        self.signatures[self.number - 1] = Some(signature.clone());
        self.transaction = Some(transaction.clone());
        self.router.broadcast(
            &Message::new().attach(signature),
            Phase::VerificationAndSubmission,
        )?;

        let packets = self.router.receive_from_multiple(
            &self.players.all(),
            Phase::VerificationAndSubmission,
            false,
        )?;

        let mut invalid = Vec::new();
        for (sender, packet) in packets {
            let Ok(signature) = packet.message.reader().read_signature() else {
                // Forwarded as an empty signature, which no peer can verify
                warn!("malformed signature message from {}", sender);
                self.matrix.record(
                    self.me,
                    sender,
                    Evidence::new(
                        Reason::InvalidSignature,
                        true,
                        Detail::Note("malformed signature message".into()),
                    ),
                );
                invalid.push((sender, Signature(Vec::new())));
                continue;
            };
            if self.crypto.verify(&sender, &transaction, &signature) {
                let slot = self.slot(&sender)?;
                self.signatures[slot] = Some(signature);
            } else {
                warn!("invalid signature from {}", sender);
                self.matrix.record(
                    self.me,
                    sender,
                    Evidence::new(
                        Reason::InvalidSignature,
                        true,
                        Detail::Signature(signature.clone()),
                    ),
                );
                invalid.push((sender, signature));
            }
        }

        if !invalid.is_empty() {
            self.set_phase(Phase::Blame);
            let blame = Message::new().attach(Blame::InvalidSignature { invalid });
            self.router.broadcast(&blame, Phase::Blame)?;
            return self.fill().map(RoundOutcome::Blamed);
        }
        if self.router.blame_received() {
            return self.fill().map(RoundOutcome::Blamed);
        }

        let signatures = players
            .iter()
            .zip(&self.signatures)
            .filter_map(|(player, signature)| signature.clone().map(|s| (*player, s)))
            .collect::<Vec<_>>();
        self.ledger.submit(&transaction, &signatures)?;
        self.set_phase(Phase::Completed);
        let id = transaction.id()?;
        info!(
            "session {} attempt {}: submitted shuffle {} with {} inputs",
            self.session,
            self.attempt,
            hex::encode(&id[..8]),
            transaction.inputs.len()
        );

        let output_key = self.output_key.take().ok_or(ShuffleError::Format {
            expected: "output key",
            found: "none".to_string(),
        })?;
        Ok(RoundOutcome::Completed {
            transaction,
            output_key,
        })
    }

    // ========================================================================
    // Blame
    // ========================================================================

    /// Run the equivocation check before revealing shuffle evidence, so an
    /// equivocating announcer is caught first
    fn blame_shuffle_misbehavior(&mut self) -> Result<BlameMatrix> {
        match self.equivocation_check()? {
            Some(matrix) => Ok(matrix),
            None => self.reveal_shuffle_evidence(),
        }
    }

    /// Publish our decryption key and the shuffle packets we saw.
    ///
    /// Once our commitment is out, the announcements behind it go along
    /// too, so peers can check it even if we never saw a digest mismatch.
    fn reveal_shuffle_evidence(&mut self) -> Result<BlameMatrix> {
        self.set_phase(Phase::Blame);

        let mut packets = self.router.packets_by_phase(Phase::Shuffling);
        packets.extend(self.router.packets_by_phase(Phase::BroadcastOutput));
        let mut evidence = Message::new().attach(Blame::ShuffleEvidence {
            decryption_key: self.decryption_key.clone(),
            packets,
        });

        if self.commitment_sent {
            let mut packets = self.router.packets_by_phase(Phase::Announcement);
            packets.extend(self.router.packets_by_phase(Phase::BroadcastOutput));
            evidence.push(Blame::EquivocationFailure { packets });
        }

        self.router.broadcast(&evidence, Phase::Blame)?;
        self.fill()
    }

    /// Drain blame packets until the transport goes quiet, then evaluate
    fn fill(&mut self) -> Result<BlameMatrix> {
        self.set_phase(Phase::Blame);
        let reports = self.router.receive_all_blame()?;

        let mut commitments = BTreeMap::new();
        for packet in self.router.packets_by_phase(Phase::EquivocationCheck) {
            if packet.recipient == self.me {
                commitments.entry(packet.sender).or_insert(packet.message);
            }
        }
        if let Some(own) = &self.commitment {
            commitments.insert(self.me, own.clone());
        }

        let evaluator = Evaluator {
            me: self.me,
            players: &self.players,
            amount: self.amount,
            crypto: self.crypto,
            ledger: self.ledger,
            encryption_keys: &self.encryption_keys,
            transaction: self.transaction.as_ref(),
            commitments: &commitments,
        };
        let matrix = evaluator.evaluate(std::mem::take(&mut self.matrix), &reports);

        info!(
            "session {} attempt {}: blame phase closed with {} entries",
            self.session,
            self.attempt,
            matrix.len()
        );
        Ok(matrix)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn set_phase(&self, phase: Phase) {
        if self.monitor.get() != phase {
            debug!("entering {} phase", phase);
        }
        self.monitor.set(phase);
    }

    fn player(&self, number: usize) -> Result<VerificationKey> {
        self.players
            .get(number)
            .copied()
            .ok_or(ShuffleError::InvalidParticipantSet)
    }

    fn slot(&self, key: &VerificationKey) -> Result<usize> {
        self.players
            .index_of(key)
            .ok_or(ShuffleError::InvalidParticipantSet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MemoryNetwork, MockCrypto, MockLedger};
    use std::time::Duration;

    #[test]
    fn test_outsider_cannot_build_round() {
        let crypto = MockCrypto::new(1);
        let ledger = MockLedger::new();
        let monitor = PhaseMonitor::new();
        let signing_key = crypto.make_signing_key();
        let others: BTreeSet<VerificationKey> = (0..3)
            .map(|_| crypto.verification_key(&crypto.make_signing_key()))
            .collect();

        let network = MemoryNetwork::new(Duration::from_millis(10));
        let mut transport = network.endpoint(crypto.verification_key(&signing_key));
        let context = RoundContext {
            session: SessionId::from_label("outsider"),
            attempt: 0,
            amount: 10,
            signing_key: &signing_key,
            change: None,
            crypto: &crypto,
            ledger: &ledger,
            monitor: &monitor,
        };

        let result = Round::new(context, &others, &mut transport);
        assert!(matches!(result, Err(ShuffleError::InvalidParticipantSet)));
    }

    #[test]
    fn test_single_player_round_completes() {
        let crypto = MockCrypto::new(2);
        let ledger = MockLedger::new();
        let monitor = PhaseMonitor::new();
        let signing_key = crypto.make_signing_key();
        let me = crypto.verification_key(&signing_key);
        ledger.fund(crypto.address(&me), 50);

        let network = MemoryNetwork::new(Duration::from_millis(10));
        let mut transport = network.endpoint(me);
        let context = RoundContext {
            session: SessionId::from_label("solo"),
            attempt: 0,
            amount: 50,
            signing_key: &signing_key,
            change: None,
            crypto: &crypto,
            ledger: &ledger,
            monitor: &monitor,
        };

        let players = [me].into_iter().collect();
        let mut round = Round::new(context, &players, &mut transport).unwrap();
        let outcome = round.run().unwrap();

        let RoundOutcome::Completed {
            transaction,
            output_key,
        } = outcome
        else {
            panic!("expected completion");
        };
        assert_eq!(transaction.inputs, vec![crypto.address(&me)]);
        assert_eq!(
            transaction.outputs,
            vec![crypto.address(&crypto.verification_key(&output_key))]
        );
        assert_eq!(monitor.get(), Phase::Completed);
    }

    #[test]
    fn test_own_shortfall_goes_straight_to_blame() {
        let crypto = MockCrypto::new(3);
        let ledger = MockLedger::new();
        let monitor = PhaseMonitor::new();
        let signing_key = crypto.make_signing_key();
        let me = crypto.verification_key(&signing_key);

        let network = MemoryNetwork::new(Duration::from_millis(10));
        let mut transport = network.endpoint(me);
        let context = RoundContext {
            session: SessionId::from_label("broke"),
            attempt: 0,
            amount: 50,
            signing_key: &signing_key,
            change: None,
            crypto: &crypto,
            ledger: &ledger,
            monitor: &monitor,
        };

        let players = [me].into_iter().collect();
        let mut round = Round::new(context, &players, &mut transport).unwrap();
        let outcome = round.run().unwrap();

        assert!(matches!(outcome, RoundOutcome::Blamed(ref m) if m.is_empty()));
        assert_eq!(monitor.get(), Phase::Blame);
    }
}
