//! Blame Evaluator
//!
//! Turns the blame records gathered at the end of a failed round into
//! matrix entries. Every record ends in exactly one of three ways: an
//! accusation (credible or not), an `Inconclusive` entry against whoever
//! supplied unusable evidence, or nothing at all for our own claims, which
//! the round already recorded.
//!
//! Unresolvable evidence is never read as exculpatory.
//!
//! Packets carry no signatures, so a revealed packet is only taken as fact
//! when both ends of the link reveal the same bytes, or when we were one
//! of the ends. A verdict that rests on one side's word alone still names
//! the culprit for us, but that witness's own accusation does not count.

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use super::{Blame, BlameMatrix, Detail, Evidence, Reason};
use crate::crypto::Crypto;
use crate::ledger::{Ledger, Transaction};
use crate::message::Message;
use crate::packet::Packet;
use crate::phase::Phase;
use crate::players::PlayerOrder;
use crate::shuffle::decrypt_layers;
use crate::types::{Address, DecryptionKey, EncryptionKey, VerificationKey};

/// Local knowledge the evaluator cross-checks peer evidence against
pub struct Evaluator<'a> {
    pub me: VerificationKey,
    pub players: &'a PlayerOrder,
    pub amount: u64,
    pub crypto: &'a dyn Crypto,
    pub ledger: &'a dyn Ledger,
    /// Encryption keys as announced to us, by player index; ours included
    pub encryption_keys: &'a [Option<EncryptionKey>],
    /// The transaction we built, if the round got that far
    pub transaction: Option<&'a Transaction>,
    /// Equivocation-check digests by sender; ours included
    pub commitments: &'a BTreeMap<VerificationKey, Message>,
}

/// Evidence pooled across all reports before the global passes
#[derive(Default)]
struct Pool {
    /// Final broadcast as received by each player
    output_vectors: BTreeMap<VerificationKey, Message>,
    /// Onion as received by each player in the shuffle phase
    shuffle_inputs: BTreeMap<VerificationKey, Message>,
    /// Onion each player says it forwarded to its successor
    shuffle_sent: BTreeMap<VerificationKey, Message>,
    /// Final broadcast as the last player says it sent it, by recipient
    broadcast_sent: BTreeMap<VerificationKey, Message>,
    decryption_keys: BTreeMap<VerificationKey, DecryptionKey>,
    /// sender → recipient → announced key
    announcements: BTreeMap<VerificationKey, BTreeMap<VerificationKey, EncryptionKey>>,
    equivocation_reporters: BTreeSet<VerificationKey>,
    /// Peer shuffle accusations settled by the decrypt-chain reconstruction
    pending: Vec<(VerificationKey, VerificationKey, Reason)>,
}

/// One hop of the shuffle chain, as far as the revealed packets agree
enum Link {
    /// Both ends agree, or we were one of them
    Agreed(Message),
    /// Only one end revealed it
    Claimed(Message, VerificationKey),
    /// The two ends revealed different packets
    Contradicted,
    Missing,
}

/// Outcome of the decrypt-chain reconstruction
#[derive(Default)]
struct Verdict {
    culprits: BTreeSet<VerificationKey>,
    /// Players whose unconfirmed packets the verdict depends on
    witnesses: BTreeSet<VerificationKey>,
}

impl Evaluator<'_> {
    /// Fold every report into `matrix`
    pub fn evaluate(
        &self,
        mut matrix: BlameMatrix,
        reports: &BTreeMap<VerificationKey, Vec<Packet>>,
    ) -> BlameMatrix {
        let mut pool = Pool::default();

        for (from, packets) in reports {
            for packet in packets {
                let mut reader = packet.message.reader();
                while !reader.is_empty() {
                    match reader.read_blame() {
                        Ok(blame) => self.dispatch(&mut matrix, &mut pool, from, blame),
                        Err(_) => {
                            self.inconclusive(&mut matrix, from, "blame message with a non-blame element");
                            break;
                        }
                    }
                }
            }
        }

        self.check_output_vectors(&mut matrix, &pool);
        self.check_announcements(&mut matrix, &pool);
        let verdict = self.reconstruct(&mut matrix, &pool);

        for (accuser, accused, reason) in &pool.pending {
            if verdict.culprits.contains(accused) && !verdict.witnesses.contains(accuser) {
                matrix.record(*accuser, *accused, Evidence::credible(*reason));
            }
        }

        debug!("blame matrix holds {} entries", matrix.len());
        matrix
    }

    fn dispatch(&self, matrix: &mut BlameMatrix, pool: &mut Pool, from: &VerificationKey, blame: Blame) {
        let own = *from == self.me;

        match blame {
            Blame::NoFundsAtAll { accused } => {
                if own || !self.known(matrix, from, &accused) {
                    return;
                }
                let credible = matrix.contains(&self.me, &accused, Reason::NoFundsAtAll);
                matrix.record(
                    *from,
                    accused,
                    Evidence::new(Reason::NoFundsAtAll, credible, Detail::None),
                );
            }
            Blame::InsufficientFunds {
                accused,
                transaction,
            } => {
                if own || !self.known(matrix, from, &accused) {
                    return;
                }
                self.record_spend(matrix, from, accused, Reason::InsufficientFunds, transaction);
            }
            Blame::DoubleSpend {
                accused,
                transaction,
            } => {
                if own || !self.known(matrix, from, &accused) {
                    return;
                }
                self.record_spend(matrix, from, accused, Reason::DoubleSpend, transaction);
            }
            Blame::MissingOutput { accused } => {
                if own || !self.known(matrix, from, &accused) {
                    return;
                }
                self.record_pending(matrix, pool, from, accused, Reason::MissingOutput);
            }
            Blame::ShuffleFailure { accused } => {
                if own || !self.known(matrix, from, &accused) {
                    return;
                }
                self.record_pending(matrix, pool, from, accused, Reason::ShuffleFailure);
            }
            Blame::ShuffleEvidence {
                decryption_key,
                packets,
            } => {
                self.collect_shuffle_evidence(matrix, pool, from, decryption_key, &packets);
            }
            Blame::EquivocationFailure { packets } => {
                self.collect_equivocation_evidence(matrix, pool, from, &packets);
            }
            Blame::InvalidSignature { invalid } => {
                if own {
                    return;
                }
                for (accused, signature) in invalid {
                    if !self.known(matrix, from, &accused) {
                        continue;
                    }
                    let credible = self
                        .transaction
                        .is_some_and(|tx| !self.crypto.verify(&accused, tx, &signature));
                    matrix.record(
                        *from,
                        accused,
                        Evidence::new(
                            Reason::InvalidSignature,
                            credible,
                            Detail::Signature(signature),
                        ),
                    );
                }
            }
        }
    }

    // ========================================================================
    // Per-record handlers
    // ========================================================================

    fn record_spend(
        &self,
        matrix: &mut BlameMatrix,
        from: &VerificationKey,
        accused: VerificationKey,
        reason: Reason,
        transaction: Transaction,
    ) {
        let address = self.crypto.address(&accused);
        let credible = self.ledger.spends_from(&address, self.amount, &transaction);
        matrix.record(
            *from,
            accused,
            Evidence::new(reason, credible, Detail::Transaction(transaction)),
        );
    }

    fn record_pending(
        &self,
        matrix: &mut BlameMatrix,
        pool: &mut Pool,
        from: &VerificationKey,
        accused: VerificationKey,
        reason: Reason,
    ) {
        matrix.record(*from, accused, Evidence::new(reason, false, Detail::None));
        pool.pending.push((*from, accused, reason));
    }

    fn collect_shuffle_evidence(
        &self,
        matrix: &mut BlameMatrix,
        pool: &mut Pool,
        from: &VerificationKey,
        decryption_key: Option<DecryptionKey>,
        packets: &[Packet],
    ) {
        let Some(number) = self.players.number_of(from) else {
            return;
        };

        match decryption_key {
            None if number == 1 => {}
            None => self.inconclusive(matrix, from, "decryption key withheld"),
            Some(_) if number == 1 => {
                self.inconclusive(matrix, from, "first player revealed a decryption key")
            }
            Some(key) => match self.announced_key(from) {
                Some(announced) if self.crypto.encryption_key(&key) == announced => {
                    match pool.decryption_keys.get(from) {
                        Some(existing) if *existing != key => {
                            self.inconclusive(matrix, from, "revealed two decryption keys")
                        }
                        _ => {
                            pool.decryption_keys.insert(*from, key);
                        }
                    }
                }
                Some(_) => {
                    matrix.record(
                        self.me,
                        *from,
                        Evidence::new(
                            Reason::ShuffleFailure,
                            true,
                            Detail::Note("revealed key does not match announced key".into()),
                        ),
                    );
                }
                None => self.inconclusive(matrix, from, "no announced key on file"),
            },
        }

        for packet in packets {
            if packet.sender == *from {
                self.collect_sent(matrix, pool, from, number, packet);
                continue;
            }
            if packet.recipient != *from {
                continue;
            }
            match packet.phase {
                Phase::Shuffling => {
                    if Some(&packet.sender) != self.players.get(number.saturating_sub(1)) {
                        self.inconclusive(matrix, from, "shuffle packet from a non-neighbour");
                        continue;
                    }
                    self.insert_once(
                        matrix,
                        &mut pool.shuffle_inputs,
                        *from,
                        from,
                        &packet.message,
                        "shuffle",
                    );
                }
                Phase::BroadcastOutput => self.collect_output_vector(matrix, pool, from, packet),
                other => {
                    let note = format!("unexpected {other} packet in shuffle evidence");
                    self.inconclusive(matrix, from, &note);
                }
            }
        }
    }

    /// Packets a reporter says it sent; announcements are checked elsewhere
    fn collect_sent(
        &self,
        matrix: &mut BlameMatrix,
        pool: &mut Pool,
        from: &VerificationKey,
        number: usize,
        packet: &Packet,
    ) {
        match packet.phase {
            Phase::Shuffling => {
                if Some(&packet.recipient) != self.players.get(number + 1) {
                    self.inconclusive(matrix, from, "shuffle packet to a non-neighbour");
                    return;
                }
                self.insert_once(
                    matrix,
                    &mut pool.shuffle_sent,
                    *from,
                    from,
                    &packet.message,
                    "forwarded shuffle",
                );
            }
            Phase::BroadcastOutput => {
                if Some(from) != self.players.last() {
                    self.inconclusive(matrix, from, "broadcast output from a non-last player");
                    return;
                }
                self.insert_once(
                    matrix,
                    &mut pool.broadcast_sent,
                    packet.recipient,
                    from,
                    &packet.message,
                    "sent broadcast output",
                );
            }
            _ => {}
        }
    }

    fn collect_equivocation_evidence(
        &self,
        matrix: &mut BlameMatrix,
        pool: &mut Pool,
        from: &VerificationKey,
        packets: &[Packet],
    ) {
        pool.equivocation_reporters.insert(*from);

        if let Some(number) = self.players.number_of(from) {
            for packet in packets.iter().filter(|p| p.sender == *from) {
                self.collect_sent(matrix, pool, from, number, packet);
            }
        }

        for packet in packets.iter().filter(|p| p.recipient == *from) {
            match packet.phase {
                Phase::Announcement => match packet.message.reader().read_encryption_key() {
                    Ok(key) => {
                        let by_recipient = pool.announcements.entry(packet.sender).or_default();
                        match by_recipient.get(from) {
                            Some(existing) if *existing != key => self.inconclusive(
                                matrix,
                                from,
                                "conflicting announcement reports",
                            ),
                            _ => {
                                by_recipient.insert(*from, key);
                            }
                        }
                    }
                    Err(_) => self.inconclusive(matrix, from, "malformed announcement evidence"),
                },
                Phase::BroadcastOutput => self.collect_output_vector(matrix, pool, from, packet),
                other => {
                    let note = format!("unexpected {other} packet in equivocation evidence");
                    self.inconclusive(matrix, from, &note);
                }
            }
        }

        self.check_commitment(matrix, pool, from);
    }

    fn collect_output_vector(
        &self,
        matrix: &mut BlameMatrix,
        pool: &mut Pool,
        from: &VerificationKey,
        packet: &Packet,
    ) {
        if Some(&packet.sender) != self.players.last() {
            self.inconclusive(matrix, from, "broadcast output from a non-last player");
            return;
        }
        self.insert_once(
            matrix,
            &mut pool.output_vectors,
            *from,
            from,
            &packet.message,
            "broadcast output",
        );
    }

    /// Recompute `from`'s commitment from the keys it says it received
    fn check_commitment(&self, matrix: &mut BlameMatrix, pool: &Pool, from: &VerificationKey) {
        let mut keys = Message::new();
        for number in 2..=self.players.len() {
            let Some(sender) = self.players.get(number) else {
                return;
            };
            let key = if sender == from {
                self.announced_key(from)
            } else {
                pool.announcements
                    .get(sender)
                    .and_then(|by_recipient| by_recipient.get(from))
                    .copied()
            };
            match key {
                Some(key) => keys.push(key),
                None => {
                    let note = format!("announcement of player {number} missing from evidence");
                    self.inconclusive(matrix, from, &note);
                    return;
                }
            }
        }

        let digest = self.crypto.hash(&keys);
        match self.commitments.get(from) {
            Some(committed) if *committed == digest => {}
            Some(_) => {
                matrix.record(
                    self.me,
                    *from,
                    Evidence::new(
                        Reason::EquivocationFailure,
                        true,
                        Detail::Note("reported announcements contradict committed digest".into()),
                    ),
                );
            }
            None => self.inconclusive(matrix, from, "no equivocation digest on file"),
        }
    }

    // ========================================================================
    // Global passes
    // ========================================================================

    /// Every non-last player reports one output vector; they must agree
    fn check_output_vectors(&self, matrix: &mut BlameMatrix, pool: &Pool) {
        if pool.output_vectors.is_empty() {
            return;
        }
        let Some(last) = self.players.last() else {
            return;
        };

        for player in self.players.iter().filter(|p| *p != last) {
            if !pool.output_vectors.contains_key(player) {
                self.inconclusive(matrix, player, "no broadcast output report");
            }
        }

        // Reports the last player contradicts are dropped; what it admits
        // to having sent counts alongside the rest
        let reported: Vec<(VerificationKey, Message)> = pool
            .output_vectors
            .iter()
            .filter(|(reporter, _)| !self.broadcast_contradicted(matrix, pool, reporter))
            .chain(&pool.broadcast_sent)
            .map(|(k, m)| (*k, m.clone()))
            .collect();
        let distinct: BTreeSet<Vec<u8>> = reported.iter().map(|(_, m)| m.canonical_bytes()).collect();
        if distinct.len() > 1 {
            warn!("last player {} broadcast differing output vectors", last);
            matrix.record(
                self.me,
                *last,
                Evidence::new(Reason::EquivocationFailure, true, Detail::OutputVectors(reported)),
            );
        }
    }

    /// Every recipient must report the same key for a given sender
    fn check_announcements(&self, matrix: &mut BlameMatrix, pool: &Pool) {
        for (sender, by_recipient) in &pool.announcements {
            let mut reported: Vec<(VerificationKey, EncryptionKey)> =
                by_recipient.iter().map(|(r, k)| (*r, *k)).collect();
            if *sender != self.me && !by_recipient.contains_key(&self.me) {
                if let Some(key) = self.announced_key(sender) {
                    reported.push((self.me, key));
                }
            }

            let distinct: BTreeSet<EncryptionKey> = reported.iter().map(|(_, k)| *k).collect();
            if distinct.len() > 1 {
                warn!("player {} announced differing encryption keys", sender);
                matrix.record(
                    self.me,
                    *sender,
                    Evidence::new(
                        Reason::EquivocationFailure,
                        true,
                        Detail::Announcements(reported),
                    ),
                );
            }

            for reporter in &pool.equivocation_reporters {
                if reporter != sender && !by_recipient.contains_key(reporter) {
                    self.inconclusive(matrix, reporter, "announcement missing from evidence");
                }
            }
        }
    }

    /// Peel every revealed onion and find where the chain first breaks.
    ///
    /// Needs the decryption keys of players 2..=N and the onion each of
    /// them received; anything less is recorded as inconclusive.
    fn reconstruct(&self, matrix: &mut BlameMatrix, pool: &Pool) -> Verdict {
        let mut verdict = Verdict::default();
        if pool.decryption_keys.is_empty() && pool.shuffle_inputs.is_empty() {
            return verdict;
        }

        let n = self.players.len();
        let mut keys: Vec<&DecryptionKey> = Vec::with_capacity(n.saturating_sub(1));
        let mut onions: Vec<(Message, Option<VerificationKey>)> = Vec::with_capacity(n.saturating_sub(1));
        let mut complete = true;
        let mut contradicted = false;
        for number in 2..=n {
            let Some(player) = self.players.get(number) else {
                return verdict;
            };
            match pool.decryption_keys.get(player) {
                Some(key) => keys.push(key),
                None => {
                    self.inconclusive(matrix, player, "decryption key not revealed");
                    complete = false;
                }
            }
            match self.link(matrix, pool, number) {
                Link::Agreed(onion) => onions.push((onion, None)),
                Link::Claimed(onion, witness) => onions.push((onion, Some(witness))),
                Link::Contradicted => contradicted = true,
                Link::Missing => {
                    self.inconclusive(matrix, player, "received onion not revealed");
                    complete = false;
                }
            }
        }
        if !complete || contradicted {
            return verdict;
        }

        let mut previous: Option<BTreeSet<Address>> = None;
        let mut previous_witness: Option<VerificationKey> = None;
        for (offset, (onion, witness)) in onions.iter().enumerate() {
            let number = offset + 2;
            let Some(sender) = self.players.get(number - 1) else {
                return verdict;
            };

            match self.peel(onion, &keys[offset..], number - 1) {
                Some(plain) if previous.as_ref().is_none_or(|p| p.is_subset(&plain)) => {
                    previous = Some(plain);
                    previous_witness = *witness;
                }
                _ => {
                    verdict.culprits.insert(*sender);
                    verdict.witnesses.extend(witness.iter().chain(&previous_witness));
                    break;
                }
            }
        }

        if verdict.culprits.is_empty() {
            if let (Some(received), Some((outputs, witness)), Some(last)) = (
                previous,
                self.final_outputs(pool),
                self.players.last(),
            ) {
                let complete_broadcast = outputs.addresses().is_ok_and(|outputs| {
                    let set: BTreeSet<Address> = outputs.iter().cloned().collect();
                    set.len() == n && outputs.len() == n && received.is_subset(&set)
                });
                if !complete_broadcast {
                    verdict.culprits.insert(*last);
                    verdict.witnesses.extend(witness.iter().chain(&previous_witness));
                }
            }
        }

        for culprit in &verdict.culprits {
            if *culprit == self.me {
                warn!("decrypt chain reconstruction names the local player");
                continue;
            }
            matrix.record(
                self.me,
                *culprit,
                Evidence::new(
                    Reason::ShuffleFailure,
                    true,
                    Detail::Note("decrypt chain breaks at this player".into()),
                ),
            );
        }
        verdict
    }

    /// The onion player `number` received, checked against what its
    /// predecessor says it forwarded
    fn link(&self, matrix: &mut BlameMatrix, pool: &Pool, number: usize) -> Link {
        let (Some(receiver), Some(sender)) = (self.players.get(number), self.players.get(number - 1))
        else {
            return Link::Missing;
        };

        match (pool.shuffle_inputs.get(receiver), pool.shuffle_sent.get(sender)) {
            (Some(received), Some(sent)) if received == sent => Link::Agreed(received.clone()),
            (Some(received), Some(_)) if *receiver == self.me => {
                self.inconclusive(matrix, sender, "revealed a shuffle packet we never received");
                Link::Agreed(received.clone())
            }
            (Some(_), Some(sent)) if *sender == self.me => {
                self.inconclusive(matrix, receiver, "revealed a shuffle packet we never sent");
                Link::Agreed(sent.clone())
            }
            (Some(_), Some(_)) => {
                self.inconclusive(matrix, sender, "forwarded onion disputed by its receiver");
                self.inconclusive(matrix, receiver, "received onion disputed by its sender");
                Link::Contradicted
            }
            (Some(received), None) if *receiver == self.me => Link::Agreed(received.clone()),
            (Some(received), None) => Link::Claimed(received.clone(), *receiver),
            (None, Some(sent)) if *sender == self.me => Link::Agreed(sent.clone()),
            (None, Some(sent)) => Link::Claimed(sent.clone(), *sender),
            (None, None) => Link::Missing,
        }
    }

    /// True when the last player revealed a different broadcast to
    /// `reporter` than the one `reporter` says it received
    fn broadcast_contradicted(
        &self,
        matrix: &mut BlameMatrix,
        pool: &Pool,
        reporter: &VerificationKey,
    ) -> bool {
        let (Some(received), Some(sent), Some(last)) = (
            pool.output_vectors.get(reporter),
            pool.broadcast_sent.get(reporter),
            self.players.last(),
        ) else {
            return false;
        };
        if received == sent {
            return false;
        }

        self.inconclusive(matrix, last, "broadcast output disputed by its receiver");
        if *reporter == self.me {
            return false;
        }
        if *last != self.me {
            self.inconclusive(matrix, reporter, "received broadcast disputed by its sender");
        }
        true
    }

    /// The final broadcast to judge completeness by, with the reporter it
    /// rests on when neither end confirms it
    fn final_outputs(&self, pool: &Pool) -> Option<(Message, Option<VerificationKey>)> {
        if self.players.last() == Some(&self.me) {
            if let Some(sent) = pool.broadcast_sent.values().next() {
                return Some((sent.clone(), None));
            }
        }
        if let Some(own) = pool.output_vectors.get(&self.me) {
            return Some((own.clone(), None));
        }

        let mut claimed = None;
        for (reporter, vector) in &pool.output_vectors {
            match pool.broadcast_sent.get(reporter) {
                Some(sent) if sent == vector => return Some((vector.clone(), None)),
                Some(_) => {}
                None => {
                    claimed.get_or_insert_with(|| (vector.clone(), Some(*reporter)));
                }
            }
        }
        claimed
    }

    /// Fully decrypt one onion; `None` if any entry fails, repeats, or the
    /// count is off
    fn peel(
        &self,
        onion: &Message,
        layers: &[&DecryptionKey],
        expected: usize,
    ) -> Option<BTreeSet<Address>> {
        let layered = onion.addresses().ok()?;
        let mut plain = BTreeSet::new();
        for address in &layered {
            let address = decrypt_layers(self.crypto, address, layers).ok()?;
            if !plain.insert(address) {
                return None;
            }
        }
        (plain.len() == expected).then_some(plain)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn announced_key(&self, player: &VerificationKey) -> Option<EncryptionKey> {
        self.players
            .index_of(player)
            .and_then(|i| self.encryption_keys.get(i).copied().flatten())
    }

    /// Accusations must name a player of this round
    fn known(&self, matrix: &mut BlameMatrix, from: &VerificationKey, accused: &VerificationKey) -> bool {
        if self.players.contains(accused) {
            return true;
        }
        self.inconclusive(matrix, from, "accused a non-player");
        false
    }

    fn insert_once(
        &self,
        matrix: &mut BlameMatrix,
        reports: &mut BTreeMap<VerificationKey, Message>,
        key: VerificationKey,
        from: &VerificationKey,
        message: &Message,
        what: &str,
    ) {
        match reports.get(&key) {
            Some(existing) if existing != message => {
                let note = format!("conflicting {what} reports");
                self.inconclusive(matrix, from, &note);
            }
            Some(_) => {}
            None => {
                reports.insert(key, message.clone());
            }
        }
    }

    fn inconclusive(&self, matrix: &mut BlameMatrix, against: &VerificationKey, note: &str) {
        debug!("inconclusive evidence against {}: {}", against, note);
        matrix.record(self.me, *against, Evidence::inconclusive(note));
    }
}
