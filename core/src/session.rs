//! Session Driver
//!
//! Runs rounds over a shrinking player set until one completes, the retry
//! budget is spent, or nobody can be eliminated with confidence.
//!
//! ```text
//!   players ──▶ Round ──▶ Completed ─────────────────────────────▶ success
//!                 │
//!                 └──▶ Blamed ──▶ eliminate ──┬─ culprits found ──▶ next Round (attempt + 1)
//!                                             └─ none / us ───────▶ failure
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::blame::BlameMatrix;
use crate::config::SessionConfig;
use crate::crypto::Crypto;
use crate::error::{Result, ShuffleError};
use crate::ledger::{Ledger, Transaction};
use crate::packet::Packet;
use crate::phase::{Phase, PhaseMonitor};
use crate::round::{Round, RoundContext, RoundOutcome};
use crate::transport::Transport;
use crate::types::{Address, SessionId, SigningKey, VerificationKey};

// ============================================================================
// Outcome
// ============================================================================

/// Terminal result of [`Session::run`]
#[derive(Debug)]
pub struct SessionOutcome {
    pub session: SessionId,
    pub success: bool,
    /// Phase the last round stopped in
    pub phase: Phase,
    /// Rounds started
    pub attempts: u32,
    pub transaction: Option<Transaction>,
    /// Controls our new output address on success
    pub output_key: Option<SigningKey>,
    pub blame: Option<BlameMatrix>,
    pub eliminated: BTreeSet<VerificationKey>,
    pub error: Option<ShuffleError>,
}

impl SessionOutcome {
    fn failure(session: SessionId, phase: Phase, attempts: u32) -> Self {
        Self {
            session,
            success: false,
            phase,
            attempts,
            transaction: None,
            output_key: None,
            blame: None,
            eliminated: BTreeSet::new(),
            error: None,
        }
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.success {
            write!(
                f,
                "successful run of session {} after {} attempt(s)",
                self.session, self.attempts
            )?;
            if let Some(transaction) = &self.transaction {
                write!(f, " with {} input(s)", transaction.inputs.len())?;
            }
            return Ok(());
        }

        write!(
            f,
            "unsuccessful run of session {}: failed in phase {}",
            self.session, self.phase
        )?;
        if let Some(error) = &self.error {
            write!(f, "; error: {error}")?;
        }
        if let Some(blame) = &self.blame {
            write!(f, "; blame {blame}")?;
        }
        Ok(())
    }
}

// ============================================================================
// Session
// ============================================================================

pub struct Session {
    id: SessionId,
    signing_key: SigningKey,
    me: VerificationKey,
    players: BTreeSet<VerificationKey>,
    change: Option<Address>,
    config: SessionConfig,
    crypto: Arc<dyn Crypto>,
    ledger: Arc<dyn Ledger>,
    transport: Box<dyn Transport>,
    monitor: PhaseMonitor,
    started: bool,
}

impl Session {
    pub fn new(
        id: SessionId,
        signing_key: SigningKey,
        players: BTreeSet<VerificationKey>,
        config: SessionConfig,
        crypto: Arc<dyn Crypto>,
        ledger: Arc<dyn Ledger>,
        transport: Box<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let me = crypto.verification_key(&signing_key);
        Ok(Self {
            id,
            signing_key,
            me,
            players,
            change: None,
            config,
            crypto,
            ledger,
            transport,
            monitor: PhaseMonitor::new(),
            started: false,
        })
    }

    /// Announce a change address with our encryption key
    pub fn with_change(mut self, change: Address) -> Self {
        self.change = Some(change);
        self
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn verification_key(&self) -> VerificationKey {
        self.me
    }

    /// Handle for reading the current phase from another thread
    pub fn monitor(&self) -> PhaseMonitor {
        self.monitor.clone()
    }

    /// Run the protocol to completion. A session runs at most once.
    pub fn run(&mut self) -> SessionOutcome {
        if self.started {
            let mut outcome = SessionOutcome::failure(self.id, self.monitor.get(), 0);
            outcome.error = Some(ShuffleError::AlreadyStarted);
            return outcome;
        }
        self.started = true;

        let mut survivors = self.players.clone();
        let mut eliminated = BTreeSet::new();
        let mut carried: Vec<Packet> = Vec::new();
        let mut attempt: u32 = 0;
        let mut last_blame = None;

        while survivors.len() >= self.config.min_players {
            let context = RoundContext {
                session: self.id,
                attempt,
                amount: self.config.amount,
                signing_key: &self.signing_key,
                change: self.change.as_ref(),
                crypto: self.crypto.as_ref(),
                ledger: self.ledger.as_ref(),
                monitor: &self.monitor,
            };

            let result = match Round::new(context, &survivors, self.transport.as_mut()) {
                Ok(mut round) => {
                    round.preload(std::mem::take(&mut carried));
                    let result = round.run();
                    carried = round.take_ahead();
                    result
                }
                Err(e) => Err(e),
            };
            attempt += 1;

            let matrix = match result {
                Ok(RoundOutcome::Completed {
                    transaction,
                    output_key,
                }) => {
                    let mut outcome = SessionOutcome::failure(self.id, self.monitor.get(), attempt);
                    outcome.success = true;
                    outcome.transaction = Some(transaction);
                    outcome.output_key = Some(output_key);
                    outcome.eliminated = eliminated;
                    info!("{}", outcome);
                    return outcome;
                }
                Ok(RoundOutcome::Blamed(matrix)) => matrix,
                Err(e) => {
                    warn!("session {} attempt {} aborted: {}", self.id, attempt - 1, e);
                    let mut outcome = SessionOutcome::failure(self.id, self.monitor.get(), attempt);
                    outcome.error = Some(e);
                    outcome.blame = last_blame;
                    outcome.eliminated = eliminated;
                    return outcome;
                }
            };

            if attempt > self.config.max_retries {
                warn!("session {} out of retries after {} attempt(s)", self.id, attempt);
                return self.blamed(matrix, attempt, eliminated);
            }

            let culprits = eliminate(&matrix, &survivors);
            if culprits.contains(&self.me) {
                warn!("session {}: we were eliminated", self.id);
                return self.blamed(matrix, attempt, eliminated);
            }
            if culprits.is_empty() {
                warn!("session {}: blame names no one with confidence", self.id);
                return self.blamed(matrix, attempt, eliminated);
            }

            for culprit in &culprits {
                info!("session {}: eliminating {}", self.id, culprit);
                survivors.remove(culprit);
            }
            eliminated.extend(culprits);
            last_blame = Some(matrix);
        }

        let mut outcome = SessionOutcome::failure(self.id, self.monitor.get(), attempt);
        outcome.error = Some(ShuffleError::TooFewPlayers {
            remaining: survivors.len(),
            minimum: self.config.min_players,
        });
        outcome.blame = last_blame;
        outcome.eliminated = eliminated;
        outcome
    }

    fn blamed(
        &self,
        matrix: BlameMatrix,
        attempts: u32,
        eliminated: BTreeSet<VerificationKey>,
    ) -> SessionOutcome {
        let mut outcome = SessionOutcome::failure(self.id, self.monitor.get(), attempts);
        outcome.blame = Some(matrix);
        outcome.eliminated = eliminated;
        outcome
    }
}

/// Players that at least two honest-seeming accusers hold conclusive
/// evidence against.
///
/// An accuser seems honest while no conclusive evidence names it.
/// Inconclusive entries never count either way.
pub fn eliminate(
    matrix: &BlameMatrix,
    players: &BTreeSet<VerificationKey>,
) -> BTreeSet<VerificationKey> {
    let suspects: BTreeSet<VerificationKey> = players
        .iter()
        .filter(|p| !matrix.conclusive_accusers(p).is_empty())
        .copied()
        .collect();

    players
        .iter()
        .filter(|accused| {
            matrix
                .conclusive_accusers(accused)
                .iter()
                .filter(|accuser| players.contains(*accuser) && !suspects.contains(*accuser))
                .count()
                >= 2
        })
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blame::{Detail, Evidence, Reason};
    use crate::mock::{MemoryNetwork, MockCrypto, MockLedger};
    use std::time::Duration;

    fn key(i: u8) -> VerificationKey {
        VerificationKey([i; 32])
    }

    fn players(n: u8) -> BTreeSet<VerificationKey> {
        (1..=n).map(key).collect()
    }

    #[test]
    fn test_single_accuser_is_not_enough() {
        let mut matrix = BlameMatrix::new();
        matrix.record(key(1), key(3), Evidence::credible(Reason::MissingOutput));
        matrix.record(key(2), key(3), Evidence::inconclusive("no broadcast output report"));

        assert!(eliminate(&matrix, &players(3)).is_empty());
    }

    #[test]
    fn test_two_honest_accusers_eliminate() {
        let mut matrix = BlameMatrix::new();
        matrix.record(key(1), key(2), Evidence::credible(Reason::NoFundsAtAll));
        matrix.record(key(3), key(2), Evidence::credible(Reason::NoFundsAtAll));
        // Counter-accusation from the accused is not credible
        matrix.record(
            key(2),
            key(1),
            Evidence::new(Reason::NoFundsAtAll, false, Detail::None),
        );

        assert_eq!(eliminate(&matrix, &players(3)), [key(2)].into_iter().collect());
    }

    #[test]
    fn test_suspect_accusers_do_not_count() {
        let mut matrix = BlameMatrix::new();
        matrix.record(key(1), key(2), Evidence::credible(Reason::DoubleSpend));
        matrix.record(key(3), key(2), Evidence::credible(Reason::DoubleSpend));
        matrix.record(key(4), key(3), Evidence::credible(Reason::InvalidSignature));

        // Key 3 is itself accused, so only key 1 counts against key 2
        assert!(eliminate(&matrix, &players(4)).is_empty());
    }

    #[test]
    fn test_outcome_display() {
        let mut outcome = SessionOutcome::failure(SessionId::from_label("display"), Phase::Blame, 2);
        let mut matrix = BlameMatrix::new();
        matrix.record(key(1), key(2), Evidence::credible(Reason::DoubleSpend));
        outcome.blame = Some(matrix);

        let text = outcome.to_string();
        assert!(text.starts_with("unsuccessful run"));
        assert!(text.contains("failed in phase blame"));
        assert!(text.contains("double spend"));

        outcome.success = true;
        assert!(outcome.to_string().starts_with("successful run"));
    }

    #[test]
    fn test_config_is_validated() {
        let crypto: Arc<dyn Crypto> = Arc::new(MockCrypto::new(5));
        let signing_key = crypto.make_signing_key();
        let network = MemoryNetwork::new(Duration::from_millis(10));
        let transport = Box::new(network.endpoint(crypto.verification_key(&signing_key)));
        let config = SessionConfig {
            amount: 0,
            ..SessionConfig::default()
        };

        let result = Session::new(
            SessionId::from_label("bad-config"),
            signing_key,
            players(3),
            config,
            crypto,
            Arc::new(MockLedger::new()),
            transport,
        );
        assert!(matches!(result, Err(ShuffleError::InvalidConfig(_))));
    }

    #[test]
    fn test_too_few_players_fails_without_a_round() {
        let crypto: Arc<dyn Crypto> = Arc::new(MockCrypto::new(6));
        let signing_key = crypto.make_signing_key();
        let me = crypto.verification_key(&signing_key);
        let network = MemoryNetwork::new(Duration::from_millis(10));
        let transport = Box::new(network.endpoint(me));

        let mut session = Session::new(
            SessionId::from_label("lonely"),
            signing_key,
            [me, key(9)].into_iter().collect(),
            SessionConfig::default(),
            crypto,
            Arc::new(MockLedger::new()),
            transport,
        )
        .unwrap();

        let outcome = session.run();
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 0);
        assert!(matches!(
            outcome.error,
            Some(ShuffleError::TooFewPlayers { remaining: 2, minimum: 3 })
        ));
    }
}
