//! Protocol Errors

use thiserror::Error;

use crate::ledger::LedgerError;
use crate::packet::Packet;
use crate::phase::Phase;
use crate::transport::TransportError;
use crate::types::VerificationKey;

pub type Result<T> = std::result::Result<T, ShuffleError>;

/// Everything that can stop a round.
///
/// `BlameReceived` is not a fault: it is the signal that a peer has moved
/// the round into the blame phase while we were waiting for something
/// else. Callers match on it explicitly.
#[derive(Debug, Error)]
pub enum ShuffleError {
    #[error("timed out waiting for a {phase} packet")]
    Timeout { phase: Phase },

    #[error("malformed message: expected {expected}, found {found}")]
    Format {
        expected: &'static str,
        found: String,
    },

    #[error("cryptography failure: {0}")]
    Cryptography(String),

    #[error("{field} mismatch: expected {expected}, found {found}")]
    Mismatch {
        field: &'static str,
        expected: String,
        found: String,
    },

    #[error("protocol violation: {sender} sent more than one {phase} packet")]
    ProtocolViolation {
        sender: VerificationKey,
        phase: Phase,
    },

    #[error("local player is not part of the participant set")]
    InvalidParticipantSet,

    #[error("blame packet from {} received while waiting for {expected}", .packet.sender)]
    BlameReceived {
        expected: Phase,
        packet: Box<Packet>,
    },

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("only {remaining} player(s) remain, at least {minimum} required")]
    TooFewPlayers { remaining: usize, minimum: usize },

    #[error("session has already been started")]
    AlreadyStarted,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ShuffleError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ShuffleError::Timeout { .. })
    }

    pub fn is_blame(&self) -> bool {
        matches!(self, ShuffleError::BlameReceived { .. })
    }
}
