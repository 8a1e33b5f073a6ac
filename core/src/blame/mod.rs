//! Blame
//!
//! Accusation records exchanged in the blame phase, the matrix each node
//! builds from them, and the evaluator that cross-checks peer evidence.
//!
//! ```text
//!   blame packets ──▶ Evaluator ──┬─ per-record checks (ledger, signatures, keys)
//!   own history  ───▶             ├─ output-vector / announcement consistency
//!                                 └─ decrypt-chain reconstruction
//!                                          │
//!                                          ▼
//!                              BlameMatrix (accuser → accused → evidence)
//! ```

mod evaluator;
mod matrix;

pub use evaluator::Evaluator;
pub use matrix::{BlameMatrix, Detail, Evidence};

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ledger::Transaction;
use crate::packet::Packet;
use crate::types::{DecryptionKey, Signature, VerificationKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Reason {
    NoFundsAtAll = 1,
    InsufficientFunds = 2,
    DoubleSpend = 3,
    EquivocationFailure = 4,
    ShuffleFailure = 5,
    MissingOutput = 6,
    InvalidSignature = 7,
    /// Evidence that could not be resolved either way
    Inconclusive = 8,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Reason::NoFundsAtAll => "no funds at all",
            Reason::InsufficientFunds => "insufficient funds",
            Reason::DoubleSpend => "double spend",
            Reason::EquivocationFailure => "equivocation",
            Reason::ShuffleFailure => "shuffle failure",
            Reason::MissingOutput => "missing output",
            Reason::InvalidSignature => "invalid signature",
            Reason::Inconclusive => "inconclusive",
        };
        f.write_str(name)
    }
}

/// An accusation or evidence record carried in a Blame-phase message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Blame {
    NoFundsAtAll {
        accused: VerificationKey,
    },
    InsufficientFunds {
        accused: VerificationKey,
        transaction: Transaction,
    },
    DoubleSpend {
        accused: VerificationKey,
        transaction: Transaction,
    },
    /// Our new address was absent from the final broadcast
    MissingOutput {
        accused: VerificationKey,
    },
    /// The onion we received did not decrypt
    ShuffleFailure {
        accused: VerificationKey,
    },
    /// Revealed per-round key and the shuffle packets we received
    ShuffleEvidence {
        decryption_key: Option<DecryptionKey>,
        packets: Vec<Packet>,
    },
    /// Announcement and broadcast-output packets we received
    EquivocationFailure {
        packets: Vec<Packet>,
    },
    InvalidSignature {
        invalid: Vec<(VerificationKey, Signature)>,
    },
}

impl Blame {
    pub fn reason(&self) -> Reason {
        match self {
            Blame::NoFundsAtAll { .. } => Reason::NoFundsAtAll,
            Blame::InsufficientFunds { .. } => Reason::InsufficientFunds,
            Blame::DoubleSpend { .. } => Reason::DoubleSpend,
            Blame::MissingOutput { .. } => Reason::MissingOutput,
            Blame::ShuffleFailure { .. } | Blame::ShuffleEvidence { .. } => Reason::ShuffleFailure,
            Blame::EquivocationFailure { .. } => Reason::EquivocationFailure,
            Blame::InvalidSignature { .. } => Reason::InvalidSignature,
        }
    }
}
