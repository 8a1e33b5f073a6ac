//! CoinShuffle Protocol Engine
//!
//! Decentralized coin mixing: N players jointly build one transaction
//! whose outputs cannot be linked to their inputs, and attribute blame
//! when someone deviates.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Session                                │
//! │   retries rounds, eliminates corroborated culprits               │
//! │                                                                  │
//! │   ┌──────────────────────────────────────────────────────────┐   │
//! │   │                         Round                            │   │
//! │   │  Announcement ─▶ Shuffling ─▶ BroadcastOutput            │   │
//! │   │     ─▶ EquivocationCheck ─▶ Verification ─▶ Completed    │   │
//! │   │                  │                                       │   │
//! │   │                  └──▶ Blame ──▶ Evaluator ──▶ BlameMatrix │   │
//! │   └──────────┬───────────────────────────────┬───────────────┘   │
//! │              │                               │                   │
//! │        PacketRouter                   Crypto / Ledger            │
//! │              │                                                   │
//! │          Transport                                               │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Collaborators ([`Crypto`], [`Ledger`], [`Transport`]) are traits; the
//! [`mock`] module has in-memory versions for tests.

pub mod blame;
pub mod config;
pub mod crypto;
pub mod error;
pub mod ledger;
pub mod message;
pub mod mock;
pub mod packet;
pub mod phase;
pub mod players;
pub mod round;
pub mod router;
pub mod session;
pub mod shuffle;
pub mod transport;
pub mod types;

pub use blame::{Blame, BlameMatrix, Detail, Evidence, Reason};
pub use config::{NetworkConfig, SessionConfig, ShuffleConfig};
pub use crypto::Crypto;
pub use error::{Result, ShuffleError};
pub use ledger::{ChangeOutput, Ledger, LedgerError, Transaction};
pub use message::{Element, Message, MessageReader};
pub use packet::Packet;
pub use phase::{Phase, PhaseMonitor};
pub use players::PlayerOrder;
pub use round::{Round, RoundContext, RoundOutcome};
pub use router::PacketRouter;
pub use session::{Session, SessionOutcome, eliminate};
pub use transport::{Transport, TransportError};
pub use types::{
    Address, DecryptionKey, Digest, EncryptionKey, SessionId, Signature, SigningKey,
    VerificationKey,
};
