//! In-Memory Collaborators
//!
//! Deterministic stand-ins for the crypto backend, the ledger and the
//! network, good enough to run whole sessions on threads inside one
//! process.

mod crypto;
mod ledger;
mod network;

pub use crypto::MockCrypto;
pub use ledger::MockLedger;
pub use network::{MemoryNetwork, MemoryTransport};
