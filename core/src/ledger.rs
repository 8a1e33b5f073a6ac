//! Ledger Collaborator
//!
//! Balance lookups, transaction assembly, double-spend detection and
//! submission. The chain-specific format hides behind [`Ledger`]; the
//! protocol only needs the generic [`Transaction`] shape below.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use wincode::{SchemaRead, SchemaWrite};

use crate::types::{Address, Signature, VerificationKey};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("conflicting spend: {0}")]
    Conflict(String),
    #[error("network unavailable: {0}")]
    Network(String),
    #[error("cannot build transaction: {0}")]
    Construction(String),
}

/// Change returned to one input
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, SchemaRead, SchemaWrite)]
pub struct ChangeOutput {
    pub input: Address,
    pub address: Address,
}

/// The joint transaction every player signs.
///
/// Inputs follow the canonical player order; outputs follow the shuffled
/// order received in the broadcast phase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, SchemaRead, SchemaWrite)]
pub struct Transaction {
    pub amount: u64,
    pub inputs: Vec<Address>,
    pub outputs: Vec<Address>,
    pub change: Vec<ChangeOutput>,
}

impl Transaction {
    /// Bytes covered by every participant's signature
    pub fn signing_bytes(&self) -> Result<Vec<u8>, LedgerError> {
        wincode::serialize(self).map_err(|e| LedgerError::Construction(e.to_string()))
    }

    /// Content hash, stable across participants
    pub fn id(&self) -> Result<[u8; 32], LedgerError> {
        Ok(*blake3::hash(&self.signing_bytes()?).as_bytes())
    }
}

pub trait Ledger: Send + Sync {
    /// Confirmed value available at an address
    fn value_held(&self, address: &Address) -> Result<u64, LedgerError>;

    /// Assemble the joint transaction.
    ///
    /// `change` maps an input address to the change address its owner
    /// announced; inputs without an entry get no change output.
    fn shuffle_transaction(
        &self,
        amount: u64,
        inputs: &[Address],
        outputs: &[Address],
        change: &BTreeMap<Address, Address>,
    ) -> Result<Transaction, LedgerError>;

    /// A transaction that spends from `address` so that less than `amount`
    /// remains, if the ledger knows one.
    fn conflicting_transaction(&self, address: &Address, amount: u64) -> Option<Transaction>;

    /// Whether `transaction` spends from `address` in a way that leaves less
    /// than `amount` behind.
    fn spends_from(&self, address: &Address, amount: u64, transaction: &Transaction) -> bool;

    /// Relay the transaction together with every participant's signature
    fn submit(
        &self,
        transaction: &Transaction,
        signatures: &[(VerificationKey, Signature)],
    ) -> Result<(), LedgerError>;
}
