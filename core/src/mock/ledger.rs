use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use crate::ledger::{ChangeOutput, Ledger, LedgerError, Transaction};
use crate::types::{Address, Signature, VerificationKey};

#[derive(Default)]
struct LedgerState {
    balances: HashMap<Address, u64>,
    conflicts: HashMap<Address, Transaction>,
    submitted: Vec<Transaction>,
}

/// Shared in-memory ledger.
///
/// A registered conflict models an unconfirmed spend: `value_held` still
/// reports the confirmed balance, but building a transaction over that
/// input fails.
#[derive(Default)]
pub struct MockLedger {
    state: Mutex<LedgerState>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fund(&self, address: Address, value: u64) {
        self.state.lock().balances.insert(address, value);
    }

    /// Register a spend of `address` the ledger has seen elsewhere
    pub fn add_conflict(&self, address: Address, transaction: Transaction) {
        self.state.lock().conflicts.insert(address, transaction);
    }

    pub fn submitted(&self) -> Vec<Transaction> {
        self.state.lock().submitted.clone()
    }
}

impl Ledger for MockLedger {
    fn value_held(&self, address: &Address) -> Result<u64, LedgerError> {
        Ok(self.state.lock().balances.get(address).copied().unwrap_or(0))
    }

    fn shuffle_transaction(
        &self,
        amount: u64,
        inputs: &[Address],
        outputs: &[Address],
        change: &BTreeMap<Address, Address>,
    ) -> Result<Transaction, LedgerError> {
        let state = self.state.lock();
        for input in inputs {
            if state.conflicts.contains_key(input) {
                return Err(LedgerError::Conflict(format!("input {input} already spent")));
            }
            if state.balances.get(input).copied().unwrap_or(0) < amount {
                return Err(LedgerError::Construction(format!(
                    "input {input} holds less than {amount}"
                )));
            }
        }

        Ok(Transaction {
            amount,
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            change: change
                .iter()
                .map(|(input, address)| ChangeOutput {
                    input: input.clone(),
                    address: address.clone(),
                })
                .collect(),
        })
    }

    fn conflicting_transaction(&self, address: &Address, _amount: u64) -> Option<Transaction> {
        self.state.lock().conflicts.get(address).cloned()
    }

    fn spends_from(&self, address: &Address, _amount: u64, transaction: &Transaction) -> bool {
        let state = self.state.lock();
        state.conflicts.get(address) == Some(transaction) || transaction.inputs.contains(address)
    }

    fn submit(
        &self,
        transaction: &Transaction,
        signatures: &[(VerificationKey, Signature)],
    ) -> Result<(), LedgerError> {
        if signatures.len() != transaction.inputs.len() {
            return Err(LedgerError::Construction(format!(
                "{} signature(s) for {} input(s)",
                signatures.len(),
                transaction.inputs.len()
            )));
        }
        let mut state = self.state.lock();
        if !state.submitted.contains(transaction) {
            state.submitted.push(transaction.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> Address {
        Address(vec![byte])
    }

    #[test]
    fn test_unfunded_address_holds_nothing() {
        let ledger = MockLedger::new();
        assert_eq!(ledger.value_held(&addr(1)).unwrap(), 0);
        ledger.fund(addr(1), 50);
        assert_eq!(ledger.value_held(&addr(1)).unwrap(), 50);
    }

    #[test]
    fn test_conflict_blocks_construction() {
        let ledger = MockLedger::new();
        ledger.fund(addr(1), 50);
        ledger.fund(addr(2), 50);

        let spend = Transaction {
            amount: 50,
            inputs: vec![addr(2)],
            outputs: vec![addr(9)],
            change: Vec::new(),
        };
        ledger.add_conflict(addr(2), spend.clone());

        let result =
            ledger.shuffle_transaction(10, &[addr(1), addr(2)], &[addr(3), addr(4)], &BTreeMap::new());
        assert!(matches!(result, Err(LedgerError::Conflict(_))));
        assert_eq!(ledger.conflicting_transaction(&addr(2), 10), Some(spend.clone()));
        assert!(ledger.spends_from(&addr(2), 10, &spend));
        assert!(!ledger.spends_from(&addr(1), 10, &spend));
    }

    #[test]
    fn test_submit_is_idempotent() {
        let ledger = MockLedger::new();
        ledger.fund(addr(1), 10);
        let tx = ledger
            .shuffle_transaction(10, &[addr(1)], &[addr(2)], &BTreeMap::new())
            .unwrap();

        let signatures = vec![(VerificationKey([1; 32]), Signature(vec![7]))];
        ledger.submit(&tx, &signatures).unwrap();
        ledger.submit(&tx, &signatures).unwrap();
        assert_eq!(ledger.submitted(), vec![tx.clone()]);
        assert!(ledger.submit(&tx, &[]).is_err());
    }

    #[test]
    fn test_transaction_id_follows_content() {
        let ledger = MockLedger::new();
        ledger.fund(addr(1), 10);
        ledger.fund(addr(2), 10);
        let tx = ledger
            .shuffle_transaction(10, &[addr(1), addr(2)], &[addr(3), addr(4)], &BTreeMap::new())
            .unwrap();

        assert_eq!(tx.id().unwrap(), tx.clone().id().unwrap());

        let mut redirected = tx.clone();
        redirected.outputs[0] = addr(9);
        assert_ne!(tx.id().unwrap(), redirected.id().unwrap());
    }
}
