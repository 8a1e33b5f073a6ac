//! Player Numbering
//!
//! The protocol talks about players 1..N. Internally the keys sit in a
//! zero-indexed vector and a separate map answers "which position is this
//! key", so the two directions can never drift apart.

use std::collections::{BTreeSet, HashMap};

use crate::types::VerificationKey;

/// Bijection between 1-based player numbers and verification keys
#[derive(Debug, Clone)]
pub struct PlayerOrder {
    keys: Vec<VerificationKey>,
    positions: HashMap<VerificationKey, usize>,
}

impl PlayerOrder {
    /// Number the players in ascending key order
    pub fn new(players: &BTreeSet<VerificationKey>) -> Self {
        let keys: Vec<VerificationKey> = players.iter().copied().collect();
        let positions = keys.iter().enumerate().map(|(i, key)| (*key, i)).collect();
        Self { keys, positions }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Key of player `number` (1-based)
    pub fn get(&self, number: usize) -> Option<&VerificationKey> {
        number.checked_sub(1).and_then(|i| self.keys.get(i))
    }

    /// 1-based number of `key`
    pub fn number_of(&self, key: &VerificationKey) -> Option<usize> {
        self.positions.get(key).map(|i| i + 1)
    }

    /// Zero-based slot of `key`, for per-player vectors
    pub fn index_of(&self, key: &VerificationKey) -> Option<usize> {
        self.positions.get(key).copied()
    }

    pub fn contains(&self, key: &VerificationKey) -> bool {
        self.positions.contains_key(key)
    }

    pub fn first(&self) -> Option<&VerificationKey> {
        self.keys.first()
    }

    pub fn last(&self) -> Option<&VerificationKey> {
        self.keys.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VerificationKey> {
        self.keys.iter()
    }

    /// Keys of players `max(from, 1)..=min(to, N)`; empty when `from > N`
    pub fn set(&self, from: usize, to: usize) -> BTreeSet<VerificationKey> {
        let from = from.max(1);
        let to = to.min(self.keys.len());
        if from > to {
            return BTreeSet::new();
        }
        self.keys[from - 1..to].iter().copied().collect()
    }

    pub fn all(&self) -> BTreeSet<VerificationKey> {
        self.keys.iter().copied().collect()
    }
}
