use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::Reason;
use crate::ledger::Transaction;
use crate::message::Message;
use crate::types::{EncryptionKey, Signature, VerificationKey};

/// Supporting material attached to an accusation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Detail {
    None,
    Transaction(Transaction),
    Signature(Signature),
    /// Broadcast-output vectors as reported by each recipient
    OutputVectors(Vec<(VerificationKey, Message)>),
    /// Encryption keys one sender announced, as reported by each recipient
    Announcements(Vec<(VerificationKey, EncryptionKey)>),
    Note(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub reason: Reason,
    /// Corroborated by the local node's own checks
    pub credible: bool,
    pub detail: Detail,
}

impl Evidence {
    pub fn new(reason: Reason, credible: bool, detail: Detail) -> Self {
        Self {
            reason,
            credible,
            detail,
        }
    }

    pub fn credible(reason: Reason) -> Self {
        Self::new(reason, true, Detail::None)
    }

    pub fn inconclusive(note: impl Into<String>) -> Self {
        Self::new(Reason::Inconclusive, false, Detail::Note(note.into()))
    }

    /// Counts towards elimination
    pub fn is_conclusive(&self) -> bool {
        self.credible && self.reason != Reason::Inconclusive
    }
}

/// Sparse accuser → accused → evidence relation.
///
/// At most one entry exists per (accuser, accused, reason). Entries are
/// never removed; recording the same triple again can only raise its
/// credibility.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlameMatrix {
    entries: BTreeMap<VerificationKey, BTreeMap<VerificationKey, Vec<Evidence>>>,
}

impl BlameMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the matrix changed
    pub fn record(
        &mut self,
        accuser: VerificationKey,
        accused: VerificationKey,
        evidence: Evidence,
    ) -> bool {
        let list = self
            .entries
            .entry(accuser)
            .or_default()
            .entry(accused)
            .or_default();

        match list.iter_mut().find(|e| e.reason == evidence.reason) {
            Some(existing) if !existing.credible && evidence.credible => {
                existing.credible = true;
                true
            }
            Some(_) => false,
            None => {
                list.push(evidence);
                true
            }
        }
    }

    pub fn contains(&self, accuser: &VerificationKey, accused: &VerificationKey, reason: Reason) -> bool {
        self.get(accuser, accused)
            .is_some_and(|list| list.iter().any(|e| e.reason == reason))
    }

    pub fn get(&self, accuser: &VerificationKey, accused: &VerificationKey) -> Option<&[Evidence]> {
        self.entries
            .get(accuser)
            .and_then(|row| row.get(accused))
            .map(Vec::as_slice)
    }

    /// Every (accuser, evidence) pair naming `accused`
    pub fn against<'a>(
        &'a self,
        accused: &'a VerificationKey,
    ) -> impl Iterator<Item = (&'a VerificationKey, &'a Evidence)> + 'a {
        self.entries.iter().flat_map(move |(accuser, row)| {
            row.get(accused)
                .into_iter()
                .flatten()
                .map(move |evidence| (accuser, evidence))
        })
    }

    /// Accusers with at least one conclusive entry against `accused`
    pub fn conclusive_accusers(&self, accused: &VerificationKey) -> BTreeSet<VerificationKey> {
        self.against(accused)
            .filter(|(accuser, evidence)| *accuser != accused && evidence.is_conclusive())
            .map(|(accuser, _)| *accuser)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(|row| row.values().all(Vec::is_empty))
    }

    /// Number of recorded (accuser, accused, reason) entries
    pub fn len(&self) -> usize {
        self.entries
            .values()
            .flat_map(|row| row.values())
            .map(Vec::len)
            .sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&VerificationKey, &VerificationKey, &Evidence)> {
        self.entries.iter().flat_map(|(accuser, row)| {
            row.iter()
                .flat_map(move |(accused, list)| list.iter().map(move |e| (accuser, accused, e)))
        })
    }
}

impl fmt::Display for BlameMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("{}");
        }
        f.write_str("{")?;
        for (i, (accuser, accused, evidence)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(
                f,
                "{accuser} -> {accused}: {}{}",
                evidence.reason,
                if evidence.credible { "" } else { " (unverified)" }
            )?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: u8) -> VerificationKey {
        VerificationKey([i; 32])
    }

    #[test]
    fn test_record_is_idempotent_per_reason() {
        let mut matrix = BlameMatrix::new();
        assert!(matrix.record(key(1), key(2), Evidence::credible(Reason::NoFundsAtAll)));
        assert!(!matrix.record(key(1), key(2), Evidence::credible(Reason::NoFundsAtAll)));
        assert!(matrix.record(key(1), key(2), Evidence::credible(Reason::DoubleSpend)));

        assert_eq!(matrix.len(), 2);
        assert!(matrix.contains(&key(1), &key(2), Reason::NoFundsAtAll));
        assert!(!matrix.contains(&key(2), &key(1), Reason::NoFundsAtAll));
    }

    #[test]
    fn test_credibility_only_rises() {
        let mut matrix = BlameMatrix::new();
        let doubtful = Evidence::new(Reason::MissingOutput, false, Detail::None);
        matrix.record(key(1), key(3), doubtful.clone());
        assert!(matrix.conclusive_accusers(&key(3)).is_empty());

        assert!(matrix.record(key(1), key(3), Evidence::credible(Reason::MissingOutput)));
        assert!(!matrix.record(key(1), key(3), doubtful));
        assert_eq!(matrix.conclusive_accusers(&key(3)), [key(1)].into_iter().collect());
    }

    #[test]
    fn test_inconclusive_never_counts() {
        let mut matrix = BlameMatrix::new();
        matrix.record(key(1), key(2), Evidence::inconclusive("missing report"));
        matrix.record(key(3), key(2), Evidence::credible(Reason::InvalidSignature));
        matrix.record(key(2), key(2), Evidence::credible(Reason::InvalidSignature));

        assert_eq!(matrix.conclusive_accusers(&key(2)), [key(3)].into_iter().collect());
        assert_eq!(matrix.against(&key(2)).count(), 3);
    }

    #[test]
    fn test_display_lists_entries() {
        let mut matrix = BlameMatrix::new();
        assert_eq!(matrix.to_string(), "{}");
        matrix.record(key(1), key(2), Evidence::credible(Reason::DoubleSpend));
        assert!(matrix.to_string().contains("double spend"));
    }
}
