//! Shuffle and Relay
//!
//! Each hop of the shuffle peels one onion layer off every address it
//! received, checks the set, adds its own layered address and permutes:
//!
//! ```text
//!  player 1        player 2              player 3 (last)
//!  [E3(E2(a1))] ─▶ peel ─▶ [E3(a1)]      peel ─▶ [a1, a2]
//!                  + E3(a2)              + a3
//!                  permute ─────────────▶ permute ─▶ broadcast
//! ```

use std::collections::HashSet;

use crate::blame::Blame;
use crate::crypto::Crypto;
use crate::error::Result;
use crate::types::{Address, DecryptionKey, EncryptionKey, VerificationKey};

/// Why a relay step rejected the set it received
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFault {
    /// A layer did not decrypt under our key
    Undecryptable,
    /// Two entries decrypted to the same address
    Duplicate,
    WrongCount { expected: usize, found: usize },
}

impl RelayFault {
    /// The accusation broadcast against `accused` (the last player)
    pub fn accusation(&self, accused: VerificationKey) -> Blame {
        match self {
            RelayFault::Undecryptable => Blame::ShuffleFailure { accused },
            RelayFault::Duplicate | RelayFault::WrongCount { .. } => {
                Blame::MissingOutput { accused }
            }
        }
    }
}

/// Uniform random permutation.
///
/// Repeatedly draws an index into the unplaced items with
/// `random(max_inclusive)` and moves that item to the output.
pub fn permute<T>(mut items: Vec<T>, mut random: impl FnMut(usize) -> usize) -> Vec<T> {
    let mut shuffled = Vec::with_capacity(items.len());
    while !items.is_empty() {
        let last = items.len() - 1;
        let pick = random(last).min(last);
        shuffled.push(items.swap_remove(pick));
    }
    shuffled
}

/// Permute with the collaborator's random source
pub fn shuffle(crypto: &dyn Crypto, addresses: Vec<Address>) -> Vec<Address> {
    permute(addresses, |max| crypto.random(max))
}

/// Apply `layers` in order; the first key ends up innermost
pub fn encrypt_layers(
    crypto: &dyn Crypto,
    address: &Address,
    layers: &[EncryptionKey],
) -> Result<Address> {
    layers
        .iter()
        .try_fold(address.clone(), |layered, key| crypto.encrypt(key, &layered))
}

/// Remove `layers` in order; the first key is the outermost layer
pub fn decrypt_layers(
    crypto: &dyn Crypto,
    address: &Address,
    layers: &[&DecryptionKey],
) -> Result<Address> {
    layers
        .iter()
        .try_fold(address.clone(), |layered, key| crypto.decrypt(key, &layered))
}

/// Peel one layer off every address and check the result has exactly
/// `expected` distinct entries.
pub fn decrypt_all(
    crypto: &dyn Crypto,
    key: &DecryptionKey,
    addresses: &[Address],
    expected: usize,
) -> std::result::Result<Vec<Address>, RelayFault> {
    let mut seen = HashSet::with_capacity(addresses.len());
    let mut decrypted = Vec::with_capacity(addresses.len());

    for address in addresses {
        let plain = crypto
            .decrypt(key, address)
            .map_err(|_| RelayFault::Undecryptable)?;
        if !seen.insert(plain.clone()) {
            return Err(RelayFault::Duplicate);
        }
        decrypted.push(plain);
    }

    if decrypted.len() != expected {
        return Err(RelayFault::WrongCount {
            expected,
            found: decrypted.len(),
        });
    }

    Ok(decrypted)
}
