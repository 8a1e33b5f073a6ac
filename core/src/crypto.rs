//! Crypto Collaborator
//!
//! Key generation, onion layers, signatures, hashing and randomness. One
//! backend instance serves every identity type, so the protocol never
//! touches a concrete primitive.

use crate::error::Result;
use crate::ledger::Transaction;
use crate::message::Message;
use crate::types::{Address, DecryptionKey, EncryptionKey, Signature, SigningKey, VerificationKey};

pub trait Crypto: Send + Sync {
    /// Fresh per-round onion key
    fn make_decryption_key(&self) -> DecryptionKey;

    fn make_signing_key(&self) -> SigningKey;

    /// Uniform integer in `[0, max_inclusive]`, unpredictable to peers
    fn random(&self, max_inclusive: usize) -> usize;

    /// Deterministic, collision-resistant digest wrapped back into a message
    fn hash(&self, message: &Message) -> Message;

    fn encryption_key(&self, key: &DecryptionKey) -> EncryptionKey;

    /// Add one onion layer
    fn encrypt(&self, key: &EncryptionKey, address: &Address) -> Result<Address>;

    /// Remove one onion layer; fails with a cryptography error on malformed
    /// or foreign ciphertext
    fn decrypt(&self, key: &DecryptionKey, address: &Address) -> Result<Address>;

    fn verification_key(&self, key: &SigningKey) -> VerificationKey;

    fn sign(&self, key: &SigningKey, transaction: &Transaction) -> Result<Signature>;

    fn verify(&self, key: &VerificationKey, transaction: &Transaction, signature: &Signature)
    -> bool;

    /// Coin address controlled by a verification key
    fn address(&self, key: &VerificationKey) -> Address;
}
