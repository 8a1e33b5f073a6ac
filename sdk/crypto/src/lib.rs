//! CoinShuffle Curve25519 Backend
//!
//! Production [`Crypto`] implementation for the round engine.
//!
//! ```text
//!   onion layers   X25519 ECDH + blake3 KDF + ChaCha20-Poly1305   (onion.rs)
//!   signatures     Ed25519 over the wincode transaction payload   (signing.rs)
//!   digests        blake3 over canonical message bytes
//!   addresses      blake3 derive-key of the verification key
//!   randomness     OS entropy
//! ```

pub mod onion;
pub mod signing;

use rand::Rng;
use rand::RngCore;
use rand::rngs::OsRng;

use coinshuffle_core::{
    Address, Crypto, DecryptionKey, Digest, EncryptionKey, Message, Result, ShuffleError,
    Signature, SigningKey, Transaction, VerificationKey,
};

pub use onion::{LAYER_OVERHEAD, OnionError};

/// Stateless; one instance can serve any number of sessions
#[derive(Debug, Clone, Copy, Default)]
pub struct Curve25519Crypto;

impl Curve25519Crypto {
    pub fn new() -> Self {
        Self
    }
}

fn random_bytes() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

impl Crypto for Curve25519Crypto {
    fn make_decryption_key(&self) -> DecryptionKey {
        DecryptionKey::from_bytes(random_bytes())
    }

    fn make_signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(random_bytes())
    }

    fn random(&self, max_inclusive: usize) -> usize {
        OsRng.gen_range(0..=max_inclusive)
    }

    fn hash(&self, message: &Message) -> Message {
        let digest = blake3::hash(&message.canonical_bytes());
        Message::new().attach(Digest(*digest.as_bytes()))
    }

    fn encryption_key(&self, key: &DecryptionKey) -> EncryptionKey {
        EncryptionKey(onion::public_key(key.as_bytes()))
    }

    fn encrypt(&self, key: &EncryptionKey, address: &Address) -> Result<Address> {
        onion::seal(&key.0, address.as_bytes())
            .map(Address)
            .map_err(|e| ShuffleError::Cryptography(e.to_string()))
    }

    fn decrypt(&self, key: &DecryptionKey, address: &Address) -> Result<Address> {
        onion::open(key.as_bytes(), address.as_bytes())
            .map(Address)
            .map_err(|e| ShuffleError::Cryptography(e.to_string()))
    }

    fn verification_key(&self, key: &SigningKey) -> VerificationKey {
        signing::verification_key(key)
    }

    fn sign(&self, key: &SigningKey, transaction: &Transaction) -> Result<Signature> {
        signing::sign(key, transaction)
    }

    fn verify(&self, key: &VerificationKey, transaction: &Transaction, signature: &Signature) -> bool {
        signing::verify(key, transaction, signature)
    }

    fn address(&self, key: &VerificationKey) -> Address {
        Address(blake3::derive_key("coinshuffle-address-v1", &key.0).to_vec())
    }
}
