use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use crate::crypto::Crypto;
use crate::error::{Result, ShuffleError};
use crate::ledger::Transaction;
use crate::message::Message;
use crate::types::{
    Address, DecryptionKey, Digest, EncryptionKey, Signature, SigningKey, VerificationKey,
};

const LAYER_TAG: u8 = 0xE1;

/// Seeded crypto backend for tests.
///
/// Layers are `tag || encryption key || inner`, so decryption succeeds
/// only with the matching key and the structure is easy to inspect.
/// Signatures are keyed blake3 hashes under the verification key, which
/// anyone can forge; they only catch accidental corruption.
pub struct MockCrypto {
    rng: Mutex<StdRng>,
}

impl MockCrypto {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn random_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        self.rng.lock().fill_bytes(&mut bytes);
        bytes
    }
}

impl Crypto for MockCrypto {
    fn make_decryption_key(&self) -> DecryptionKey {
        DecryptionKey::from_bytes(self.random_bytes())
    }

    fn make_signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(self.random_bytes())
    }

    fn random(&self, max_inclusive: usize) -> usize {
        self.rng.lock().gen_range(0..=max_inclusive)
    }

    fn hash(&self, message: &Message) -> Message {
        let digest = blake3::hash(&message.canonical_bytes());
        Message::new().attach(Digest(*digest.as_bytes()))
    }

    fn encryption_key(&self, key: &DecryptionKey) -> EncryptionKey {
        EncryptionKey(blake3::derive_key(
            "coinshuffle-mock-encryption-key",
            key.as_bytes(),
        ))
    }

    fn encrypt(&self, key: &EncryptionKey, address: &Address) -> Result<Address> {
        let mut layered = Vec::with_capacity(1 + 32 + address.0.len());
        layered.push(LAYER_TAG);
        layered.extend_from_slice(&key.0);
        layered.extend_from_slice(&address.0);
        Ok(Address(layered))
    }

    fn decrypt(&self, key: &DecryptionKey, address: &Address) -> Result<Address> {
        let bytes = address.as_bytes();
        if bytes.len() < 33 || bytes[0] != LAYER_TAG {
            return Err(ShuffleError::Cryptography("not an onion layer".to_string()));
        }
        if bytes[1..33] != self.encryption_key(key).0 {
            return Err(ShuffleError::Cryptography(
                "layer encrypted to another key".to_string(),
            ));
        }
        Ok(Address(bytes[33..].to_vec()))
    }

    fn verification_key(&self, key: &SigningKey) -> VerificationKey {
        VerificationKey(blake3::derive_key(
            "coinshuffle-mock-verification-key",
            key.as_bytes(),
        ))
    }

    fn sign(&self, key: &SigningKey, transaction: &Transaction) -> Result<Signature> {
        let payload = transaction.signing_bytes()?;
        let vk = self.verification_key(key);
        Ok(Signature(blake3::keyed_hash(&vk.0, &payload).as_bytes().to_vec()))
    }

    fn verify(&self, key: &VerificationKey, transaction: &Transaction, signature: &Signature) -> bool {
        match transaction.signing_bytes() {
            Ok(payload) => blake3::keyed_hash(&key.0, &payload).as_bytes()[..] == signature.0[..],
            Err(_) => false,
        }
    }

    fn address(&self, key: &VerificationKey) -> Address {
        Address(blake3::derive_key("coinshuffle-mock-address", &key.0).to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transaction() -> Transaction {
        Transaction {
            amount: 10,
            inputs: vec![Address(vec![1])],
            outputs: vec![Address(vec![2])],
            change: Vec::new(),
        }
    }

    #[test]
    fn test_same_seed_same_keys() {
        let a = MockCrypto::new(11);
        let b = MockCrypto::new(11);
        assert_eq!(a.make_signing_key(), b.make_signing_key());
    }

    #[test]
    fn test_sign_and_verify() {
        let crypto = MockCrypto::new(1);
        let sk = crypto.make_signing_key();
        let vk = crypto.verification_key(&sk);
        let tx = transaction();

        let signature = crypto.sign(&sk, &tx).unwrap();
        assert!(crypto.verify(&vk, &tx, &signature));

        let other = crypto.verification_key(&crypto.make_signing_key());
        assert!(!crypto.verify(&other, &tx, &signature));
        assert!(!crypto.verify(&vk, &tx, &Signature(vec![0u8; 32])));
    }

    #[test]
    fn test_wrong_key_fails_to_decrypt() {
        let crypto = MockCrypto::new(2);
        let right = crypto.make_decryption_key();
        let wrong = crypto.make_decryption_key();
        let layered = crypto
            .encrypt(&crypto.encryption_key(&right), &Address(vec![5]))
            .unwrap();

        assert_eq!(crypto.decrypt(&right, &layered).unwrap(), Address(vec![5]));
        assert!(matches!(
            crypto.decrypt(&wrong, &layered),
            Err(ShuffleError::Cryptography(_))
        ));
        assert!(crypto.decrypt(&right, &Address(vec![1, 2])).is_err());
    }

    #[test]
    fn test_random_stays_in_range() {
        let crypto = MockCrypto::new(3);
        for max in 0..20 {
            assert!(crypto.random(max) <= max);
        }
    }
}
