//! Ed25519 transaction signatures

use ed25519_dalek::{Signer, Verifier};

use coinshuffle_core::{Result, Signature, SigningKey, Transaction, VerificationKey};

pub fn verification_key(key: &SigningKey) -> VerificationKey {
    let signing_key = ed25519_dalek::SigningKey::from_bytes(key.as_bytes());
    VerificationKey(signing_key.verifying_key().to_bytes())
}

pub fn sign(key: &SigningKey, transaction: &Transaction) -> Result<Signature> {
    let payload = transaction.signing_bytes()?;
    let signing_key = ed25519_dalek::SigningKey::from_bytes(key.as_bytes());
    Ok(Signature(signing_key.sign(&payload).to_bytes().to_vec()))
}

/// False on malformed keys or signatures as well as on mismatch
pub fn verify(key: &VerificationKey, transaction: &Transaction, signature: &Signature) -> bool {
    let Ok(payload) = transaction.signing_bytes() else {
        return false;
    };
    let Ok(verifying_key) = ed25519_dalek::VerifyingKey::from_bytes(&key.0) else {
        return false;
    };
    let Ok(signature) = ed25519_dalek::Signature::from_slice(&signature.0) else {
        return false;
    };
    verifying_key.verify(&payload, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use coinshuffle_core::Address;

    fn transaction() -> Transaction {
        Transaction {
            amount: 500,
            inputs: vec![Address(vec![1; 32]), Address(vec![2; 32])],
            outputs: vec![Address(vec![3; 32]), Address(vec![4; 32])],
            change: Vec::new(),
        }
    }

    #[test]
    fn test_signature_verifies_under_own_key() {
        let key = SigningKey::from_bytes([7; 32]);
        let signature = sign(&key, &transaction()).unwrap();
        assert_eq!(signature.0.len(), 64);
        assert!(verify(&verification_key(&key), &transaction(), &signature));
    }

    #[test]
    fn test_signature_is_bound_to_transaction_and_key() {
        let key = SigningKey::from_bytes([7; 32]);
        let signature = sign(&key, &transaction()).unwrap();

        let mut other = transaction();
        other.outputs.swap(0, 1);
        assert!(!verify(&verification_key(&key), &other, &signature));

        let stranger = verification_key(&SigningKey::from_bytes([8; 32]));
        assert!(!verify(&stranger, &transaction(), &signature));
    }

    #[test]
    fn test_malformed_signature_is_rejected() {
        let key = verification_key(&SigningKey::from_bytes([7; 32]));
        assert!(!verify(&key, &transaction(), &Signature(vec![0xAA; 10])));
        assert!(!verify(&key, &transaction(), &Signature(Vec::new())));
    }
}
