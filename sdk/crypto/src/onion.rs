//! Onion Layers
//!
//! One layer is an ECIES-style envelope:
//!
//! ```text
//! ┌──────────────────┬────────────┬──────────────────────────────┐
//! │ ephemeral pk (32)│ nonce (12) │ ChaCha20-Poly1305(inner)+tag │
//! └──────────────────┴────────────┴──────────────────────────────┘
//! ```
//!
//! The layer key is blake3 (derive-key mode) over the X25519 shared secret
//! and the ephemeral public key.

use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;
use rand::rngs::OsRng;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

const EPHEMERAL_PK_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Bytes one layer adds to its payload
pub const LAYER_OVERHEAD: usize = EPHEMERAL_PK_LEN + NONCE_LEN + TAG_LEN;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OnionError {
    #[error("layer too short: {0} bytes")]
    Truncated(usize),
    #[error("layer does not open under this key")]
    Decryption,
    #[error("layer encryption failed")]
    Encryption,
}

/// X25519 public key of a layer secret
pub fn public_key(secret: &[u8; 32]) -> [u8; 32] {
    PublicKey::from(&StaticSecret::from(*secret)).to_bytes()
}

/// Wrap `inner` in one layer for `recipient`
pub fn seal(recipient: &[u8; 32], inner: &[u8]) -> Result<Vec<u8>, OnionError> {
    let ephemeral_secret = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_pk = PublicKey::from(&ephemeral_secret);
    let shared_secret = ephemeral_secret.diffie_hellman(&PublicKey::from(*recipient));

    let key = derive_layer_key(shared_secret.as_bytes(), ephemeral_pk.as_bytes());

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| OnionError::Encryption)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), inner)
        .map_err(|_| OnionError::Encryption)?;

    let mut layered = Vec::with_capacity(LAYER_OVERHEAD + inner.len());
    layered.extend_from_slice(ephemeral_pk.as_bytes());
    layered.extend_from_slice(&nonce_bytes);
    layered.extend_from_slice(&ciphertext);
    Ok(layered)
}

/// Remove one layer with `secret`
pub fn open(secret: &[u8; 32], layered: &[u8]) -> Result<Vec<u8>, OnionError> {
    if layered.len() < LAYER_OVERHEAD {
        return Err(OnionError::Truncated(layered.len()));
    }
    let (ephemeral_pk, rest) = layered.split_at(EPHEMERAL_PK_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let mut pk = [0u8; EPHEMERAL_PK_LEN];
    pk.copy_from_slice(ephemeral_pk);
    let shared_secret = StaticSecret::from(*secret).diffie_hellman(&PublicKey::from(pk));

    let key = derive_layer_key(shared_secret.as_bytes(), &pk);
    let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| OnionError::Decryption)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| OnionError::Decryption)
}

fn derive_layer_key(shared_secret: &[u8], ephemeral_pk: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key("coinshuffle-onion-v1");
    hasher.update(shared_secret);
    hasher.update(ephemeral_pk);
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(byte: u8) -> [u8; 32] {
        [byte; 32]
    }

    #[test]
    fn test_layer_opens_with_matching_secret() {
        let layered = seal(&public_key(&secret(1)), b"address").unwrap();
        assert_eq!(layered.len(), LAYER_OVERHEAD + 7);
        assert_eq!(open(&secret(1), &layered).unwrap(), b"address");
    }

    #[test]
    fn test_layer_rejects_other_secret() {
        let layered = seal(&public_key(&secret(1)), b"address").unwrap();
        assert_eq!(open(&secret(2), &layered), Err(OnionError::Decryption));
    }

    #[test]
    fn test_sealing_is_randomized() {
        let pk = public_key(&secret(3));
        assert_ne!(seal(&pk, b"same").unwrap(), seal(&pk, b"same").unwrap());
    }

    #[test]
    fn test_nested_layers_peel_outermost_first() {
        let (inner, outer) = (secret(4), secret(5));
        let once = seal(&public_key(&inner), b"payload").unwrap();
        let twice = seal(&public_key(&outer), &once).unwrap();

        assert!(open(&inner, &twice).is_err());
        let peeled = open(&outer, &twice).unwrap();
        assert_eq!(open(&inner, &peeled).unwrap(), b"payload");
    }

    #[test]
    fn test_truncated_and_tampered_layers_fail() {
        assert_eq!(open(&secret(6), &[0u8; 10]), Err(OnionError::Truncated(10)));

        let mut layered = seal(&public_key(&secret(6)), b"payload").unwrap();
        let last = layered.len() - 1;
        layered[last] ^= 0x01;
        assert_eq!(open(&secret(6), &layered), Err(OnionError::Decryption));
    }
}
