//! Typed Message Stream
//!
//! A message is an append-only list of typed elements. Reading never
//! consumes the message itself: every [`Message::reader`] starts its own
//! cursor, so evidence packets can be re-parsed during blame evaluation.

use serde::{Deserialize, Serialize};

use crate::blame::Blame;
use crate::error::{Result, ShuffleError};
use crate::ledger::Transaction;
use crate::packet::Packet;
use crate::types::{Address, Digest, EncryptionKey, Signature};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Element {
    EncryptionKey(EncryptionKey),
    Address(Address),
    Signature(Signature),
    Blame(Blame),
    Digest(Digest),
}

impl Element {
    fn kind(&self) -> &'static str {
        match self {
            Element::EncryptionKey(_) => "encryption key",
            Element::Address(_) => "address",
            Element::Signature(_) => "signature",
            Element::Blame(_) => "blame",
            Element::Digest(_) => "digest",
        }
    }
}

impl From<EncryptionKey> for Element {
    fn from(key: EncryptionKey) -> Self {
        Element::EncryptionKey(key)
    }
}

impl From<Address> for Element {
    fn from(address: Address) -> Self {
        Element::Address(address)
    }
}

impl From<Signature> for Element {
    fn from(signature: Signature) -> Self {
        Element::Signature(signature)
    }
}

impl From<Blame> for Element {
    fn from(blame: Blame) -> Self {
        Element::Blame(blame)
    }
}

impl From<Digest> for Element {
    fn from(digest: Digest) -> Self {
        Element::Digest(digest)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    elements: Vec<Element>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_elements(elements: Vec<Element>) -> Self {
        Self { elements }
    }

    /// Append an element, builder style
    pub fn attach(mut self, element: impl Into<Element>) -> Self {
        self.elements.push(element.into());
        self
    }

    pub fn push(&mut self, element: impl Into<Element>) {
        self.elements.push(element.into());
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn reader(&self) -> MessageReader<'_> {
        MessageReader {
            elements: &self.elements,
            position: 0,
        }
    }

    /// Read every element as an address
    pub fn addresses(&self) -> Result<Vec<Address>> {
        let mut reader = self.reader();
        let mut addresses = Vec::with_capacity(self.elements.len());
        while !reader.is_empty() {
            addresses.push(reader.read_address()?);
        }
        Ok(addresses)
    }

    /// Deterministic, type-tagged encoding used as a hash preimage
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_message(&mut out, self);
        out
    }
}

impl FromIterator<Address> for Message {
    fn from_iter<I: IntoIterator<Item = Address>>(iter: I) -> Self {
        Self {
            elements: iter.into_iter().map(Element::Address).collect(),
        }
    }
}

/// Independent read cursor over a message
#[derive(Debug, Clone)]
pub struct MessageReader<'a> {
    elements: &'a [Element],
    position: usize,
}

macro_rules! read_typed {
    ($name:ident, $variant:ident, $ty:ty, $label:literal) => {
        pub fn $name(&mut self) -> Result<$ty> {
            match self.next($label)? {
                Element::$variant(value) => Ok(value.clone()),
                other => Err(ShuffleError::Format {
                    expected: $label,
                    found: other.kind().to_string(),
                }),
            }
        }
    };
}

impl<'a> MessageReader<'a> {
    pub fn is_empty(&self) -> bool {
        self.position >= self.elements.len()
    }

    pub fn remaining(&self) -> usize {
        self.elements.len().saturating_sub(self.position)
    }

    fn next(&mut self, expected: &'static str) -> Result<&'a Element> {
        let element = self
            .elements
            .get(self.position)
            .ok_or_else(|| ShuffleError::Format {
                expected,
                found: "end of message".to_string(),
            })?;
        self.position += 1;
        Ok(element)
    }

    read_typed!(read_encryption_key, EncryptionKey, EncryptionKey, "encryption key");
    read_typed!(read_address, Address, Address, "address");
    read_typed!(read_signature, Signature, Signature, "signature");
    read_typed!(read_blame, Blame, Blame, "blame");
    read_typed!(read_digest, Digest, Digest, "digest");
}

// ============================================================================
// Canonical encoding
// ============================================================================

const TAG_ENCRYPTION_KEY: u8 = 1;
const TAG_ADDRESS: u8 = 2;
const TAG_SIGNATURE: u8 = 3;
const TAG_BLAME: u8 = 4;
const TAG_DIGEST: u8 = 5;

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn write_message(out: &mut Vec<u8>, message: &Message) {
    out.extend_from_slice(&(message.elements.len() as u32).to_le_bytes());
    for element in &message.elements {
        match element {
            Element::EncryptionKey(key) => {
                out.push(TAG_ENCRYPTION_KEY);
                write_bytes(out, &key.0);
            }
            Element::Address(address) => {
                out.push(TAG_ADDRESS);
                write_bytes(out, &address.0);
            }
            Element::Signature(signature) => {
                out.push(TAG_SIGNATURE);
                write_bytes(out, &signature.0);
            }
            Element::Blame(blame) => {
                out.push(TAG_BLAME);
                write_blame(out, blame);
            }
            Element::Digest(digest) => {
                out.push(TAG_DIGEST);
                write_bytes(out, &digest.0);
            }
        }
    }
}

fn write_transaction(out: &mut Vec<u8>, tx: &Transaction) {
    out.extend_from_slice(&tx.amount.to_le_bytes());
    out.extend_from_slice(&(tx.inputs.len() as u32).to_le_bytes());
    for input in &tx.inputs {
        write_bytes(out, &input.0);
    }
    out.extend_from_slice(&(tx.outputs.len() as u32).to_le_bytes());
    for output in &tx.outputs {
        write_bytes(out, &output.0);
    }
    out.extend_from_slice(&(tx.change.len() as u32).to_le_bytes());
    for change in &tx.change {
        write_bytes(out, &change.input.0);
        write_bytes(out, &change.address.0);
    }
}

fn write_packets(out: &mut Vec<u8>, packets: &[Packet]) {
    out.extend_from_slice(&(packets.len() as u32).to_le_bytes());
    for packet in packets {
        out.extend_from_slice(&packet.session.0);
        out.extend_from_slice(&packet.attempt.to_le_bytes());
        out.push(packet.phase as u8);
        out.extend_from_slice(&packet.sender.0);
        out.extend_from_slice(&packet.recipient.0);
        write_message(out, &packet.message);
    }
}

fn write_blame(out: &mut Vec<u8>, blame: &Blame) {
    out.push(blame.reason() as u8);
    match blame {
        Blame::NoFundsAtAll { accused }
        | Blame::MissingOutput { accused }
        | Blame::ShuffleFailure { accused } => out.extend_from_slice(&accused.0),
        Blame::InsufficientFunds {
            accused,
            transaction,
        }
        | Blame::DoubleSpend {
            accused,
            transaction,
        } => {
            out.extend_from_slice(&accused.0);
            write_transaction(out, transaction);
        }
        Blame::ShuffleEvidence {
            decryption_key,
            packets,
        } => {
            match decryption_key {
                Some(key) => {
                    out.push(1);
                    out.extend_from_slice(key.as_bytes());
                }
                None => out.push(0),
            }
            write_packets(out, packets);
        }
        Blame::EquivocationFailure { packets } => write_packets(out, packets),
        Blame::InvalidSignature { invalid } => {
            out.extend_from_slice(&(invalid.len() as u32).to_le_bytes());
            for (key, signature) in invalid {
                out.extend_from_slice(&key.0);
                write_bytes(out, &signature.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VerificationKey;

    fn address(byte: u8) -> Address {
        Address(vec![byte; 4])
    }

    #[test]
    fn test_readers_are_independent() {
        let message = Message::new().attach(address(1)).attach(address(2));

        let mut first = message.reader();
        assert_eq!(first.read_address().unwrap(), address(1));

        let mut second = message.reader();
        assert_eq!(second.read_address().unwrap(), address(1));
        assert_eq!(first.read_address().unwrap(), address(2));
        assert!(first.is_empty());
        assert_eq!(second.remaining(), 1);
    }

    #[test]
    fn test_type_mismatch_is_format_error() {
        let message = Message::new().attach(EncryptionKey([3u8; 32]));
        let err = message.reader().read_address().unwrap_err();
        assert!(matches!(err, ShuffleError::Format { expected: "address", .. }));
    }

    #[test]
    fn test_reading_past_end_is_format_error() {
        let message = Message::new();
        assert!(message.is_empty());
        let err = message.reader().read_signature().unwrap_err();
        assert!(matches!(err, ShuffleError::Format { .. }));
    }

    #[test]
    fn test_addresses_rejects_mixed_message() {
        let message = Message::new()
            .attach(address(1))
            .attach(Digest([0u8; 32]));
        assert!(message.addresses().is_err());

        let only_addresses: Message = vec![address(1), address(2)].into_iter().collect();
        assert_eq!(only_addresses.addresses().unwrap().len(), 2);
    }

    #[test]
    fn test_canonical_bytes_are_order_sensitive() {
        let a = Message::new()
            .attach(EncryptionKey([1u8; 32]))
            .attach(EncryptionKey([2u8; 32]));
        let b = Message::new()
            .attach(EncryptionKey([2u8; 32]))
            .attach(EncryptionKey([1u8; 32]));

        assert_ne!(a.canonical_bytes(), b.canonical_bytes());
        assert_eq!(a.canonical_bytes(), a.clone().canonical_bytes());
    }

    #[test]
    fn test_canonical_bytes_distinguish_element_types() {
        let as_key = Message::new().attach(EncryptionKey([5u8; 32]));
        let as_digest = Message::new().attach(Digest([5u8; 32]));
        assert_ne!(as_key.canonical_bytes(), as_digest.canonical_bytes());
    }

    #[test]
    fn test_blame_elements_are_readable() {
        let accused = VerificationKey([4u8; 32]);
        let message = Message::new().attach(Blame::NoFundsAtAll { accused });

        let blame = message.reader().read_blame().unwrap();
        assert_eq!(blame, Blame::NoFundsAtAll { accused });
    }
}
