//! Transport Collaborator

use thiserror::Error;

use crate::packet::Packet;
use crate::types::VerificationKey;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Nothing arrived within the transport's receive deadline
    #[error("receive timed out")]
    Timeout,
    #[error("connection closed")]
    Closed,
    #[error("no route to {0}")]
    UnknownRecipient(VerificationKey),
    #[error("{0}")]
    Other(String),
}

/// Point-to-point packet delivery between session participants.
///
/// `receive` blocks until a packet arrives or the implementation's
/// deadline passes, in which case it returns [`TransportError::Timeout`].
pub trait Transport: Send {
    fn send_to(&mut self, recipient: &VerificationKey, packet: &Packet) -> Result<(), TransportError>;

    fn receive(&mut self) -> Result<Packet, TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send_to(&mut self, recipient: &VerificationKey, packet: &Packet) -> Result<(), TransportError> {
        (**self).send_to(recipient, packet)
    }

    fn receive(&mut self) -> Result<Packet, TransportError> {
        (**self).receive()
    }
}
