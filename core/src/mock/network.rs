use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::NetworkConfig;
use crate::packet::Packet;
use crate::transport::{Transport, TransportError};
use crate::types::VerificationKey;

/// Hub connecting in-process endpoints by verification key
#[derive(Clone)]
pub struct MemoryNetwork {
    inboxes: Arc<DashMap<VerificationKey, Sender<Packet>>>,
    timeout: Duration,
}

impl MemoryNetwork {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inboxes: Arc::new(DashMap::new()),
            timeout,
        }
    }

    /// Hub whose endpoints wait `receive_timeout_ms` on every receive
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self::new(config.receive_timeout())
    }

    /// Register `key` and return its transport
    pub fn endpoint(&self, key: VerificationKey) -> MemoryTransport {
        let (sender, inbox) = unbounded();
        self.inboxes.insert(key, sender);
        MemoryTransport {
            inboxes: Arc::clone(&self.inboxes),
            inbox,
            timeout: self.timeout,
        }
    }
}

pub struct MemoryTransport {
    inboxes: Arc<DashMap<VerificationKey, Sender<Packet>>>,
    inbox: Receiver<Packet>,
    timeout: Duration,
}

impl MemoryTransport {
    /// Packets waiting in this endpoint's inbox
    pub fn pending(&self) -> usize {
        self.inbox.len()
    }
}

impl Transport for MemoryTransport {
    fn send_to(&mut self, recipient: &VerificationKey, packet: &Packet) -> Result<(), TransportError> {
        let inbox = self
            .inboxes
            .get(recipient)
            .ok_or(TransportError::UnknownRecipient(*recipient))?;
        inbox
            .send(packet.clone())
            .map_err(|_| TransportError::Closed)
    }

    fn receive(&mut self) -> Result<Packet, TransportError> {
        self.inbox.recv_timeout(self.timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => TransportError::Timeout,
            RecvTimeoutError::Disconnected => TransportError::Closed,
        })
    }
}
