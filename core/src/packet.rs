//! Protocol Packets

use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::phase::Phase;
use crate::types::{SessionId, VerificationKey};

/// One message addressed from one participant to another.
///
/// `phase` names the protocol step that produced the packet, independent
/// of where the receiver currently is, which is what lets the router park
/// early arrivals. `attempt` numbers the round within the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub message: Message,
    pub session: SessionId,
    pub attempt: u32,
    pub phase: Phase,
    pub sender: VerificationKey,
    pub recipient: VerificationKey,
}

impl Packet {
    pub fn new(
        message: Message,
        session: SessionId,
        attempt: u32,
        phase: Phase,
        sender: VerificationKey,
        recipient: VerificationKey,
    ) -> Self {
        Self {
            message,
            session,
            attempt,
            phase,
            sender,
            recipient,
        }
    }

    pub fn is_blame(&self) -> bool {
        self.phase == Phase::Blame
    }
}
