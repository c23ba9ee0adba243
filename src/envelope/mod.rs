//! Envelope - the unit of traffic on the event bus.
//!
//! Fields are private: an envelope is immutable once built, and the only
//! mutation (sequence stamping) happens inside the bus before fan-out.

mod enums;

pub use enums::{Direction, Payload};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{EnvelopeId, Identity};

/// A message moving through the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    id: EnvelopeId,
    direction: Direction,
    /// Sender for inbound traffic, destination for outbound.
    peer: Identity,
    payload: Payload,
    timestamp: DateTime<Utc>,
    /// Assigned by the bus at publish time. Zero until published.
    sequence: u64,
}

impl Envelope {
    fn new(direction: Direction, peer: Identity, payload: Payload) -> Self {
        Self {
            id: EnvelopeId::new(),
            direction,
            peer,
            payload,
            timestamp: Utc::now(),
            sequence: 0,
        }
    }

    /// Envelope arriving from `sender`.
    pub fn inbound(sender: Identity, payload: impl Into<Payload>) -> Self {
        Self::new(Direction::Inbound, sender, payload.into())
    }

    /// Envelope addressed to `recipient`.
    pub fn outbound(recipient: Identity, payload: impl Into<Payload>) -> Self {
        Self::new(Direction::Outbound, recipient, payload.into())
    }

    /// Outbound response to this envelope's peer.
    pub fn reply(&self, payload: impl Into<Payload>) -> Self {
        Self::outbound(self.peer.clone(), payload)
    }

    pub fn id(&self) -> &EnvelopeId {
        &self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn peer(&self) -> &Identity {
        &self.peer
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub(crate) fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }
}
