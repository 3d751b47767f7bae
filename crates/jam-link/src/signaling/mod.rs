//! Store-and-poll signaling mailbox.
//!
//! Peers announce themselves in a room, post offer/answer/candidate messages
//! addressed to another peer (or broadcast), and poll for anything newer than
//! the last stamp they saw. Delivery is at-least-once and callers must
//! tolerate duplicates and reordering.

use std::fmt;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::LinkError;

mod http;
mod memory;
pub mod relay;
pub mod wire;

pub use http::HttpMailbox;
pub use memory::MemoryMailbox;
pub use wire::{OutboundSignal, PollBatch, SignalEnvelope, SignalKind};

pub const MAX_ID_LEN: usize = 50;

/// `^[A-Za-z0-9_-]{1,50}$`, shared by room and peer ids.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(String);

impl RoomId {
    pub fn parse(raw: &str) -> Result<Self, LinkError> {
        let trimmed = raw.trim();
        if is_valid_id(trimmed) {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(LinkError::InvalidRoom(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Local identity for one connection attempt; regenerated whenever the
/// session starts over.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub fn generate() -> Self {
        Self(format!("jam-{}", Uuid::new_v4().simple()))
    }

    pub fn from_string(id: impl Into<String>) -> Result<Self, LinkError> {
        let id = id.into();
        if is_valid_id(&id) {
            Ok(Self(id))
        } else {
            Err(LinkError::Rejected(format!("invalid peer id {id:?}")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Announces `peer` in `room` and returns the other peers already there,
    /// in join order.
    async fn join(&self, room: &RoomId, peer: &PeerId) -> Result<Vec<String>, LinkError>;

    /// Fails with [`LinkError::PeerUnavailable`] when the addressee is not in
    /// the room.
    async fn send(
        &self,
        room: &RoomId,
        peer: &PeerId,
        signal: &OutboundSignal,
    ) -> Result<(), LinkError>;

    async fn poll(&self, room: &RoomId, peer: &PeerId, since: u64)
    -> Result<PollBatch, LinkError>;

    async fn leave(&self, room: &RoomId, peer: &PeerId) -> Result<(), LinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn room_ids_follow_the_relay_pattern() {
        assert!(RoomId::parse("jam").is_ok());
        assert!(RoomId::parse("late_night-session_2").is_ok());
        assert_eq!(RoomId::parse("  jam ").unwrap().as_str(), "jam");
        assert!(RoomId::parse("").is_err());
        assert!(RoomId::parse("jam room").is_err());
        assert!(RoomId::parse("../etc").is_err());
        assert!(RoomId::parse(&"x".repeat(51)).is_err());
        assert!(RoomId::parse(&"x".repeat(50)).is_ok());
    }

    #[test_timeout::timeout]
    fn generated_peer_ids_are_valid_and_unique() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert!(is_valid_id(a.as_str()));
        assert_ne!(a, b);
    }
}
