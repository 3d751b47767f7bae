//! In-memory room store behind the relay: per-room peer lists and a capped,
//! stamped message queue.

use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_MESSAGE_CAP: usize = 100;
pub const DEFAULT_ROOM_TTL: Duration = Duration::from_secs(3600);

/// A stored message. `kind` stays a free-form string here; clients decide
/// which types they understand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayedMessage {
    pub from: String,
    pub to: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub timestamp: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("Peer not found")]
    PeerNotFound(String),
    #[error("Room not found")]
    RoomNotFound(String),
}

#[derive(Debug)]
struct Room {
    peers: Vec<String>,
    messages: VecDeque<RelayedMessage>,
    last_stamp: u64,
    last_activity: Instant,
}

impl Room {
    fn new(now: Instant) -> Self {
        Self {
            peers: Vec::new(),
            messages: VecDeque::new(),
            last_stamp: 0,
            last_activity: now,
        }
    }

    /// Millisecond wall-clock stamp, bumped so stamps strictly increase
    /// within the room even inside one clock tick.
    fn next_stamp(&mut self) -> u64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        self.last_stamp = wall.max(self.last_stamp.saturating_add(1));
        self.last_stamp
    }
}

#[derive(Debug)]
pub struct RoomStore {
    rooms: DashMap<String, Room>,
    message_cap: usize,
    room_ttl: Duration,
}

impl Default for RoomStore {
    fn default() -> Self {
        Self::new(DEFAULT_MESSAGE_CAP, DEFAULT_ROOM_TTL)
    }
}

impl RoomStore {
    pub fn new(message_cap: usize, room_ttl: Duration) -> Self {
        Self {
            rooms: DashMap::new(),
            message_cap: message_cap.max(1),
            room_ttl,
        }
    }

    /// Adds `peer` (idempotently) and returns the other peers in join order.
    /// A room idle past its TTL is reset first.
    pub fn join(&self, room: &str, peer: &str) -> Vec<String> {
        let now = Instant::now();
        let mut entry = self
            .rooms
            .entry(room.to_string())
            .or_insert_with(|| Room::new(now));
        if now.duration_since(entry.last_activity) > self.room_ttl {
            *entry = Room::new(now);
        }
        entry.last_activity = now;
        if !entry.peers.iter().any(|existing| existing == peer) {
            entry.peers.push(peer.to_string());
        }
        entry
            .peers
            .iter()
            .filter(|existing| existing.as_str() != peer)
            .cloned()
            .collect()
    }

    /// Stores a message and returns its stamp. Addressing a peer that is not
    /// in the room fails, and so does posting to a room nobody joined; the
    /// oldest message is dropped past the cap.
    pub fn post(
        &self,
        room: &str,
        from: &str,
        kind: &str,
        data: Value,
        to: Option<&str>,
    ) -> Result<u64, RelayError> {
        let now = Instant::now();
        let Some(mut entry) = self.rooms.get_mut(room) else {
            return Err(match to {
                Some(to) => RelayError::PeerNotFound(to.to_string()),
                None => RelayError::RoomNotFound(room.to_string()),
            });
        };
        if let Some(to) = to {
            if !entry.peers.iter().any(|peer| peer == to) {
                return Err(RelayError::PeerNotFound(to.to_string()));
            }
        }
        entry.last_activity = now;
        let timestamp = entry.next_stamp();
        entry.messages.push_back(RelayedMessage {
            from: from.to_string(),
            to: to.map(str::to_string),
            kind: kind.to_string(),
            data,
            timestamp,
        });
        while entry.messages.len() > self.message_cap {
            entry.messages.pop_front();
        }
        Ok(timestamp)
    }

    /// Messages newer than `since` addressed to `peer` or broadcast, plus the
    /// newest stamp the room has issued (never older than `since`).
    pub fn poll(&self, room: &str, peer: &str, since: u64) -> (Vec<RelayedMessage>, u64) {
        let Some(mut entry) = self.rooms.get_mut(room) else {
            return (Vec::new(), since);
        };
        entry.last_activity = Instant::now();
        let messages = entry
            .messages
            .iter()
            .filter(|message| message.timestamp > since)
            .filter(|message| message.to.as_deref().is_none_or(|to| to == peer))
            .cloned()
            .collect();
        (messages, entry.last_stamp.max(since))
    }

    /// Removes `peer`; the room goes away once empty.
    pub fn leave(&self, room: &str, peer: &str) {
        let now_empty = match self.rooms.get_mut(room) {
            Some(mut entry) => {
                entry.peers.retain(|existing| existing != peer);
                entry.last_activity = Instant::now();
                entry.peers.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.rooms.remove_if(room, |_, entry| entry.peers.is_empty());
        }
    }

    /// Drops rooms idle for longer than the TTL as of `now`.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let before = self.rooms.len();
        self.rooms
            .retain(|_, room| now.saturating_duration_since(room.last_activity) <= self.room_ttl);
        before.saturating_sub(self.rooms.len())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn peers(&self, room: &str) -> Vec<String> {
        self.rooms
            .get(room)
            .map(|entry| entry.peers.clone())
            .unwrap_or_default()
    }
}
