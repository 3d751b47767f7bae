use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use super::relay::{RelayError, RoomStore};
use super::wire::{OutboundSignal, PollBatch};
use super::{Mailbox, PeerId, RoomId};
use crate::error::LinkError;

/// [`Mailbox`] backed directly by a [`RoomStore`], for running several links
/// in one process. Can be switched offline to simulate a relay outage.
#[derive(Clone, Default)]
pub struct MemoryMailbox {
    store: Arc<RoomStore>,
    offline: Arc<AtomicBool>,
}

impl MemoryMailbox {
    pub fn new(store: Arc<RoomStore>) -> Self {
        Self {
            store,
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn store(&self) -> &Arc<RoomStore> {
        &self.store
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> Result<(), LinkError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(LinkError::Signaling("relay unreachable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Mailbox for MemoryMailbox {
    async fn join(&self, room: &RoomId, peer: &PeerId) -> Result<Vec<String>, LinkError> {
        self.ensure_online()?;
        Ok(self.store.join(room.as_str(), peer.as_str()))
    }

    async fn send(
        &self,
        room: &RoomId,
        peer: &PeerId,
        signal: &OutboundSignal,
    ) -> Result<(), LinkError> {
        self.ensure_online()?;
        self.store
            .post(
                room.as_str(),
                peer.as_str(),
                signal.kind.as_str(),
                signal.data.clone(),
                signal.to.as_deref(),
            )
            .map(|_| ())
            .map_err(|err| match err {
                RelayError::PeerNotFound(to) => LinkError::PeerUnavailable(to),
                RelayError::RoomNotFound(room) => {
                    LinkError::Signaling(format!("room {room} no longer exists"))
                }
            })
    }

    async fn poll(
        &self,
        room: &RoomId,
        peer: &PeerId,
        since: u64,
    ) -> Result<PollBatch, LinkError> {
        self.ensure_online()?;
        let (messages, timestamp) = self.store.poll(room.as_str(), peer.as_str(), since);
        let messages = messages
            .into_iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PollBatch {
            messages,
            timestamp,
        })
    }

    async fn leave(&self, room: &RoomId, peer: &PeerId) -> Result<(), LinkError> {
        self.ensure_online()?;
        self.store.leave(room.as_str(), peer.as_str());
        Ok(())
    }
}
