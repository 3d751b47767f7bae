use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::candidate::CandidateQueue;
use crate::channel::DataChannelSession;
use crate::credentials::IceServer;
use crate::peer::PeerLink;
use crate::signaling::{OutboundSignal, PeerId, RoomId};

/// One connection attempt. Dropped wholesale on teardown so a later
/// `connect` starts from a clean slate.
pub(super) struct Session {
    /// Tags poll and send results produced for this session.
    pub id: u64,
    pub room: RoomId,
    pub local_peer: PeerId,
    pub remote_peer: Option<String>,
    pub initiator: bool,
    pub ice_servers: Vec<IceServer>,

    pub peer: Option<Arc<dyn PeerLink>>,
    /// Generation of `peer`; its events carry the same number.
    pub peer_generation: u64,
    pub channel: Option<DataChannelSession>,
    pub offer_sent: bool,
    pub remote_description_set: bool,
    pub candidates: CandidateQueue,
    pub path_reported: bool,
    /// Set once the relay accepted our join; only then is there anything
    /// to leave.
    pub joined: bool,

    pub polling: bool,
    pub since: u64,
    pub poll_task: Option<JoinHandle<()>>,
    pub outbox: mpsc::UnboundedSender<OutboundSignal>,
    pub outbox_task: JoinHandle<()>,
}

impl Session {
    pub fn channel_open(&self) -> bool {
        self.channel.as_ref().is_some_and(DataChannelSession::is_open)
    }

    /// Whether a message from `from` belongs to this session. Until a remote
    /// peer is locked in, anyone but ourselves may start a negotiation.
    pub fn accepts_from(&self, from: &str) -> bool {
        from != self.local_peer.as_str()
            && self
                .remote_peer
                .as_deref()
                .is_none_or(|remote| remote == from)
    }

    pub fn stop_background(&mut self) {
        self.polling = false;
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
        self.outbox_task.abort();
    }
}
