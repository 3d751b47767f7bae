//! The negotiated peer connection behind two traits, so the engine can drive
//! webrtc-rs in production and an in-memory pair in tests.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::candidate::{CandidateInit, PathKind};
use crate::credentials::IceServer;
use crate::error::LinkError;

pub mod loopback;
pub mod rtc;

pub use loopback::LoopbackNetwork;
pub use rtc::RtcConnector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectivity {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// `None` marks the end of local gathering.
    CandidateDiscovered(Option<CandidateInit>),
    Connectivity(IceConnectivity),
    ChannelOpened,
    ChannelMessage(String),
    ChannelClosed,
}

/// Callback side of a peer connection. Every event is tagged with the
/// generation of the connection that produced it so the engine can ignore
/// stragglers from a connection it already replaced.
#[derive(Clone, Debug)]
pub struct PeerEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, PeerEvent)>,
}

impl PeerEventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, PeerEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// False once the engine has gone away.
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Creates an offer and applies it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, LinkError>;

    /// Creates an answer and applies it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription, LinkError>;

    async fn set_remote_description(&self, description: SessionDescription)
    -> Result<(), LinkError>;

    async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<(), LinkError>;

    /// Tells the stack the remote side finished gathering. Implementations
    /// that cannot express this treat it as a no-op.
    async fn end_of_candidates(&self) -> Result<(), LinkError>;

    async fn send_text(&self, text: &str) -> Result<(), LinkError>;

    /// Classifies the nominated candidate pair, if any.
    async fn selected_path(&self) -> Option<PathKind>;

    async fn close(&self) -> Result<(), LinkError>;
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Opens a connection. The initiator creates the data channel; the other
    /// side waits for it to arrive.
    async fn open(
        &self,
        ice_servers: &[IceServer],
        initiator: bool,
        sink: PeerEventSink,
    ) -> Result<Arc<dyn PeerLink>, LinkError>;
}
