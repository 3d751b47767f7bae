//! Negotiation engine: a single task owns the session and reacts to typed
//! events from the caller, the signaling poll loop, the peer connection and
//! its own timers. Nothing outside the task touches session state.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::candidate::PathKind;
use crate::config::LinkConfig;
use crate::credentials::{CredentialProvider, HttpCredentialSource, default_ice_servers};
use crate::error::LinkError;
use crate::latency::LatencyStats;
use crate::peer::{PeerConnector, RtcConnector};
use crate::protocol::{AppMessage, MidiEvent};
use crate::signaling::{HttpMailbox, Mailbox};
use crate::status::StatusNotice;

mod actor;
mod session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    JoiningSignaling,
    WaitingForPeer,
    CreatingOffer,
    OfferSent,
    OfferReceived,
    AnswerSent,
    AnswerReceived,
    IceGathering,
    Connected,
    Disconnected,
    Reconnecting,
    Closed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::JoiningSignaling => "joining-signaling",
            Phase::WaitingForPeer => "waiting-for-peer",
            Phase::CreatingOffer => "creating-offer",
            Phase::OfferSent => "offer-sent",
            Phase::OfferReceived => "offer-received",
            Phase::AnswerSent => "answer-sent",
            Phase::AnswerReceived => "answer-received",
            Phase::IceGathering => "ice-gathering",
            Phase::Connected => "connected",
            Phase::Disconnected => "disconnected",
            Phase::Reconnecting => "reconnecting",
            Phase::Closed => "closed",
        }
    }

    /// Phases from which `connect` may start a new session.
    pub fn is_resting(self) -> bool {
        matches!(self, Phase::Idle | Phase::Closed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Status(StatusNotice),
    PhaseChanged(Phase),
    ChannelOpened { remote_peer: String },
    ChannelClosed,
    /// Inbound application message. Pings and pongs are answered internally
    /// and never surface here.
    Message(AppMessage),
    Latency(LatencyStats),
    PathClassified(PathKind),
    Reconnecting { attempt: u32, delay: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub phase: Phase,
    pub room: Option<String>,
    pub local_peer: Option<String>,
    pub remote_peer: Option<String>,
    pub initiator: bool,
    pub channel_open: bool,
    pub queued_candidates: usize,
    pub reconnect_attempt: u32,
    pub latency_in_progress: bool,
    pub latency: Option<LatencyStats>,
}

pub(crate) enum Command {
    Connect {
        room: String,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Send {
        message: AppMessage,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    MeasureLatency {
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
}

/// Collaborators the engine talks to, injected so tests can swap each one.
pub struct LinkDeps {
    pub mailbox: Arc<dyn Mailbox>,
    pub credentials: CredentialProvider,
    pub connector: Arc<dyn PeerConnector>,
}

impl LinkDeps {
    /// HTTP mailbox, HTTP credential lookup with the built-in fallback list,
    /// and real WebRTC connections.
    pub fn from_config(config: &LinkConfig) -> Result<Self, LinkError> {
        let mailbox = Arc::new(HttpMailbox::new(
            &config.signaling_url,
            config.request_timeout,
        )?);
        let credentials = match &config.credentials_url {
            Some(url) => CredentialProvider::new(
                Arc::new(HttpCredentialSource::new(url.clone(), config.request_timeout)?),
                default_ice_servers(),
            ),
            None => CredentialProvider::fallback_only(default_ice_servers()),
        };
        Ok(Self {
            mailbox,
            credentials,
            connector: Arc::new(RtcConnector::new(config.channel_label.clone())),
        })
    }
}

pub type LinkEvents = mpsc::UnboundedReceiver<LinkEvent>;

pub struct Link;

impl Link {
    /// Spawns the engine task on the current tokio runtime. The task runs
    /// until every [`LinkHandle`] is dropped, tearing the session down on the
    /// way out.
    pub fn spawn(config: LinkConfig, deps: LinkDeps) -> (LinkHandle, LinkEvents) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (engine, inbox) = actor::Engine::new(config, deps, event_tx);
        tokio::spawn(engine.run(command_rx, inbox));
        (LinkHandle { commands: command_tx }, event_rx)
    }

    pub fn from_config(config: LinkConfig) -> Result<(LinkHandle, LinkEvents), LinkError> {
        let deps = LinkDeps::from_config(&config)?;
        Ok(Self::spawn(config, deps))
    }
}

#[derive(Clone)]
pub struct LinkHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl LinkHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, LinkError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| LinkError::Shutdown)?;
        response.await.map_err(|_| LinkError::Shutdown)
    }

    /// Starts a session in `room`. Returns once the request is accepted;
    /// progress arrives on the event stream.
    pub async fn connect(&self, room: &str) -> Result<(), LinkError> {
        let room = room.to_string();
        self.request(|reply| Command::Connect { room, reply })
            .await?
    }

    /// Tears the session down. Safe to call repeatedly.
    pub async fn disconnect(&self) -> Result<(), LinkError> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Best-effort send; fails with [`LinkError::NotConnected`] unless the
    /// data channel is open. Dropped messages are never retried.
    pub async fn send(&self, message: AppMessage) -> Result<(), LinkError> {
        self.request(|reply| Command::Send { message, reply })
            .await?
    }

    pub async fn send_midi(&self, data: Vec<u8>, timestamp: Option<f64>) -> Result<(), LinkError> {
        self.send(AppMessage::Midi(MidiEvent { data, timestamp }))
            .await
    }

    /// Starts a ping burst. Fails with [`LinkError::PingInProgress`] while a
    /// previous run is still collecting pongs.
    pub async fn measure_latency(&self) -> Result<(), LinkError> {
        self.request(|reply| Command::MeasureLatency { reply })
            .await?
    }

    pub async fn snapshot(&self) -> Result<Snapshot, LinkError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }
}
