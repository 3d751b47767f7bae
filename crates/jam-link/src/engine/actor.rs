use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, trace, warn};

use super::session::Session;
use super::{Command, LinkDeps, LinkEvent, Phase, Snapshot};
use crate::candidate::{CandidateInit, CandidateQueue, RemoteCandidate, candidate_kind};
use crate::channel::DataChannelSession;
use crate::config::LinkConfig;
use crate::credentials::{CredentialOrigin, CredentialProvider};
use crate::error::{ErrorKind, LinkError};
use crate::latency::{LatencyEstimator, LatencyStats, PongOutcome};
use crate::peer::{
    IceConnectivity, PeerConnector, PeerEvent, PeerEventSink, PeerLink, SdpKind,
    SessionDescription,
};
use crate::protocol::{AppMessage, Probe};
use crate::signaling::{
    Mailbox, OutboundSignal, PeerId, PollBatch, RoomId, SignalEnvelope, SignalKind,
};
use crate::status::StatusNotice;

const TARGET: &str = "jam_link::engine";

/// Results from tasks the engine spawned, tagged with the session that
/// spawned them.
enum Internal {
    PollFinished {
        session: u64,
        result: Result<PollBatch, LinkError>,
    },
    SendFailed {
        session: u64,
        kind: SignalKind,
        error: LinkError,
    },
}

#[derive(Debug, Clone, Copy, Default)]
struct Timers {
    poll: Option<Instant>,
    reconnect: Option<Instant>,
    negotiation: Option<Instant>,
    ping: Option<Instant>,
    ping_expiry: Option<Instant>,
    auto_latency: Option<Instant>,
}

pub(super) struct Inbox {
    peer: mpsc::UnboundedReceiver<(u64, PeerEvent)>,
    internal: mpsc::UnboundedReceiver<Internal>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

pub(super) struct Engine {
    config: LinkConfig,
    mailbox: Arc<dyn Mailbox>,
    credentials: CredentialProvider,
    connector: Arc<dyn PeerConnector>,
    events: mpsc::UnboundedSender<LinkEvent>,
    peer_tx: mpsc::UnboundedSender<(u64, PeerEvent)>,
    internal_tx: mpsc::UnboundedSender<Internal>,

    phase: Phase,
    session: Option<Session>,
    next_session_id: u64,
    next_peer_generation: u64,
    manual_disconnect: bool,
    reconnect_attempt: u32,
    /// Ids an earlier session joined with whose `leave` never reached the
    /// relay. The relay keeps listing them until they are removed.
    departed: Vec<(RoomId, PeerId)>,
    latency: LatencyEstimator,
    last_latency: Option<LatencyStats>,
    timers: Timers,
    clock: Instant,
}

impl Engine {
    pub(super) fn new(
        config: LinkConfig,
        deps: LinkDeps,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> (Self, Inbox) {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let latency = LatencyEstimator::new(config.latency.burst);
        let engine = Self {
            config,
            mailbox: deps.mailbox,
            credentials: deps.credentials,
            connector: deps.connector,
            events,
            peer_tx,
            internal_tx,
            phase: Phase::Idle,
            session: None,
            next_session_id: 0,
            next_peer_generation: 0,
            manual_disconnect: false,
            reconnect_attempt: 0,
            departed: Vec::new(),
            latency,
            last_latency: None,
            timers: Timers::default(),
            clock: Instant::now(),
        };
        let inbox = Inbox {
            peer: peer_rx,
            internal: internal_rx,
        };
        (engine, inbox)
    }

    pub(super) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbox: Inbox,
    ) {
        loop {
            let timers = self.timers;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                Some((generation, event)) = inbox.peer.recv() => {
                    self.on_peer_event(generation, event).await;
                }
                Some(internal) = inbox.internal.recv() => self.on_internal(internal).await,
                _ = sleep_until_opt(timers.poll) => self.on_poll_due(),
                _ = sleep_until_opt(timers.reconnect) => self.on_reconnect_due().await,
                _ = sleep_until_opt(timers.negotiation) => self.on_negotiation_deadline().await,
                _ = sleep_until_opt(timers.ping) => self.on_ping_due().await,
                _ = sleep_until_opt(timers.ping_expiry) => self.on_ping_expired(),
                _ = sleep_until_opt(timers.auto_latency) => self.on_auto_latency(),
            }
        }
        debug!(target = TARGET, "all link handles dropped; shutting down");
        self.manual_disconnect = true;
        self.teardown().await;
        self.set_phase(Phase::Closed);
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect { room, reply } => match self.accept_connect(&room) {
                Ok(room) => {
                    let _ = reply.send(Ok(()));
                    self.manual_disconnect = false;
                    self.reconnect_attempt = 0;
                    self.start_attempt(room, PeerId::generate()).await;
                }
                Err(err) => {
                    self.notify(StatusNotice::error(&err));
                    let _ = reply.send(Err(err));
                }
            },
            Command::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Command::Send { message, reply } => {
                let _ = reply.send(self.send_app(&message).await);
            }
            Command::MeasureLatency { reply } => {
                let result = self.start_latency_run();
                if let Err(err) = &result {
                    self.notify(StatusNotice::warning_for(err.kind(), err.to_string()));
                }
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn accept_connect(&self, room: &str) -> Result<RoomId, LinkError> {
        if !self.phase.is_resting() || self.session.is_some() {
            return Err(LinkError::AlreadyConnected);
        }
        RoomId::parse(room)
    }

    // ---- session lifecycle ----

    async fn start_attempt(&mut self, room: RoomId, local_peer: PeerId) {
        self.set_phase(Phase::JoiningSignaling);

        let resolved = self.credentials.ice_servers().await;
        if resolved.origin == CredentialOrigin::Fallback && self.credentials.has_source() {
            self.notify(StatusNotice::warning(
                "Traversal credentials unavailable; using public fallback servers",
            ));
        }

        self.next_session_id += 1;
        let id = self.next_session_id;
        let (outbox, outbox_task) = self.spawn_outbox(id, room.clone(), local_peer.clone());
        info!(target = TARGET, %room, peer = %local_peer, "starting session");
        self.session = Some(Session {
            id,
            room,
            local_peer,
            remote_peer: None,
            initiator: false,
            ice_servers: resolved.servers,
            peer: None,
            peer_generation: 0,
            channel: None,
            offer_sent: false,
            remote_description_set: false,
            candidates: CandidateQueue::new(self.config.candidate_queue_cap),
            joined: false,
            path_reported: false,
            polling: false,
            since: 0,
            poll_task: None,
            outbox,
            outbox_task,
        });
        self.join_room().await;
    }

    /// Sends queued signals one at a time so the relay sees them in the order
    /// the engine produced them.
    fn spawn_outbox(
        &self,
        session: u64,
        room: RoomId,
        peer: PeerId,
    ) -> (
        mpsc::UnboundedSender<OutboundSignal>,
        tokio::task::JoinHandle<()>,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel::<OutboundSignal>();
        let mailbox = Arc::clone(&self.mailbox);
        let internal = self.internal_tx.clone();
        let task = tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                if let Err(error) = mailbox.send(&room, &peer, &signal).await {
                    let failed = Internal::SendFailed {
                        session,
                        kind: signal.kind,
                        error,
                    };
                    if internal.send(failed).is_err() {
                        break;
                    }
                }
            }
        });
        (tx, task)
    }

    async fn join_room(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let room = session.room.clone();
        let peer = session.local_peer.clone();
        self.set_phase(Phase::JoiningSignaling);
        self.flush_departed().await;
        match self.mailbox.join(&room, &peer).await {
            Ok(peers) => self.on_joined(peers).await,
            Err(err) if err.is_retryable() => self.signaling_lost(err).await,
            Err(err) => self.fail(err).await,
        }
    }

    async fn on_joined(&mut self, peers: Vec<String>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.polling = true;
        session.joined = true;
        self.timers.poll = Some(Instant::now());
        let room = session.room.clone();
        let local = session.local_peer.clone();

        if session.peer.is_some() {
            info!(target = TARGET, %room, peer = %local, "rejoined room; keeping peer connection");
            let phase = if session.channel_open() {
                Phase::Connected
            } else {
                Phase::IceGathering
            };
            self.notify(StatusNotice::success("Signaling restored"));
            self.set_phase(phase);
            return;
        }

        self.notify(StatusNotice::info(format!("Joined room {room} as {local}")));
        let first_other = peers
            .into_iter()
            .find(|peer| peer != local.as_str() && !self.is_departed(&room, peer));
        match first_other {
            Some(remote) => self.start_offer(remote).await,
            None => self.set_phase(Phase::WaitingForPeer),
        }
    }

    /// Retries `leave` for ids a failed teardown left behind. Whatever still
    /// fails stays queued for the next join.
    async fn flush_departed(&mut self) {
        if self.departed.is_empty() {
            return;
        }
        let mut remaining = Vec::new();
        for (room, peer) in std::mem::take(&mut self.departed) {
            match self.mailbox.leave(&room, &peer).await {
                Ok(()) => debug!(target = TARGET, %room, %peer, "removed stale peer id"),
                Err(err) => {
                    trace!(target = TARGET, %room, %peer, error = %err, "stale peer id still listed");
                    remaining.push((room, peer));
                }
            }
        }
        self.departed = remaining;
    }

    fn is_departed(&self, room: &RoomId, peer: &str) -> bool {
        self.departed
            .iter()
            .any(|(r, id)| r.as_str() == room.as_str() && id.as_str() == peer)
    }

    async fn disconnect(&mut self) {
        self.manual_disconnect = true;
        let had_session = self.session.is_some();
        self.teardown().await;
        self.set_phase(Phase::Closed);
        if had_session {
            self.notify(StatusNotice::info("Disconnected"));
        }
    }

    /// Ends the attempt with one error notice and leaves the engine closed.
    async fn fail(&mut self, err: LinkError) {
        error!(target = TARGET, kind = %err.kind(), error = %err, "session failed");
        self.notify(StatusNotice::error(&err));
        self.teardown().await;
        self.set_phase(Phase::Closed);
    }

    /// Releases everything the session holds. Each step runs even if an
    /// earlier one failed.
    async fn teardown(&mut self) {
        self.timers = Timers::default();
        self.latency.reset();
        let Some(mut session) = self.session.take() else {
            return;
        };
        session.stop_background();

        if let Err(err) = self.mailbox.leave(&session.room, &session.local_peer).await {
            debug!(target = TARGET, error = %err, "leave failed during teardown");
            if session.joined {
                self.departed
                    .push((session.room.clone(), session.local_peer.clone()));
            }
        }
        session.channel = None;
        if let Some(link) = session.peer.take() {
            if let Err(err) = link.close().await {
                debug!(target = TARGET, error = %err, "peer close failed during teardown");
            }
        }
        session.candidates.clear();
        trace!(target = TARGET, session = session.id, "session released");
    }

    // ---- signaling ----

    fn enqueue_signal(&self, signal: OutboundSignal) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.outbox.send(signal).is_err() {
            debug!(target = TARGET, "outbox closed; dropping signal");
        }
    }

    fn on_poll_due(&mut self) {
        self.timers.poll = None;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.polling || session.poll_task.is_some() {
            return;
        }
        let mailbox = Arc::clone(&self.mailbox);
        let internal = self.internal_tx.clone();
        let room = session.room.clone();
        let peer = session.local_peer.clone();
        let since = session.since;
        let id = session.id;
        session.poll_task = Some(tokio::spawn(async move {
            let result = mailbox.poll(&room, &peer, since).await;
            let _ = internal.send(Internal::PollFinished {
                session: id,
                result,
            });
        }));
    }

    fn schedule_poll(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.polling && session.poll_task.is_none() && self.timers.poll.is_none() {
            self.timers.poll = Some(Instant::now() + self.config.poll_interval);
        }
    }

    async fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::PollFinished { session, result } => self.on_poll_finished(session, result).await,
            Internal::SendFailed {
                session,
                kind,
                error,
            } => {
                if self.session.as_ref().map(|current| current.id) != Some(session) {
                    return;
                }
                warn!(target = TARGET, kind = kind.as_str(), error = %error, "signaling send failed");
                match error.kind() {
                    ErrorKind::PeerUnavailable => self.fail(error).await,
                    ErrorKind::Signaling => self.signaling_lost(error).await,
                    other => self.notify(StatusNotice::warning_for(
                        other,
                        format!("Dropped {} message: {error}", kind.as_str()),
                    )),
                }
            }
        }
    }

    async fn on_poll_finished(&mut self, id: u64, result: Result<PollBatch, LinkError>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.id != id {
            return;
        }
        session.poll_task = None;
        if !session.polling {
            return;
        }

        let batch = match result {
            Ok(batch) => batch,
            Err(err) => {
                self.signaling_lost(err).await;
                return;
            }
        };
        session.since = session.since.max(batch.timestamp);
        self.reconnect_attempt = 0;

        for raw in batch.messages {
            match serde_json::from_value::<SignalEnvelope>(raw) {
                Ok(envelope) => self.on_signal(envelope).await,
                Err(err) => warn!(
                    target = TARGET,
                    error = %err,
                    "dropping malformed signaling message"
                ),
            }
        }
        self.schedule_poll();
    }

    /// Reconnects only on signaling loss, never after a manual disconnect,
    /// and gives up after the configured number of attempts.
    async fn signaling_lost(&mut self, err: LinkError) {
        if self.manual_disconnect || self.session.is_none() || self.timers.reconnect.is_some() {
            return;
        }
        warn!(target = TARGET, error = %err, "signaling transport lost");
        if let Some(session) = self.session.as_mut() {
            session.polling = false;
            if let Some(task) = session.poll_task.take() {
                task.abort();
            }
        }
        self.timers.poll = None;

        let policy = self.config.reconnect;
        let attempt = self.reconnect_attempt + 1;
        if attempt > policy.max_attempts {
            self.fail(LinkError::ReconnectExhausted(policy.max_attempts))
                .await;
            return;
        }
        self.reconnect_attempt = attempt;
        let delay = policy.delay_for(attempt);
        self.set_phase(Phase::Disconnected);
        self.set_phase(Phase::Reconnecting);
        self.notify(StatusNotice::warning_for(
            ErrorKind::Signaling,
            format!(
                "Signaling lost ({err}); reconnecting in {:.1}s (attempt {attempt}/{})",
                delay.as_secs_f64(),
                policy.max_attempts
            ),
        ));
        self.emit(LinkEvent::Reconnecting { attempt, delay });
        self.timers.reconnect = Some(Instant::now() + delay);
    }

    async fn on_reconnect_due(&mut self) {
        self.timers.reconnect = None;
        if self.manual_disconnect {
            return;
        }
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.channel_open() {
            self.join_room().await;
            return;
        }
        let room = session.room.clone();
        self.teardown().await;
        self.start_attempt(room, PeerId::generate()).await;
    }

    async fn on_signal(&mut self, envelope: SignalEnvelope) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if envelope.from == session.local_peer.as_str() {
            return;
        }
        if envelope
            .to
            .as_deref()
            .is_some_and(|to| to != session.local_peer.as_str())
        {
            return;
        }
        if !session.accepts_from(&envelope.from) {
            debug!(
                target = TARGET,
                from = %envelope.from,
                kind = envelope.kind.as_str(),
                "ignoring signaling from a peer outside this session"
            );
            return;
        }

        match envelope.kind {
            SignalKind::Offer | SignalKind::Answer => match envelope.description() {
                Ok(desc) if desc.kind == SdpKind::Offer && envelope.kind == SignalKind::Offer => {
                    self.on_remote_offer(envelope.from, desc).await;
                }
                Ok(desc) if desc.kind == SdpKind::Answer && envelope.kind == SignalKind::Answer => {
                    self.on_remote_answer(desc).await;
                }
                Ok(desc) => warn!(
                    target = TARGET,
                    envelope = envelope.kind.as_str(),
                    sdp = ?desc.kind,
                    "dropping description with mismatched type"
                ),
                Err(err) => warn!(target = TARGET, error = %err, "dropping malformed description"),
            },
            SignalKind::IceCandidate => match envelope.candidate() {
                Ok(candidate) => self.on_remote_candidate(envelope.from, candidate).await,
                Err(err) => warn!(target = TARGET, error = %err, "dropping malformed candidate"),
            },
        }
    }

    // ---- negotiation ----

    async fn open_peer(&mut self, initiator: bool) -> Result<Arc<dyn PeerLink>, LinkError> {
        self.next_peer_generation += 1;
        let generation = self.next_peer_generation;
        let servers = self
            .session
            .as_ref()
            .map(|session| session.ice_servers.clone())
            .unwrap_or_default();
        let sink = PeerEventSink::new(generation, self.peer_tx.clone());
        let link = self.connector.open(&servers, initiator, sink).await?;
        if let Some(session) = self.session.as_mut() {
            session.peer = Some(Arc::clone(&link));
            session.peer_generation = generation;
            session.channel = Some(DataChannelSession::new(Arc::clone(&link)));
            session.offer_sent = false;
            session.remote_description_set = false;
            session.path_reported = false;
        }
        Ok(link)
    }

    /// Drops the current peer connection without touching the rest of the
    /// session. Late events from it are ignored by generation.
    async fn retire_peer(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.channel = None;
        session.offer_sent = false;
        session.initiator = false;
        if let Some(link) = session.peer.take() {
            if let Err(err) = link.close().await {
                debug!(target = TARGET, error = %err, "closing superseded peer failed");
            }
        }
    }

    fn arm_negotiation_deadline(&mut self) {
        if self.timers.negotiation.is_none() {
            self.timers.negotiation = Some(Instant::now() + self.config.negotiation_timeout);
        }
    }

    async fn start_offer(&mut self, remote: String) {
        if let Some(session) = self.session.as_mut() {
            session.initiator = true;
            session.remote_peer = Some(remote.clone());
        }
        self.set_phase(Phase::CreatingOffer);
        match self.send_offer(&remote).await {
            Ok(()) => {
                self.set_phase(Phase::OfferSent);
                self.arm_negotiation_deadline();
            }
            Err(err) => self.fail(err).await,
        }
    }

    async fn send_offer(&mut self, remote: &str) -> Result<(), LinkError> {
        let link = self.open_peer(true).await?;
        let offer = link.create_offer().await?;
        self.enqueue_signal(OutboundSignal::description(&offer, remote)?);
        if let Some(session) = self.session.as_mut() {
            session.offer_sent = true;
        }
        debug!(target = TARGET, to = remote, "offer sent");
        Ok(())
    }

    async fn on_remote_offer(&mut self, from: String, offer: SessionDescription) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.remote_description_set {
            debug!(target = TARGET, %from, "duplicate offer ignored");
            return;
        }
        if session.initiator && session.offer_sent {
            // Both sides offered: the smaller id answers, the other waits.
            if session.local_peer.as_str() < from.as_str() {
                info!(target = TARGET, %from, "offer collision; answering remote offer");
                self.retire_peer().await;
            } else {
                debug!(target = TARGET, %from, "offer collision; keeping local offer");
                return;
            }
        }

        if let Some(session) = self.session.as_mut() {
            session.remote_peer = Some(from.clone());
            session.initiator = false;
        }
        self.set_phase(Phase::OfferReceived);
        self.arm_negotiation_deadline();
        match self.answer_offer(&from, offer).await {
            Ok(()) => {
                self.set_phase(Phase::AnswerSent);
                self.set_phase(Phase::IceGathering);
            }
            Err(err) => self.fail(err).await,
        }
    }

    async fn answer_offer(&mut self, from: &str, offer: SessionDescription) -> Result<(), LinkError> {
        if self
            .session
            .as_ref()
            .is_some_and(|session| session.peer.is_some())
        {
            self.retire_peer().await;
        }
        let link = self.open_peer(false).await?;
        link.set_remote_description(offer).await?;
        self.replay_queued_candidates().await;
        let answer = link.create_answer().await?;
        self.enqueue_signal(OutboundSignal::description(&answer, from)?);
        debug!(target = TARGET, to = from, "answer sent");
        Ok(())
    }

    async fn on_remote_answer(&mut self, answer: SessionDescription) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if !session.initiator || !session.offer_sent || session.remote_description_set {
            debug!(target = TARGET, "unexpected answer ignored");
            return;
        }
        let Some(link) = session.peer.clone() else {
            return;
        };
        self.set_phase(Phase::AnswerReceived);
        match link.set_remote_description(answer).await {
            Ok(()) => {
                self.replay_queued_candidates().await;
                self.set_phase(Phase::IceGathering);
            }
            Err(err) => self.fail(err).await,
        }
    }

    /// Marks the remote description applied and feeds the queued candidates
    /// to the peer in arrival order.
    async fn replay_queued_candidates(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.remote_description_set = true;
        let remote = session.remote_peer.as_deref().unwrap_or_default();
        let (queued, discarded) = session.candidates.drain_from(remote);
        if discarded > 0 {
            debug!(target = TARGET, discarded, "dropped queued candidates from other peers");
        }
        let Some(link) = session.peer.clone() else {
            return;
        };
        if !queued.is_empty() {
            debug!(target = TARGET, count = queued.len(), "replaying queued candidates");
        }
        for candidate in queued {
            apply_candidate(link.as_ref(), candidate).await;
        }
    }

    async fn on_remote_candidate(&mut self, from: String, candidate: RemoteCandidate) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let RemoteCandidate::Candidate(init) = &candidate {
            if !self.config.candidates.allows(&init.candidate) {
                trace!(target = TARGET, candidate = %init.candidate, "filtered remote candidate");
                return;
            }
        }
        let link = match (&session.peer, session.remote_description_set) {
            (Some(link), true) => Arc::clone(link),
            _ => {
                if let Some(evicted) = session.candidates.push(from, candidate) {
                    warn!(
                        target = TARGET,
                        cap = self.config.candidate_queue_cap,
                        evicted = ?evicted,
                        "candidate queue full; evicted oldest entry"
                    );
                }
                return;
            }
        };
        apply_candidate(link.as_ref(), candidate).await;
    }

    // ---- peer events ----

    async fn on_peer_event(&mut self, generation: u64, event: PeerEvent) {
        let current = self
            .session
            .as_ref()
            .is_some_and(|session| session.peer.is_some() && session.peer_generation == generation);
        if !current {
            trace!(target = TARGET, generation, event = ?event, "stale peer event");
            return;
        }
        match event {
            PeerEvent::CandidateDiscovered(candidate) => self.on_local_candidate(candidate),
            PeerEvent::Connectivity(state) => self.on_connectivity(state).await,
            PeerEvent::ChannelOpened => self.on_channel_opened(),
            PeerEvent::ChannelMessage(text) => self.on_channel_message(&text).await,
            PeerEvent::ChannelClosed => self.on_channel_closed(),
        }
    }

    fn on_local_candidate(&mut self, candidate: Option<CandidateInit>) {
        let Some(remote) = self
            .session
            .as_ref()
            .and_then(|session| session.remote_peer.clone())
        else {
            return;
        };
        let signal = match candidate {
            Some(init) => {
                if !self.config.candidates.allows(&init.candidate) {
                    trace!(target = TARGET, candidate = %init.candidate, "filtered local candidate");
                    return;
                }
                if let Some(kind) = candidate_kind(&init.candidate) {
                    self.notify(StatusNotice::info(format!("Found {} candidate", kind.describe())));
                }
                OutboundSignal::candidate(Some(&init), &remote)
            }
            None => {
                self.notify(StatusNotice::success("Candidate gathering complete"));
                OutboundSignal::candidate(None, &remote)
            }
        };
        match signal {
            Ok(signal) => self.enqueue_signal(signal),
            Err(err) => warn!(target = TARGET, error = %err, "could not encode local candidate"),
        }
    }

    async fn on_connectivity(&mut self, state: IceConnectivity) {
        debug!(target = TARGET, ?state, "peer connectivity");
        match state {
            IceConnectivity::New => {}
            IceConnectivity::Checking => {
                if self.phase != Phase::Connected {
                    self.set_phase(Phase::IceGathering);
                }
                self.notify(StatusNotice::info("Checking connectivity"));
            }
            IceConnectivity::Connected | IceConnectivity::Completed => {
                self.timers.negotiation = None;
                self.set_phase(Phase::Connected);
                self.classify_path().await;
            }
            IceConnectivity::Disconnected => {
                self.set_phase(Phase::Disconnected);
                self.notify(StatusNotice::warning("Peer connectivity interrupted"));
            }
            IceConnectivity::Closed => {
                self.set_phase(Phase::Disconnected);
                self.notify(StatusNotice::info("Peer connection closed"));
            }
            IceConnectivity::Failed => {
                self.fail(LinkError::PeerConnection("ICE connectivity failed".into()))
                    .await;
            }
        }
    }

    /// Inspects the nominated pair once per session, for observability only.
    async fn classify_path(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.path_reported {
            return;
        }
        session.path_reported = true;
        let Some(link) = session.peer.clone() else {
            return;
        };
        if let Some(path) = link.selected_path().await {
            info!(target = TARGET, ?path, "connection path classified");
            self.emit(LinkEvent::PathClassified(path));
            self.notify(StatusNotice::info(format!("Connected over {}", path.describe())));
        }
    }

    fn on_channel_opened(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Some(channel) = session.channel.as_mut() {
            channel.mark_open();
        }
        let remote_peer = session.remote_peer.clone().unwrap_or_default();
        self.notify(StatusNotice::success(format!("Data channel open with {remote_peer}")));
        self.emit(LinkEvent::ChannelOpened { remote_peer });
        self.timers.auto_latency = Some(Instant::now() + self.config.latency.auto_start_delay);
    }

    fn on_channel_closed(&mut self) {
        if let Some(channel) = self
            .session
            .as_mut()
            .and_then(|session| session.channel.as_mut())
        {
            channel.mark_closed();
        }
        self.timers.auto_latency = None;
        self.notify(StatusNotice::info("Data channel closed"));
        self.emit(LinkEvent::ChannelClosed);
    }

    async fn on_channel_message(&mut self, text: &str) {
        let Some(channel) = self
            .session
            .as_ref()
            .and_then(|session| session.channel.as_ref())
        else {
            return;
        };
        let message = match channel.dispatch(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(target = TARGET, error = %err, "dropping malformed data channel frame");
                return;
            }
        };
        match message {
            AppMessage::Ping(probe) => {
                if let Err(err) = self.send_app(&AppMessage::Pong(probe)).await {
                    debug!(target = TARGET, error = %err, "pong not sent");
                }
            }
            AppMessage::Pong(probe) => self.on_pong(&probe),
            other => self.emit(LinkEvent::Message(other)),
        }
    }

    async fn send_app(&self, message: &AppMessage) -> Result<(), LinkError> {
        let Some(channel) = self
            .session
            .as_ref()
            .and_then(|session| session.channel.as_ref())
        else {
            return Err(LinkError::NotConnected);
        };
        channel.send(message).await
    }

    // ---- latency ----

    fn now_ms(&self) -> f64 {
        self.clock.elapsed().as_secs_f64() * 1000.0
    }

    fn start_latency_run(&mut self) -> Result<(), LinkError> {
        let open = self.session.as_ref().is_some_and(Session::channel_open);
        if !open {
            return Err(LinkError::NotConnected);
        }
        let run = self.latency.begin()?;
        let now = Instant::now();
        self.timers.ping = Some(now);
        self.timers.ping_expiry = Some(now + self.config.latency.run_timeout);
        debug!(target = TARGET, run, "latency run started");
        Ok(())
    }

    async fn on_ping_due(&mut self) {
        self.timers.ping = None;
        let now = self.now_ms();
        let Some(probe) = self.latency.next_ping(now) else {
            return;
        };
        if let Err(err) = self.send_app(&AppMessage::Ping(probe)).await {
            debug!(target = TARGET, error = %err, ping = ?probe.ping_id, "ping not sent");
        }
        if self.latency.has_more_pings() {
            self.timers.ping = Some(Instant::now() + self.config.latency.spacing);
        }
    }

    fn on_pong(&mut self, probe: &Probe) {
        let now = self.now_ms();
        match self.latency.record_pong(probe, now) {
            PongOutcome::Rejected(reason) => {
                warn!(target = TARGET, reason, pong = ?probe, "rejecting pong");
            }
            PongOutcome::Recorded { rtt, received } => {
                trace!(target = TARGET, rtt, received, "pong recorded");
            }
            PongOutcome::Completed(stats) => {
                self.timers.ping = None;
                self.timers.ping_expiry = None;
                self.last_latency = Some(stats);
                self.notify(StatusNotice::success(format!(
                    "Latency {:.1} ms one-way (round trip min {:.1} / avg {:.1} / max {:.1} ms)",
                    stats.one_way(),
                    stats.min,
                    stats.mean,
                    stats.max
                )));
                self.emit(LinkEvent::Latency(stats));
            }
        }
    }

    fn on_ping_expired(&mut self) {
        self.timers.ping_expiry = None;
        self.timers.ping = None;
        match self.latency.expire(self.latency.current_run()) {
            Some(Some(stats)) => {
                self.last_latency = Some(stats);
                self.notify(StatusNotice::warning(format!(
                    "Latency run incomplete: {} of {} pongs, {:.1} ms one-way",
                    stats.samples,
                    self.config.latency.burst,
                    stats.one_way()
                )));
                self.emit(LinkEvent::Latency(stats));
            }
            Some(None) => {
                self.notify(StatusNotice::warning("No pong received; latency unknown"));
            }
            None => {}
        }
    }

    fn on_auto_latency(&mut self) {
        self.timers.auto_latency = None;
        if self.latency.is_in_progress() {
            return;
        }
        if let Err(err) = self.start_latency_run() {
            debug!(target = TARGET, error = %err, "automatic latency run skipped");
        }
    }

    async fn on_negotiation_deadline(&mut self) {
        self.timers.negotiation = None;
        if self.session.is_none() || self.phase == Phase::Connected {
            return;
        }
        self.fail(LinkError::NegotiationTimeout(self.config.negotiation_timeout))
            .await;
    }

    // ---- outputs ----

    fn set_phase(&mut self, phase: Phase) {
        if self.phase == phase {
            return;
        }
        debug!(target = TARGET, from = %self.phase, to = %phase, "phase change");
        self.phase = phase;
        self.emit(LinkEvent::PhaseChanged(phase));
    }

    fn notify(&self, notice: StatusNotice) {
        debug!(target = TARGET, severity = notice.severity.as_str(), message = %notice.message, "status");
        self.emit(LinkEvent::Status(notice));
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    fn snapshot(&self) -> Snapshot {
        let session = self.session.as_ref();
        Snapshot {
            phase: self.phase,
            room: session.map(|s| s.room.to_string()),
            local_peer: session.map(|s| s.local_peer.to_string()),
            remote_peer: session.and_then(|s| s.remote_peer.clone()),
            initiator: session.is_some_and(|s| s.initiator),
            channel_open: session.is_some_and(Session::channel_open),
            queued_candidates: session.map_or(0, |s| s.candidates.len()),
            reconnect_attempt: self.reconnect_attempt,
            latency_in_progress: self.latency.is_in_progress(),
            latency: self.last_latency,
        }
    }
}

async fn apply_candidate(link: &dyn PeerLink, candidate: RemoteCandidate) {
    match candidate {
        RemoteCandidate::Candidate(init) => {
            if let Err(err) = link.add_ice_candidate(init).await {
                warn!(target = TARGET, error = %err, "remote candidate rejected");
            }
        }
        RemoteCandidate::EndOfCandidates => {
            if let Err(err) = link.end_of_candidates().await {
                debug!(target = TARGET, error = %err, "end-of-candidates not accepted; ignoring");
            }
        }
    }
}
