//! In-process peer connections. Offers and answers carry a link id instead
//! of real SDP; once an offerer applies the matching answer both ends report
//! connectivity and open their channels. Everything each link was asked to
//! do is recorded for inspection.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;

use super::{
    IceConnectivity, PeerConnector, PeerEvent, PeerEventSink, PeerLink, SdpKind,
    SessionDescription,
};
use crate::candidate::{CandidateInit, PathKind};
use crate::credentials::IceServer;
use crate::error::LinkError;

const SDP_MARKER: &str = "a=x-loopback:";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct NetworkState {
    next_id: u64,
    links: Vec<Arc<LoopbackLink>>,
    candidates: Option<Vec<String>>,
}

/// A [`PeerConnector`] whose links can only reach each other.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Candidate lines every link announces after setting its local
    /// description. `{port}` is replaced with a per-link port.
    pub fn with_candidates(candidates: Vec<String>) -> Self {
        let network = Self::default();
        lock(&network.state).candidates = Some(candidates);
        network
    }

    pub fn links(&self) -> Vec<Arc<LoopbackLink>> {
        lock(&self.state).links.clone()
    }

    fn find(&self, id: u64) -> Option<Arc<LoopbackLink>> {
        lock(&self.state)
            .links
            .iter()
            .find(|link| link.id == id)
            .cloned()
    }
}

#[async_trait]
impl PeerConnector for LoopbackNetwork {
    async fn open(
        &self,
        _ice_servers: &[IceServer],
        initiator: bool,
        sink: PeerEventSink,
    ) -> Result<Arc<dyn PeerLink>, LinkError> {
        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = state.next_id;
        let port = 40_000 + id;
        let candidates = state
            .candidates
            .clone()
            .unwrap_or_else(|| vec!["candidate:1 1 udp 2130706431 127.0.0.1 {port} typ host".into()])
            .into_iter()
            .map(|line| line.replace("{port}", &port.to_string()))
            .collect();
        let link = Arc::new(LoopbackLink {
            id,
            initiator,
            sink,
            network: Arc::downgrade(&self.state),
            local_candidates: candidates,
            state: Mutex::new(LinkState::default()),
        });
        state.links.push(Arc::clone(&link));
        Ok(link as Arc<dyn PeerLink>)
    }
}

#[derive(Default)]
struct LinkState {
    partner: Option<Weak<LoopbackLink>>,
    remote_description: Option<SessionDescription>,
    remote_candidates: Vec<CandidateInit>,
    remote_gathering_done: bool,
    channel_open: bool,
    closed: bool,
}

pub struct LoopbackLink {
    id: u64,
    initiator: bool,
    sink: PeerEventSink,
    network: Weak<Mutex<NetworkState>>,
    local_candidates: Vec<String>,
    state: Mutex<LinkState>,
}

impl LoopbackLink {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn remote_candidates(&self) -> Vec<CandidateInit> {
        lock(&self.state).remote_candidates.clone()
    }

    pub fn remote_gathering_done(&self) -> bool {
        lock(&self.state).remote_gathering_done
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.state).remote_description.clone()
    }

    fn describe(&self, kind: SdpKind) -> Result<SessionDescription, LinkError> {
        if lock(&self.state).closed {
            return Err(LinkError::PeerConnection("connection closed".into()));
        }
        for line in &self.local_candidates {
            self.sink
                .emit(PeerEvent::CandidateDiscovered(Some(CandidateInit::new(line))));
        }
        self.sink.emit(PeerEvent::CandidateDiscovered(None));
        Ok(SessionDescription {
            kind,
            sdp: format!("v=0\r\n{SDP_MARKER}{}\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n", self.id),
        })
    }

    fn partner(&self) -> Option<Arc<LoopbackLink>> {
        lock(&self.state).partner.as_ref().and_then(Weak::upgrade)
    }

    fn open_channel(&self) {
        lock(&self.state).channel_open = true;
        self.sink
            .emit(PeerEvent::Connectivity(IceConnectivity::Checking));
        self.sink
            .emit(PeerEvent::Connectivity(IceConnectivity::Connected));
        self.sink.emit(PeerEvent::ChannelOpened);
    }
}

fn link_id_from_sdp(sdp: &str) -> Option<u64> {
    sdp.lines()
        .find_map(|line| line.trim().strip_prefix(SDP_MARKER))
        .and_then(|id| id.parse().ok())
}

#[async_trait]
impl PeerLink for LoopbackLink {
    async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
        self.describe(SdpKind::Offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, LinkError> {
        if lock(&self.state).remote_description.is_none() {
            return Err(LinkError::PeerConnection(
                "answer requested before remote offer".into(),
            ));
        }
        self.describe(SdpKind::Answer)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), LinkError> {
        let partner = link_id_from_sdp(&description.sdp).and_then(|id| {
            let state = self.network.upgrade()?;
            let network = LoopbackNetwork { state };
            network.find(id)
        });
        let kind = description.kind;
        {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(LinkError::PeerConnection("connection closed".into()));
            }
            state.remote_description = Some(description);
            state.partner = partner.as_ref().map(Arc::downgrade);
        }

        if kind == SdpKind::Answer {
            if let Some(partner) = partner {
                if !partner.is_closed() {
                    partner.open_channel();
                    self.open_channel();
                }
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<(), LinkError> {
        let mut state = lock(&self.state);
        if state.remote_description.is_none() {
            return Err(LinkError::PeerConnection(
                "candidate added before remote description".into(),
            ));
        }
        state.remote_candidates.push(candidate);
        Ok(())
    }

    async fn end_of_candidates(&self) -> Result<(), LinkError> {
        lock(&self.state).remote_gathering_done = true;
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<(), LinkError> {
        if !lock(&self.state).channel_open {
            return Err(LinkError::NotConnected);
        }
        let partner = self.partner().ok_or(LinkError::NotConnected)?;
        if !lock(&partner.state).channel_open {
            return Err(LinkError::NotConnected);
        }
        partner
            .sink
            .emit(PeerEvent::ChannelMessage(text.to_string()));
        Ok(())
    }

    async fn selected_path(&self) -> Option<PathKind> {
        lock(&self.state).channel_open.then_some(PathKind::Direct)
    }

    async fn close(&self) -> Result<(), LinkError> {
        let was_open = {
            let mut state = lock(&self.state);
            state.closed = true;
            std::mem::replace(&mut state.channel_open, false)
        };
        if was_open {
            if let Some(partner) = self.partner() {
                let partner_open = std::mem::replace(&mut lock(&partner.state).channel_open, false);
                if partner_open {
                    partner.sink.emit(PeerEvent::ChannelClosed);
                    partner
                        .sink
                        .emit(PeerEvent::Connectivity(IceConnectivity::Disconnected));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test_timeout::tokio_timeout_test(10)]
    async fn offer_answer_opens_both_channels() {
        let network = LoopbackNetwork::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = network.open(&[], true, PeerEventSink::new(1, tx_a)).await.unwrap();
        let b = network.open(&[], false, PeerEventSink::new(7, tx_b)).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        a.send_text("hello").await.unwrap();

        let mut b_events = Vec::new();
        while let Ok((generation, event)) = rx_b.try_recv() {
            assert_eq!(generation, 7);
            b_events.push(event);
        }
        assert!(b_events.contains(&PeerEvent::ChannelOpened));
        assert_eq!(
            b_events.last(),
            Some(&PeerEvent::ChannelMessage("hello".into()))
        );

        a.close().await.unwrap();
        let mut saw_close = false;
        while let Ok((_, event)) = rx_b.try_recv() {
            saw_close |= event == PeerEvent::ChannelClosed;
        }
        assert!(saw_close);
        assert!(rx_a.try_recv().is_ok());
    }
}
