use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::stats::StatsReportType;

use super::{
    IceConnectivity, PeerConnector, PeerEvent, PeerEventSink, PeerLink, SdpKind,
    SessionDescription,
};
use crate::candidate::{CandidateInit, PathKind};
use crate::credentials::IceServer;
use crate::error::LinkError;

/// Opens real WebRTC peer connections carrying one ordered data channel.
pub struct RtcConnector {
    channel_label: String,
}

impl RtcConnector {
    pub fn new(channel_label: impl Into<String>) -> Self {
        Self {
            channel_label: channel_label.into(),
        }
    }
}

fn build_api() -> Result<API, LinkError> {
    let mut setting = SettingEngine::default();
    setting.set_ice_timeouts(
        Some(Duration::from_secs(5)),
        Some(Duration::from_secs(25)),
        Some(Duration::from_secs(2)),
    );

    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn map_connectivity(state: RTCIceConnectionState) -> Option<IceConnectivity> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectivity::New,
        RTCIceConnectionState::Checking => IceConnectivity::Checking,
        RTCIceConnectionState::Connected => IceConnectivity::Connected,
        RTCIceConnectionState::Completed => IceConnectivity::Completed,
        RTCIceConnectionState::Disconnected => IceConnectivity::Disconnected,
        RTCIceConnectionState::Failed => IceConnectivity::Failed,
        RTCIceConnectionState::Closed => IceConnectivity::Closed,
        RTCIceConnectionState::Unspecified => return None,
    })
}

fn candidate_from_rtc(candidate: &RTCIceCandidate) -> Result<CandidateInit, LinkError> {
    let init = candidate.to_json()?;
    Ok(CandidateInit {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    })
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn open(
        &self,
        ice_servers: &[IceServer],
        initiator: bool,
        sink: PeerEventSink,
    ) -> Result<Arc<dyn PeerLink>, LinkError> {
        let api = build_api()?;
        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };
        trace!(
            target = "jam_link::peer::rtc",
            initiator,
            servers = ice_servers.len(),
            generation = sink.generation(),
            "opening peer connection"
        );
        let pc = Arc::new(api.new_peer_connection(config).await?);
        let link = Arc::new(RtcPeerLink {
            pc: Arc::clone(&pc),
            channel: Arc::new(AsyncMutex::new(None)),
        });

        let candidate_sink = sink.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = candidate_sink.clone();
            Box::pin(async move {
                match candidate {
                    Some(candidate) => match candidate_from_rtc(&candidate) {
                        Ok(init) => {
                            sink.emit(PeerEvent::CandidateDiscovered(Some(init)));
                        }
                        Err(err) => warn!(
                            target = "jam_link::peer::rtc",
                            error = %err,
                            "could not serialize local candidate"
                        ),
                    },
                    None => {
                        sink.emit(PeerEvent::CandidateDiscovered(None));
                    }
                }
            })
        }));

        let state_sink = sink.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            debug!(target = "jam_link::peer::rtc", %state, "ice connection state");
            if let Some(connectivity) = map_connectivity(state) {
                state_sink.emit(PeerEvent::Connectivity(connectivity));
            }
            Box::pin(async {})
        }));

        if initiator {
            let init = RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            };
            let dc = pc
                .create_data_channel(&self.channel_label, Some(init))
                .await?;
            attach_channel(&link.channel, dc, sink).await;
        } else {
            let slot = Arc::clone(&link.channel);
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let slot = Arc::clone(&slot);
                let sink = sink.clone();
                Box::pin(async move {
                    debug!(
                        target = "jam_link::peer::rtc",
                        label = dc.label(),
                        "remote data channel announced"
                    );
                    attach_channel(&slot, dc, sink).await;
                })
            }));
        }

        Ok(link as Arc<dyn PeerLink>)
    }
}

async fn attach_channel(
    slot: &AsyncMutex<Option<Arc<RTCDataChannel>>>,
    dc: Arc<RTCDataChannel>,
    sink: PeerEventSink,
) {
    let open_sink = sink.clone();
    dc.on_open(Box::new(move || {
        debug!(target = "jam_link::peer::rtc", "data channel open");
        open_sink.emit(PeerEvent::ChannelOpened);
        Box::pin(async {})
    }));

    let close_sink = sink.clone();
    dc.on_close(Box::new(move || {
        debug!(target = "jam_link::peer::rtc", "data channel closed");
        close_sink.emit(PeerEvent::ChannelClosed);
        Box::pin(async {})
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        match String::from_utf8(msg.data.to_vec()) {
            Ok(text) => {
                sink.emit(PeerEvent::ChannelMessage(text));
            }
            Err(err) => warn!(
                target = "jam_link::peer::rtc",
                error = %err,
                bytes = msg.data.len(),
                "dropping non-utf8 data channel frame"
            ),
        }
        Box::pin(async {})
    }));

    *slot.lock().await = Some(dc);
}

struct RtcPeerLink {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<AsyncMutex<Option<Arc<RTCDataChannel>>>>,
}

impl RtcPeerLink {
    async fn local_description(&self, kind: SdpKind) -> Result<SessionDescription, LinkError> {
        let local = self.pc.local_description().await.ok_or_else(|| {
            LinkError::PeerConnection("local description missing after negotiation step".into())
        })?;
        Ok(SessionDescription {
            kind,
            sdp: local.sdp,
        })
    }
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;
        self.local_description(SdpKind::Offer).await
    }

    async fn create_answer(&self) -> Result<SessionDescription, LinkError> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        self.local_description(SdpKind::Answer).await
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), LinkError> {
        let remote = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp)?,
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp)?,
        };
        self.pc.set_remote_description(remote).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<(), LinkError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn end_of_candidates(&self) -> Result<(), LinkError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit::default())
            .await?;
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<(), LinkError> {
        let channel = self.channel.lock().await.clone();
        let Some(dc) = channel else {
            return Err(LinkError::NotConnected);
        };
        dc.send_text(text.to_string()).await?;
        Ok(())
    }

    async fn selected_path(&self) -> Option<PathKind> {
        let report = self.pc.get_stats().await;
        let local_id = report.reports.values().find_map(|entry| match entry {
            StatsReportType::CandidatePair(pair) if pair.nominated => {
                Some(pair.local_candidate_id.clone())
            }
            _ => None,
        })?;
        report.reports.values().find_map(|entry| match entry {
            StatsReportType::LocalCandidate(candidate) if candidate.id == local_id => {
                PathKind::from_candidate_type(&candidate.candidate_type.to_string())
            }
            _ => None,
        })
    }

    async fn close(&self) -> Result<(), LinkError> {
        if let Some(dc) = self.channel.lock().await.take() {
            if let Err(err) = dc.close().await {
                debug!(
                    target = "jam_link::peer::rtc",
                    error = %err,
                    "data channel close failed"
                );
            }
        }
        self.pc.close().await?;
        Ok(())
    }
}
