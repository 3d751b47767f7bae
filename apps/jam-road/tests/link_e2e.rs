//! Two links negotiating through a real relay over HTTP. The WebRTC layer is
//! the in-process loopback network so the run is deterministic.

use std::sync::Arc;
use std::time::Duration;

use jam_link::credentials::{default_ice_servers, CredentialProvider, HttpCredentialSource};
use jam_link::peer::LoopbackNetwork;
use jam_link::signaling::HttpMailbox;
use jam_link::{
    AppMessage, Link, LinkConfig, LinkDeps, LinkEvent, LinkEvents, LinkHandle, MidiEvent, Phase,
    Severity,
};
use jam_road::config::Config;
use jam_road::{router, AppState};

async fn spawn_road() -> (String, AppState) {
    let state = AppState::from_config(&Config::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    let app = router(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

fn spawn_link(base: &str, network: &LoopbackNetwork) -> (LinkHandle, LinkEvents) {
    let config = LinkConfig {
        signaling_url: format!("{base}/signaling"),
        credentials_url: Some(format!("{base}/credentials")),
        poll_interval: Duration::from_millis(20),
        request_timeout: Duration::from_secs(2),
        ..LinkConfig::default()
    };
    let mailbox = HttpMailbox::new(&config.signaling_url, config.request_timeout).unwrap();
    let source = HttpCredentialSource::new(
        format!("{base}/credentials"),
        config.request_timeout,
    )
    .unwrap();
    let deps = LinkDeps {
        mailbox: Arc::new(mailbox),
        credentials: CredentialProvider::new(Arc::new(source), default_ice_servers()),
        connector: Arc::new(network.clone()),
    };
    Link::spawn(config, deps)
}

async fn wait_for(
    events: &mut LinkEvents,
    what: &str,
    mut matches: impl FnMut(&LinkEvent) -> bool,
) -> Vec<LinkEvent> {
    let mut seen = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(10), events.recv()).await {
            Ok(Some(event)) => {
                let done = matches(&event);
                seen.push(event);
                if done {
                    return seen;
                }
            }
            Ok(None) => panic!("engine stopped while waiting for {what}"),
            Err(_) => panic!("timed out waiting for {what}; saw {seen:?}"),
        }
    }
}

#[test_timeout::tokio_timeout_test(30)]
async fn two_links_meet_through_the_relay() {
    let (base, state) = spawn_road().await;
    let network = LoopbackNetwork::new();
    let (alice, mut alice_events) = spawn_link(&base, &network);
    let (bob, mut bob_events) = spawn_link(&base, &network);

    alice.connect("rehearsal").await.unwrap();
    let seen = wait_for(&mut alice_events, "waiting", |event| {
        *event == LinkEvent::PhaseChanged(Phase::WaitingForPeer)
    })
    .await;
    // Credentials came from the relay, so no fallback warning.
    assert!(!seen.iter().any(|event| matches!(
        event,
        LinkEvent::Status(notice) if notice.severity == Severity::Warning
    )));

    bob.connect("rehearsal").await.unwrap();
    let opened = |event: &LinkEvent| matches!(event, LinkEvent::ChannelOpened { .. });
    wait_for(&mut alice_events, "alice channel", opened).await;
    wait_for(&mut bob_events, "bob channel", opened).await;

    bob.send_midi(vec![0x90, 64, 90], Some(12.5)).await.unwrap();
    let seen = wait_for(&mut alice_events, "midi", |event| {
        matches!(event, LinkEvent::Message(_))
    })
    .await;
    assert_eq!(
        seen.last(),
        Some(&LinkEvent::Message(AppMessage::Midi(MidiEvent {
            data: vec![0x90, 64, 90],
            timestamp: Some(12.5),
        })))
    );

    bob.disconnect().await.unwrap();
    wait_for(&mut alice_events, "channel close", |event| {
        *event == LinkEvent::ChannelClosed
    })
    .await;
    let alice_id = alice.snapshot().await.unwrap().local_peer.unwrap();
    assert_eq!(state.rooms.peers("rehearsal"), vec![alice_id]);

    alice.disconnect().await.unwrap();
    assert_eq!(state.rooms.room_count(), 0);
}

#[test_timeout::tokio_timeout_test(30)]
async fn unreachable_relay_triggers_reconnect() {
    let network = LoopbackNetwork::new();
    // Nothing listens on the discard port.
    let (link, mut events) = spawn_link("http://127.0.0.1:9", &network);

    link.connect("rehearsal").await.unwrap();
    let seen = wait_for(&mut events, "reconnect", |event| {
        matches!(event, LinkEvent::Reconnecting { attempt: 1, .. })
    })
    .await;
    assert!(seen.iter().any(|event| matches!(
        event,
        LinkEvent::Status(notice)
            if notice.severity == Severity::Warning && notice.message.contains("fallback")
    )));
    link.disconnect().await.unwrap();
    assert_eq!(link.snapshot().await.unwrap().phase, Phase::Closed);
}
