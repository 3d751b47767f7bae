//! Relay outages seen from the public link API, with the relay held in
//! memory so it can be switched off and on under a paused clock.

use std::sync::Arc;
use std::time::Duration;

use jam_link::credentials::CredentialProvider;
use jam_link::peer::LoopbackNetwork;
use jam_link::signaling::MemoryMailbox;
use jam_link::{Link, LinkConfig, LinkDeps, LinkEvent, LinkEvents, LinkHandle, Phase};
use tokio::time::Instant;

const ROOM: &str = "jam";

fn spawn_link(mailbox: &MemoryMailbox, network: &LoopbackNetwork) -> (LinkHandle, LinkEvents) {
    let config = LinkConfig {
        credentials_url: None,
        poll_interval: Duration::from_millis(50),
        ..LinkConfig::default()
    };
    Link::spawn(
        config,
        LinkDeps {
            mailbox: Arc::new(mailbox.clone()),
            credentials: CredentialProvider::fallback_only(Vec::new()),
            connector: Arc::new(network.clone()),
        },
    )
}

async fn collect_until(
    events: &mut LinkEvents,
    what: &str,
    mut matches: impl FnMut(&LinkEvent) -> bool,
) -> Vec<LinkEvent> {
    let mut seen = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(300), events.recv()).await {
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

async fn wait_phase(events: &mut LinkEvents, phase: Phase) -> Vec<LinkEvent> {
    collect_until(events, phase.as_str(), |event| {
        *event == LinkEvent::PhaseChanged(phase)
    })
    .await
}

async fn local_peer(link: &LinkHandle) -> String {
    link.snapshot()
        .await
        .unwrap()
        .local_peer
        .expect("session active")
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn reconnect_recovers_with_a_fresh_peer_id() {
    let mailbox = MemoryMailbox::default();
    let network = LoopbackNetwork::new();
    let (link, mut events) = spawn_link(&mailbox, &network);

    link.connect(ROOM).await.unwrap();
    wait_phase(&mut events, Phase::WaitingForPeer).await;
    let before = local_peer(&link).await;

    mailbox.set_offline(true);
    let started = Instant::now();
    collect_until(&mut events, "first retry", |event| {
        matches!(event, LinkEvent::Reconnecting { attempt: 1, .. })
    })
    .await;
    mailbox.set_offline(false);
    wait_phase(&mut events, Phase::WaitingForPeer).await;
    assert!(started.elapsed() >= Duration::from_secs(1));

    let after = local_peer(&link).await;
    assert_ne!(before, after);
    assert_eq!(mailbox.store().peers(ROOM), vec![after]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(link.snapshot().await.unwrap().reconnect_attempt, 0);
}

#[test_timeout::tokio_timeout_test(60, paused)]
async fn long_outage_does_not_leave_our_old_id_in_the_room() {
    let mailbox = MemoryMailbox::default();
    let network = LoopbackNetwork::new();
    let (alice, mut alice_events) = spawn_link(&mailbox, &network);

    alice.connect(ROOM).await.unwrap();
    wait_phase(&mut alice_events, Phase::WaitingForPeer).await;
    let original = local_peer(&alice).await;

    // Down through the first retry, so that retry cannot leave the room.
    mailbox.set_offline(true);
    collect_until(&mut alice_events, "second retry", |event| {
        matches!(event, LinkEvent::Reconnecting { attempt: 2, .. })
    })
    .await;
    mailbox.set_offline(false);

    let seen = wait_phase(&mut alice_events, Phase::WaitingForPeer).await;
    assert!(
        !seen.contains(&LinkEvent::PhaseChanged(Phase::CreatingOffer)),
        "offered to a stale id: {seen:?}"
    );
    let current = local_peer(&alice).await;
    assert_ne!(current, original);
    assert_eq!(mailbox.store().peers(ROOM), vec![current.clone()]);

    // A newcomer sees only the live id and reaches it.
    let (bob, mut bob_events) = spawn_link(&mailbox, &network);
    bob.connect(ROOM).await.unwrap();
    let opened = |event: &LinkEvent| matches!(event, LinkEvent::ChannelOpened { .. });
    collect_until(&mut bob_events, "bob channel", opened).await;
    collect_until(&mut alice_events, "alice channel", opened).await;
    assert_eq!(
        bob.snapshot().await.unwrap().remote_peer,
        Some(current)
    );
}
