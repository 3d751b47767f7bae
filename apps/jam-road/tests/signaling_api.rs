use std::time::Duration;

use jam_link::credentials::{CredentialSource, HttpCredentialSource};
use jam_link::peer::SessionDescription;
use jam_link::signaling::{
    HttpMailbox, Mailbox, OutboundSignal, PeerId, RoomId, SignalEnvelope, SignalKind,
};
use jam_link::ErrorKind;
use jam_road::config::Config;
use jam_road::{router, AppState};
use serde_json::{json, Value};

async fn spawn_road(config: Config) -> (String, AppState) {
    let state = AppState::from_config(&config);
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

fn mailbox(base: &str) -> HttpMailbox {
    HttpMailbox::new(&format!("{base}/signaling"), Duration::from_secs(5)).unwrap()
}

fn ids(room: &str, peer: &str) -> (RoomId, PeerId) {
    (
        RoomId::parse(room).unwrap(),
        PeerId::from_string(peer).unwrap(),
    )
}

#[test_timeout::tokio_timeout_test(30)]
async fn mailbox_round_trip_over_http() {
    let (base, state) = spawn_road(Config::default()).await;
    let client = mailbox(&base);
    let (room, alice) = ids("studio", "jam-alice");
    let (_, bob) = ids("studio", "jam-bob");

    assert!(client.join(&room, &alice).await.unwrap().is_empty());
    assert_eq!(
        client.join(&room, &bob).await.unwrap(),
        vec!["jam-alice".to_string()]
    );

    let offer = OutboundSignal::description(&SessionDescription::offer("v=0\r\n"), "jam-alice")
        .unwrap();
    client.send(&room, &bob, &offer).await.unwrap();

    let batch = client.poll(&room, &alice, 0).await.unwrap();
    assert_eq!(batch.messages.len(), 1);
    assert!(batch.timestamp > 0);
    let envelope: SignalEnvelope = serde_json::from_value(batch.messages[0].clone()).unwrap();
    assert_eq!(envelope.from, "jam-bob");
    assert_eq!(envelope.kind, SignalKind::Offer);
    assert_eq!(envelope.description().unwrap().sdp, "v=0\r\n");
    assert_eq!(envelope.timestamp, batch.timestamp);

    // Nothing for bob: the offer was addressed to alice.
    assert!(client.poll(&room, &bob, 0).await.unwrap().messages.is_empty());
    let again = client.poll(&room, &alice, batch.timestamp).await.unwrap();
    assert!(again.messages.is_empty());
    assert_eq!(again.timestamp, batch.timestamp);

    client.leave(&room, &alice).await.unwrap();
    let err = client.send(&room, &bob, &offer).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PeerUnavailable);

    client.leave(&room, &bob).await.unwrap();
    assert_eq!(state.rooms.room_count(), 0);
}

#[test_timeout::tokio_timeout_test(30)]
async fn broadcasts_reach_everyone_with_increasing_stamps() {
    let (base, _state) = spawn_road(Config::default()).await;
    let client = mailbox(&base);
    let (room, alice) = ids("room_2", "jam-alice");
    let (_, bob) = ids("room_2", "jam-bob");
    client.join(&room, &alice).await.unwrap();
    client.join(&room, &bob).await.unwrap();

    for _ in 0..3 {
        let broadcast = OutboundSignal {
            kind: SignalKind::IceCandidate,
            data: Value::Null,
            to: None,
        };
        client.send(&room, &alice, &broadcast).await.unwrap();
    }

    for peer in [&alice, &bob] {
        let batch = client.poll(&room, peer, 0).await.unwrap();
        let stamps: Vec<u64> = batch
            .messages
            .iter()
            .map(|message| message["timestamp"].as_u64().unwrap())
            .collect();
        assert_eq!(stamps.len(), 3);
        assert!(stamps.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(batch.timestamp, stamps[2]);
    }
}

#[test_timeout::tokio_timeout_test(30)]
async fn malformed_requests_get_json_errors() {
    let (base, state) = spawn_road(Config::default()).await;
    let http = reqwest::Client::new();
    let url = format!("{base}/signaling");

    let cases: Vec<(reqwest::RequestBuilder, u16, &str)> = vec![
        (
            http.get(&url).query(&[("action", "join"), ("room", "bad room"), ("peer", "a")]),
            400,
            "Invalid room ID",
        ),
        (
            http.get(&url).query(&[("action", "join"), ("room", "ok")]),
            400,
            "Missing peer ID",
        ),
        (
            http.get(&url).query(&[("action", "dance"), ("room", "ok"), ("peer", "a")]),
            400,
            "Invalid action",
        ),
        (
            http.get(&url).query(&[("action", "send"), ("room", "ok"), ("peer", "a")]),
            405,
            "Method not allowed",
        ),
        (
            http.post(&url)
                .query(&[("action", "send"), ("room", "ok"), ("peer", "a")])
                .json(&json!({ "type": "offer" })),
            400,
            "Invalid message format",
        ),
        (
            http.post(&url)
                .query(&[("action", "send"), ("room", "ok"), ("peer", "a")])
                .json(&json!({ "type": "offer", "data": {}, "to": "ghost" })),
            404,
            "Peer not found",
        ),
        (
            http.post(&url)
                .query(&[("action", "send"), ("room", "empty"), ("peer", "a")])
                .json(&json!({ "type": "ice-candidate", "data": null })),
            404,
            "Room not found",
        ),
    ];

    for (request, status, message) in cases {
        let response = request.send().await.unwrap();
        assert_eq!(response.status().as_u16(), status, "{message}");
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"], message);
    }
    assert_eq!(state.rooms.room_count(), 0);
}

#[test_timeout::tokio_timeout_test(30)]
async fn credentials_include_turn_only_with_a_secret() {
    let config = Config {
        turn_host: Some("turn.example.org".into()),
        turn_secret: Some("road-secret".into()),
        credential_ttl_seconds: 600,
        ..Config::default()
    };
    let (base, _state) = spawn_road(config).await;
    let source =
        HttpCredentialSource::new(format!("{base}/credentials"), Duration::from_secs(5)).unwrap();
    let bundle = source.fetch().await.unwrap();
    assert_eq!(bundle.ttl, 600);
    assert_eq!(bundle.ice_servers.len(), 4);
    let turn = &bundle.ice_servers[2];
    assert_eq!(turn.urls, vec!["turn:turn.example.org:3478".to_string()]);
    assert!(turn.username.as_deref().unwrap().ends_with(":jam"));
    assert!(turn.credential.is_some());

    let (base, _state) = spawn_road(Config::default()).await;
    let source =
        HttpCredentialSource::new(format!("{base}/credentials"), Duration::from_secs(5)).unwrap();
    let bundle = source.fetch().await.unwrap();
    assert_eq!(bundle.ice_servers.len(), 2);
    assert!(bundle.ice_servers.iter().all(|server| server.credential.is_none()));
}

#[test_timeout::tokio_timeout_test(30)]
async fn health_reports_live_rooms() {
    let (base, _state) = spawn_road(Config::default()).await;
    let client = mailbox(&base);
    let (room, alice) = ids("lobby", "jam-alice");
    client.join(&room, &alice).await.unwrap();

    let body: Value = reqwest::get(format!("{base}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, json!({ "status": "ok", "rooms": 1 }));
}
