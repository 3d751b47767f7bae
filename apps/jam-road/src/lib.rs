//! The jam signaling relay: a polling mailbox per room plus a TURN
//! credential endpoint.

pub mod config;
pub mod credentials;
pub mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::Request;
use axum::{routing::get, Router};
use jam_link::signaling::relay::RoomStore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info_span, Span};

use crate::config::Config;
use crate::credentials::CredentialIssuer;

#[derive(Clone)]
pub struct AppState {
    pub rooms: Arc<RoomStore>,
    pub credentials: Arc<CredentialIssuer>,
}

impl AppState {
    pub fn from_config(config: &Config) -> Self {
        Self {
            rooms: Arc::new(RoomStore::new(
                config.message_cap,
                Duration::from_secs(config.room_ttl_seconds),
            )),
            credentials: Arc::new(CredentialIssuer::from_config(config)),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/signaling", get(handlers::signaling).post(handlers::signaling))
        .route("/credentials", get(handlers::credentials))
        .route("/health", get(handlers::health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .with_state(state)
}

/// Tags each request with the signaling action and room so handler logs can
/// be told apart when many peers poll at once.
fn request_span(request: &Request<Body>) -> Span {
    let query = request.uri().query().unwrap_or_default();
    info_span!(
        "request",
        method = %request.method(),
        path = request.uri().path(),
        action = query_param(query, "action").unwrap_or("-"),
        room = query_param(query, "room").unwrap_or("-"),
    )
}

fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

/// Periodically drops rooms nobody has touched within the TTL.
pub fn spawn_sweeper(rooms: Arc<RoomStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let removed = rooms.sweep_expired(std::time::Instant::now());
            if removed > 0 {
                debug!(removed, remaining = rooms.room_count(), "swept idle rooms");
            }
        }
    })
}
