use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Json, Response},
};
use jam_link::credentials::CredentialBundle;
use jam_link::signaling::is_valid_id;
use jam_link::signaling::relay::RelayError;
use jam_link::signaling::wire::{Ack, ErrorBody, JoinResponse, PollResponse};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error};

use crate::credentials::CredentialError;
use crate::AppState;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid room ID")]
    InvalidRoom,
    #[error("Missing peer ID")]
    MissingPeer,
    #[error("Invalid peer ID")]
    InvalidPeer,
    #[error("Invalid message format")]
    InvalidMessage,
    #[error("Invalid action")]
    InvalidAction,
    #[error("Method not allowed")]
    MethodNotAllowed,
    #[error("Peer not found")]
    PeerNotFound,
    #[error("Room not found")]
    RoomNotFound,
    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::PeerNotFound | ApiError::RoomNotFound => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::Credentials(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        } else {
            debug!(status = status.as_u16(), error = %self, "request rejected");
        }
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::PeerNotFound(_) => ApiError::PeerNotFound,
            RelayError::RoomNotFound(_) => ApiError::RoomNotFound,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SignalingQuery {
    pub action: Option<String>,
    pub room: Option<String>,
    pub peer: Option<String>,
    pub since: Option<String>,
}

/// Body of `action=send`. `data` must be present but may be `null`.
#[derive(Debug, Deserialize)]
struct SendBody {
    #[serde(rename = "type")]
    kind: String,
    data: Value,
    #[serde(default)]
    to: Option<String>,
}

fn checked_peer(peer: Option<&str>) -> Result<&str, ApiError> {
    match peer.map(str::trim) {
        None | Some("") => Err(ApiError::MissingPeer),
        Some(peer) if is_valid_id(peer) => Ok(peer),
        Some(_) => Err(ApiError::InvalidPeer),
    }
}

pub async fn signaling(
    State(state): State<AppState>,
    method: Method,
    Query(query): Query<SignalingQuery>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let room = query
        .room
        .as_deref()
        .map(str::trim)
        .filter(|room| is_valid_id(room))
        .ok_or(ApiError::InvalidRoom)?;
    let action = query.action.as_deref().unwrap_or_default();

    match action {
        "join" => {
            let peer = checked_peer(query.peer.as_deref())?;
            let peers = state.rooms.join(room, peer);
            debug!(room, peer, others = peers.len(), "peer joined");
            Ok(Json(JoinResponse {
                success: true,
                peers,
            })
            .into_response())
        }
        "send" => {
            if method != Method::POST {
                return Err(ApiError::MethodNotAllowed);
            }
            let peer = checked_peer(query.peer.as_deref())?;
            let message: SendBody =
                serde_json::from_slice(&body).map_err(|_| ApiError::InvalidMessage)?;
            if message.kind.trim().is_empty() {
                return Err(ApiError::InvalidMessage);
            }
            let stamp = state.rooms.post(
                room,
                peer,
                &message.kind,
                message.data,
                message.to.as_deref(),
            )?;
            debug!(
                room,
                from = peer,
                kind = %message.kind,
                to = message.to.as_deref().unwrap_or("*"),
                stamp,
                "message stored"
            );
            Ok(Json(Ack { success: true }).into_response())
        }
        "poll" => {
            let peer = checked_peer(query.peer.as_deref())?;
            let since = query
                .since
                .as_deref()
                .and_then(|since| since.trim().parse::<u64>().ok())
                .unwrap_or(0);
            let (messages, timestamp) = state.rooms.poll(room, peer, since);
            let messages = messages
                .into_iter()
                .filter_map(|message| serde_json::to_value(message).ok())
                .collect();
            Ok(Json(PollResponse {
                success: true,
                messages,
                timestamp,
            })
            .into_response())
        }
        "leave" => {
            let peer = checked_peer(query.peer.as_deref())?;
            state.rooms.leave(room, peer);
            debug!(room, peer, "peer left");
            Ok(Json(Ack { success: true }).into_response())
        }
        _ => Err(ApiError::InvalidAction),
    }
}

pub async fn credentials(
    State(state): State<AppState>,
) -> Result<Json<CredentialBundle>, ApiError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    Ok(Json(state.credentials.issue(now)?))
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "rooms": state.rooms.room_count(),
    }))
}
