use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::trace;
use url::Url;

use super::wire::{Ack, ErrorBody, JoinResponse, OutboundSignal, PollBatch, PollResponse};
use super::{Mailbox, PeerId, RoomId};
use crate::error::LinkError;

/// [`Mailbox`] over the relay's `?action=` HTTP interface.
pub struct HttpMailbox {
    client: Client,
    base: Url,
}

impl HttpMailbox {
    pub fn new(base: &str, request_timeout: Duration) -> Result<Self, LinkError> {
        let base = Url::parse(base)
            .map_err(|err| LinkError::Signaling(format!("invalid signaling url {base:?}: {err}")))?;
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { client, base })
    }

    fn action_url(&self, action: &str, room: &RoomId, peer: &PeerId, since: Option<u64>) -> Url {
        let mut url = self.base.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("action", action)
                .append_pair("room", room.as_str())
                .append_pair("peer", peer.as_str());
            if let Some(since) = since {
                query.append_pair("since", &since.to_string());
            }
        }
        url
    }
}

#[async_trait]
impl Mailbox for HttpMailbox {
    async fn join(&self, room: &RoomId, peer: &PeerId) -> Result<Vec<String>, LinkError> {
        let url = self.action_url("join", room, peer, None);
        trace!(target = "jam_link::signaling", action = "join", %room, %peer);
        let response = self.client.get(url).send().await?;
        let body: JoinResponse = read_json(response, None).await?;
        if !body.success {
            return Err(LinkError::Rejected("join refused".into()));
        }
        Ok(body
            .peers
            .into_iter()
            .filter(|id| id != peer.as_str())
            .collect())
    }

    async fn send(
        &self,
        room: &RoomId,
        peer: &PeerId,
        signal: &OutboundSignal,
    ) -> Result<(), LinkError> {
        let url = self.action_url("send", room, peer, None);
        trace!(
            target = "jam_link::signaling",
            action = "send",
            kind = signal.kind.as_str(),
            to = signal.to.as_deref().unwrap_or("*")
        );
        let response = self.client.post(url).json(signal).send().await?;
        let body: Ack = read_json(response, signal.to.as_deref()).await?;
        if body.success {
            Ok(())
        } else {
            Err(LinkError::Rejected("send refused".into()))
        }
    }

    async fn poll(
        &self,
        room: &RoomId,
        peer: &PeerId,
        since: u64,
    ) -> Result<PollBatch, LinkError> {
        let url = self.action_url("poll", room, peer, Some(since));
        let response = self.client.get(url).send().await?;
        let body: PollResponse = read_json(response, None).await?;
        if !body.success {
            return Err(LinkError::Rejected("poll refused".into()));
        }
        trace!(
            target = "jam_link::signaling",
            action = "poll",
            since,
            received = body.messages.len(),
            timestamp = body.timestamp
        );
        Ok(PollBatch {
            messages: body.messages,
            timestamp: body.timestamp,
        })
    }

    async fn leave(&self, room: &RoomId, peer: &PeerId) -> Result<(), LinkError> {
        let url = self.action_url("leave", room, peer, None);
        trace!(target = "jam_link::signaling", action = "leave", %room, %peer);
        let response = self.client.get(url).send().await?;
        let _: Ack = read_json(response, None).await?;
        Ok(())
    }
}

/// 404 on a send means the addressee left the room; other client errors are
/// rejections and server errors are transient.
async fn read_json<T: DeserializeOwned>(
    response: Response,
    addressee: Option<&str>,
) -> Result<T, LinkError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|err| LinkError::Malformed(err.to_string()));
    }

    let detail = response
        .json::<ErrorBody>()
        .await
        .map(|body| body.error)
        .unwrap_or_else(|_| status.to_string());
    Err(match (status, addressee) {
        (StatusCode::NOT_FOUND, Some(to)) => LinkError::PeerUnavailable(to.to_string()),
        (status, _) if status.is_server_error() => {
            LinkError::Signaling(format!("relay returned {status}: {detail}"))
        }
        (StatusCode::NOT_FOUND, None) => {
            LinkError::Signaling(format!("relay endpoint not found: {detail}"))
        }
        _ => LinkError::Rejected(detail),
    })
}
