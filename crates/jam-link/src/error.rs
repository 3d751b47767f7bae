use std::time::Duration;

use thiserror::Error;

/// Fieldless tag for a [`LinkError`], kept alongside the display string so
/// callers and tests can branch on the failure without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Signaling,
    PeerUnavailable,
    InvalidRoom,
    Rejected,
    Malformed,
    PeerConnection,
    NegotiationTimeout,
    ReconnectExhausted,
    NotConnected,
    AlreadyConnected,
    PingInProgress,
    Shutdown,
}

impl ErrorKind {
    /// Only signaling transport failures are retried with backoff. Everything
    /// else either ends the attempt or is reported straight to the caller.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Signaling)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Signaling => "signaling",
            ErrorKind::PeerUnavailable => "peer-unavailable",
            ErrorKind::InvalidRoom => "invalid-room",
            ErrorKind::Rejected => "rejected",
            ErrorKind::Malformed => "malformed",
            ErrorKind::PeerConnection => "peer-connection",
            ErrorKind::NegotiationTimeout => "negotiation-timeout",
            ErrorKind::ReconnectExhausted => "reconnect-exhausted",
            ErrorKind::NotConnected => "not-connected",
            ErrorKind::AlreadyConnected => "already-connected",
            ErrorKind::PingInProgress => "ping-in-progress",
            ErrorKind::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("signaling request failed: {0}")]
    Signaling(String),
    #[error("peer {0} is not reachable")]
    PeerUnavailable(String),
    #[error("invalid room id {0:?}")]
    InvalidRoom(String),
    #[error("signaling server rejected the request: {0}")]
    Rejected(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("peer connection failed: {0}")]
    PeerConnection(String),
    #[error("negotiation did not complete within {0:?}")]
    NegotiationTimeout(Duration),
    #[error("gave up reconnecting after {0} attempts")]
    ReconnectExhausted(u32),
    #[error("data channel is not open")]
    NotConnected,
    #[error("a session is already active")]
    AlreadyConnected,
    #[error("a latency measurement is already in progress")]
    PingInProgress,
    #[error("link has shut down")]
    Shutdown,
}

impl LinkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LinkError::Signaling(_) => ErrorKind::Signaling,
            LinkError::PeerUnavailable(_) => ErrorKind::PeerUnavailable,
            LinkError::InvalidRoom(_) => ErrorKind::InvalidRoom,
            LinkError::Rejected(_) => ErrorKind::Rejected,
            LinkError::Malformed(_) => ErrorKind::Malformed,
            LinkError::PeerConnection(_) => ErrorKind::PeerConnection,
            LinkError::NegotiationTimeout(_) => ErrorKind::NegotiationTimeout,
            LinkError::ReconnectExhausted(_) => ErrorKind::ReconnectExhausted,
            LinkError::NotConnected => ErrorKind::NotConnected,
            LinkError::AlreadyConnected => ErrorKind::AlreadyConnected,
            LinkError::PingInProgress => ErrorKind::PingInProgress,
            LinkError::Shutdown => ErrorKind::Shutdown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<reqwest::Error> for LinkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            LinkError::Malformed(err.to_string())
        } else {
            LinkError::Signaling(err.to_string())
        }
    }
}

impl From<webrtc::Error> for LinkError {
    fn from(err: webrtc::Error) -> Self {
        LinkError::PeerConnection(err.to_string())
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(err: serde_json::Error) -> Self {
        LinkError::Malformed(err.to_string())
    }
}
