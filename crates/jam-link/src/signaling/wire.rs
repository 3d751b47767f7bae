use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::candidate::{CandidateInit, RemoteCandidate};
use crate::error::LinkError;
use crate::peer::SessionDescription;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
        }
    }
}

/// A relayed message as returned by `poll`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub from: String,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub timestamp: u64,
}

impl SignalEnvelope {
    pub fn description(&self) -> Result<SessionDescription, LinkError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// `null`, a missing object, or an empty candidate string all mean the
    /// sender finished gathering.
    pub fn candidate(&self) -> Result<RemoteCandidate, LinkError> {
        if self.data.is_null() {
            return Ok(RemoteCandidate::EndOfCandidates);
        }
        let init: CandidateInit = serde_json::from_value(self.data.clone())?;
        if init.candidate.trim().is_empty() {
            Ok(RemoteCandidate::EndOfCandidates)
        } else {
            Ok(RemoteCandidate::Candidate(init))
        }
    }
}

/// Body of a `send` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundSignal {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

impl OutboundSignal {
    pub fn description(desc: &SessionDescription, to: &str) -> Result<Self, LinkError> {
        let kind = match desc.kind {
            crate::peer::SdpKind::Offer => SignalKind::Offer,
            crate::peer::SdpKind::Answer => SignalKind::Answer,
        };
        Ok(Self {
            kind,
            data: serde_json::to_value(desc)?,
            to: Some(to.to_string()),
        })
    }

    /// `None` forwards the end-of-candidates marker as `data: null`.
    pub fn candidate(candidate: Option<&CandidateInit>, to: &str) -> Result<Self, LinkError> {
        let data = match candidate {
            Some(init) => serde_json::to_value(init)?,
            None => Value::Null,
        };
        Ok(Self {
            kind: SignalKind::IceCandidate,
            data,
            to: Some(to.to_string()),
        })
    }
}

/// Raw poll result. Messages stay untyped so one malformed entry can be
/// dropped without losing the rest of the batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollBatch {
    pub messages: Vec<Value>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResponse {
    pub success: bool,
    #[serde(default)]
    pub peers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResponse {
    pub success: bool,
    #[serde(default)]
    pub messages: Vec<Value>,
    #[serde(default)]
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn null_and_empty_candidates_end_gathering() {
        let mut envelope: SignalEnvelope = serde_json::from_value(json!({
            "from": "jam-a", "to": "jam-b", "type": "ice-candidate", "data": null, "timestamp": 7
        }))
        .unwrap();
        assert_eq!(envelope.candidate().unwrap(), RemoteCandidate::EndOfCandidates);

        envelope.data = json!({"candidate": "", "sdpMid": "0", "sdpMLineIndex": 0});
        assert_eq!(envelope.candidate().unwrap(), RemoteCandidate::EndOfCandidates);
    }

    #[test_timeout::timeout]
    fn unknown_signal_types_fail_to_parse() {
        let parsed = serde_json::from_value::<SignalEnvelope>(json!({
            "from": "jam-a", "type": "renegotiate", "data": {}, "timestamp": 1
        }));
        assert!(parsed.is_err());
    }

    #[test_timeout::timeout]
    fn outbound_candidate_carries_browser_shape() {
        let init = CandidateInit::new("candidate:1 1 udp 100 192.168.1.5 54321 typ host");
        let signal = OutboundSignal::candidate(Some(&init), "jam-b").unwrap();
        let body = serde_json::to_value(&signal).unwrap();
        assert_eq!(body["type"], "ice-candidate");
        assert_eq!(body["to"], "jam-b");
        assert_eq!(body["data"]["sdpMLineIndex"], 0);
    }
}
