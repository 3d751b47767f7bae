//! ICE candidate parsing, address-family filtering and the pre-negotiation
//! queue.
//!
//! Candidate strings follow RFC 5245 attribute syntax:
//! `candidate:<foundation> <component> <transport> <priority> <address> <port> typ <kind> ...`

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Wire shape of a trickled candidate, matching the browser
/// `RTCIceCandidateInit` dictionary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl CandidateInit {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

/// A candidate received from the remote peer. The end marker is forwarded
/// explicitly so the local stack knows remote gathering finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCandidate {
    Candidate(CandidateInit),
    EndOfCandidates,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

/// How traffic reaches the peer over a given candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathKind {
    Direct,
    ServerReflexive,
    Relayed,
}

impl PathKind {
    /// Maps an ICE candidate type (`host`, `srflx`, `prflx`, `relay`).
    pub fn from_candidate_type(kind: &str) -> Option<Self> {
        match kind {
            "host" => Some(PathKind::Direct),
            "srflx" | "prflx" => Some(PathKind::ServerReflexive),
            "relay" => Some(PathKind::Relayed),
            _ => None,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            PathKind::Direct => "local network path",
            PathKind::ServerReflexive => "public path via STUN",
            PathKind::Relayed => "relay path via TURN",
        }
    }
}

/// Connection address of a candidate line (the fifth whitespace token).
pub fn connection_address(candidate: &str) -> Option<&str> {
    candidate.split_whitespace().nth(4)
}

/// Two or more colons means an IPv6 literal; hostnames and dotted quads
/// count as IPv4.
pub fn address_family(address: &str) -> AddressFamily {
    if address.matches(':').count() >= 2 {
        AddressFamily::V6
    } else {
        AddressFamily::V4
    }
}

pub fn candidate_kind(candidate: &str) -> Option<PathKind> {
    let mut tokens = candidate.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "typ" {
            return tokens.next().and_then(PathKind::from_candidate_type);
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidatePolicy {
    pub ipv4: bool,
    pub ipv6: bool,
}

impl Default for CandidatePolicy {
    fn default() -> Self {
        Self {
            ipv4: true,
            ipv6: true,
        }
    }
}

impl CandidatePolicy {
    /// Candidates without a parseable address are let through; the end marker
    /// (an empty candidate string) is one of them.
    pub fn allows(&self, candidate: &str) -> bool {
        match connection_address(candidate).map(address_family) {
            Some(AddressFamily::V4) => self.ipv4,
            Some(AddressFamily::V6) => self.ipv6,
            None => true,
        }
    }
}

/// Remote candidates that arrived before the remote description, tagged with
/// the peer that sent them. Bounded: once full, the oldest entry is evicted to
/// admit the newest.
#[derive(Debug)]
pub struct CandidateQueue {
    entries: VecDeque<(String, RemoteCandidate)>,
    cap: usize,
}

impl CandidateQueue {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    /// Returns the evicted entry when the queue was full.
    pub fn push(
        &mut self,
        from: impl Into<String>,
        candidate: RemoteCandidate,
    ) -> Option<RemoteCandidate> {
        let evicted = if self.entries.len() >= self.cap {
            self.entries.pop_front().map(|(_, candidate)| candidate)
        } else {
            None
        };
        self.entries.push_back((from.into(), candidate));
        evicted
    }

    /// Empties the queue. Entries `peer` sent come back in arrival order;
    /// anyone else's are discarded and only counted.
    pub fn drain_from(&mut self, peer: &str) -> (Vec<RemoteCandidate>, usize) {
        let mut kept = Vec::with_capacity(self.entries.len());
        let mut discarded = 0;
        for (from, candidate) in self.entries.drain(..) {
            if from == peer {
                kept.push(candidate);
            } else {
                discarded += 1;
            }
        }
        (kept, discarded)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
