//! Peer-to-peer MIDI over a WebRTC data channel.
//!
//! Two peers meet in a named room on an HTTP relay, trade offer, answer and
//! ICE candidates through it by polling, and then exchange MIDI directly.
//! [`Link::spawn`] starts the negotiation engine; everything it does is
//! reported on the returned [`LinkEvents`] stream.

pub mod candidate;
pub mod channel;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod latency;
pub mod midi;
pub mod peer;
pub mod protocol;
pub mod signaling;
pub mod status;
pub mod telemetry;

pub use config::LinkConfig;
pub use engine::{Link, LinkDeps, LinkEvent, LinkEvents, LinkHandle, Phase, Snapshot};
pub use error::{ErrorKind, LinkError};
pub use protocol::{AppMessage, MidiEvent};
pub use status::{Severity, StatusNotice};
