use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::LinkError;
use crate::peer::PeerLink;
use crate::protocol::{self, AppMessage};

/// The application's view of the negotiated data channel.
///
/// Delivery is lossy on purpose: [`send`](Self::send) fails immediately while
/// the channel is not open and nothing is queued or retried, because a late
/// MIDI event is worse than a missing one.
pub struct DataChannelSession {
    link: Arc<dyn PeerLink>,
    open: bool,
}

impl DataChannelSession {
    pub fn new(link: Arc<dyn PeerLink>) -> Self {
        Self { link, open: false }
    }

    pub fn mark_open(&mut self) {
        self.open = true;
    }

    pub fn mark_closed(&mut self) {
        self.open = false;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub async fn send(&self, message: &AppMessage) -> Result<(), LinkError> {
        if !self.open {
            trace!(target = "jam_link::channel", "dropping send on closed channel");
            return Err(LinkError::NotConnected);
        }
        let frame = protocol::encode(message)?;
        self.link.send_text(&frame).await.inspect_err(|err| {
            debug!(target = "jam_link::channel", error = %err, "data channel send failed");
        })
    }

    /// Decodes an inbound frame. Unknown `type`s come back as MIDI events.
    pub fn dispatch(&self, frame: &str) -> Result<AppMessage, LinkError> {
        protocol::decode(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{CandidateInit, PathKind};
    use crate::peer::SessionDescription;
    use crate::protocol::MidiEvent;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingLink {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PeerLink for RecordingLink {
        async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
            Ok(SessionDescription::offer(""))
        }
        async fn create_answer(&self) -> Result<SessionDescription, LinkError> {
            Ok(SessionDescription::answer(""))
        }
        async fn set_remote_description(&self, _: SessionDescription) -> Result<(), LinkError> {
            Ok(())
        }
        async fn add_ice_candidate(&self, _: CandidateInit) -> Result<(), LinkError> {
            Ok(())
        }
        async fn end_of_candidates(&self) -> Result<(), LinkError> {
            Ok(())
        }
        async fn send_text(&self, text: &str) -> Result<(), LinkError> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
        async fn selected_path(&self) -> Option<PathKind> {
            None
        }
        async fn close(&self) -> Result<(), LinkError> {
            Ok(())
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn sends_only_while_open() {
        let link = Arc::new(RecordingLink::default());
        let mut session = DataChannelSession::new(link.clone());
        let note = AppMessage::Midi(MidiEvent::new([0x90, 60, 100]));

        assert!(matches!(
            session.send(&note).await,
            Err(LinkError::NotConnected)
        ));
        session.mark_open();
        session.send(&note).await.unwrap();
        session.mark_closed();
        assert!(session.send(&note).await.is_err());

        assert_eq!(
            link.sent.lock().unwrap().as_slice(),
            [r#"{"data":[144,60,100]}"#.to_string()]
        );
    }
}
