//! Outbound side of the relay connection.

use groupsync_common::protocol::{OutboundMessage, PeerSignal, SignalPayload};
use peer::SignalingRelay;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Where the coordinator posts messages for the relay.
pub trait RelaySink: Send + Sync {
    fn post(&self, message: OutboundMessage);
}

impl RelaySink for mpsc::UnboundedSender<OutboundMessage> {
    fn post(&self, message: OutboundMessage) {
        // ---
        if self.send(message).is_err() {
            debug!("Relay connection closed, dropping outbound message");
        }
    }
}

/// Peer signaling carried over the relay as `Signal` messages.
pub struct RelaySignaling {
    // ---
    local_id: String,
    sink: Arc<dyn RelaySink>,
}

impl RelaySignaling {
    pub fn new(local_id: impl Into<String>, sink: Arc<dyn RelaySink>) -> Self {
        // ---
        Self {
            local_id: local_id.into(),
            sink,
        }
    }
}

impl SignalingRelay for RelaySignaling {
    fn relay(&self, to: Option<&str>, payload: SignalPayload) {
        // ---
        let signal = PeerSignal::new(Some(self.local_id.clone()), to.map(str::to_string), payload);
        self.sink.post(OutboundMessage::Signal(signal));
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_signaling_is_stamped_with_sender() {
        // ---
        let (tx, mut rx) = mpsc::unbounded_channel();
        let signaling = RelaySignaling::new("alice", Arc::new(tx));
        signaling.relay(Some("bob"), SignalPayload::Answer("sdp".into()));

        let Ok(OutboundMessage::Signal(signal)) = rx.try_recv() else {
            panic!("expected a signal message");
        };
        assert_eq!(signal.from.as_deref(), Some("alice"));
        assert_eq!(signal.to.as_deref(), Some("bob"));
        assert_eq!(signal.answer.as_deref(), Some("sdp"));
    }

    #[test]
    fn test_closed_relay_is_not_an_error() {
        // ---
        let (tx, rx) = mpsc::unbounded_channel::<OutboundMessage>();
        drop(rx);
        tx.post(OutboundMessage::LeaveGroup);
    }
}
