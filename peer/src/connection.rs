//! A single direct connection to one remote participant.
//!
//! The connection owns the offer/answer/candidate handshake and a reliable
//! ordered message channel. The actual transport lives behind [`RtcEngine`];
//! signaling goes out through a [`SignalingRelay`] handed in by the owner.
//!
//! ```text
//! Idle --open()--> Connecting --channel open--> Connected
//!   \                  \                           |
//!    +------------------+------ close() ----------+--> Closed
//! ```

use groupsync_common::protocol::{IceCandidate, SignalPayload};
use groupsync_common::{Result, SyncError};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Participant identifier assigned by the relay.
pub type PeerId = String;

/// Label of the reliable data channel.
pub const CHANNEL_LABEL: &str = "groupsync";

/// Something the transport reports back asynchronously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A local ICE candidate to trickle to the remote side.
    LocalCandidate(IceCandidate),
    /// The reliable channel is open in both directions.
    ChannelOpen,
    /// One text message from the remote side.
    Message(String),
    /// The channel or the whole connection went away.
    ChannelClosed,
}

/// Engine events tagged with the remote peer they concern.
pub type EngineEventSender = mpsc::UnboundedSender<(PeerId, EngineEvent)>;
pub type EngineEventReceiver = mpsc::UnboundedReceiver<(PeerId, EngineEvent)>;

/// Transport backend for one peer connection.
///
/// Implementations report progress through the [`EngineEventSender`] they
/// were created with.
pub trait RtcEngine: Send {
    /// Creates the reliable ordered channel (initiator side only).
    fn create_channel(&mut self, label: &str) -> anyhow::Result<()>;

    /// Creates an offer and applies it as the local description.
    fn create_offer(&mut self) -> anyhow::Result<String>;

    /// Creates an answer and applies it as the local description.
    fn create_answer(&mut self) -> anyhow::Result<String>;

    fn set_remote_description(&mut self, sdp: &str) -> anyhow::Result<()>;

    fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> anyhow::Result<()>;

    fn send(&mut self, text: &str) -> anyhow::Result<()>;

    fn close(&mut self);
}

/// Creates engines for new connections.
pub trait EngineFactory: Send + Sync {
    fn create(
        &self,
        local: &str,
        remote: &str,
        events: EngineEventSender,
    ) -> anyhow::Result<Box<dyn RtcEngine>>;
}

/// Outbound half of the signaling channel.
pub trait SignalingRelay: Send + Sync {
    /// Sends `payload` to `to`, or to every participant when `to` is `None`.
    fn relay(&self, to: Option<&str>, payload: SignalPayload);
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Closed,
}

/// What a connection surfaces to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Open,
    Message(String),
    Close,
}

pub(crate) fn transport_error(err: anyhow::Error) -> SyncError {
    // ---
    SyncError::Transport(format!("{err:#}"))
}

/// One peer connection.
pub struct PeerConnection {
    // ---
    peer_id: PeerId,
    is_initiator: bool,
    state: ConnectionState,
    engine: Box<dyn RtcEngine>,
    relay: Arc<dyn SignalingRelay>,

    /// Whether the remote session description has been applied.
    remote_description_set: bool,

    /// Candidates that arrived before the remote description, in arrival order.
    pending_candidates: VecDeque<IceCandidate>,
}

impl PeerConnection {
    // ---
    pub fn new(
        peer_id: impl Into<PeerId>,
        is_initiator: bool,
        engine: Box<dyn RtcEngine>,
        relay: Arc<dyn SignalingRelay>,
    ) -> Self {
        // ---
        Self {
            peer_id: peer_id.into(),
            is_initiator,
            state: ConnectionState::Idle,
            engine,
            relay,
            remote_description_set: false,
            pending_candidates: VecDeque::new(),
        }
    }

    pub fn peer_id(&self) -> &str {
        // ---
        &self.peer_id
    }

    pub fn is_initiator(&self) -> bool {
        // ---
        self.is_initiator
    }

    pub fn state(&self) -> ConnectionState {
        // ---
        self.state
    }

    pub fn is_connected(&self) -> bool {
        // ---
        self.state == ConnectionState::Connected
    }

    /// Number of candidates waiting for the remote description.
    pub fn pending_candidates(&self) -> usize {
        // ---
        self.pending_candidates.len()
    }

    /// Starts connecting.
    ///
    /// The initiator creates the channel and sends an offer; the acceptor
    /// just waits for one.
    pub fn open(&mut self) -> Result<()> {
        // ---
        if self.state != ConnectionState::Idle {
            debug!("open() on peer {} in state {:?}, ignoring", self.peer_id, self.state);
            return Ok(());
        }

        self.state = ConnectionState::Connecting;

        if self.is_initiator {
            self.engine
                .create_channel(CHANNEL_LABEL)
                .map_err(transport_error)?;
            let offer = self.engine.create_offer().map_err(transport_error)?;
            debug!("Sending offer to peer {}", self.peer_id);
            self.relay
                .relay(Some(&self.peer_id), SignalPayload::Offer(offer));
        } else {
            debug!("Waiting for offer from peer {}", self.peer_id);
        }

        Ok(())
    }

    /// Applies one inbound signaling payload.
    pub fn handle_signal(&mut self, payload: SignalPayload) -> Result<()> {
        // ---
        if self.state == ConnectionState::Closed {
            debug!("Dropping signal for closed peer {}", self.peer_id);
            return Ok(());
        }

        match payload {
            SignalPayload::Offer(sdp) => {
                if self.is_initiator {
                    warn!("Peer {} sent an offer to the initiating side", self.peer_id);
                }
                if self.state == ConnectionState::Idle {
                    self.state = ConnectionState::Connecting;
                }

                self.apply_remote_description(&sdp)?;
                let answer = self.engine.create_answer().map_err(transport_error)?;
                debug!("Sending answer to peer {}", self.peer_id);
                self.relay
                    .relay(Some(&self.peer_id), SignalPayload::Answer(answer));
            }
            SignalPayload::Answer(sdp) => {
                self.apply_remote_description(&sdp)?;
            }
            SignalPayload::IceCandidate(candidate) => {
                if self.remote_description_set {
                    self.engine
                        .add_ice_candidate(&candidate)
                        .map_err(transport_error)?;
                } else {
                    debug!(
                        "Queueing ICE candidate from peer {} until remote description is set",
                        self.peer_id
                    );
                    self.pending_candidates.push_back(candidate);
                }
            }
            SignalPayload::NewSession | SignalPayload::SessionLeaving => {
                // Session lifecycle is the link manager's business
                debug!("Ignoring session signal at connection level");
            }
        }

        Ok(())
    }

    fn apply_remote_description(&mut self, sdp: &str) -> Result<()> {
        // ---
        self.engine
            .set_remote_description(sdp)
            .map_err(transport_error)?;
        self.remote_description_set = true;

        // One bad candidate must not strand the rest of the queue
        while let Some(candidate) = self.pending_candidates.pop_front() {
            if let Err(e) = self.engine.add_ice_candidate(&candidate) {
                warn!(
                    "Skipping queued ICE candidate from peer {}: {}",
                    self.peer_id, e
                );
            }
        }

        Ok(())
    }

    /// Applies one engine event, returning what the owner should hear about.
    pub fn handle_engine_event(&mut self, event: EngineEvent) -> Option<ConnectionEvent> {
        // ---
        match event {
            EngineEvent::LocalCandidate(candidate) => {
                if self.state != ConnectionState::Closed {
                    self.relay
                        .relay(Some(&self.peer_id), SignalPayload::IceCandidate(candidate));
                }
                None
            }
            EngineEvent::ChannelOpen => match self.state {
                ConnectionState::Idle | ConnectionState::Connecting => {
                    info!("Channel to peer {} open", self.peer_id);
                    self.state = ConnectionState::Connected;
                    Some(ConnectionEvent::Open)
                }
                _ => None,
            },
            EngineEvent::Message(text) => {
                if self.state == ConnectionState::Connected {
                    Some(ConnectionEvent::Message(text))
                } else {
                    warn!(
                        "Dropping message from peer {} in state {:?}",
                        self.peer_id, self.state
                    );
                    None
                }
            }
            EngineEvent::ChannelClosed => {
                if self.close() {
                    info!("Channel to peer {} closed by remote", self.peer_id);
                    Some(ConnectionEvent::Close)
                } else {
                    None
                }
            }
        }
    }

    /// Sends one message on the reliable channel.
    pub fn send(&mut self, text: &str) -> Result<()> {
        // ---
        if self.state != ConnectionState::Connected {
            return Err(SyncError::ChannelNotReady {
                peer: self.peer_id.clone(),
            });
        }
        self.engine.send(text).map_err(transport_error)
    }

    /// Closes the connection; returns whether this call did the closing.
    pub fn close(&mut self) -> bool {
        // ---
        if self.state == ConnectionState::Closed {
            return false;
        }

        self.engine.close();
        self.state = ConnectionState::Closed;
        self.pending_candidates.clear();
        true
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer_id", &self.peer_id)
            .field("is_initiator", &self.is_initiator)
            .field("state", &self.state)
            .field("pending_candidates", &self.pending_candidates.len())
            .finish()
    }
}
