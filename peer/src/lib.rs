//! Direct peer links for group playback sync.
//!
//! Participants of a group open reliable data channels to each other,
//! signaled through the relay. Over those channels they measure pairwise
//! clock offsets and exchange status. Everything here is driven by explicit
//! events and timestamps; the caller owns the event loop.

pub mod clock_tracker;
pub mod connection;
pub mod diff_buffer;
pub mod link_manager;
pub mod memory;

pub use clock_tracker::{PeerClockTracker, PeerStats, TrackerEvent};
pub use connection::{
    ConnectionState, EngineEvent, EngineEventReceiver, EngineEventSender, EngineFactory,
    PeerConnection, PeerId, RtcEngine, SignalingRelay,
};
pub use diff_buffer::{DiffBuffer, DiffBufferConfig};
pub use link_manager::{LinkEvent, PeerLinkManager, Target};
pub use memory::MemoryNetwork;
