//! Error taxonomy for the synchronization core.
//!
//! None of these are fatal to the host process. The worst outcome is that a
//! sync session is torn down and playback continues locally.

use thiserror::Error;

/// Errors raised by clock sync, peer links and the coordinator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// No response to a time probe within the caller's deadline.
    #[error("time probe {id} timed out after {waited_ms}ms")]
    ProbeTimeout { id: u64, waited_ms: i64 },

    /// The time source answered with a transport-level failure.
    #[error("time probe {id} failed: {reason}")]
    ProbeFailed { id: u64, reason: String },

    /// A probe response referenced a request we are not waiting for.
    #[error("no pending time probe with id {0}")]
    UnknownProbe(u64),

    /// A message had to reference the active player session but none exists.
    #[error("no active player session ({0})")]
    MissingSessionContext(&'static str),

    /// Command emitted before the session was enabled, or already applied.
    #[error("command ignored: {0}")]
    StaleOrDuplicateCommand(&'static str),

    /// Inbound relay or peer message could not be understood.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Send attempted on a peer connection that is not open.
    #[error("channel to peer {peer} is not ready")]
    ChannelNotReady { peer: String },

    /// Repeated drift corrections failed to converge.
    #[error("drift correction exhausted after {attempts} attempts")]
    CorrectionExhausted { attempts: u32 },

    /// The RTC engine rejected an operation.
    #[error("peer transport error: {0}")]
    Transport(String),
}

impl SyncError {
    /// Whether this error should tear down the current sync session.
    pub fn is_session_fatal(&self) -> bool {
        // ---
        matches!(
            self,
            SyncError::MissingSessionContext(_) | SyncError::CorrectionExhausted { .. }
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        // ---
        SyncError::MalformedMessage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
