//! Shared building blocks for group playback synchronization.
//!
//! This crate holds the pieces both the peer layer and the coordinator
//! depend on: relay/peer wire types, clock-offset estimation, the error
//! taxonomy, the settings store, and observability setup.

pub mod cli;
pub mod clock;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod settings;
pub mod time;

pub use cli::ColorWhen;
pub use clock::{
    ClockSample, ClockSyncConfig, ClockSynchronizer, OffsetEstimate, ProbeOutcome, ProbeTicket,
    RemoteTimestamps, TimeSource,
};
pub use error::{Result, SyncError};
pub use observability::{init_tracing, MetricsContext, MetricsServerConfig, DEFAULT_LOG_FILTER};
pub use settings::SettingsStore;
pub use time::{Clock, ManualClock, SystemClock, Ticks};
