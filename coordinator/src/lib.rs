//! Group Playback Sync Coordinator
//!
//! Keeps a local media player aligned with a group's authoritative playback
//! timeline. Relay commands are scheduled against an estimate of the relay
//! server's clock, and drift is corrected by speed or skip adjustments.
//! Optional peer links measure clock offsets between participants.
//!
//! The state machine lives in [`SyncCoordinator`]; [`run_coordinator`] is a
//! single-task driver that feeds it from channels.

pub mod config;
pub mod coordinator;
pub mod drift;
pub mod player;
pub mod relay;
pub mod session;
pub mod sim;
pub mod stats;
pub mod timers;

pub use config::SyncConfig;
pub use coordinator::{CommandOutcome, CoordinatorDeps, Notification, PeerDeps, SyncCoordinator};
pub use drift::{Correction, DriftCorrector};
pub use player::{
    BoundPlayerEvent, LocalPlayer, PlaybackControl, PlayerEventKind, PlayerEventReceiver,
    PlayerEventSender, PlayerEventSink, SubscriptionId,
};
pub use relay::RelaySink;
pub use session::SessionState;
pub use stats::SyncStats;

use anyhow::Result;
use futures::stream::{FuturesUnordered, StreamExt};
use groupsync_common::settings::SettingChange;
use groupsync_common::{SyncError, TimeSource};
use peer::EngineEventReceiver;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

/// Longest the driver sleeps without anything scheduled (ms).
const MAX_IDLE_MS: i64 = 1_000;

/// Everything the driver listens to.
pub struct DriverInputs {
    // ---
    /// Raw relay frames.
    pub relay_inbound: mpsc::UnboundedReceiver<String>,

    pub player_events: PlayerEventReceiver,

    /// Peer engine events, when peer links are configured.
    pub engine_events: Option<EngineEventReceiver>,

    /// Live settings changes.
    pub settings_changes: Option<broadcast::Receiver<SettingChange>>,
}

/// Runs the coordinator until shutdown or until the relay stream closes.
///
/// Single task: probes run concurrently through a [`FuturesUnordered`], but
/// their results, like every other input, are applied from this loop. The
/// session is disabled (with `LeaveGroup`) on the way out.
///
/// # Arguments
///
/// * `coordinator` - State machine to drive
/// * `time_source` - Answers server time probes
/// * `inputs` - Relay, player, peer engine and settings streams
/// * `shutdown` - Completes (or is dropped) to stop the loop
///
/// # Errors
///
/// Currently always returns `Ok`; individual input failures are logged.
pub async fn run_coordinator(
    coordinator: &mut SyncCoordinator,
    time_source: Arc<dyn TimeSource>,
    mut inputs: DriverInputs,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<()> {
    // ---
    let clock = coordinator.clock();
    let mut probes = FuturesUnordered::new();

    loop {
        coordinator.poll();

        while let Some(ticket) = coordinator.begin_probe() {
            let source = Arc::clone(&time_source);
            let deadline = coordinator.probe_timeout();
            probes.push(async move {
                let result = tokio::time::timeout(deadline, source.query_time()).await;
                (ticket.id, result)
            });
        }

        let wait_ms = coordinator
            .next_deadline()
            .map(|at| (at - clock.now_ms()).clamp(0, MAX_IDLE_MS))
            .unwrap_or(MAX_IDLE_MS);

        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
            text = inputs.relay_inbound.recv() => match text {
                Some(text) => {
                    if let Err(e) = coordinator.handle_relay_text(&text) {
                        log_input_error(&e);
                    }
                }
                None => {
                    info!("Relay stream closed");
                    break;
                }
            },
            Some(event) = inputs.player_events.recv() => coordinator.on_player_event(event),
            Some((peer_id, event)) = next_engine_event(&mut inputs.engine_events) => {
                coordinator.on_engine_event(&peer_id, event);
            }
            Some(change) = next_setting(&mut inputs.settings_changes) => {
                coordinator.apply_setting(&change);
            }
            Some((id, result)) = probes.next(), if !probes.is_empty() => match result {
                Ok(answer) => coordinator.on_probe_result(id, answer),
                Err(_) => coordinator.on_probe_timeout(id),
            },
            _ = tokio::time::sleep(Duration::from_millis(wait_ms as u64)) => {}
        }
    }

    coordinator.disable(true);
    coordinator.stats().log(clock.now_ms());
    Ok(())
}

fn log_input_error(err: &SyncError) {
    // ---
    match err {
        SyncError::StaleOrDuplicateCommand(_) => debug!("{}", err),
        _ => warn!("{}", err),
    }
}

async fn next_engine_event(
    rx: &mut Option<EngineEventReceiver>,
) -> Option<(peer::PeerId, peer::EngineEvent)> {
    // ---
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_setting(
    rx: &mut Option<broadcast::Receiver<SettingChange>>,
) -> Option<SettingChange> {
    // ---
    loop {
        let Some(inner) = rx.as_mut() else {
            return std::future::pending().await;
        };
        match inner.recv().await {
            Ok(change) => return Some(change),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Missed {} settings changes", missed);
            }
            Err(broadcast::error::RecvError::Closed) => *rx = None,
        }
    }
}
