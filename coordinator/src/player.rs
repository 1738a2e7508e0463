//! The local player boundary.
//!
//! The coordinator never decodes or renders anything. It drives a
//! [`LocalPlayer`] and listens to its events through explicit subscription
//! handles. While a sync session is active, user-facing playback controls
//! are routed through a [`RemoteRequestControl`] so they become requests to
//! the relay instead of local actions.

use crate::relay::RelaySink;
use groupsync_common::protocol::OutboundMessage;
use groupsync_common::Ticks;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Events a player reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlayerEventKind {
    Playing,
    Waiting,
    Pause,
    Unpause,
    TimeUpdate,
}

impl PlayerEventKind {
    pub const ALL: [PlayerEventKind; 5] = [
        PlayerEventKind::Playing,
        PlayerEventKind::Waiting,
        PlayerEventKind::Pause,
        PlayerEventKind::Unpause,
        PlayerEventKind::TimeUpdate,
    ];
}

/// A player event tagged with the binding it came through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundPlayerEvent {
    pub binding: u64,
    pub kind: PlayerEventKind,
}

pub type PlayerEventSender = mpsc::UnboundedSender<BoundPlayerEvent>;
pub type PlayerEventReceiver = mpsc::UnboundedReceiver<BoundPlayerEvent>;

/// Handle returned by [`LocalPlayer::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Where a player delivers events for one binding.
#[derive(Debug, Clone)]
pub struct PlayerEventSink {
    // ---
    binding: u64,
    tx: PlayerEventSender,
}

impl PlayerEventSink {
    pub fn new(binding: u64, tx: PlayerEventSender) -> Self {
        // ---
        Self { binding, tx }
    }

    pub fn emit(&self, kind: PlayerEventKind) {
        // ---
        // Receiver gone means the coordinator stopped; nothing to do
        let _ = self.tx.send(BoundPlayerEvent {
            binding: self.binding,
            kind,
        });
    }
}

/// Pause/unpause/seek, the part of a player a user can drive.
pub trait PlaybackControl: Send {
    fn pause(&mut self);
    fn unpause(&mut self);
    fn seek(&mut self, position: Ticks);
}

/// The media player collaborator.
pub trait LocalPlayer: Send {
    /// Id of the active playback session, if any.
    fn session_id(&self) -> Option<String>;

    fn unpause(&mut self);
    fn pause(&mut self);
    fn seek(&mut self, position: Ticks);
    fn current_position(&self) -> Ticks;

    fn supports_playback_rate(&self) -> bool;
    fn playback_rate(&self) -> f64;
    fn set_playback_rate(&mut self, rate: f64);

    fn subscribe(&mut self, kind: PlayerEventKind, sink: PlayerEventSink) -> SubscriptionId;

    /// Returns whether `id` was an active subscription.
    fn unsubscribe(&mut self, id: SubscriptionId) -> bool;
}

/// User controls turned into relay requests.
pub struct RemoteRequestControl {
    // ---
    relay: Arc<dyn RelaySink>,
}

impl RemoteRequestControl {
    pub fn new(relay: Arc<dyn RelaySink>) -> Self {
        // ---
        Self { relay }
    }
}

impl PlaybackControl for RemoteRequestControl {
    fn pause(&mut self) {
        // ---
        debug!("User pause -> RequestPause");
        self.relay.post(OutboundMessage::RequestPause);
    }

    fn unpause(&mut self) {
        // ---
        debug!("User unpause -> RequestPlay");
        self.relay.post(OutboundMessage::RequestPlay);
    }

    fn seek(&mut self, position: Ticks) {
        // ---
        debug!("User seek to {} -> RequestSeek", position);
        self.relay.post(OutboundMessage::RequestSeek {
            position_ticks: position,
        });
    }
}

/// The coordinator's hold on exactly one player.
///
/// Created by [`PlayerBinding::attach`], which subscribes to every event
/// kind. [`PlayerBinding::release`] undoes everything: subscriptions, the
/// user-control interceptor and any playback-rate override.
pub struct PlayerBinding {
    // ---
    id: u64,
    player: Box<dyn LocalPlayer>,

    /// Replaces the player's own controls for user input while installed.
    interceptor: Option<Box<dyn PlaybackControl>>,

    /// Rate before the coordinator started overriding it.
    saved_rate: Option<f64>,

    subscriptions: Vec<SubscriptionId>,
}

impl PlayerBinding {
    // ---
    /// Subscribes to all player events, tagging them with `id`.
    pub fn attach(id: u64, mut player: Box<dyn LocalPlayer>, events: PlayerEventSender) -> Self {
        // ---
        let subscriptions = PlayerEventKind::ALL
            .iter()
            .map(|kind| player.subscribe(*kind, PlayerEventSink::new(id, events.clone())))
            .collect();

        Self {
            id,
            player,
            interceptor: None,
            saved_rate: None,
            subscriptions,
        }
    }

    /// Detaches from the player and hands it back untouched.
    pub fn release(mut self) -> Box<dyn LocalPlayer> {
        // ---
        self.remove_interceptor();
        self.restore_rate();
        for id in self.subscriptions.drain(..) {
            if !self.player.unsubscribe(id) {
                debug!("Subscription {:?} was already gone", id);
            }
        }
        self.player
    }

    pub fn id(&self) -> u64 {
        // ---
        self.id
    }

    pub fn subscription_count(&self) -> usize {
        // ---
        self.subscriptions.len()
    }

    pub fn player(&self) -> &dyn LocalPlayer {
        // ---
        self.player.as_ref()
    }

    // -- interceptor -------------------------------------------------------

    pub fn install_interceptor(&mut self, control: Box<dyn PlaybackControl>) {
        // ---
        self.interceptor = Some(control);
    }

    pub fn remove_interceptor(&mut self) -> bool {
        // ---
        self.interceptor.take().is_some()
    }

    pub fn is_intercepted(&self) -> bool {
        // ---
        self.interceptor.is_some()
    }

    /// User pressed pause.
    pub fn user_pause(&mut self) {
        // ---
        match &mut self.interceptor {
            Some(control) => control.pause(),
            None => self.player.pause(),
        }
    }

    /// User pressed play.
    pub fn user_unpause(&mut self) {
        // ---
        match &mut self.interceptor {
            Some(control) => control.unpause(),
            None => self.player.unpause(),
        }
    }

    /// User dragged the seek bar.
    pub fn user_seek(&mut self, position: Ticks) {
        // ---
        match &mut self.interceptor {
            Some(control) => control.seek(position),
            None => self.player.seek(position),
        }
    }

    // -- local actions (never intercepted) ---------------------------------

    pub fn local_pause(&mut self) {
        self.player.pause();
    }

    pub fn local_unpause(&mut self) {
        self.player.unpause();
    }

    pub fn local_seek(&mut self, position: Ticks) {
        self.player.seek(position);
    }

    pub fn current_position(&self) -> Ticks {
        self.player.current_position()
    }

    pub fn supports_playback_rate(&self) -> bool {
        self.player.supports_playback_rate()
    }

    // -- playback rate -----------------------------------------------------

    /// Remembers the current rate so it can be restored later.
    pub fn save_rate(&mut self) {
        // ---
        if self.saved_rate.is_none() && self.player.supports_playback_rate() {
            self.saved_rate = Some(self.player.playback_rate());
        }
    }

    pub fn set_rate(&mut self, rate: f64) {
        // ---
        if self.player.supports_playback_rate() {
            self.player.set_playback_rate(rate);
        }
    }

    /// Puts back the saved rate, if any.
    pub fn restore_rate(&mut self) {
        // ---
        if let Some(rate) = self.saved_rate.take() {
            self.player.set_playback_rate(rate);
        }
    }

    pub fn saved_rate(&self) -> Option<f64> {
        // ---
        self.saved_rate
    }
}

impl std::fmt::Debug for PlayerBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerBinding")
            .field("id", &self.id)
            .field("intercepted", &self.interceptor.is_some())
            .field("saved_rate", &self.saved_rate)
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}
