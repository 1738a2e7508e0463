//! The group sync state machine.
//!
//! [`SyncCoordinator`] owns the session, the bound player, the server clock
//! estimate, timers and (optionally) peer links. It never sleeps and never
//! spawns: the driver in [`crate::run_coordinator`] feeds it relay text,
//! player events, probe results and engine events, and calls
//! [`SyncCoordinator::poll`] whenever [`SyncCoordinator::next_deadline`]
//! passes. Local time is always read from the injected [`Clock`].

use crate::config::SyncConfig;
use crate::drift::{Correction, DriftCorrector};
use crate::player::{
    BoundPlayerEvent, LocalPlayer, PlayerBinding, PlayerEventKind, PlayerEventSender,
    RemoteRequestControl,
};
use crate::relay::{RelaySignaling, RelaySink};
use crate::session::{SessionState, SyncSession};
use crate::stats::SyncStats;
use crate::timers::{TimerId, TimerKind, TimerQueue};
use chrono::DateTime;
use groupsync_common::protocol::{
    ChannelClass, CommandKind, GroupCommand, GroupUpdate, GroupUpdateKind, InboundMessage,
    OutboundMessage, PeerSignal, PrepareSession,
};
use groupsync_common::settings::{SettingChange, DISPLAY_NAME, ENABLE_PEER_LINKS};
use groupsync_common::time::{ms_to_ticks, ticks_to_ms};
use groupsync_common::{
    Clock, ClockSynchronizer, MetricsContext, OffsetEstimate, ProbeTicket, RemoteTimestamps,
    Result, SyncError, Ticks,
};
use peer::{
    EngineEvent, EngineEventSender, EngineFactory, LinkEvent, PeerClockTracker, PeerLinkManager,
    PeerStats, Target,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Something the host UI may want to show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    GroupJoined { group_id: Option<String> },
    GroupLeft,
    UserJoined(String),
    UserLeft(String),
    WaitingFor(String),
    GroupDoesNotExist,
    CreateGroupDenied,
    JoinGroupDenied,
    LibraryAccessDenied,
    SyncDisabled,
    MissingPlayerSession,
    CorrectionExhausted,
}

/// What [`SyncCoordinator::process_command`] did with a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Sync is not enabled.
    Ignored,
    /// Held until the first clock estimate arrives.
    Queued,
    Scheduled(CommandKind),
}

/// A player action waiting for the player to report it happened.
#[derive(Debug, Clone, Copy, PartialEq)]
enum PendingConfirmation {
    /// Seek to the live group position once playback resumes.
    Unpause,
    /// Seek to `position` once the player is paused.
    Pause { position: Ticks },
}

/// Inputs for peer links.
pub struct PeerDeps {
    // ---
    /// Our participant id on the relay.
    pub local_id: String,
    pub factory: Arc<dyn EngineFactory>,

    /// Sender handed to every engine; the driver drains the receiver.
    pub engine_events: EngineEventSender,
}

/// Everything a coordinator is built from.
pub struct CoordinatorDeps {
    // ---
    pub clock: Arc<dyn Clock>,
    pub relay: Arc<dyn RelaySink>,
    pub player_events: PlayerEventSender,
    pub metrics: MetricsContext,
    pub config: SyncConfig,
    pub peers: Option<PeerDeps>,
}

struct PeerSide {
    links: PeerLinkManager,
    tracker: PeerClockTracker,
}

/// Keeps one local player aligned with its group.
pub struct SyncCoordinator {
    // ---
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    relay: Arc<dyn RelaySink>,
    metrics: MetricsContext,
    player_events: PlayerEventSender,

    /// Offset to the relay server's clock.
    server_clock: ClockSynchronizer,

    session: Option<SyncSession>,
    binding: Option<PlayerBinding>,
    last_binding_id: u64,

    timers: TimerQueue,
    pending: Option<(PendingConfirmation, TimerId)>,
    drift: DriftCorrector,

    /// Local time the player started waiting, if it is.
    waiting_since: Option<i64>,
    buffering: bool,

    peers: Option<PeerSide>,
    notifications: Vec<Notification>,
    external_messages: Vec<(String, Value)>,
    stats: SyncStats,
}

impl SyncCoordinator {
    // ---
    /// Creates a disabled coordinator with no player bound.
    pub fn new(deps: CoordinatorDeps) -> Self {
        // ---
        let CoordinatorDeps {
            clock,
            relay,
            player_events,
            metrics,
            config,
            peers,
        } = deps;

        let peers = peers.map(|p| {
            let signaling = Arc::new(RelaySignaling::new(p.local_id.clone(), Arc::clone(&relay)));
            PeerSide {
                links: PeerLinkManager::new(p.local_id, p.factory, signaling, p.engine_events),
                tracker: PeerClockTracker::new(config.display_name.clone(), config.clock.clone()),
            }
        });
        let now = clock.now_ms();

        Self {
            server_clock: ClockSynchronizer::new(config.clock.clone()),
            config,
            clock,
            relay,
            metrics,
            player_events,
            session: None,
            binding: None,
            last_binding_id: 0,
            timers: TimerQueue::new(),
            pending: None,
            drift: DriftCorrector::new(),
            waiting_since: None,
            buffering: false,
            peers,
            notifications: Vec::new(),
            external_messages: Vec::new(),
            stats: SyncStats::new(now, 5_000),
        }
    }

    // -- accessors ---------------------------------------------------------

    pub fn state(&self) -> SessionState {
        // ---
        self.session
            .as_ref()
            .map(SyncSession::state)
            .unwrap_or(SessionState::Disabled)
    }

    pub fn is_enabled(&self) -> bool {
        // ---
        self.session.is_some()
    }

    pub fn config(&self) -> &SyncConfig {
        // ---
        &self.config
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        // ---
        Arc::clone(&self.clock)
    }

    pub fn stats(&self) -> &SyncStats {
        // ---
        &self.stats
    }

    pub fn server_offset(&self) -> OffsetEstimate {
        // ---
        self.server_clock.current_offset()
    }

    pub fn last_command(&self) -> Option<&GroupCommand> {
        // ---
        self.session.as_ref().and_then(|s| s.last_command.as_ref())
    }

    pub fn pending_timers(&self) -> usize {
        // ---
        self.timers.len()
    }

    pub fn awaiting_confirmation(&self) -> bool {
        // ---
        self.pending.is_some()
    }

    pub fn is_buffering(&self) -> bool {
        // ---
        self.buffering
    }

    pub fn drift(&self) -> &DriftCorrector {
        // ---
        &self.drift
    }

    pub fn binding_id(&self) -> Option<u64> {
        // ---
        self.binding.as_ref().map(PlayerBinding::id)
    }

    /// Whether user controls are currently turned into relay requests.
    pub fn is_intercepting(&self) -> bool {
        // ---
        self.binding
            .as_ref()
            .map(PlayerBinding::is_intercepted)
            .unwrap_or(false)
    }

    pub fn probe_timeout(&self) -> Duration {
        // ---
        self.server_clock.probe_timeout()
    }

    pub fn take_notifications(&mut self) -> Vec<Notification> {
        // ---
        std::mem::take(&mut self.notifications)
    }

    /// Application messages received from peers, oldest first.
    pub fn take_external_messages(&mut self) -> Vec<(String, Value)> {
        // ---
        std::mem::take(&mut self.external_messages)
    }

    pub fn peer_stats(&self) -> Vec<PeerStats> {
        // ---
        self.peers
            .as_ref()
            .map(|p| p.tracker.all_stats())
            .unwrap_or_default()
    }

    pub fn connected_peers(&self) -> usize {
        // ---
        self.peers
            .as_ref()
            .map(|p| p.links.connected_count())
            .unwrap_or(0)
    }

    fn now(&self) -> i64 {
        // ---
        self.clock.now_ms()
    }

    // -- lifecycle ---------------------------------------------------------

    /// Starts a sync session that began at server time `enabled_at`.
    ///
    /// Enabling while already enabled discards the old session first.
    pub fn enable(&mut self, enabled_at: i64, group_id: Option<String>) {
        // ---
        if self.session.is_some() {
            info!("Re-enabling sync, dropping the previous session");
            self.teardown(false);
        }

        info!(
            "Sync enabled for group {} (enabled at {})",
            group_id.as_deref().unwrap_or("?"),
            enabled_at
        );
        self.session = Some(SyncSession::new(enabled_at, group_id));
        self.intercept_player();
        self.server_clock.force_update();

        if self.config.enable_peer_links {
            self.enable_peers();
        }
    }

    /// Ends the session. Safe to call at any time, any number of times.
    ///
    /// With `notify_relay`, a `LeaveGroup` request goes out if a session
    /// was active.
    pub fn disable(&mut self, notify_relay: bool) {
        // ---
        if self.teardown(notify_relay) {
            info!("Sync disabled");
            self.notifications.push(Notification::SyncDisabled);
        }
    }

    /// Clears every piece of session state. Returns whether a session existed.
    fn teardown(&mut self, notify_relay: bool) -> bool {
        // ---
        let was_enabled = self.session.take().is_some();

        self.timers.clear();
        self.pending = None;
        let orphaned = self.server_clock.cancel_all();
        if orphaned > 0 {
            debug!("Dropped {} in-flight server clock request(s)", orphaned);
        }
        self.drift.reset();
        self.waiting_since = None;
        self.buffering = false;

        if let Some(binding) = &mut self.binding {
            binding.remove_interceptor();
            binding.restore_rate();
        }

        if notify_relay && was_enabled {
            self.relay.post(OutboundMessage::LeaveGroup);
        }

        self.disable_peers();
        was_enabled
    }

    fn intercept_player(&mut self) {
        // ---
        if let Some(binding) = &mut self.binding {
            binding.install_interceptor(Box::new(RemoteRequestControl::new(Arc::clone(
                &self.relay,
            ))));
            binding.save_rate();
        }
    }

    fn enable_peers(&mut self) {
        // ---
        if let Some(p) = &mut self.peers {
            p.links.enable();
        }
    }

    fn disable_peers(&mut self) {
        // ---
        let Some(p) = &mut self.peers else {
            return;
        };
        for event in p.links.disable_all() {
            if let LinkEvent::PeerDisconnected(id) = event {
                p.tracker.on_peer_disconnected(&id);
            }
        }
        p.tracker.clear();
        self.metrics.peers_connected.set(0);
    }

    // -- player binding ----------------------------------------------------

    /// Binds `player`, releasing whatever was bound before.
    ///
    /// Returns the new binding id. Events tagged with an older id are
    /// ignored from now on.
    pub fn bind_player(&mut self, player: Box<dyn LocalPlayer>) -> u64 {
        // ---
        self.unbind_player();

        self.last_binding_id += 1;
        let id = self.last_binding_id;
        self.binding = Some(PlayerBinding::attach(id, player, self.player_events.clone()));
        if self.session.is_some() {
            self.intercept_player();
        }
        debug!("Bound player as binding {}", id);
        id
    }

    /// Releases the bound player with its subscriptions and controls restored.
    pub fn unbind_player(&mut self) -> Option<Box<dyn LocalPlayer>> {
        // ---
        let binding = self.binding.take()?;
        if let Some((_, timer)) = self.pending.take() {
            self.timers.cancel(timer);
        }
        self.clear_buffering();
        debug!("Released binding {}", binding.id());
        Some(binding.release())
    }

    /// User pressed pause. Becomes a relay request while sync is enabled.
    pub fn user_pause(&mut self) {
        // ---
        self.with_binding(PlayerBinding::user_pause);
    }

    pub fn user_unpause(&mut self) {
        // ---
        self.with_binding(PlayerBinding::user_unpause);
    }

    pub fn user_seek(&mut self, position: Ticks) {
        // ---
        self.with_binding(|b| b.user_seek(position));
    }

    fn with_binding(&mut self, action: impl FnOnce(&mut PlayerBinding)) {
        // ---
        match &mut self.binding {
            Some(binding) => action(binding),
            None => debug!("No player bound, skipping action"),
        }
    }

    // -- relay input -------------------------------------------------------

    /// Parses and dispatches one relay text frame.
    ///
    /// # Errors
    ///
    /// `MalformedMessage` if the frame cannot be decoded; otherwise whatever
    /// the command or update handler reports.
    pub fn handle_relay_text(&mut self, text: &str) -> Result<()> {
        // ---
        match InboundMessage::parse(text)? {
            InboundMessage::SyncPlayGroupUpdate(update) => self.handle_group_update(update),
            InboundMessage::SyncPlayCommand(cmd) => self.process_command(cmd).map(|_| ()),
        }
    }

    /// Applies one group lifecycle event.
    pub fn handle_group_update(&mut self, update: GroupUpdate) -> Result<()> {
        // ---
        let name = || update.data_str().unwrap_or_default().to_string();

        match update.kind {
            GroupUpdateKind::PrepareSession => {
                let prepare: PrepareSession = update.data_as()?;
                return self.prepare_session(prepare);
            }
            GroupUpdateKind::GroupJoined => {
                let raw = update.data_str().ok_or_else(|| {
                    SyncError::MalformedMessage("GroupJoined without an enable time".into())
                })?;
                let enabled_at = DateTime::parse_from_rfc3339(raw)
                    .map_err(|e| {
                        SyncError::MalformedMessage(format!("bad GroupJoined time {raw:?}: {e}"))
                    })?
                    .timestamp_millis();
                self.enable(enabled_at, update.group_id.clone());
                self.notifications.push(Notification::GroupJoined {
                    group_id: update.group_id.clone(),
                });
            }
            GroupUpdateKind::GroupLeft => {
                self.disable(false);
                self.notifications.push(Notification::GroupLeft);
            }
            GroupUpdateKind::NotInGroup => self.disable(false),
            GroupUpdateKind::UserJoined => self.notifications.push(Notification::UserJoined(name())),
            GroupUpdateKind::UserLeft => self.notifications.push(Notification::UserLeft(name())),
            GroupUpdateKind::GroupWait => self.notifications.push(Notification::WaitingFor(name())),
            GroupUpdateKind::GroupDoesNotExist => {
                self.notifications.push(Notification::GroupDoesNotExist)
            }
            GroupUpdateKind::CreateGroupDenied => {
                self.notifications.push(Notification::CreateGroupDenied)
            }
            GroupUpdateKind::JoinGroupDenied => {
                self.notifications.push(Notification::JoinGroupDenied)
            }
            GroupUpdateKind::LibraryAccessDenied => {
                self.notifications.push(Notification::LibraryAccessDenied)
            }
            GroupUpdateKind::WebRtc => {
                let signal: PeerSignal = update.data_as()?;
                self.route_signal(&signal)?;
            }
        }
        Ok(())
    }

    fn prepare_session(&mut self, prepare: PrepareSession) -> Result<()> {
        // ---
        let session_id = self.binding.as_ref().and_then(|b| b.player().session_id());
        let Some(session_id) = session_id else {
            warn!(
                "Group {} wants to play {} but no player session is active",
                prepare.group_id, prepare.playing_item_id
            );
            self.disable(false);
            self.notifications.push(Notification::MissingPlayerSession);
            return Err(SyncError::MissingSessionContext("PrepareSession"));
        };

        info!(
            "Joining group {} with item {} (player session {})",
            prepare.group_id, prepare.playing_item_id, session_id
        );
        self.relay.post(OutboundMessage::JoinGroup {
            group_id: prepare.group_id,
            playing_item_id: prepare.playing_item_id,
        });
        Ok(())
    }

    // -- commands ----------------------------------------------------------

    /// Applies an authoritative playback command.
    ///
    /// # Errors
    ///
    /// `StaleOrDuplicateCommand` for commands emitted before the session was
    /// enabled or repeating the last applied one. Neither changes any state.
    pub fn process_command(&mut self, cmd: GroupCommand) -> Result<CommandOutcome> {
        // ---
        let Some(session) = self.session.as_mut() else {
            debug!("Sync disabled, ignoring {:?} command", cmd.kind);
            return Ok(CommandOutcome::Ignored);
        };

        if !session.ready {
            if let Some(displaced) = session.queue(cmd) {
                debug!("Queued command replaces pending {:?}", displaced.kind);
            }
            self.stats.commands_queued += 1;
            return Ok(CommandOutcome::Queued);
        }

        let reason = if session.is_stale(&cmd) {
            Some("emitted before the session was enabled")
        } else if session.is_duplicate(&cmd) {
            Some("same as the last applied command")
        } else {
            None
        };
        if let Some(reason) = reason {
            debug!("Ignoring {:?} command: {}", cmd.kind, reason);
            self.metrics.commands_ignored_total.inc();
            self.stats.commands_ignored += 1;
            return Err(SyncError::StaleOrDuplicateCommand(reason));
        }

        session.last_command = Some(cmd.clone());
        self.apply_command(&cmd);

        self.metrics.commands_applied_total.inc();
        self.stats.commands_applied += 1;
        Ok(CommandOutcome::Scheduled(cmd.kind))
    }

    fn apply_command(&mut self, cmd: &GroupCommand) {
        // ---
        self.cancel_scheduled_action();

        let now = self.now();
        let local_when = self.server_clock.current_offset().remote_to_local(cmd.when_ms());
        debug!(
            "{:?} at position {} in {}ms",
            cmd.kind,
            cmd.position_ticks,
            local_when - now
        );

        match cmd.kind {
            CommandKind::Play => {
                self.drift.reset();
                if local_when > now {
                    self.with_binding(|b| b.local_seek(cmd.position_ticks));
                    self.timers.schedule(local_when, TimerKind::ScheduledUnpause);
                } else {
                    self.with_binding(PlayerBinding::local_unpause);
                    self.await_confirmation(PendingConfirmation::Unpause, now);
                    self.drift.arm();
                }
            }
            CommandKind::Pause | CommandKind::Seek => {
                if local_when > now {
                    self.timers.schedule(
                        local_when,
                        TimerKind::ScheduledPause {
                            position: cmd.position_ticks,
                        },
                    );
                } else {
                    self.pause_then_seek(cmd.position_ticks, now);
                }
            }
        }
    }

    /// Drops the previous command's timers and any correction in progress.
    fn cancel_scheduled_action(&mut self) {
        // ---
        self.timers.cancel_where(TimerKind::is_scheduled_action);
        self.pending = None;
        self.drift.disarm();

        if self.drift.is_speed_active() {
            self.with_binding(|b| b.set_rate(1.0));
            self.drift.finish_speed();
        }
        self.timers.cancel_where(|k| {
            matches!(k, TimerKind::RestorePlaybackRate | TimerKind::SkipCooldown)
        });
    }

    fn pause_then_seek(&mut self, position: Ticks, now: i64) {
        // ---
        self.with_binding(PlayerBinding::local_pause);
        self.await_confirmation(PendingConfirmation::Pause { position }, now);
    }

    fn await_confirmation(&mut self, confirmation: PendingConfirmation, now: i64) {
        // ---
        let timer = self.timers.schedule(
            now + self.config.confirmation_timeout_ms,
            TimerKind::ConfirmationTimeout,
        );
        self.pending = Some((confirmation, timer));
    }

    /// Resolves the pending confirmation if `event` is the one it waits for.
    fn confirm(&mut self, event: PlayerEventKind) {
        // ---
        let Some((pending, timer)) = self.pending else {
            return;
        };
        let matches = match pending {
            PendingConfirmation::Unpause => {
                matches!(event, PlayerEventKind::Unpause | PlayerEventKind::Playing)
            }
            PendingConfirmation::Pause { .. } => event == PlayerEventKind::Pause,
        };
        if matches {
            self.timers.cancel(timer);
            self.pending = None;
            self.finish_confirmation(pending);
        }
    }

    fn finish_confirmation(&mut self, pending: PendingConfirmation) {
        // ---
        let now = self.now();
        match pending {
            PendingConfirmation::Unpause => {
                if let Some(target) = self.live_position(now) {
                    self.with_binding(|b| b.local_seek(target));
                }
            }
            PendingConfirmation::Pause { position } => {
                self.with_binding(|b| b.local_seek(position));
            }
        }
    }

    /// Where the group's playhead is at local time `now`, while playing.
    fn live_position(&self, now: i64) -> Option<Ticks> {
        // ---
        let cmd = self.last_command()?;
        if cmd.kind != CommandKind::Play {
            return None;
        }
        let server_now = self.server_clock.current_offset().local_to_remote(now);
        Some(cmd.position_ticks + ms_to_ticks((server_now - cmd.when_ms()) as f64))
    }

    // -- player events -----------------------------------------------------

    pub fn on_player_event(&mut self, event: BoundPlayerEvent) {
        // ---
        if self.binding_id() != Some(event.binding) {
            debug!("Ignoring {:?} from released binding {}", event.kind, event.binding);
            return;
        }

        let now = self.now();
        match event.kind {
            PlayerEventKind::Playing => {
                self.clear_buffering();
                self.confirm(PlayerEventKind::Playing);
            }
            PlayerEventKind::Waiting => {
                if self.waiting_since.is_none() {
                    self.waiting_since = Some(now);
                    self.timers.schedule(
                        now + self.config.buffering_threshold_ms + 1,
                        TimerKind::BufferingCheck,
                    );
                }
            }
            PlayerEventKind::Pause | PlayerEventKind::Unpause => self.confirm(event.kind),
            PlayerEventKind::TimeUpdate => self.check_drift(now),
        }
    }

    fn clear_buffering(&mut self) {
        // ---
        if self.buffering {
            info!("Player stopped buffering");
        }
        self.waiting_since = None;
        self.buffering = false;
        self.timers.cancel_where(|k| matches!(k, TimerKind::BufferingCheck));
    }

    fn check_drift(&mut self, now: i64) {
        // ---
        let Some(session) = &self.session else {
            return;
        };
        if !session.ready || self.buffering || self.pending.is_some() {
            return;
        }
        if !self
            .drift
            .should_check(now, self.config.drift_check_interval_ms())
        {
            return;
        }
        let Some(expected) = self.live_position(now) else {
            return;
        };
        let Some(binding) = &self.binding else {
            return;
        };

        let actual = binding.current_position();
        let diff_ms = ticks_to_ms(expected - actual);
        let correction =
            self.drift
                .decide(diff_ms, binding.supports_playback_rate(), now, &self.config);

        self.metrics.drift_seconds.observe(diff_ms.abs() / 1000.0);
        self.stats.record_drift(diff_ms, &correction);
        self.report_playback_diff(diff_ms);

        match correction {
            Correction::InSync => {}
            Correction::Tolerated => debug!("Drift {:.0}ms, no correction applies", diff_ms),
            Correction::Speed { rate } => {
                info!("SpeedToSync: drift {:.0}ms, rate {:.3}", diff_ms, rate);
                self.with_binding(|b| b.set_rate(rate));
                self.timers.schedule(
                    now + self.config.speed_to_sync_duration_ms,
                    TimerKind::RestorePlaybackRate,
                );
                self.metrics.speed_corrections_total.inc();
            }
            Correction::Skip => {
                info!("SkipToSync: drift {:.0}ms, seeking to {}", diff_ms, expected);
                self.with_binding(|b| b.local_seek(expected));
                self.timers
                    .schedule(now + self.config.skip_cooldown_ms, TimerKind::SkipCooldown);
                self.metrics.skip_corrections_total.inc();
            }
            Correction::Exhausted { attempts } => {
                let err = SyncError::CorrectionExhausted { attempts };
                warn!("{}, waiting for the next play command", err);
                self.metrics.corrections_exhausted_total.inc();
                self.notifications.push(Notification::CorrectionExhausted);
            }
        }
    }

    fn report_playback_diff(&mut self, diff_ms: f64) {
        // ---
        if let Some(p) = &mut self.peers {
            if p.links.is_enabled() {
                p.tracker.report_playback_diff(diff_ms, &mut p.links);
            }
        }
    }

    // -- timers ------------------------------------------------------------

    /// Expires probes, fires due timers and services peer clocks.
    pub fn poll(&mut self) {
        // ---
        let now = self.now();

        for err in self.server_clock.expire_probes(now) {
            self.on_probe_error(err);
        }

        while let Some((_, kind)) = self.timers.pop_due(now) {
            self.fire_timer(kind, now);
        }

        if let Some(p) = &mut self.peers {
            if p.links.is_enabled() {
                p.tracker.poll(&mut p.links, now);
            }
        }

        self.stats.maybe_log(now);
    }

    /// Earliest local time [`Self::poll`] has something to do.
    pub fn next_deadline(&self) -> Option<i64> {
        // ---
        let now = self.now();
        let probe_wakeup = self
            .session
            .as_ref()
            .map(|_| self.server_clock.next_wakeup(now));
        let mut next = earliest(self.timers.next_deadline(), probe_wakeup);
        if let Some(p) = &self.peers {
            next = earliest(next, p.tracker.next_wakeup(now));
        }
        next
    }

    fn fire_timer(&mut self, kind: TimerKind, now: i64) {
        // ---
        match kind {
            TimerKind::ScheduledUnpause => {
                self.with_binding(PlayerBinding::local_unpause);
                self.timers.schedule(
                    now + self.config.drift_check_interval_ms(),
                    TimerKind::ArmCorrection,
                );
            }
            TimerKind::ScheduledPause { position } => self.pause_then_seek(position, now),
            TimerKind::ArmCorrection | TimerKind::SkipCooldown => self.drift.arm(),
            TimerKind::ConfirmationTimeout => {
                if let Some((pending, _)) = self.pending.take() {
                    warn!(
                        "Player did not confirm {:?} within {}ms, continuing anyway",
                        pending, self.config.confirmation_timeout_ms
                    );
                    self.finish_confirmation(pending);
                }
            }
            TimerKind::RestorePlaybackRate => {
                self.with_binding(|b| b.set_rate(1.0));
                self.drift.finish_speed();
                self.drift.arm();
            }
            TimerKind::BufferingCheck => {
                if let Some(since) = self.waiting_since {
                    if now - since > self.config.buffering_threshold_ms {
                        info!("Player buffering for {}ms, pausing drift checks", now - since);
                        self.buffering = true;
                    } else {
                        self.timers.schedule(
                            since + self.config.buffering_threshold_ms + 1,
                            TimerKind::BufferingCheck,
                        );
                    }
                }
            }
        }
    }

    // -- server clock ------------------------------------------------------

    /// Starts a server time probe if one is due. Only probes while enabled.
    pub fn begin_probe(&mut self) -> Option<ProbeTicket> {
        // ---
        let now = self.now();
        if self.session.is_none() || !self.server_clock.is_probe_due(now) {
            return None;
        }
        self.metrics.probes_sent_total.inc();
        Some(self.server_clock.begin_probe(now))
    }

    /// Completes probe `id` with the time source's answer.
    pub fn on_probe_result(&mut self, id: u64, result: anyhow::Result<RemoteTimestamps>) {
        // ---
        if self.session.is_none() {
            debug!("Sync disabled, dropping server clock answer {}", id);
            return;
        }
        let now = self.now();
        let outcome = match result {
            Ok(remote) => self.server_clock.resolve_probe(id, remote, now),
            Err(e) => Err(self.server_clock.fail_probe(id, format!("{e:#}"))),
        };
        match outcome {
            Ok(outcome) => self.on_offset_updated(outcome.estimate),
            Err(err) => self.on_probe_error(err),
        }
    }

    /// Probe `id` hit its deadline in the driver.
    pub fn on_probe_timeout(&mut self, id: u64) {
        // ---
        let err = self.server_clock.cancel_probe(id, self.now());
        self.on_probe_error(err);
    }

    fn on_probe_error(&mut self, err: SyncError) {
        // ---
        match &err {
            SyncError::ProbeTimeout { .. } => self.metrics.probes_timed_out_total.inc(),
            SyncError::ProbeFailed { .. } => self.metrics.probes_failed_total.inc(),
            _ => {
                debug!("Ignoring probe result: {}", err);
                return;
            }
        }
        self.stats.record_probe_failure();
        warn!("Server clock: {}", err);
    }

    fn on_offset_updated(&mut self, estimate: OffsetEstimate) {
        // ---
        self.metrics
            .clock_offset_ms
            .set(estimate.offset_ms.round() as i64);
        self.metrics
            .round_trip_seconds
            .observe(estimate.round_trip_ms / 1000.0);
        self.stats.record_probe(estimate.offset_ms);

        self.relay.post(OutboundMessage::Ping {
            ping_ms: estimate.round_trip_ms.round() as i64,
        });

        if let Some(p) = &mut self.peers {
            if p.links.is_enabled() {
                p.tracker.broadcast_server_update(&estimate, &mut p.links);
            }
        }

        let queued = match &mut self.session {
            Some(session) if !session.ready => {
                session.ready = true;
                info!(
                    "Server clock ready: offset {:.1}ms, round trip {:.1}ms",
                    estimate.offset_ms, estimate.round_trip_ms
                );
                session.queued.take()
            }
            _ => None,
        };
        if let Some(cmd) = queued {
            if let Err(e) = self.process_command(cmd) {
                debug!("Queued command dropped: {}", e);
            }
        }
    }

    // -- peers -------------------------------------------------------------

    fn route_signal(&mut self, signal: &PeerSignal) -> Result<()> {
        // ---
        let Some(p) = &mut self.peers else {
            debug!("Peer links unavailable, ignoring signaling");
            return Ok(());
        };
        let events = p.links.route_signaling_message(signal)?;
        for event in events {
            self.handle_link_event(event);
        }
        Ok(())
    }

    /// Applies one transport event reported by a peer engine.
    pub fn on_engine_event(&mut self, peer_id: &str, event: EngineEvent) {
        // ---
        let Some(p) = &mut self.peers else {
            return;
        };
        if let Some(link_event) = p.links.handle_engine_event(peer_id, event) {
            self.handle_link_event(link_event);
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        // ---
        let now = self.now();
        let Some(p) = &mut self.peers else {
            return;
        };

        match event {
            LinkEvent::PeerConnected(id) => {
                info!("Peer {} connected", id);
                p.tracker.on_peer_connected(&id, &mut p.links, now);
                self.metrics
                    .peers_connected
                    .set(p.links.connected_count() as i64);
            }
            LinkEvent::PeerDisconnected(id) => {
                info!("Peer {} disconnected", id);
                p.tracker.on_peer_disconnected(&id);
                self.metrics
                    .peers_connected
                    .set(p.links.connected_count() as i64);
            }
            LinkEvent::Message { from, envelope } => match envelope.class {
                ChannelClass::Internal => {
                    let dropped = p.tracker.dropped_messages();
                    let event = p.tracker.handle_message(&from, envelope.data, &mut p.links, now);
                    if let Some(event) = event {
                        debug!("{:?}", event);
                    }
                    if p.tracker.dropped_messages() > dropped {
                        self.metrics.peer_messages_dropped_total.inc();
                    }
                }
                ChannelClass::External => self.external_messages.push((from, envelope.data)),
            },
        }
    }

    /// Sends an application message to peers.
    ///
    /// Returns how many peers it went to; zero when peer links are off.
    pub fn send_peer_message(&mut self, target: &Target, data: Value) -> Result<usize> {
        // ---
        match &mut self.peers {
            Some(p) if p.links.is_enabled() => p.links.send(target, data, ChannelClass::External),
            _ => Ok(0),
        }
    }

    /// Asks peers to send us their playback drift.
    pub fn set_peer_playback_updates(&mut self, enabled: bool) {
        // ---
        if let Some(p) = &mut self.peers {
            p.tracker.set_playback_updates(enabled, &mut p.links);
        }
    }

    // -- settings ----------------------------------------------------------

    /// Applies one live settings change.
    pub fn apply_setting(&mut self, change: &SettingChange) {
        // ---
        if !self.config.apply_change(change) {
            return;
        }
        debug!("Setting {} changed", change.key);

        match change.key.as_str() {
            DISPLAY_NAME => {
                let name = self.config.display_name.clone();
                if let Some(p) = &mut self.peers {
                    p.tracker.set_display_name(name, &mut p.links);
                }
            }
            ENABLE_PEER_LINKS if self.session.is_some() => {
                if self.config.enable_peer_links {
                    self.enable_peers();
                } else {
                    self.disable_peers();
                }
            }
            _ => {}
        }
    }
}

fn earliest(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    // ---
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_earliest() {
        // ---
        assert_eq!(earliest(None, None), None);
        assert_eq!(earliest(Some(5), None), Some(5));
        assert_eq!(earliest(None, Some(3)), Some(3));
        assert_eq!(earliest(Some(5), Some(3)), Some(3));
    }
}
