//! In-process stand-ins for a media player and the relay server.
//!
//! [`SimPlayer`] keeps a virtual playhead driven by a [`Clock`], so drift can
//! be produced deliberately in tests. [`SimServer`] runs a single group the
//! way the relay would and answers time probes. Both back the integration
//! tests and the `coordinator` binary.

use crate::player::{LocalPlayer, PlayerEventKind, PlayerEventSink, SubscriptionId};
use crate::relay::RelaySink;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use groupsync_common::protocol::{
    CommandKind, GroupCommand, GroupUpdate, GroupUpdateKind, InboundMessage, OutboundMessage,
    PrepareSession,
};
use groupsync_common::time::ms_to_ticks;
use groupsync_common::{Clock, RemoteTimestamps, Ticks, TimeSource};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Player
// ---------------------------------------------------------------------------

/// Something the coordinator asked the player to do.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerAction {
    Pause,
    Unpause,
    Seek(Ticks),
    SetRate(f64),
}

struct PlayerState {
    // ---
    clock: Arc<dyn Clock>,
    session_id: Option<String>,

    paused: bool,
    anchor_position: Ticks,
    anchor_ms: i64,
    rate: f64,

    /// Playback speed error of this device, 1.0 for a perfect clock.
    natural_speed: f64,

    supports_rate: bool,

    /// Whether pause/unpause produce confirmation events.
    confirms: bool,

    next_subscription: u64,
    subscribers: Vec<(SubscriptionId, PlayerEventKind, PlayerEventSink)>,

    /// Every action with the local time it happened.
    actions: Vec<(i64, PlayerAction)>,
}

impl PlayerState {
    // ---
    fn position_at(&self, now: i64) -> Ticks {
        // ---
        if self.paused {
            return self.anchor_position;
        }
        let elapsed = (now - self.anchor_ms) as f64 * self.rate * self.natural_speed;
        self.anchor_position + ms_to_ticks(elapsed)
    }

    fn reanchor(&mut self, now: i64) {
        // ---
        self.anchor_position = self.position_at(now);
        self.anchor_ms = now;
    }

    fn emit(&self, kind: PlayerEventKind) {
        // ---
        for (_, subscribed, sink) in &self.subscribers {
            if *subscribed == kind {
                sink.emit(kind);
            }
        }
    }

    fn record(&mut self, now: i64, action: PlayerAction) {
        // ---
        self.actions.push((now, action));
    }
}

/// A player with a virtual playhead.
///
/// Clones share state, so a test can keep a handle after boxing one into
/// the coordinator. Starts paused at position zero.
#[derive(Clone)]
pub struct SimPlayer {
    // ---
    state: Arc<Mutex<PlayerState>>,
}

impl SimPlayer {
    // ---
    pub fn new(clock: Arc<dyn Clock>, session_id: Option<String>) -> Self {
        // ---
        let now = clock.now_ms();
        Self {
            state: Arc::new(Mutex::new(PlayerState {
                clock,
                session_id,
                paused: true,
                anchor_position: 0,
                anchor_ms: now,
                rate: 1.0,
                natural_speed: 1.0,
                supports_rate: true,
                confirms: true,
                next_subscription: 0,
                subscribers: Vec::new(),
                actions: Vec::new(),
            })),
        }
    }

    pub fn set_supports_rate(&self, supported: bool) {
        // ---
        self.state.lock().supports_rate = supported;
    }

    /// Makes the playhead run fast or slow relative to the clock.
    pub fn set_natural_speed(&self, speed: f64) {
        // ---
        let mut state = self.state.lock();
        let now = state.clock.now_ms();
        state.reanchor(now);
        state.natural_speed = speed;
    }

    /// Turns pause/unpause confirmation events on or off.
    pub fn set_confirm_events(&self, confirms: bool) {
        // ---
        self.state.lock().confirms = confirms;
    }

    /// Moves the playhead without recording an action.
    pub fn set_position(&self, position: Ticks) {
        // ---
        let mut state = self.state.lock();
        let now = state.clock.now_ms();
        state.anchor_position = position;
        state.anchor_ms = now;
    }

    pub fn position(&self) -> Ticks {
        // ---
        let state = self.state.lock();
        state.position_at(state.clock.now_ms())
    }

    pub fn is_paused(&self) -> bool {
        // ---
        self.state.lock().paused
    }

    pub fn actions(&self) -> Vec<PlayerAction> {
        // ---
        self.state
            .lock()
            .actions
            .iter()
            .map(|(_, action)| action.clone())
            .collect()
    }

    /// Actions with the local time each happened.
    pub fn timed_actions(&self) -> Vec<(i64, PlayerAction)> {
        // ---
        self.state.lock().actions.clone()
    }

    pub fn clear_actions(&self) {
        // ---
        self.state.lock().actions.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        // ---
        self.state.lock().subscribers.len()
    }

    /// Emits `kind` to every matching subscriber.
    pub fn emit(&self, kind: PlayerEventKind) {
        // ---
        self.state.lock().emit(kind);
    }

    /// Emits a `TimeUpdate`, as a real player does several times a second.
    pub fn tick(&self) {
        // ---
        self.emit(PlayerEventKind::TimeUpdate);
    }
}

impl LocalPlayer for SimPlayer {
    fn session_id(&self) -> Option<String> {
        // ---
        self.state.lock().session_id.clone()
    }

    fn unpause(&mut self) {
        // ---
        let mut state = self.state.lock();
        let now = state.clock.now_ms();
        state.record(now, PlayerAction::Unpause);
        if !state.paused {
            return;
        }
        state.reanchor(now);
        state.paused = false;
        if state.confirms {
            state.emit(PlayerEventKind::Unpause);
            state.emit(PlayerEventKind::Playing);
        }
    }

    fn pause(&mut self) {
        // ---
        let mut state = self.state.lock();
        let now = state.clock.now_ms();
        state.record(now, PlayerAction::Pause);
        if state.paused {
            return;
        }
        state.reanchor(now);
        state.paused = true;
        if state.confirms {
            state.emit(PlayerEventKind::Pause);
        }
    }

    fn seek(&mut self, position: Ticks) {
        // ---
        let mut state = self.state.lock();
        let now = state.clock.now_ms();
        state.record(now, PlayerAction::Seek(position));
        state.anchor_position = position;
        state.anchor_ms = now;
    }

    fn current_position(&self) -> Ticks {
        // ---
        self.position()
    }

    fn supports_playback_rate(&self) -> bool {
        // ---
        self.state.lock().supports_rate
    }

    fn playback_rate(&self) -> f64 {
        // ---
        self.state.lock().rate
    }

    fn set_playback_rate(&mut self, rate: f64) {
        // ---
        let mut state = self.state.lock();
        let now = state.clock.now_ms();
        state.record(now, PlayerAction::SetRate(rate));
        state.reanchor(now);
        state.rate = rate;
    }

    fn subscribe(&mut self, kind: PlayerEventKind, sink: PlayerEventSink) -> SubscriptionId {
        // ---
        let mut state = self.state.lock();
        state.next_subscription += 1;
        let id = SubscriptionId(state.next_subscription);
        state.subscribers.push((id, kind, sink));
        id
    }

    fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        // ---
        let mut state = self.state.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|(sub, _, _)| *sub != id);
        state.subscribers.len() != before
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Lead time the server gives clients before a Play takes effect (ms).
pub const PLAY_LEAD_MS: i64 = 500;

#[derive(Default)]
struct GroupState {
    // ---
    clients: BTreeMap<String, mpsc::UnboundedSender<String>>,
    group_id: Option<String>,
    playing: bool,

    /// Group position at server time `position_at`.
    position: Ticks,
    position_at: i64,

    /// Latest round trip each client reported.
    pings: BTreeMap<String, i64>,
}

impl GroupState {
    // ---
    fn position_at(&self, now: i64) -> Ticks {
        // ---
        if self.playing {
            self.position + ms_to_ticks((now - self.position_at).max(0) as f64)
        } else {
            self.position
        }
    }
}

struct ServerInner {
    // ---
    clock: Arc<dyn Clock>,

    /// One-way network delay for time probes (ms), plus up to `jitter_ms`.
    latency_ms: u64,
    jitter_ms: u64,

    group: Mutex<GroupState>,
}

/// A one-group relay server.
#[derive(Clone)]
pub struct SimServer {
    // ---
    inner: Arc<ServerInner>,
}

impl SimServer {
    // ---
    pub fn new(clock: Arc<dyn Clock>, latency_ms: u64, jitter_ms: u64) -> Self {
        // ---
        Self {
            inner: Arc::new(ServerInner {
                clock,
                latency_ms,
                jitter_ms,
                group: Mutex::new(GroupState::default()),
            }),
        }
    }

    /// Registers a client. Returns the relay text stream for it and the
    /// sink its coordinator posts to.
    pub fn connect(
        &self,
        client_id: &str,
    ) -> (mpsc::UnboundedReceiver<String>, Arc<dyn RelaySink>) {
        // ---
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .group
            .lock()
            .clients
            .insert(client_id.to_string(), tx);

        let sink = Arc::new(SimClientSink {
            server: self.clone(),
            client_id: client_id.to_string(),
        });
        (rx, sink)
    }

    /// Drops a client's connection, closing its relay stream.
    pub fn disconnect(&self, client_id: &str) {
        // ---
        let mut group = self.inner.group.lock();
        group.clients.remove(client_id);
        group.pings.remove(client_id);
    }

    /// Asks every connected client to join `group_id` for `item_id`.
    pub fn prepare_session(&self, group_id: &str, item_id: &str) {
        // ---
        let data = PrepareSession {
            group_id: group_id.to_string(),
            playing_item_id: item_id.to_string(),
        };
        let update = GroupUpdate::new(
            GroupUpdateKind::PrepareSession,
            Some(group_id.to_string()),
            serde_json::to_value(data).ok(),
        );
        let group = self.inner.group.lock();
        for tx in group.clients.values() {
            send(tx, &InboundMessage::SyncPlayGroupUpdate(update.clone()));
        }
    }

    /// Group playhead at the current server time.
    pub fn group_position(&self) -> Ticks {
        // ---
        let now = self.inner.clock.now_ms();
        self.inner.group.lock().position_at(now)
    }

    pub fn is_playing(&self) -> bool {
        // ---
        self.inner.group.lock().playing
    }

    pub fn member_count(&self) -> usize {
        // ---
        self.inner.group.lock().clients.len()
    }

    /// Latest round trip reported by `client_id`.
    pub fn reported_ping(&self, client_id: &str) -> Option<i64> {
        // ---
        self.inner.group.lock().pings.get(client_id).copied()
    }

    /// Handles one message from `from`, as the relay would.
    pub fn handle(&self, from: &str, message: OutboundMessage) {
        // ---
        let now = self.inner.clock.now_ms();
        let mut group = self.inner.group.lock();

        match message {
            OutboundMessage::JoinGroup { group_id, .. } => {
                group.group_id = Some(group_id.clone());
                let joined = GroupUpdate::new(
                    GroupUpdateKind::GroupJoined,
                    Some(group_id.clone()),
                    Some(rfc3339(now).into()),
                );
                if let Some(tx) = group.clients.get(from) {
                    send(tx, &InboundMessage::SyncPlayGroupUpdate(joined));
                    if group.playing {
                        let when = now + PLAY_LEAD_MS;
                        let cmd = command(CommandKind::Play, when, group.position_at(when), now);
                        send(tx, &InboundMessage::SyncPlayCommand(cmd));
                    }
                }
                let user_joined = GroupUpdate::new(
                    GroupUpdateKind::UserJoined,
                    Some(group_id),
                    Some(from.into()),
                );
                broadcast_except(&group, from, &InboundMessage::SyncPlayGroupUpdate(user_joined));
            }
            OutboundMessage::LeaveGroup => {
                let group_id = group.group_id.clone();
                if let Some(tx) = group.clients.get(from) {
                    let left = GroupUpdate::new(GroupUpdateKind::GroupLeft, group_id.clone(), None);
                    send(tx, &InboundMessage::SyncPlayGroupUpdate(left));
                }
                let user_left =
                    GroupUpdate::new(GroupUpdateKind::UserLeft, group_id, Some(from.into()));
                broadcast_except(&group, from, &InboundMessage::SyncPlayGroupUpdate(user_left));
            }
            OutboundMessage::RequestPlay => {
                let when = now + PLAY_LEAD_MS;
                let position = group.position_at(now);
                group.position = position;
                group.position_at = when;
                group.playing = true;
                let cmd = command(CommandKind::Play, when, position, now);
                broadcast_except(&group, "", &InboundMessage::SyncPlayCommand(cmd));
            }
            OutboundMessage::RequestPause => {
                let position = group.position_at(now);
                group.position = position;
                group.position_at = now;
                group.playing = false;
                let cmd = command(CommandKind::Pause, now, position, now);
                broadcast_except(&group, "", &InboundMessage::SyncPlayCommand(cmd));
            }
            OutboundMessage::RequestSeek { position_ticks } => {
                group.position = position_ticks;
                group.position_at = now;
                group.playing = false;
                let cmd = command(CommandKind::Seek, now, position_ticks, now);
                broadcast_except(&group, "", &InboundMessage::SyncPlayCommand(cmd));
            }
            OutboundMessage::Ping { ping_ms } => {
                group.pings.insert(from.to_string(), ping_ms);
            }
            OutboundMessage::Signal(signal) => {
                let group_id = group.group_id.clone();
                let data = match serde_json::to_value(&signal) {
                    Ok(data) => data,
                    Err(e) => {
                        warn!("Cannot forward signal from {}: {}", from, e);
                        return;
                    }
                };
                let update = GroupUpdate::new(GroupUpdateKind::WebRtc, group_id, Some(data));
                let message = InboundMessage::SyncPlayGroupUpdate(update);
                match signal.to.as_deref().and_then(|to| group.clients.get(to)) {
                    Some(tx) => send(tx, &message),
                    None => broadcast_except(&group, from, &message),
                }
            }
        }
    }
}

#[async_trait]
impl TimeSource for SimServer {
    async fn query_time(&self) -> anyhow::Result<RemoteTimestamps> {
        // ---
        let (there, back) = {
            let mut rng = rand::thread_rng();
            let jitter = self.inner.jitter_ms;
            (
                self.inner.latency_ms + rng.gen_range(0..=jitter),
                self.inner.latency_ms + rng.gen_range(0..=jitter),
            )
        };

        tokio::time::sleep(Duration::from_millis(there)).await;
        let now = self.inner.clock.now_ms();
        tokio::time::sleep(Duration::from_millis(back)).await;

        Ok(RemoteTimestamps {
            request_received: now,
            response_sent: now,
        })
    }
}

/// A client's outbound side, delivering straight into the server.
struct SimClientSink {
    // ---
    server: SimServer,
    client_id: String,
}

impl RelaySink for SimClientSink {
    fn post(&self, message: OutboundMessage) {
        // ---
        debug!("{} -> server: {:?}", self.client_id, message);
        self.server.handle(&self.client_id, message);
    }
}

fn command(kind: CommandKind, when: i64, position: Ticks, emitted: i64) -> GroupCommand {
    // ---
    GroupCommand {
        kind,
        when: to_utc(when),
        position_ticks: position,
        emitted_at: to_utc(emitted),
    }
}

fn to_utc(ms: i64) -> DateTime<Utc> {
    // ---
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn rfc3339(ms: i64) -> String {
    // ---
    to_utc(ms).to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn send(tx: &mpsc::UnboundedSender<String>, message: &InboundMessage) {
    // ---
    match serde_json::to_string(message) {
        Ok(text) => {
            if tx.send(text).is_err() {
                debug!("Client gone, dropping relay message");
            }
        }
        Err(e) => warn!("Cannot encode relay message: {}", e),
    }
}

fn broadcast_except(group: &GroupState, skip: &str, message: &InboundMessage) {
    // ---
    for (id, tx) in &group.clients {
        if id != skip {
            send(tx, message);
        }
    }
}
