//! Shared fixture for coordinator integration tests.
//!
//! Everything runs on a [`ManualClock`]; nothing sleeps.

#![allow(dead_code)]

use chrono::DateTime;
use coordinator::sim::SimPlayer;
use coordinator::{CoordinatorDeps, PeerDeps, PlayerEventReceiver, SyncConfig, SyncCoordinator};
use groupsync_common::protocol::{CommandKind, GroupCommand, OutboundMessage};
use groupsync_common::{Clock, ManualClock, MetricsContext, RemoteTimestamps, Ticks};
use peer::{EngineEventReceiver, MemoryNetwork};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Local clock at the start of every test.
pub const START_MS: i64 = 1_700_000_000_000;

pub const TICKS_PER_MS: i64 = 10_000;

pub struct Harness {
    // ---
    pub clock: ManualClock,
    pub coordinator: SyncCoordinator,
    pub player: SimPlayer,
    pub player_rx: PlayerEventReceiver,
    pub relay_rx: mpsc::UnboundedReceiver<OutboundMessage>,
    pub engine_rx: Option<EngineEventReceiver>,

    /// Server clock minus local clock.
    pub offset_ms: i64,
}

impl Harness {
    // ---
    pub fn new(config: SyncConfig) -> Self {
        // ---
        Self::build(config, Some("session-1"), None)
    }

    pub fn build(
        config: SyncConfig,
        session_id: Option<&str>,
        peers: Option<(&str, MemoryNetwork)>,
    ) -> Self {
        // ---
        let clock = ManualClock::new(START_MS);
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let (player_tx, player_rx) = mpsc::unbounded_channel();

        let (peer_deps, engine_rx) = match peers {
            Some((local_id, network)) => {
                let (engine_tx, engine_rx) = mpsc::unbounded_channel();
                let deps = PeerDeps {
                    local_id: local_id.to_string(),
                    factory: Arc::new(network),
                    engine_events: engine_tx,
                };
                (Some(deps), Some(engine_rx))
            }
            None => (None, None),
        };

        let mut coordinator = SyncCoordinator::new(CoordinatorDeps {
            clock: Arc::new(clock.clone()),
            relay: Arc::new(relay_tx),
            player_events: player_tx,
            metrics: MetricsContext::new("test").unwrap(),
            config,
            peers: peer_deps,
        });

        let player = SimPlayer::new(Arc::new(clock.clone()), session_id.map(str::to_string));
        coordinator.bind_player(Box::new(player.clone()));

        Self {
            clock,
            coordinator,
            player,
            player_rx,
            relay_rx,
            engine_rx,
            offset_ms: 0,
        }
    }

    pub fn now(&self) -> i64 {
        // ---
        self.clock.now_ms()
    }

    pub fn server_now(&self) -> i64 {
        // ---
        self.now() + self.offset_ms
    }

    /// Enables sync as of the current server time.
    pub fn enable(&mut self) {
        // ---
        let at = self.server_now();
        self.coordinator.enable(at, Some("g".to_string()));
    }

    /// Answers the due probe instantly with the server's current time.
    pub fn resolve_probe(&mut self) {
        // ---
        let ticket = self.coordinator.begin_probe().expect("probe due");
        let server = self.server_now();
        self.coordinator.on_probe_result(
            ticket.id,
            Ok(RemoteTimestamps {
                request_received: server,
                response_sent: server,
            }),
        );
    }

    /// Enabled with a clock estimate, ready for commands.
    pub fn ready(&mut self) {
        // ---
        self.enable();
        self.resolve_probe();
    }

    /// A command emitted now, taking effect `in_ms` from now (server time).
    pub fn command(&self, kind: CommandKind, in_ms: i64, position: Ticks) -> GroupCommand {
        // ---
        let server = self.server_now();
        GroupCommand {
            kind,
            when: DateTime::from_timestamp_millis(server + in_ms).unwrap(),
            position_ticks: position,
            emitted_at: DateTime::from_timestamp_millis(server).unwrap(),
        }
    }

    /// Delivers every queued player event.
    pub fn pump(&mut self) {
        // ---
        while let Ok(event) = self.player_rx.try_recv() {
            self.coordinator.on_player_event(event);
        }
    }

    /// Moves the clock, fires due timers and delivers resulting events.
    pub fn advance(&mut self, ms: i64) {
        // ---
        self.clock.advance(ms);
        self.coordinator.poll();
        self.pump();
    }

    /// A `TimeUpdate` from the player, delivered.
    pub fn tick(&mut self) {
        // ---
        self.player.tick();
        self.pump();
    }

    pub fn drain_relay(&mut self) -> Vec<OutboundMessage> {
        // ---
        std::iter::from_fn(|| self.relay_rx.try_recv().ok()).collect()
    }

    /// Delivers every queued peer engine event.
    pub fn pump_engine(&mut self) -> usize {
        // ---
        let Some(rx) = self.engine_rx.as_mut() else {
            return 0;
        };
        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        let count = events.len();
        for (peer_id, event) in events {
            self.coordinator.on_engine_event(&peer_id, event);
        }
        count
    }
}

/// Ready harness playing from `position`, with actions cleared.
pub fn playing(config: SyncConfig, position: Ticks) -> Harness {
    // ---
    let mut h = Harness::new(config);
    h.ready();
    let cmd = h.command(CommandKind::Play, 0, position);
    h.coordinator.process_command(cmd).unwrap();
    h.pump();
    h.player.clear_actions();
    h
}
