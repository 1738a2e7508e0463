//! Clock offsets and status for every connected peer.
//!
//! Each peer gets its own [`ClockSynchronizer`] driven by `ping-request` /
//! `ping-response` messages on the internal channel. Peers also share their
//! display names, their own view of the server clock, and (on request) their
//! playback drift.

use crate::diff_buffer::DiffBuffer;
use crate::link_manager::{PeerLinkManager, Target};
use groupsync_common::protocol::{
    DisplayName, InternalMessage, PingRequest, PingResponse, PlaybackDiff,
    PlaybackUpdatesRequest, ServerSyncUpdate,
};
use groupsync_common::{ClockSyncConfig, ClockSynchronizer, OffsetEstimate, RemoteTimestamps};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

/// What we know about one peer.
#[derive(Debug)]
pub struct PeerState {
    // ---
    pub clock: ClockSynchronizer,
    pub display_name: Option<String>,

    /// Drift samples the peer reported to us.
    pub diffs: DiffBuffer,

    /// The peer's own estimate of the server clock.
    pub server_sync: Option<ServerSyncUpdate>,

    /// Whether the peer asked us for playback diffs.
    pub wants_updates: bool,
}

impl PeerState {
    fn new(config: &ClockSyncConfig) -> Self {
        // ---
        Self {
            clock: ClockSynchronizer::new(config.clone()),
            display_name: None,
            diffs: DiffBuffer::default(),
            server_sync: None,
            wants_updates: false,
        }
    }
}

/// Summary of one peer, for status output.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerStats {
    // ---
    pub peer_id: String,
    pub display_name: Option<String>,

    /// Peer clock minus local clock.
    pub offset_ms: f64,
    pub round_trip_ms: f64,

    pub average_diff_ms: Option<f64>,
    pub server_offset_ms: Option<f64>,
}

/// Something worth telling the layer above about.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent {
    OffsetUpdated {
        peer: String,
        estimate: OffsetEstimate,
    },
    NameChanged {
        peer: String,
        name: String,
    },
    DiffReported {
        peer: String,
        diff_ms: f64,
    },
    ServerSync {
        peer: String,
        update: ServerSyncUpdate,
    },
}

/// Per-peer clock tracking on top of a [`PeerLinkManager`].
#[derive(Debug)]
pub struct PeerClockTracker {
    // ---
    display_name: String,
    config: ClockSyncConfig,
    peers: HashMap<String, PeerState>,

    /// Whether we want peers to send us their playback diffs.
    request_updates: bool,

    /// Internal messages dropped as malformed.
    dropped: u64,
}

impl PeerClockTracker {
    // ---
    pub fn new(display_name: impl Into<String>, config: ClockSyncConfig) -> Self {
        // ---
        Self {
            display_name: display_name.into(),
            config,
            peers: HashMap::new(),
            request_updates: false,
            dropped: 0,
        }
    }

    pub fn display_name(&self) -> &str {
        // ---
        &self.display_name
    }

    /// Changes our display name and tells every connected peer.
    pub fn set_display_name(&mut self, name: impl Into<String>, links: &mut PeerLinkManager) {
        // ---
        self.display_name = name.into();
        let message = InternalMessage::DisplayName(DisplayName {
            name: self.display_name.clone(),
        });
        if let Err(e) = links.send_internal(&Target::Broadcast, &message) {
            warn!("Failed to broadcast display name: {}", e);
        }
    }

    /// Starts tracking a freshly connected peer.
    ///
    /// Sends our display name, the playback-update request if active, and
    /// the first ping.
    pub fn on_peer_connected(&mut self, peer_id: &str, links: &mut PeerLinkManager, now: i64) {
        // ---
        self.peers
            .insert(peer_id.to_string(), PeerState::new(&self.config));

        let target = Target::Peer(peer_id.to_string());
        let mut greeting = vec![InternalMessage::DisplayName(DisplayName {
            name: self.display_name.clone(),
        })];
        if self.request_updates {
            greeting.push(InternalMessage::PlaybackUpdatesRequest(
                PlaybackUpdatesRequest { enabled: true },
            ));
        }
        for message in &greeting {
            if let Err(e) = links.send_internal(&target, message) {
                warn!("Failed to greet peer {}: {}", peer_id, e);
            }
        }

        self.send_ping(peer_id, links, now);
    }

    pub fn on_peer_disconnected(&mut self, peer_id: &str) {
        // ---
        if self.peers.remove(peer_id).is_some() {
            debug!("Stopped tracking peer {}", peer_id);
        }
    }

    /// Handles one `internal` envelope payload from `peer_id`.
    ///
    /// Malformed payloads are logged and dropped.
    pub fn handle_message(
        &mut self,
        peer_id: &str,
        data: Value,
        links: &mut PeerLinkManager,
        now: i64,
    ) -> Option<TrackerEvent> {
        // ---
        let message = match InternalMessage::from_value(data) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping internal message from peer {}: {}", peer_id, e);
                self.dropped += 1;
                return None;
            }
        };

        let config = &self.config;
        let state = self
            .peers
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerState::new(config));

        match message {
            InternalMessage::PingRequest(PingRequest { request_id }) => {
                let reply = InternalMessage::PingResponse(PingResponse {
                    request_id,
                    request_received: now,
                    response_sent: now,
                });
                if let Err(e) = links.send_internal(&Target::Peer(peer_id.to_string()), &reply) {
                    warn!("Failed to answer ping from peer {}: {}", peer_id, e);
                }
                None
            }
            InternalMessage::PingResponse(resp) => {
                let remote = RemoteTimestamps {
                    request_received: resp.request_received,
                    response_sent: resp.response_sent,
                };
                match state.clock.resolve_probe(resp.request_id, remote, now) {
                    Ok(outcome) => Some(TrackerEvent::OffsetUpdated {
                        peer: peer_id.to_string(),
                        estimate: outcome.estimate,
                    }),
                    Err(e) => {
                        debug!("Ignoring ping response from peer {}: {}", peer_id, e);
                        None
                    }
                }
            }
            InternalMessage::DisplayName(DisplayName { name }) => {
                state.display_name = Some(name.clone());
                Some(TrackerEvent::NameChanged {
                    peer: peer_id.to_string(),
                    name,
                })
            }
            InternalMessage::TimeSyncServerUpdate(update) => {
                state.server_sync = Some(update);
                Some(TrackerEvent::ServerSync {
                    peer: peer_id.to_string(),
                    update,
                })
            }
            InternalMessage::PlaybackDiff(PlaybackDiff { diff_ms }) => {
                state.diffs.push(diff_ms, now);
                Some(TrackerEvent::DiffReported {
                    peer: peer_id.to_string(),
                    diff_ms,
                })
            }
            InternalMessage::PlaybackUpdatesRequest(PlaybackUpdatesRequest { enabled }) => {
                state.wants_updates = enabled;
                None
            }
        }
    }

    /// Expires overdue pings and sends the ones that are due.
    pub fn poll(&mut self, links: &mut PeerLinkManager, now: i64) {
        // ---
        let mut due = Vec::new();
        for (peer_id, state) in &mut self.peers {
            for err in state.clock.expire_probes(now) {
                warn!("Peer {}: {}", peer_id, err);
            }
            if state.clock.is_probe_due(now) {
                due.push(peer_id.clone());
            }
        }

        for peer_id in due {
            self.send_ping(&peer_id, links, now);
        }
    }

    fn send_ping(&mut self, peer_id: &str, links: &mut PeerLinkManager, now: i64) {
        // ---
        let Some(state) = self.peers.get_mut(peer_id) else {
            return;
        };

        let ticket = state.clock.begin_probe(now);
        let message = InternalMessage::PingRequest(PingRequest {
            request_id: ticket.id,
        });
        if let Err(e) = links.send_internal(&Target::Peer(peer_id.to_string()), &message) {
            let err = state.clock.fail_probe(ticket.id, e.to_string());
            warn!("Peer {}: {}", peer_id, err);
        }
    }

    /// Earliest instant [`Self::poll`] has work to do.
    pub fn next_wakeup(&self, now: i64) -> Option<i64> {
        // ---
        self.peers
            .values()
            .map(|state| state.clock.next_wakeup(now))
            .min()
    }

    /// Turns playback-diff reporting from peers on or off.
    pub fn set_playback_updates(&mut self, enabled: bool, links: &mut PeerLinkManager) {
        // ---
        if self.request_updates == enabled {
            return;
        }
        self.request_updates = enabled;
        if !enabled {
            for state in self.peers.values_mut() {
                state.diffs.clear();
            }
        }

        let message =
            InternalMessage::PlaybackUpdatesRequest(PlaybackUpdatesRequest { enabled });
        if let Err(e) = links.send_internal(&Target::Broadcast, &message) {
            warn!("Failed to broadcast playback update request: {}", e);
        }
    }

    /// Shares our server clock estimate with every peer.
    pub fn broadcast_server_update(&self, estimate: &OffsetEstimate, links: &mut PeerLinkManager) {
        // ---
        let message = InternalMessage::TimeSyncServerUpdate(ServerSyncUpdate {
            offset_ms: estimate.offset_ms,
            ping_ms: estimate.round_trip_ms,
        });
        if let Err(e) = links.send_internal(&Target::Broadcast, &message) {
            warn!("Failed to broadcast server time update: {}", e);
        }
    }

    /// Sends our current drift to every peer that asked for it.
    pub fn report_playback_diff(&self, diff_ms: f64, links: &mut PeerLinkManager) -> usize {
        // ---
        let message = InternalMessage::PlaybackDiff(PlaybackDiff { diff_ms });
        let mut sent = 0;
        for (peer_id, state) in &self.peers {
            if !state.wants_updates {
                continue;
            }
            match links.send_internal(&Target::Peer(peer_id.clone()), &message) {
                Ok(n) => sent += n,
                Err(e) => debug!("Playback diff to peer {} not sent: {}", peer_id, e),
            }
        }
        sent
    }

    pub fn peer_state(&self, peer_id: &str) -> Option<&PeerState> {
        // ---
        self.peers.get(peer_id)
    }

    pub fn peer_stats(&self, peer_id: &str) -> Option<PeerStats> {
        // ---
        self.peers.get(peer_id).map(|state| {
            let estimate = state.clock.current_offset();
            PeerStats {
                peer_id: peer_id.to_string(),
                display_name: state.display_name.clone(),
                offset_ms: estimate.offset_ms,
                round_trip_ms: estimate.round_trip_ms,
                average_diff_ms: state.diffs.average(),
                server_offset_ms: state.server_sync.map(|s| s.offset_ms),
            }
        })
    }

    /// Stats for every tracked peer, ordered by id.
    pub fn all_stats(&self) -> Vec<PeerStats> {
        // ---
        let mut stats: Vec<PeerStats> = self
            .peers
            .keys()
            .filter_map(|id| self.peer_stats(id))
            .collect();
        stats.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        stats
    }

    /// Total malformed internal messages dropped so far.
    pub fn dropped_messages(&self) -> u64 {
        self.dropped
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::connection::SignalingRelay;
    use crate::memory::MemoryNetwork;
    use groupsync_common::protocol::SignalPayload;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct NullRelay;

    impl SignalingRelay for NullRelay {
        fn relay(&self, _to: Option<&str>, _payload: SignalPayload) {}
    }

    fn links() -> PeerLinkManager {
        // ---
        let (tx, _rx) = mpsc::unbounded_channel();
        PeerLinkManager::new("me", Arc::new(MemoryNetwork::new()), Arc::new(NullRelay), tx)
    }

    fn msg(message: InternalMessage) -> Value {
        message.to_value().unwrap()
    }

    #[test]
    fn test_malformed_internal_message_is_dropped() {
        // ---
        let mut tracker = PeerClockTracker::new("me", ClockSyncConfig::default());
        let mut links = links();
        let data = serde_json::json!({"type": "bogus", "data": 1});

        assert_eq!(tracker.handle_message("bob", data, &mut links, 0), None);
        assert!(tracker.is_empty());
        assert_eq!(tracker.dropped_messages(), 1);
    }

    #[test]
    fn test_display_name_and_diffs_are_recorded() {
        // ---
        let mut tracker = PeerClockTracker::new("me", ClockSyncConfig::default());
        let mut links = links();

        let ev = tracker.handle_message(
            "bob",
            msg(InternalMessage::DisplayName(DisplayName { name: "Bob".into() })),
            &mut links,
            0,
        );
        assert_eq!(
            ev,
            Some(TrackerEvent::NameChanged {
                peer: "bob".into(),
                name: "Bob".into()
            })
        );

        for (i, diff) in [10.0, 30.0].into_iter().enumerate() {
            tracker.handle_message(
                "bob",
                msg(InternalMessage::PlaybackDiff(PlaybackDiff { diff_ms: diff })),
                &mut links,
                i as i64,
            );
        }

        let stats = tracker.peer_stats("bob").unwrap();
        assert_eq!(stats.display_name.as_deref(), Some("Bob"));
        assert_eq!(stats.average_diff_ms, Some(20.0));
    }

    #[test]
    fn test_ping_response_updates_offset() {
        // ---
        let mut tracker = PeerClockTracker::new("me", ClockSyncConfig::default());
        let mut links = links();
        tracker.on_peer_connected("bob", &mut links, 1_000);

        // The ping could not be sent (no open channel) so it was failed right away
        assert_eq!(tracker.peer_state("bob").unwrap().clock.pending_probes(), 0);

        let ticket = tracker
            .peers
            .get_mut("bob")
            .unwrap()
            .clock
            .begin_probe(2_000);
        let ev = tracker.handle_message(
            "bob",
            msg(InternalMessage::PingResponse(PingResponse {
                request_id: ticket.id,
                request_received: 2_510,
                response_sent: 2_510,
            })),
            &mut links,
            2_020,
        );

        let Some(TrackerEvent::OffsetUpdated { estimate, .. }) = ev else {
            panic!("expected offset update, got {ev:?}");
        };
        assert_eq!(estimate.offset_ms, 500.0);
        assert_eq!(estimate.round_trip_ms, 20.0);

        // A replayed response is ignored
        let again = tracker.handle_message(
            "bob",
            msg(InternalMessage::PingResponse(PingResponse {
                request_id: ticket.id,
                request_received: 2_510,
                response_sent: 2_510,
            })),
            &mut links,
            2_030,
        );
        assert_eq!(again, None);
    }

    #[test]
    fn test_updates_request_flag_tracks_peer() {
        // ---
        let mut tracker = PeerClockTracker::new("me", ClockSyncConfig::default());
        let mut links = links();

        tracker.handle_message(
            "bob",
            msg(InternalMessage::PlaybackUpdatesRequest(PlaybackUpdatesRequest {
                enabled: true,
            })),
            &mut links,
            0,
        );
        assert!(tracker.peer_state("bob").unwrap().wants_updates);

        // Bob has no open channel so nothing is actually delivered
        assert_eq!(tracker.report_playback_diff(12.0, &mut links), 0);
    }

    #[test]
    fn test_disconnect_forgets_peer() {
        // ---
        let mut tracker = PeerClockTracker::new("me", ClockSyncConfig::default());
        let mut links = links();
        tracker.on_peer_connected("bob", &mut links, 0);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.next_wakeup(0).is_some());

        tracker.on_peer_disconnected("bob");
        assert!(tracker.is_empty());
        assert_eq!(tracker.next_wakeup(0), None);
    }
}
