//! Owns every peer connection of the local participant.
//!
//! Signaling arrives through the relay and is routed here by sender id.
//! Engine events arrive on the shared [`EngineEventSender`] and are turned
//! into [`LinkEvent`]s, each emitted at most once per transition.

use crate::connection::{
    transport_error, ConnectionEvent, ConnectionState, EngineEvent, EngineEventSender,
    EngineFactory, PeerConnection, PeerId, SignalingRelay,
};
use groupsync_common::protocol::{
    ChannelClass, InternalMessage, PeerEnvelope, PeerSignal, SignalPayload,
};
use groupsync_common::{Result, SyncError};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where an outgoing peer message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Peer(PeerId),
    Broadcast,
}

/// Peer-level notifications for the layer above.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    Message {
        from: PeerId,
        envelope: PeerEnvelope,
    },
}

/// Peer connection registry.
pub struct PeerLinkManager {
    // ---
    local_id: PeerId,
    factory: Arc<dyn EngineFactory>,
    relay: Arc<dyn SignalingRelay>,
    engine_events: EngineEventSender,
    connections: HashMap<PeerId, PeerConnection>,

    /// Peers whose channel is open. Ordered so broadcasts are deterministic.
    connected: BTreeSet<PeerId>,

    enabled: bool,
}

impl PeerLinkManager {
    // ---
    /// Creates a disabled manager.
    ///
    /// # Arguments
    ///
    /// * `local_id` - Our participant id, used to drop echoed signaling
    /// * `factory` - Creates a transport engine per connection
    /// * `relay` - Outbound signaling
    /// * `engine_events` - Sender handed to every engine; the caller drains
    ///   the matching receiver and feeds [`Self::handle_engine_event`]
    pub fn new(
        local_id: impl Into<PeerId>,
        factory: Arc<dyn EngineFactory>,
        relay: Arc<dyn SignalingRelay>,
        engine_events: EngineEventSender,
    ) -> Self {
        // ---
        Self {
            local_id: local_id.into(),
            factory,
            relay,
            engine_events,
            connections: HashMap::new(),
            connected: BTreeSet::new(),
            enabled: false,
        }
    }

    pub fn local_id(&self) -> &str {
        // ---
        &self.local_id
    }

    pub fn is_enabled(&self) -> bool {
        // ---
        self.enabled
    }

    /// Announces ourselves so existing participants start connecting.
    pub fn enable(&mut self) {
        // ---
        if self.enabled {
            return;
        }
        self.enabled = true;
        info!("Peer links enabled for {}", self.local_id);
        self.relay.relay(None, SignalPayload::NewSession);
    }

    /// Creates (or replaces) the connection to `peer_id` and starts it.
    ///
    /// Replacing an open connection reports its disconnect first.
    pub fn add_peer(&mut self, peer_id: &str, is_initiator: bool) -> Result<Vec<LinkEvent>> {
        // ---
        let events: Vec<LinkEvent> = self.remove_peer(peer_id).into_iter().collect();

        let engine = self
            .factory
            .create(&self.local_id, peer_id, self.engine_events.clone())
            .map_err(transport_error)?;
        let mut conn = PeerConnection::new(peer_id, is_initiator, engine, Arc::clone(&self.relay));
        if let Err(e) = conn.open() {
            conn.close();
            return Err(e);
        }

        debug!(
            "Added peer {} ({})",
            peer_id,
            if is_initiator { "initiator" } else { "acceptor" }
        );
        self.connections.insert(peer_id.to_string(), conn);
        Ok(events)
    }

    /// Routes one signaling envelope received from the relay.
    ///
    /// # Errors
    ///
    /// * `MalformedMessage` if the envelope carries no payload
    /// * `Transport` if the engine rejects a description or candidate
    pub fn route_signaling_message(&mut self, signal: &PeerSignal) -> Result<Vec<LinkEvent>> {
        // ---
        if !self.enabled {
            debug!("Peer links disabled, ignoring signaling");
            return Ok(Vec::new());
        }

        let Some(from) = signal.from.as_deref() else {
            return Err(SyncError::MalformedMessage(
                "signaling envelope without sender".into(),
            ));
        };
        if from == self.local_id {
            return Ok(Vec::new());
        }
        if let Some(to) = signal.to.as_deref() {
            if to != self.local_id {
                debug!("Signaling from {} addressed to {}, not us", from, to);
                return Ok(Vec::new());
            }
        }

        match signal.payload()? {
            SignalPayload::NewSession => {
                info!("Peer {} joined, connecting", from);
                self.add_peer(from, true)
            }
            SignalPayload::SessionLeaving => {
                info!("Peer {} left", from);
                Ok(self.remove_peer(from).into_iter().collect())
            }
            payload => {
                let mut events = Vec::new();
                if !self.connections.contains_key(from) {
                    events = self.add_peer(from, false)?;
                }
                if let Some(conn) = self.connections.get_mut(from) {
                    conn.handle_signal(payload)?;
                }
                Ok(events)
            }
        }
    }

    /// Applies one engine event reported for `peer_id`.
    pub fn handle_engine_event(&mut self, peer_id: &str, event: EngineEvent) -> Option<LinkEvent> {
        // ---
        let Some(conn) = self.connections.get_mut(peer_id) else {
            debug!("Engine event for unknown peer {}: {:?}", peer_id, event);
            return None;
        };

        match conn.handle_engine_event(event)? {
            ConnectionEvent::Open => self
                .connected
                .insert(peer_id.to_string())
                .then(|| LinkEvent::PeerConnected(peer_id.to_string())),
            ConnectionEvent::Close => {
                self.connections.remove(peer_id);
                self.connected
                    .remove(peer_id)
                    .then(|| LinkEvent::PeerDisconnected(peer_id.to_string()))
            }
            ConnectionEvent::Message(text) => match PeerEnvelope::parse(&text) {
                Ok(envelope) => Some(LinkEvent::Message {
                    from: peer_id.to_string(),
                    envelope,
                }),
                Err(e) => {
                    warn!("Dropping malformed message from peer {}: {}", peer_id, e);
                    None
                }
            },
        }
    }

    /// Sends `data` wrapped in a `class` envelope.
    ///
    /// Returns how many peers the message went to. A broadcast skips peers
    /// whose send fails; a targeted send reports the failure.
    pub fn send(&mut self, target: &Target, data: Value, class: ChannelClass) -> Result<usize> {
        // ---
        let text = serde_json::to_string(&PeerEnvelope { class, data })?;

        match target {
            Target::Peer(peer_id) => {
                let conn = self
                    .connections
                    .get_mut(peer_id)
                    .ok_or_else(|| SyncError::ChannelNotReady {
                        peer: peer_id.clone(),
                    })?;
                conn.send(&text)?;
                Ok(1)
            }
            Target::Broadcast => {
                let mut sent = 0;
                for peer_id in &self.connected {
                    let Some(conn) = self.connections.get_mut(peer_id) else {
                        continue;
                    };
                    match conn.send(&text) {
                        Ok(()) => sent += 1,
                        Err(e) => warn!("Broadcast to peer {} failed: {}", peer_id, e),
                    }
                }
                Ok(sent)
            }
        }
    }

    /// Sends one internal sync-core message.
    pub fn send_internal(&mut self, target: &Target, message: &InternalMessage) -> Result<usize> {
        // ---
        self.send(target, message.to_value()?, ChannelClass::Internal)
    }

    /// Closes the connection to `peer_id`, reporting a disconnect if it was open.
    pub fn remove_peer(&mut self, peer_id: &str) -> Option<LinkEvent> {
        // ---
        let mut conn = self.connections.remove(peer_id)?;
        conn.close();
        self.connected
            .remove(peer_id)
            .then(|| LinkEvent::PeerDisconnected(peer_id.to_string()))
    }

    /// Tears down every connection and announces that we are leaving.
    pub fn disable_all(&mut self) -> Vec<LinkEvent> {
        // ---
        if self.enabled {
            self.relay.relay(None, SignalPayload::SessionLeaving);
        }
        self.enabled = false;

        for (_, mut conn) in self.connections.drain() {
            conn.close();
        }
        let events: Vec<LinkEvent> = std::mem::take(&mut self.connected)
            .into_iter()
            .map(LinkEvent::PeerDisconnected)
            .collect();

        if !events.is_empty() {
            info!("Closed {} peer connection(s)", events.len());
        }
        events
    }

    pub fn connected_peers(&self) -> impl Iterator<Item = &PeerId> {
        // ---
        self.connected.iter()
    }

    pub fn connected_count(&self) -> usize {
        // ---
        self.connected.len()
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        // ---
        self.connected.contains(peer_id)
    }

    pub fn connection_state(&self, peer_id: &str) -> Option<ConnectionState> {
        // ---
        self.connections.get(peer_id).map(PeerConnection::state)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::memory::MemoryNetwork;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingRelay(Mutex<Vec<(Option<String>, SignalPayload)>>);

    impl SignalingRelay for RecordingRelay {
        fn relay(&self, to: Option<&str>, payload: SignalPayload) {
            self.0.lock().push((to.map(str::to_string), payload));
        }
    }

    fn manager() -> (PeerLinkManager, Arc<RecordingRelay>) {
        // ---
        let (tx, _rx) = mpsc::unbounded_channel();
        let relay = Arc::new(RecordingRelay::default());
        let mgr = PeerLinkManager::new("me", Arc::new(MemoryNetwork::new()), relay.clone(), tx);
        (mgr, relay)
    }

    fn signal(from: &str, payload: SignalPayload) -> PeerSignal {
        PeerSignal::new(Some(from.into()), None, payload)
    }

    #[test]
    fn test_disabled_manager_ignores_signaling() {
        // ---
        let (mut mgr, relay) = manager();
        let events = mgr
            .route_signaling_message(&signal("bob", SignalPayload::NewSession))
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(mgr.connection_state("bob"), None);
        assert!(relay.0.lock().is_empty());
    }

    #[test]
    fn test_new_session_makes_us_initiator() {
        // ---
        let (mut mgr, relay) = manager();
        mgr.enable();
        mgr.route_signaling_message(&signal("bob", SignalPayload::NewSession))
            .unwrap();

        assert_eq!(mgr.connection_state("bob"), Some(ConnectionState::Connecting));
        let sent = relay.0.lock().clone();
        assert_eq!(sent[0], (None, SignalPayload::NewSession));
        assert!(matches!(&sent[1], (Some(to), SignalPayload::Offer(_)) if to == "bob"));
    }

    #[test]
    fn test_offer_from_unknown_peer_creates_acceptor() {
        // ---
        let (mut mgr, relay) = manager();
        mgr.enable();
        mgr.route_signaling_message(&signal("carol", SignalPayload::Offer("offer:carol->me".into())))
            .unwrap();

        assert_eq!(mgr.connection_state("carol"), Some(ConnectionState::Connecting));
        assert!(relay
            .0
            .lock()
            .iter()
            .any(|(to, p)| to.as_deref() == Some("carol") && matches!(p, SignalPayload::Answer(_))));
    }

    #[test]
    fn test_signals_for_others_are_ignored() {
        // ---
        let (mut mgr, _relay) = manager();
        mgr.enable();

        let mut echo = signal("me", SignalPayload::NewSession);
        mgr.route_signaling_message(&echo).unwrap();
        echo.from = Some("bob".into());
        echo.to = Some("dave".into());
        mgr.route_signaling_message(&echo).unwrap();

        assert_eq!(mgr.connection_state("me"), None);
        assert_eq!(mgr.connection_state("bob"), None);
    }

    #[test]
    fn test_open_and_close_are_reported_once() {
        // ---
        let (mut mgr, _relay) = manager();
        mgr.enable();
        mgr.add_peer("bob", true).unwrap();

        assert_eq!(
            mgr.handle_engine_event("bob", EngineEvent::ChannelOpen),
            Some(LinkEvent::PeerConnected("bob".into()))
        );
        assert_eq!(mgr.handle_engine_event("bob", EngineEvent::ChannelOpen), None);
        assert!(mgr.is_connected("bob"));

        assert_eq!(
            mgr.handle_engine_event("bob", EngineEvent::ChannelClosed),
            Some(LinkEvent::PeerDisconnected("bob".into()))
        );
        assert_eq!(mgr.handle_engine_event("bob", EngineEvent::ChannelClosed), None);
        assert_eq!(mgr.connected_count(), 0);
    }

    #[test]
    fn test_malformed_message_is_dropped() {
        // ---
        let (mut mgr, _relay) = manager();
        mgr.enable();
        mgr.add_peer("bob", true).unwrap();
        mgr.handle_engine_event("bob", EngineEvent::ChannelOpen);

        assert_eq!(
            mgr.handle_engine_event("bob", EngineEvent::Message("{not json".into())),
            None
        );
        let ok = mgr.handle_engine_event(
            "bob",
            EngineEvent::Message(r#"{"type":"external","data":{"x":1}}"#.into()),
        );
        assert!(matches!(
            ok,
            Some(LinkEvent::Message { ref from, ref envelope })
                if from == "bob" && envelope.class == ChannelClass::External
        ));
    }

    #[test]
    fn test_targeted_send_to_unknown_peer_fails() {
        // ---
        let (mut mgr, _relay) = manager();
        let err = mgr
            .send(&Target::Peer("ghost".into()), Value::Null, ChannelClass::External)
            .unwrap_err();
        assert_eq!(err, SyncError::ChannelNotReady { peer: "ghost".into() });
        assert_eq!(
            mgr.send(&Target::Broadcast, Value::Null, ChannelClass::External),
            Ok(0)
        );
    }

    #[test]
    fn test_disable_all_closes_everything() {
        // ---
        let (mut mgr, relay) = manager();
        mgr.enable();
        mgr.add_peer("bob", true).unwrap();
        mgr.add_peer("carol", true).unwrap();
        mgr.handle_engine_event("bob", EngineEvent::ChannelOpen);

        let events = mgr.disable_all();
        assert_eq!(events, vec![LinkEvent::PeerDisconnected("bob".into())]);
        assert_eq!(mgr.connection_state("carol"), None);
        assert!(!mgr.is_enabled());
        assert_eq!(
            relay.0.lock().last().cloned(),
            Some((None, SignalPayload::SessionLeaving))
        );

        // Second call is a no-op
        assert!(mgr.disable_all().is_empty());
    }
}
