//! In-process transport for peer connections.
//!
//! Every engine created from the same [`MemoryNetwork`] can reach every
//! other. A channel opens once both ends have applied local and remote
//! descriptions; messages are delivered in order through the owners'
//! engine event channels. Used by the simulation binary and by tests.

use crate::connection::{EngineEvent, EngineEventSender, EngineFactory, PeerId, RtcEngine};
use anyhow::{bail, Result};
use groupsync_common::protocol::IceCandidate;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
struct Endpoint {
    // ---
    events: EngineEventSender,
    local_set: bool,
    remote_set: bool,
    open: bool,
    candidates_applied: usize,
}

impl Endpoint {
    fn notify(&self, remote: &str, event: EngineEvent) {
        // ---
        // A dropped receiver just means that side is gone
        let _ = self.events.send((remote.to_string(), event));
    }
}

#[derive(Debug, Default)]
struct NetworkState {
    /// Keyed by (local, remote).
    endpoints: HashMap<(PeerId, PeerId), Endpoint>,
}

impl NetworkState {
    fn try_open(&mut self, a: &str, b: &str) {
        // ---
        let ready = |state: &NetworkState, local: &str, remote: &str| {
            state
                .endpoints
                .get(&(local.to_string(), remote.to_string()))
                .map(|e| e.local_set && e.remote_set && !e.open)
                .unwrap_or(false)
        };

        if !(ready(self, a, b) && ready(self, b, a)) {
            return;
        }

        for (local, remote) in [(a, b), (b, a)] {
            if let Some(endpoint) = self
                .endpoints
                .get_mut(&(local.to_string(), remote.to_string()))
            {
                endpoint.open = true;
                endpoint.notify(remote, EngineEvent::ChannelOpen);
            }
        }
        debug!("memory channel {} <-> {} open", a, b);
    }
}

/// Shared in-process "network".
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    // ---
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    // ---
    pub fn new() -> Self {
        // ---
        Self::default()
    }

    /// Whether `local`'s channel to `remote` is open.
    pub fn is_open(&self, local: &str, remote: &str) -> bool {
        // ---
        self.state
            .lock()
            .endpoints
            .get(&(local.to_string(), remote.to_string()))
            .map(|e| e.open)
            .unwrap_or(false)
    }

    /// ICE candidates `local` has applied for `remote`.
    pub fn candidates_applied(&self, local: &str, remote: &str) -> usize {
        // ---
        self.state
            .lock()
            .endpoints
            .get(&(local.to_string(), remote.to_string()))
            .map(|e| e.candidates_applied)
            .unwrap_or(0)
    }
}

impl EngineFactory for MemoryNetwork {
    fn create(
        &self,
        local: &str,
        remote: &str,
        events: EngineEventSender,
    ) -> Result<Box<dyn RtcEngine>> {
        // ---
        let endpoint = Endpoint {
            events,
            local_set: false,
            remote_set: false,
            open: false,
            candidates_applied: 0,
        };
        self.state
            .lock()
            .endpoints
            .insert((local.to_string(), remote.to_string()), endpoint);

        Ok(Box::new(MemoryEngine {
            network: self.clone(),
            local: local.to_string(),
            remote: remote.to_string(),
            closed: false,
        }))
    }
}

/// One end of an in-process connection.
#[derive(Debug)]
pub struct MemoryEngine {
    // ---
    network: MemoryNetwork,
    local: PeerId,
    remote: PeerId,
    closed: bool,
}

impl MemoryEngine {
    fn key(&self) -> (PeerId, PeerId) {
        // ---
        (self.local.clone(), self.remote.clone())
    }

    fn set_local(&mut self, kind: &str) -> Result<String> {
        // ---
        if self.closed {
            bail!("engine for {} closed", self.remote);
        }

        let mut state = self.network.state.lock();
        let Some(endpoint) = state.endpoints.get_mut(&self.key()) else {
            bail!("endpoint {} -> {} not registered", self.local, self.remote);
        };
        endpoint.local_set = true;
        endpoint.notify(
            &self.remote,
            EngineEvent::LocalCandidate(IceCandidate::new(format!(
                "candidate:{} 1 udp memory",
                self.local
            ))),
        );
        state.try_open(&self.local, &self.remote);

        Ok(format!("{kind}:{}->{}", self.local, self.remote))
    }
}

impl RtcEngine for MemoryEngine {
    fn create_channel(&mut self, _label: &str) -> Result<()> {
        // ---
        if self.closed {
            bail!("engine for {} closed", self.remote);
        }
        Ok(())
    }

    fn create_offer(&mut self) -> Result<String> {
        self.set_local("offer")
    }

    fn create_answer(&mut self) -> Result<String> {
        self.set_local("answer")
    }

    fn set_remote_description(&mut self, sdp: &str) -> Result<()> {
        // ---
        if !(sdp.starts_with("offer:") || sdp.starts_with("answer:")) {
            bail!("unrecognized session description {sdp:?}");
        }

        let mut state = self.network.state.lock();
        let Some(endpoint) = state.endpoints.get_mut(&self.key()) else {
            bail!("endpoint {} -> {} not registered", self.local, self.remote);
        };
        endpoint.remote_set = true;
        state.try_open(&self.local, &self.remote);
        Ok(())
    }

    fn add_ice_candidate(&mut self, _candidate: &IceCandidate) -> Result<()> {
        // ---
        let mut state = self.network.state.lock();
        if let Some(endpoint) = state.endpoints.get_mut(&self.key()) {
            endpoint.candidates_applied += 1;
        }
        Ok(())
    }

    fn send(&mut self, text: &str) -> Result<()> {
        // ---
        let state = self.network.state.lock();
        let open = state
            .endpoints
            .get(&self.key())
            .map(|e| e.open)
            .unwrap_or(false);
        if !open {
            bail!("channel {} -> {} not open", self.local, self.remote);
        }

        match state.endpoints.get(&(self.remote.clone(), self.local.clone())) {
            Some(peer) if peer.open => {
                peer.notify(&self.local, EngineEvent::Message(text.to_string()));
                Ok(())
            }
            _ => bail!("peer {} unreachable", self.remote),
        }
    }

    fn close(&mut self) {
        // ---
        if self.closed {
            return;
        }
        self.closed = true;

        let mut state = self.network.state.lock();
        let was_open = state
            .endpoints
            .remove(&self.key())
            .map(|e| e.open)
            .unwrap_or(false);

        if was_open {
            if let Some(peer) = state
                .endpoints
                .get_mut(&(self.remote.clone(), self.local.clone()))
            {
                peer.open = false;
                peer.notify(&self.local, EngineEvent::ChannelClosed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_channel_opens_after_both_descriptions() {
        // ---
        let net = MemoryNetwork::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();

        let mut a = net.create("a", "b", tx_a).unwrap();
        let mut b = net.create("b", "a", tx_b).unwrap();

        let offer = a.create_offer().unwrap();
        b.set_remote_description(&offer).unwrap();
        assert!(!net.is_open("a", "b"));

        let answer = b.create_answer().unwrap();
        a.set_remote_description(&answer).unwrap();
        assert!(net.is_open("a", "b"));
        assert!(net.is_open("b", "a"));

        let mut a_events = Vec::new();
        while let Ok(ev) = rx_a.try_recv() {
            a_events.push(ev.1);
        }
        assert!(matches!(a_events[0], EngineEvent::LocalCandidate(_)));
        assert_eq!(a_events.last(), Some(&EngineEvent::ChannelOpen));

        a.send("hello").unwrap();
        let mut last = None;
        while let Ok(ev) = rx_b.try_recv() {
            last = Some(ev);
        }
        assert_eq!(last, Some(("a".to_string(), EngineEvent::Message("hello".into()))));
    }

    #[test]
    fn test_close_notifies_other_side() {
        // ---
        let net = MemoryNetwork::new();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();

        let mut a = net.create("a", "b", tx_a).unwrap();
        let mut b = net.create("b", "a", tx_b).unwrap();
        let offer = a.create_offer().unwrap();
        b.set_remote_description(&offer).unwrap();
        let answer = b.create_answer().unwrap();
        a.set_remote_description(&answer).unwrap();

        a.close();
        a.close();

        let events: Vec<_> = std::iter::from_fn(|| rx_b.try_recv().ok()).collect();
        let closes = events
            .iter()
            .filter(|(_, e)| *e == EngineEvent::ChannelClosed)
            .count();
        assert_eq!(closes, 1);
        assert!(b.send("late").is_err());
    }

    #[test]
    fn test_rejects_garbage_description() {
        // ---
        let net = MemoryNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut a = net.create("a", "b", tx).unwrap();
        assert!(a.set_remote_description("v=0 nonsense").is_err());
    }
}
