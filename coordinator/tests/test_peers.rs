//! Two coordinators linked through relay signaling and the in-memory transport.

mod support;

use coordinator::SyncConfig;
use groupsync_common::protocol::{CommandKind, GroupUpdate, GroupUpdateKind, OutboundMessage};
use peer::{MemoryNetwork, Target};
use serde_json::json;
use support::{Harness, TICKS_PER_MS};

fn member(name: &str, network: &MemoryNetwork) -> Harness {
    // ---
    let config = SyncConfig {
        enable_peer_links: true,
        display_name: name.to_uppercase(),
        ..SyncConfig::default()
    };
    Harness::build(config, Some("session"), Some((name, network.clone())))
}

/// Relays signaling from `from` to `to` the way the server would.
fn forward(from: &mut Harness, to: &mut Harness) -> bool {
    // ---
    let mut progressed = false;
    for message in from.drain_relay() {
        let OutboundMessage::Signal(signal) = message else {
            continue;
        };
        progressed = true;
        let update = GroupUpdate::new(
            GroupUpdateKind::WebRtc,
            Some("g".to_string()),
            Some(serde_json::to_value(&signal).unwrap()),
        );
        to.coordinator.handle_group_update(update).unwrap();
    }
    progressed
}

fn settle(a: &mut Harness, b: &mut Harness) {
    // ---
    for _ in 0..100 {
        let mut progressed = forward(a, b);
        progressed |= forward(b, a);
        progressed |= a.pump_engine() > 0;
        progressed |= b.pump_engine() > 0;
        if !progressed {
            return;
        }
    }
    panic!("peers did not settle");
}

fn linked_pair() -> (Harness, Harness) {
    // ---
    let network = MemoryNetwork::new();
    let mut alice = member("alice", &network);
    let mut bob = member("bob", &network);

    alice.ready();
    settle(&mut alice, &mut bob);
    bob.ready();
    settle(&mut alice, &mut bob);
    (alice, bob)
}

#[test]
fn test_members_link_and_learn_names() {
    // ---
    let (alice, bob) = linked_pair();

    assert_eq!(alice.coordinator.connected_peers(), 1);
    assert_eq!(bob.coordinator.connected_peers(), 1);

    let stats = alice.coordinator.peer_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].peer_id, "bob");
    assert_eq!(stats[0].display_name.as_deref(), Some("BOB"));
}

#[test]
fn test_application_messages_reach_the_other_member() {
    // ---
    let (mut alice, mut bob) = linked_pair();

    let sent = alice
        .coordinator
        .send_peer_message(&Target::Broadcast, json!({ "chat": "popcorn?" }))
        .unwrap();
    assert_eq!(sent, 1);
    settle(&mut alice, &mut bob);

    assert_eq!(
        bob.coordinator.take_external_messages(),
        vec![("alice".to_string(), json!({ "chat": "popcorn?" }))]
    );
    assert!(alice.coordinator.take_external_messages().is_empty());
}

#[test]
fn test_playback_diff_is_shared_on_request() {
    // ---
    let (mut alice, mut bob) = linked_pair();
    alice.coordinator.set_peer_playback_updates(true);
    settle(&mut alice, &mut bob);

    let cmd = bob.command(CommandKind::Play, 0, 0);
    bob.coordinator.process_command(cmd).unwrap();
    bob.pump();
    bob.advance(100);
    let position = bob.player.position();
    bob.player.set_position(position - 30 * TICKS_PER_MS);
    bob.tick();
    settle(&mut alice, &mut bob);

    let stats = alice.coordinator.peer_stats();
    assert_eq!(stats[0].average_diff_ms, Some(30.0));
}

#[test]
fn test_disabling_drops_links_on_both_sides() {
    // ---
    let (mut alice, mut bob) = linked_pair();

    bob.coordinator.disable(true);
    settle(&mut alice, &mut bob);

    assert_eq!(bob.coordinator.connected_peers(), 0);
    assert!(bob.coordinator.peer_stats().is_empty());
    assert_eq!(alice.coordinator.connected_peers(), 0);
    assert!(alice.coordinator.peer_stats().is_empty());

    // Application messages have nowhere to go
    let sent = bob
        .coordinator
        .send_peer_message(&Target::Broadcast, json!("anyone?"))
        .unwrap();
    assert_eq!(sent, 0);
}
