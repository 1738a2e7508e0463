//! Drift detection and correction.

mod support;

use coordinator::sim::PlayerAction;
use coordinator::{Notification, SyncConfig};
use groupsync_common::protocol::CommandKind;
use support::{playing, START_MS, TICKS_PER_MS};

/// Puts the player `ms` behind the group.
fn fall_behind(h: &mut support::Harness, ms: i64) {
    // ---
    let position = h.player.position();
    h.player.set_position(position - ms * TICKS_PER_MS);
}

#[test]
fn test_150ms_behind_speeds_up_for_one_window() {
    // ---
    let mut h = playing(SyncConfig::default(), 0);
    h.advance(100);
    fall_behind(&mut h, 150);

    h.tick();
    let actions = h.player.actions();
    assert_eq!(actions.len(), 1);
    let PlayerAction::SetRate(rate) = actions[0] else {
        panic!("expected a rate change, got {actions:?}");
    };
    assert!((rate - 1.15).abs() < 1e-9);
    assert!(!h.coordinator.drift().is_armed());

    // No checks while the window runs
    h.advance(500);
    h.tick();
    assert_eq!(h.player.actions().len(), 1);

    h.advance(500);
    assert_eq!(h.player.actions().last(), Some(&PlayerAction::SetRate(1.0)));
    assert!(h.coordinator.drift().is_armed());
    assert_eq!(h.coordinator.stats().speed_corrections, 1);
}

#[test]
fn test_500ms_behind_skips_to_expected_position() {
    // ---
    let mut h = playing(SyncConfig::default(), 0);
    h.advance(100);
    fall_behind(&mut h, 500);

    h.tick();
    assert_eq!(
        h.player.actions(),
        vec![PlayerAction::Seek(100 * TICKS_PER_MS)]
    );

    // Cooldown, then back in sync
    h.advance(999);
    h.tick();
    assert_eq!(h.player.actions().len(), 1);

    h.advance(1);
    h.tick();
    assert_eq!(h.player.actions().len(), 1);
    assert_eq!(h.coordinator.stats().skip_corrections, 1);
    assert_eq!(h.coordinator.stats().drift_checks_in_sync, 1);
}

#[test]
fn test_ahead_of_group_slows_down() {
    // ---
    let mut h = playing(SyncConfig::default(), 0);
    h.advance(100);
    fall_behind(&mut h, -200);

    h.tick();
    let actions = h.player.actions();
    let PlayerAction::SetRate(rate) = actions[0] else {
        panic!("expected a rate change, got {actions:?}");
    };
    assert!((rate - 0.8).abs() < 1e-9);
}

#[test]
fn test_small_drift_is_left_alone() {
    // ---
    let mut h = playing(SyncConfig::default(), 0);
    h.advance(100);
    fall_behind(&mut h, 30);

    h.tick();
    assert!(h.player.actions().is_empty());
    assert_eq!(h.coordinator.stats().drift_checks_in_sync, 1);
}

#[test]
fn test_no_rate_support_tolerates_moderate_drift() {
    // ---
    let mut h = playing(SyncConfig::default(), 0);
    h.player.set_supports_rate(false);
    h.advance(100);
    fall_behind(&mut h, 150);

    h.tick();
    assert!(h.player.actions().is_empty());
    assert!(h.coordinator.drift().is_armed());
}

#[test]
fn test_persistent_moderate_drift_stops_speed_after_three_windows() {
    // ---
    let mut h = playing(SyncConfig::default(), 0);

    for _ in 0..10 {
        h.advance(1_000);
        let expected = (h.now() - START_MS) * TICKS_PER_MS;
        h.player.set_position(expected - 200 * TICKS_PER_MS);
        h.tick();
    }

    let nudges = h
        .player
        .actions()
        .iter()
        .filter(|a| matches!(a, PlayerAction::SetRate(rate) if *rate != 1.0))
        .count();
    assert_eq!(nudges, 3);
    assert_eq!(h.coordinator.stats().speed_corrections, 3);
    assert_eq!(h.coordinator.drift().speed_attempts(), 3);
}

#[test]
fn test_checks_are_rate_limited() {
    // ---
    let mut h = playing(SyncConfig::default(), 0);
    h.advance(100);
    h.tick();
    assert_eq!(h.coordinator.stats().drift_checks, 1);

    fall_behind(&mut h, 500);
    h.advance(500);
    h.tick();
    assert_eq!(h.coordinator.stats().drift_checks, 1);
    assert!(h.player.actions().is_empty());

    h.advance(500);
    h.tick();
    assert_eq!(h.coordinator.stats().drift_checks, 2);
    assert_eq!(h.player.actions().len(), 1);
}

#[test]
fn test_buffering_suspends_drift_checks() {
    // ---
    let mut h = playing(SyncConfig::default(), 0);

    // A short stall does not count
    h.player.emit(coordinator::PlayerEventKind::Waiting);
    h.pump();
    h.advance(500);
    h.player.emit(coordinator::PlayerEventKind::Playing);
    h.pump();
    assert!(!h.coordinator.is_buffering());

    h.player.emit(coordinator::PlayerEventKind::Waiting);
    h.pump();
    h.advance(1_001);
    assert!(h.coordinator.is_buffering());

    fall_behind(&mut h, 500);
    h.tick();
    assert!(h.player.actions().is_empty());
    assert_eq!(h.coordinator.stats().drift_checks, 0);

    h.player.emit(coordinator::PlayerEventKind::Playing);
    h.pump();
    assert!(!h.coordinator.is_buffering());
    h.tick();
    assert_eq!(h.player.actions().len(), 1);
    assert!(matches!(h.player.actions()[0], PlayerAction::Seek(_)));
}

#[test]
fn test_repeated_skips_exhaust_until_next_play() {
    // ---
    let mut h = playing(SyncConfig::default(), 0);

    for _ in 0..5 {
        h.advance(1_000);
        fall_behind(&mut h, 500);
        h.tick();
    }
    assert_eq!(h.coordinator.stats().skip_corrections, 5);

    h.advance(1_000);
    fall_behind(&mut h, 500);
    h.tick();
    assert!(h.coordinator.drift().is_suspended());
    assert!(h
        .coordinator
        .take_notifications()
        .contains(&Notification::CorrectionExhausted));

    // Nothing more happens, however far off we are
    let seeks = h.player.actions().len();
    h.advance(1_000);
    h.tick();
    assert_eq!(h.player.actions().len(), seeks);

    // A fresh Play re-engages correction
    let cmd = h.command(CommandKind::Play, 0, 60_000 * TICKS_PER_MS);
    h.coordinator.process_command(cmd).unwrap();
    assert!(!h.coordinator.drift().is_suspended());
    assert!(h.coordinator.drift().is_armed());
}

#[test]
fn test_disable_during_speed_window_restores_rate() {
    // ---
    let mut h = playing(SyncConfig::default(), 0);
    h.advance(100);
    fall_behind(&mut h, 150);
    h.tick();
    assert!(h.coordinator.drift().is_speed_active());

    h.coordinator.disable(false);
    assert_eq!(h.player.actions().last(), Some(&PlayerAction::SetRate(1.0)));
    assert_eq!(h.coordinator.pending_timers(), 0);
}

#[test]
fn test_new_command_ends_speed_window() {
    // ---
    let mut h = playing(SyncConfig::default(), 0);
    h.advance(100);
    fall_behind(&mut h, 150);
    h.tick();
    assert!(h.coordinator.drift().is_speed_active());

    let cmd = h.command(CommandKind::Pause, 0, 0);
    h.coordinator.process_command(cmd).unwrap();
    assert!(!h.coordinator.drift().is_speed_active());
    assert!(h.player.actions().contains(&PlayerAction::SetRate(1.0)));
}
