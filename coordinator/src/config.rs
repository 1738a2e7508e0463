//! Coordinator tuning.

use groupsync_common::settings::{
    self, SettingChange, DISPLAY_NAME, ENABLE_PEER_LINKS, ENABLE_SKIP_TO_SYNC,
    ENABLE_SPEED_TO_SYNC, MAX_DELAY_SPEED_TO_SYNC, MIN_DELAY_SKIP_TO_SYNC,
    MIN_DELAY_SPEED_TO_SYNC, SPEED_TO_SYNC_DURATION,
};
use groupsync_common::{ClockSyncConfig, SettingsStore};
use tracing::{debug, warn};

/// Every threshold the coordinator works with.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    // ---
    /// Drift checks run at most once per half of this (ms).
    pub sync_method_threshold_ms: i64,

    /// Drift at or below this is in sync; above it rate correction may apply (ms).
    pub min_delay_speed_to_sync_ms: f64,

    /// Rate correction only below this drift (ms).
    pub max_delay_speed_to_sync_ms: f64,

    /// Length of one rate-correction window (ms).
    pub speed_to_sync_duration_ms: i64,

    /// Hard-seek correction above this drift (ms).
    pub min_delay_skip_to_sync_ms: f64,

    /// Correction stays off this long after a hard seek (ms).
    pub skip_cooldown_ms: i64,

    pub max_speed_attempts: u32,
    pub max_skip_attempts: u32,

    pub enable_speed_to_sync: bool,
    pub enable_skip_to_sync: bool,

    /// `waiting` must persist longer than this to count as buffering (ms).
    pub buffering_threshold_ms: i64,

    /// Grace period for the player to confirm pause/unpause (ms).
    pub confirmation_timeout_ms: i64,

    pub enable_peer_links: bool,
    pub display_name: String,

    pub clock: ClockSyncConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        // ---
        Self {
            sync_method_threshold_ms: 2_000,
            min_delay_speed_to_sync_ms: 50.0,
            max_delay_speed_to_sync_ms: 2_000.0,
            speed_to_sync_duration_ms: 1_000,
            min_delay_skip_to_sync_ms: 300.0,
            skip_cooldown_ms: 1_000,
            max_speed_attempts: 3,
            max_skip_attempts: 5,
            enable_speed_to_sync: true,
            enable_skip_to_sync: true,
            buffering_threshold_ms: 1_000,
            confirmation_timeout_ms: 500,
            enable_peer_links: false,
            display_name: "groupsync".to_string(),
            clock: ClockSyncConfig::default(),
        }
    }
}

impl SyncConfig {
    // ---
    /// Builds a config from persisted settings, defaulting anything unset.
    pub fn from_settings(store: &SettingsStore) -> Self {
        // ---
        let defaults = Self::default();
        Self {
            min_delay_speed_to_sync_ms: store
                .get_or(MIN_DELAY_SPEED_TO_SYNC, defaults.min_delay_speed_to_sync_ms),
            max_delay_speed_to_sync_ms: store
                .get_or(MAX_DELAY_SPEED_TO_SYNC, defaults.max_delay_speed_to_sync_ms),
            speed_to_sync_duration_ms: store
                .get_or(SPEED_TO_SYNC_DURATION, defaults.speed_to_sync_duration_ms),
            min_delay_skip_to_sync_ms: store
                .get_or(MIN_DELAY_SKIP_TO_SYNC, defaults.min_delay_skip_to_sync_ms),
            enable_speed_to_sync: store.get_bool(ENABLE_SPEED_TO_SYNC, defaults.enable_speed_to_sync),
            enable_skip_to_sync: store.get_bool(ENABLE_SKIP_TO_SYNC, defaults.enable_skip_to_sync),
            enable_peer_links: store.get_bool(ENABLE_PEER_LINKS, defaults.enable_peer_links),
            display_name: store
                .get(DISPLAY_NAME)
                .map(str::to_string)
                .unwrap_or_else(|| defaults.display_name.clone()),
            ..defaults
        }
    }

    /// Applies one live settings change. Returns whether anything changed.
    pub fn apply_change(&mut self, change: &SettingChange) -> bool {
        // ---
        let Some(value) = change.value.as_deref() else {
            // Removal falls back to the default
            let defaults = Self::default();
            return self.reset_key(&change.key, &defaults);
        };

        fn parse<T: std::str::FromStr>(key: &str, value: &str, slot: &mut T) -> bool {
            match value.parse() {
                Ok(v) => {
                    *slot = v;
                    true
                }
                Err(_) => {
                    warn!("Ignoring unparsable setting {}={:?}", key, value);
                    false
                }
            }
        }

        let key = change.key.as_str();
        let changed = match key {
            settings::MIN_DELAY_SPEED_TO_SYNC => {
                parse(key, value, &mut self.min_delay_speed_to_sync_ms)
            }
            settings::MAX_DELAY_SPEED_TO_SYNC => {
                parse(key, value, &mut self.max_delay_speed_to_sync_ms)
            }
            settings::SPEED_TO_SYNC_DURATION => {
                parse(key, value, &mut self.speed_to_sync_duration_ms)
            }
            settings::MIN_DELAY_SKIP_TO_SYNC => {
                parse(key, value, &mut self.min_delay_skip_to_sync_ms)
            }
            settings::ENABLE_SPEED_TO_SYNC => parse(key, value, &mut self.enable_speed_to_sync),
            settings::ENABLE_SKIP_TO_SYNC => parse(key, value, &mut self.enable_skip_to_sync),
            settings::ENABLE_PEER_LINKS => parse(key, value, &mut self.enable_peer_links),
            settings::DISPLAY_NAME => {
                self.display_name = value.to_string();
                true
            }
            _ => false,
        };

        if changed {
            debug!("Setting {} -> {}", key, value);
        }
        changed
    }

    fn reset_key(&mut self, key: &str, defaults: &SyncConfig) -> bool {
        // ---
        match key {
            settings::MIN_DELAY_SPEED_TO_SYNC => {
                self.min_delay_speed_to_sync_ms = defaults.min_delay_speed_to_sync_ms
            }
            settings::MAX_DELAY_SPEED_TO_SYNC => {
                self.max_delay_speed_to_sync_ms = defaults.max_delay_speed_to_sync_ms
            }
            settings::SPEED_TO_SYNC_DURATION => {
                self.speed_to_sync_duration_ms = defaults.speed_to_sync_duration_ms
            }
            settings::MIN_DELAY_SKIP_TO_SYNC => {
                self.min_delay_skip_to_sync_ms = defaults.min_delay_skip_to_sync_ms
            }
            settings::ENABLE_SPEED_TO_SYNC => self.enable_speed_to_sync = defaults.enable_speed_to_sync,
            settings::ENABLE_SKIP_TO_SYNC => self.enable_skip_to_sync = defaults.enable_skip_to_sync,
            settings::ENABLE_PEER_LINKS => self.enable_peer_links = defaults.enable_peer_links,
            settings::DISPLAY_NAME => self.display_name = defaults.display_name.clone(),
            _ => return false,
        }
        true
    }

    /// Minimum spacing between drift checks.
    pub fn drift_check_interval_ms(&self) -> i64 {
        // ---
        self.sync_method_threshold_ms / 2
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_from_settings_overrides_defaults() {
        // ---
        let mut store = SettingsStore::in_memory();
        store.set(MIN_DELAY_SKIP_TO_SYNC, 400).unwrap();
        store.set(ENABLE_SPEED_TO_SYNC, false).unwrap();
        store.set(DISPLAY_NAME, "den").unwrap();
        store.set(MAX_DELAY_SPEED_TO_SYNC, "lots").unwrap();

        let cfg = SyncConfig::from_settings(&store);
        assert_eq!(cfg.min_delay_skip_to_sync_ms, 400.0);
        assert!(!cfg.enable_speed_to_sync);
        assert!(cfg.enable_skip_to_sync);
        assert_eq!(cfg.display_name, "den");
        // Unparsable values fall back
        assert_eq!(cfg.max_delay_speed_to_sync_ms, 2_000.0);
        assert_eq!(cfg.drift_check_interval_ms(), 1_000);
    }

    #[test]
    fn test_apply_change() {
        // ---
        let mut cfg = SyncConfig::default();
        let change = |key: &str, value: Option<&str>| SettingChange {
            key: key.to_string(),
            value: value.map(str::to_string),
        };

        assert!(cfg.apply_change(&change(ENABLE_PEER_LINKS, Some("true"))));
        assert!(cfg.enable_peer_links);

        assert!(!cfg.apply_change(&change(SPEED_TO_SYNC_DURATION, Some("soon"))));
        assert_eq!(cfg.speed_to_sync_duration_ms, 1_000);

        assert!(cfg.apply_change(&change(ENABLE_PEER_LINKS, None)));
        assert!(!cfg.enable_peer_links);

        assert!(!cfg.apply_change(&change("unrelated", Some("1"))));
    }
}
