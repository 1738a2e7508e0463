//! Persisted key/value settings with change notification.
//!
//! Values are stored as strings in a flat JSON object. Every successful
//! `set` is written through to disk (when a path is configured) and then
//! broadcast to subscribers.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Peer-to-peer links on/off.
pub const ENABLE_PEER_LINKS: &str = "enable-peer-links";

/// Name announced to peers.
pub const DISPLAY_NAME: &str = "display-name";

/// Playback-rate correction on/off.
pub const ENABLE_SPEED_TO_SYNC: &str = "enable-speed-to-sync";

/// Hard-seek correction on/off.
pub const ENABLE_SKIP_TO_SYNC: &str = "enable-skip-to-sync";

/// Lower drift bound for rate correction (ms).
pub const MIN_DELAY_SPEED_TO_SYNC: &str = "min-delay-speed-to-sync";

/// Upper drift bound for rate correction (ms).
pub const MAX_DELAY_SPEED_TO_SYNC: &str = "max-delay-speed-to-sync";

/// Length of one rate-correction window (ms).
pub const SPEED_TO_SYNC_DURATION: &str = "speed-to-sync-duration";

/// Lower drift bound for hard-seek correction (ms).
pub const MIN_DELAY_SKIP_TO_SYNC: &str = "min-delay-skip-to-sync";

const CHANGE_CHANNEL_CAPACITY: usize = 32;

/// A single setting change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingChange {
    pub key: String,
    pub value: Option<String>,
}

/// Small persisted key/value store.
#[derive(Debug)]
pub struct SettingsStore {
    // ---
    values: BTreeMap<String, String>,
    path: Option<PathBuf>,
    changes: broadcast::Sender<SettingChange>,
}

impl SettingsStore {
    // ---
    /// Creates a store that lives only in memory.
    pub fn in_memory() -> Self {
        // ---
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            values: BTreeMap::new(),
            path: None,
            changes,
        }
    }

    /// Loads the store from `path`; a missing file yields an empty store.
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        // ---
        let path = path.as_ref().to_path_buf();
        let mut store = Self::in_memory();

        if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read settings from {}", path.display()))?;
            store.values = serde_json::from_str(&text)
                .with_context(|| format!("invalid settings file {}", path.display()))?;
            debug!("Loaded {} settings from {}", store.values.len(), path.display());
        }

        store.path = Some(path);
        Ok(store)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        // ---
        self.values.get(key).map(String::as_str)
    }

    /// Parses `key` as `T`, falling back to `default` when missing or invalid.
    pub fn get_or<T: FromStr>(&self, key: &str, default: T) -> T {
        // ---
        match self.get(key) {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!("Ignoring unparsable setting {}={:?}", key, raw);
                default
            }),
            None => default,
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        // ---
        self.get_or(key, default)
    }

    /// Sets `key`, persists, and notifies subscribers if the value changed.
    ///
    /// # Errors
    ///
    /// Returns error if the store is file-backed and the write fails; the
    /// previous value is kept in that case.
    pub fn set(&mut self, key: &str, value: impl ToString) -> Result<()> {
        // ---
        let value = value.to_string();
        if self.get(key) == Some(value.as_str()) {
            return Ok(());
        }

        // Memory only changes once the file write succeeded
        let mut next = self.values.clone();
        next.insert(key.to_string(), value.clone());
        self.persist(&next)?;

        self.values = next;
        self.notify(key, Some(value));
        Ok(())
    }

    /// Removes `key`, persists, and notifies subscribers.
    ///
    /// # Errors
    ///
    /// Returns error if the store is file-backed and the write fails; the
    /// key is kept in that case.
    pub fn remove(&mut self, key: &str) -> Result<()> {
        // ---
        if !self.values.contains_key(key) {
            return Ok(());
        }

        let mut next = self.values.clone();
        next.remove(key);
        self.persist(&next)?;

        self.values = next;
        self.notify(key, None);
        Ok(())
    }

    /// Subscribes to future changes.
    pub fn subscribe(&self) -> broadcast::Receiver<SettingChange> {
        // ---
        self.changes.subscribe()
    }

    fn notify(&self, key: &str, value: Option<String>) {
        // ---
        // No subscribers is fine
        let _ = self.changes.send(SettingChange {
            key: key.to_string(),
            value,
        });
    }

    fn persist(&self, values: &BTreeMap<String, String>) -> Result<()> {
        // ---
        let Some(path) = &self.path else {
            return Ok(());
        };

        let text = serde_json::to_string_pretty(values).context("failed to encode settings")?;
        std::fs::write(path, text)
            .with_context(|| format!("failed to write settings to {}", path.display()))?;
        Ok(())
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        // ---
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_typed_getters() {
        // ---
        let mut store = SettingsStore::in_memory();
        store.set(MIN_DELAY_SKIP_TO_SYNC, 450).unwrap();
        store.set(ENABLE_SPEED_TO_SYNC, false).unwrap();
        store.set(SPEED_TO_SYNC_DURATION, "soon").unwrap();

        assert_eq!(store.get_or(MIN_DELAY_SKIP_TO_SYNC, 300.0), 450.0);
        assert!(!store.get_bool(ENABLE_SPEED_TO_SYNC, true));
        assert_eq!(store.get_or(SPEED_TO_SYNC_DURATION, 1_000i64), 1_000);
        assert_eq!(store.get_or(MAX_DELAY_SPEED_TO_SYNC, 2_000.0), 2_000.0);
    }

    #[test]
    fn test_change_notification() {
        // ---
        let mut store = SettingsStore::in_memory();
        let mut rx = store.subscribe();

        store.set(DISPLAY_NAME, "alice").unwrap();
        store.set(DISPLAY_NAME, "alice").unwrap(); // unchanged, no event
        store.remove(DISPLAY_NAME).unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            SettingChange {
                key: DISPLAY_NAME.into(),
                value: Some("alice".into())
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            SettingChange {
                key: DISPLAY_NAME.into(),
                value: None
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_persists_to_disk() {
        // ---
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");

        let mut store = SettingsStore::load(&path).expect("missing file is fine");
        store.set(ENABLE_PEER_LINKS, true).unwrap();

        let reloaded = SettingsStore::load(&path).expect("reload");
        assert!(reloaded.get_bool(ENABLE_PEER_LINKS, false));
    }

    #[test]
    fn test_failed_write_keeps_previous_values() {
        // ---
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");

        let mut store = SettingsStore::load(&path).expect("missing file is fine");
        store.set(DISPLAY_NAME, "alice").unwrap();
        let mut rx = store.subscribe();

        // A directory in place of the file makes every write fail
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        assert!(store.set(DISPLAY_NAME, "bob").is_err());
        assert_eq!(store.get(DISPLAY_NAME), Some("alice"));

        assert!(store.set(ENABLE_PEER_LINKS, true).is_err());
        assert_eq!(store.get(ENABLE_PEER_LINKS), None);

        assert!(store.remove(DISPLAY_NAME).is_err());
        assert_eq!(store.get(DISPLAY_NAME), Some("alice"));

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        // ---
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(SettingsStore::load(&path).is_err());
    }
}
