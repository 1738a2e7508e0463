//! Per-group sync session state.

use groupsync_common::protocol::GroupCommand;

/// Coordinator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disabled,
    /// Enabled, waiting for a fresh clock estimate.
    Enabling,
    Active,
}

/// One joined group, from `GroupJoined` until leave/stop/error.
#[derive(Debug, Clone)]
pub struct SyncSession {
    // ---
    /// Server time the session was enabled (epoch ms).
    pub enabled_at: i64,

    /// Whether a clock probe has resolved since enabling.
    pub ready: bool,

    /// Command received before `ready`, replayed once ready.
    pub queued: Option<GroupCommand>,

    /// Last command that was applied.
    pub last_command: Option<GroupCommand>,

    pub group_id: Option<String>,
}

impl SyncSession {
    // ---
    pub fn new(enabled_at: i64, group_id: Option<String>) -> Self {
        // ---
        Self {
            enabled_at,
            ready: false,
            queued: None,
            last_command: None,
            group_id,
        }
    }

    pub fn state(&self) -> SessionState {
        // ---
        if self.ready {
            SessionState::Active
        } else {
            SessionState::Enabling
        }
    }

    /// Whether `cmd` was emitted before this session existed.
    pub fn is_stale(&self, cmd: &GroupCommand) -> bool {
        // ---
        cmd.emitted_at_ms() < self.enabled_at
    }

    /// Whether `cmd` repeats the last applied command.
    pub fn is_duplicate(&self, cmd: &GroupCommand) -> bool {
        // ---
        self.last_command
            .as_ref()
            .map(|last| last.same_target(cmd))
            .unwrap_or(false)
    }

    /// Queues `cmd`, returning the command it displaced.
    pub fn queue(&mut self, cmd: GroupCommand) -> Option<GroupCommand> {
        // ---
        self.queued.replace(cmd)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::DateTime;
    use groupsync_common::protocol::CommandKind;

    fn cmd(kind: CommandKind, when: i64, emitted: i64) -> GroupCommand {
        // ---
        GroupCommand {
            kind,
            when: DateTime::from_timestamp_millis(when).unwrap(),
            position_ticks: 0,
            emitted_at: DateTime::from_timestamp_millis(emitted).unwrap(),
        }
    }

    #[test]
    fn test_stale_and_duplicate() {
        // ---
        let mut session = SyncSession::new(10_000, None);
        assert_eq!(session.state(), SessionState::Enabling);

        assert!(session.is_stale(&cmd(CommandKind::Play, 12_000, 9_000)));
        assert!(!session.is_stale(&cmd(CommandKind::Play, 12_000, 10_000)));

        session.last_command = Some(cmd(CommandKind::Play, 12_000, 10_500));
        // Emission time is not part of the identity
        assert!(session.is_duplicate(&cmd(CommandKind::Play, 12_000, 11_000)));
        assert!(!session.is_duplicate(&cmd(CommandKind::Pause, 12_000, 11_000)));
    }

    #[test]
    fn test_queue_keeps_only_latest() {
        // ---
        let mut session = SyncSession::new(0, Some("g".into()));
        assert!(session.queue(cmd(CommandKind::Play, 1, 1)).is_none());
        let displaced = session.queue(cmd(CommandKind::Pause, 2, 2));
        assert_eq!(displaced.map(|c| c.kind), Some(CommandKind::Play));
        assert_eq!(session.queued.as_ref().map(|c| c.kind), Some(CommandKind::Pause));
    }
}
