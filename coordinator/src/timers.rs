//! Wall-clock timers owned by the coordinator.
//!
//! Nothing here sleeps. The driver asks for the next deadline, waits, and
//! then pops whatever is due.

use groupsync_common::Ticks;

/// What a timer does when it fires.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimerKind {
    /// Scheduled play: unpause at the group's start instant.
    ScheduledUnpause,
    /// Scheduled pause (or seek): pause, then seek to `position`.
    ScheduledPause { position: Ticks },
    /// Turn drift correction on.
    ArmCorrection,
    /// The player did not confirm a pause/unpause in time.
    ConfirmationTimeout,
    /// End of a rate-correction window.
    RestorePlaybackRate,
    /// End of the quiet period after a hard seek.
    SkipCooldown,
    /// `waiting` has persisted long enough to count as buffering.
    BufferingCheck,
}

impl TimerKind {
    /// Timers that belong to the current scheduled action.
    pub fn is_scheduled_action(&self) -> bool {
        // ---
        matches!(
            self,
            TimerKind::ScheduledUnpause
                | TimerKind::ScheduledPause { .. }
                | TimerKind::ArmCorrection
                | TimerKind::ConfirmationTimeout
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

#[derive(Debug, Clone, Copy)]
struct Timer {
    id: TimerId,
    due: i64,
    kind: TimerKind,
}

/// Pending timers, fired in due order (ties in scheduling order).
#[derive(Debug, Default)]
pub struct TimerQueue {
    // ---
    next_id: u64,
    timers: Vec<Timer>,
}

impl TimerQueue {
    // ---
    pub fn new() -> Self {
        // ---
        Self::default()
    }

    pub fn schedule(&mut self, due: i64, kind: TimerKind) -> TimerId {
        // ---
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.timers.push(Timer { id, due, kind });
        id
    }

    pub fn cancel(&mut self, id: TimerId) -> bool {
        // ---
        let before = self.timers.len();
        self.timers.retain(|t| t.id != id);
        self.timers.len() != before
    }

    /// Cancels every timer whose kind matches `pred`.
    pub fn cancel_where(&mut self, pred: impl Fn(&TimerKind) -> bool) -> usize {
        // ---
        let before = self.timers.len();
        self.timers.retain(|t| !pred(&t.kind));
        before - self.timers.len()
    }

    /// Removes and returns the earliest timer due at or before `now`.
    pub fn pop_due(&mut self, now: i64) -> Option<(TimerId, TimerKind)> {
        // ---
        let index = self
            .timers
            .iter()
            .enumerate()
            .filter(|(_, t)| t.due <= now)
            .min_by_key(|(_, t)| (t.due, t.id))
            .map(|(i, _)| i)?;
        let timer = self.timers.remove(index);
        Some((timer.id, timer.kind))
    }

    pub fn next_deadline(&self) -> Option<i64> {
        // ---
        self.timers.iter().map(|t| t.due).min()
    }

    pub fn due_at(&self, id: TimerId) -> Option<i64> {
        // ---
        self.timers.iter().find(|t| t.id == id).map(|t| t.due)
    }

    pub fn contains_kind(&self, pred: impl Fn(&TimerKind) -> bool) -> bool {
        // ---
        self.timers.iter().any(|t| pred(&t.kind))
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn clear(&mut self) {
        self.timers.clear();
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_fires_in_due_order() {
        // ---
        let mut q = TimerQueue::new();
        q.schedule(300, TimerKind::SkipCooldown);
        q.schedule(100, TimerKind::ArmCorrection);
        q.schedule(100, TimerKind::ScheduledUnpause);

        assert_eq!(q.pop_due(50), None);
        assert_eq!(q.next_deadline(), Some(100));
        assert_eq!(q.pop_due(100).map(|(_, k)| k), Some(TimerKind::ArmCorrection));
        assert_eq!(q.pop_due(100).map(|(_, k)| k), Some(TimerKind::ScheduledUnpause));
        assert_eq!(q.pop_due(299), None);
        assert_eq!(q.pop_due(1_000).map(|(_, k)| k), Some(TimerKind::SkipCooldown));
        assert!(q.is_empty());
    }

    #[test]
    fn test_cancel_scheduled_action_keeps_others() {
        // ---
        let mut q = TimerQueue::new();
        let unpause = q.schedule(10, TimerKind::ScheduledUnpause);
        q.schedule(20, TimerKind::ArmCorrection);
        q.schedule(30, TimerKind::BufferingCheck);

        assert_eq!(q.due_at(unpause), Some(10));
        assert_eq!(q.cancel_where(TimerKind::is_scheduled_action), 2);
        assert_eq!(q.len(), 1);
        assert!(!q.cancel(unpause));
        assert!(q.contains_kind(|k| *k == TimerKind::BufferingCheck));
    }
}
