//! Drift correction strategy selection.
//!
//! The corrector only decides. Applying a correction (rate change, seek)
//! and scheduling its end belongs to the coordinator.

use crate::config::SyncConfig;
use tracing::{debug, warn};

/// Outcome of one drift check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Correction {
    /// Within tolerance.
    InSync,
    /// Run at `rate` for one speed window.
    Speed { rate: f64 },
    /// Seek straight to the expected position.
    Skip,
    /// Too many skips in a row; correction is suspended until the next Play.
    Exhausted { attempts: u32 },
    /// Out of tolerance but no strategy applies.
    Tolerated,
}

/// Attempt counters and arming state.
#[derive(Debug, Clone, Default)]
pub struct DriftCorrector {
    // ---
    armed: bool,
    suspended: bool,
    speed_active: bool,
    speed_attempts: u32,
    skip_attempts: u32,

    /// Local time of the last check that ran.
    last_check: Option<i64>,
}

impl DriftCorrector {
    // ---
    pub fn new() -> Self {
        // ---
        Self::default()
    }

    /// Allows checks to run (no effect while suspended).
    pub fn arm(&mut self) {
        // ---
        if self.suspended {
            debug!("Drift correction suspended, not arming");
            return;
        }
        self.armed = true;
    }

    pub fn disarm(&mut self) {
        // ---
        self.armed = false;
    }

    pub fn is_armed(&self) -> bool {
        // ---
        self.armed
    }

    pub fn is_suspended(&self) -> bool {
        // ---
        self.suspended
    }

    pub fn is_speed_active(&self) -> bool {
        // ---
        self.speed_active
    }

    /// Marks the end of a rate-correction window.
    pub fn finish_speed(&mut self) {
        // ---
        self.speed_active = false;
    }

    /// Fresh start for a new Play command.
    pub fn reset(&mut self) {
        // ---
        *self = Self::default();
    }

    pub fn speed_attempts(&self) -> u32 {
        self.speed_attempts
    }

    pub fn skip_attempts(&self) -> u32 {
        self.skip_attempts
    }

    /// Whether a check may run at `now`, rate-limited to one per `interval_ms`.
    pub fn should_check(&self, now: i64, interval_ms: i64) -> bool {
        // ---
        if !self.armed || self.suspended {
            return false;
        }
        match self.last_check {
            Some(last) => now - last >= interval_ms,
            None => true,
        }
    }

    /// Picks a strategy for `diff_ms` (expected minus actual).
    ///
    /// Any correction other than `InSync`/`Tolerated` disarms the corrector;
    /// the caller re-arms it when the correction window ends.
    pub fn decide(
        &mut self,
        diff_ms: f64,
        rate_supported: bool,
        now: i64,
        cfg: &SyncConfig,
    ) -> Correction {
        // ---
        self.last_check = Some(now);
        let magnitude = diff_ms.abs();

        if magnitude <= cfg.min_delay_speed_to_sync_ms {
            self.speed_attempts = 0;
            self.skip_attempts = 0;
            return Correction::InSync;
        }

        let skip_applies = cfg.enable_skip_to_sync && magnitude > cfg.min_delay_skip_to_sync_ms;
        let speed_applies = cfg.enable_speed_to_sync
            && rate_supported
            && magnitude < cfg.max_delay_speed_to_sync_ms
            && self.speed_attempts < cfg.max_speed_attempts
            && !skip_applies;

        if speed_applies {
            self.speed_attempts += 1;
            self.speed_active = true;
            self.armed = false;
            let window = cfg.speed_to_sync_duration_ms.max(1) as f64;
            let rate = (1.0 + diff_ms / window).max(0.1);
            return Correction::Speed { rate };
        }

        if skip_applies {
            if self.skip_attempts >= cfg.max_skip_attempts {
                warn!(
                    "Drift still {:.0}ms after {} skips, suspending correction",
                    diff_ms, self.skip_attempts
                );
                self.armed = false;
                self.suspended = true;
                return Correction::Exhausted {
                    attempts: self.skip_attempts,
                };
            }
            self.skip_attempts += 1;
            self.armed = false;
            return Correction::Skip;
        }

        // Still out of tolerance: attempts carry over until InSync or the next Play
        Correction::Tolerated
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn armed() -> DriftCorrector {
        // ---
        let mut d = DriftCorrector::new();
        d.arm();
        d
    }

    #[test]
    fn test_small_drift_is_in_sync() {
        // ---
        let mut d = armed();
        assert_eq!(d.decide(40.0, true, 0, &SyncConfig::default()), Correction::InSync);
        assert_eq!(d.decide(-50.0, true, 0, &SyncConfig::default()), Correction::InSync);
        assert!(d.is_armed());
    }

    #[test]
    fn test_150ms_selects_speed_500ms_selects_skip() {
        // ---
        let cfg = SyncConfig::default();

        let mut d = armed();
        let Correction::Speed { rate } = d.decide(150.0, true, 0, &cfg) else {
            panic!("expected speed correction");
        };
        assert!((rate - 1.15).abs() < 1e-9);
        assert!(!d.is_armed());
        assert!(d.is_speed_active());

        let mut d = armed();
        assert_eq!(d.decide(500.0, true, 0, &cfg), Correction::Skip);
        assert_eq!(d.decide(-500.0, true, 0, &cfg), Correction::Skip);
    }

    #[test]
    fn test_speed_needs_rate_support() {
        // ---
        let mut d = armed();
        assert_eq!(
            d.decide(150.0, false, 0, &SyncConfig::default()),
            Correction::Tolerated
        );
    }

    #[test]
    fn test_speed_gives_up_after_three_attempts() {
        // ---
        let cfg = SyncConfig::default();
        let mut d = armed();
        let mut speeds = 0;
        for _ in 0..12 {
            match d.decide(-200.0, true, 0, &cfg) {
                Correction::Speed { .. } => speeds += 1,
                other => assert_eq!(other, Correction::Tolerated),
            }
            d.finish_speed();
            d.arm();
        }
        assert_eq!(speeds, 3);
        assert_eq!(d.speed_attempts(), 3);

        // Back in tolerance clears the count
        assert_eq!(d.decide(10.0, true, 0, &cfg), Correction::InSync);
        assert_eq!(d.speed_attempts(), 0);
        assert!(matches!(d.decide(-200.0, true, 0, &cfg), Correction::Speed { .. }));
    }

    #[test]
    fn test_speed_covers_large_drift_when_skip_disabled() {
        // ---
        let cfg = SyncConfig {
            enable_skip_to_sync: false,
            ..SyncConfig::default()
        };
        let mut d = armed();
        assert!(matches!(d.decide(1_500.0, true, 0, &cfg), Correction::Speed { .. }));
        let mut d = armed();
        assert_eq!(d.decide(2_500.0, true, 0, &cfg), Correction::Tolerated);
    }

    #[test]
    fn test_skip_exhaustion_suspends_until_reset() {
        // ---
        let cfg = SyncConfig::default();
        let mut d = armed();
        for _ in 0..5 {
            assert_eq!(d.decide(900.0, true, 0, &cfg), Correction::Skip);
            d.arm();
        }
        assert_eq!(
            d.decide(900.0, true, 0, &cfg),
            Correction::Exhausted { attempts: 5 }
        );
        assert!(d.is_suspended());

        d.arm();
        assert!(!d.is_armed());
        assert!(!d.should_check(10_000, 1_000));

        d.reset();
        d.arm();
        assert!(d.should_check(0, 1_000));
    }

    #[test]
    fn test_checks_are_rate_limited() {
        // ---
        let cfg = SyncConfig::default();
        let mut d = armed();
        assert!(d.should_check(0, 1_000));
        d.decide(0.0, true, 0, &cfg);
        assert!(!d.should_check(999, 1_000));
        assert!(d.should_check(1_000, 1_000));
    }
}
