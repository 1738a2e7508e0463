//! Wall-clock access and position-tick conversions.
//!
//! All times inside the core are milliseconds since the Unix epoch (`i64`).
//! Media positions are expressed in ticks of 100ns.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Position ticks per millisecond.
pub const TICKS_PER_MILLISECOND: i64 = 10_000;

/// Media position in 100ns ticks.
pub type Ticks = i64;

/// Converts a millisecond span to ticks.
pub fn ms_to_ticks(ms: f64) -> Ticks {
    // ---
    (ms * TICKS_PER_MILLISECOND as f64).round() as Ticks
}

/// Converts ticks to (fractional) milliseconds.
pub fn ticks_to_ms(ticks: Ticks) -> f64 {
    // ---
    ticks as f64 / TICKS_PER_MILLISECOND as f64
}

/// Converts a wire timestamp to epoch milliseconds.
pub fn epoch_ms(at: &DateTime<Utc>) -> i64 {
    // ---
    at.timestamp_millis()
}

/// Source of local wall-clock time.
///
/// Injected everywhere time is read so tests can drive the core with a
/// [`ManualClock`].
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        // ---
        Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same underlying time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    // ---
    now: Arc<AtomicI64>,
}

impl ManualClock {
    // ---
    pub fn new(start_ms: i64) -> Self {
        // ---
        Self {
            now: Arc::new(AtomicI64::new(start_ms)),
        }
    }

    pub fn set(&self, now_ms: i64) {
        // ---
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        // ---
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        // ---
        self.now.load(Ordering::SeqCst)
    }
}

/// A clock running at a fixed offset from another clock.
///
/// Used by the simulation to model endpoints whose wall clocks disagree.
#[derive(Clone)]
pub struct SkewedClock {
    // ---
    base: Arc<dyn Clock>,
    skew_ms: i64,
}

impl SkewedClock {
    // ---
    pub fn new(base: Arc<dyn Clock>, skew_ms: i64) -> Self {
        // ---
        Self { base, skew_ms }
    }
}

impl Clock for SkewedClock {
    fn now_ms(&self) -> i64 {
        // ---
        self.base.now_ms() + self.skew_ms
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn tick_conversions() {
        // ---
        assert_eq!(ms_to_ticks(1.0), 10_000);
        assert_eq!(ms_to_ticks(-2.5), -25_000);
        assert_eq!(ticks_to_ms(15_000), 1.5);
    }

    #[test]
    fn manual_clock_is_shared_between_clones() {
        // ---
        let clock = ManualClock::new(1_000);
        let other = clock.clone();
        clock.advance(250);
        assert_eq!(other.now_ms(), 1_250);
        other.set(5);
        assert_eq!(clock.now_ms(), 5);
    }

    #[test]
    fn skewed_clock_follows_base() {
        // ---
        let base = ManualClock::new(10_000);
        let skewed = SkewedClock::new(Arc::new(base.clone()), -300);
        assert_eq!(skewed.now_ms(), 9_700);
        base.advance(100);
        assert_eq!(skewed.now_ms(), 9_800);
    }
}
