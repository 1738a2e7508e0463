//! Statistics tracking for the sync coordinator.
//!
//! Counts commands, probes and drift corrections for periodic logging.
//! Time is passed in as epoch milliseconds so tests can use a manual clock.

use crate::drift::Correction;
use tracing::info;

/// Coordinator statistics.
///
/// Designed to be logged periodically for observability; the Prometheus
/// counters in `MetricsContext` carry the same information for scraping.
#[derive(Debug, Clone)]
pub struct SyncStats {
    // ---
    /// Commands scheduled locally
    pub commands_applied: u64,

    /// Commands dropped as stale or duplicate
    pub commands_ignored: u64,

    /// Commands held until the session became ready
    pub commands_queued: u64,

    /// Clock probes that produced a sample
    pub probes_resolved: u64,

    /// Clock probes that failed or timed out
    pub probes_failed: u64,

    /// Drift checks that ran
    pub drift_checks: u64,

    /// Drift checks that found playback within tolerance
    pub drift_checks_in_sync: u64,

    pub speed_corrections: u64,
    pub skip_corrections: u64,
    pub corrections_exhausted: u64,

    /// Most recent drift (expected minus actual, ms)
    pub last_drift_ms: Option<f64>,

    /// Most recent server offset estimate (ms)
    pub last_offset_ms: Option<f64>,

    /// Start time for rate calculations
    start_ms: i64,

    /// Last time stats were logged
    last_log_ms: i64,

    /// Interval between periodic logs
    log_interval_ms: i64,
}

impl SyncStats {
    // ---
    /// Creates a new stats tracker.
    ///
    /// # Arguments
    ///
    /// * `now` - Current local time (epoch ms)
    /// * `log_interval_ms` - How often [`SyncStats::maybe_log`] actually logs
    pub fn new(now: i64, log_interval_ms: i64) -> Self {
        // ---
        Self {
            commands_applied: 0,
            commands_ignored: 0,
            commands_queued: 0,
            probes_resolved: 0,
            probes_failed: 0,
            drift_checks: 0,
            drift_checks_in_sync: 0,
            speed_corrections: 0,
            skip_corrections: 0,
            corrections_exhausted: 0,
            last_drift_ms: None,
            last_offset_ms: None,
            start_ms: now,
            last_log_ms: now,
            log_interval_ms,
        }
    }

    pub fn record_probe(&mut self, offset_ms: f64) {
        // ---
        self.probes_resolved += 1;
        self.last_offset_ms = Some(offset_ms);
    }

    pub fn record_probe_failure(&mut self) {
        // ---
        self.probes_failed += 1;
    }

    /// Records one drift check and the correction it chose.
    pub fn record_drift(&mut self, diff_ms: f64, correction: &Correction) {
        // ---
        self.drift_checks += 1;
        self.last_drift_ms = Some(diff_ms);

        match correction {
            Correction::InSync => self.drift_checks_in_sync += 1,
            Correction::Speed { .. } => self.speed_corrections += 1,
            Correction::Skip => self.skip_corrections += 1,
            Correction::Exhausted { .. } => self.corrections_exhausted += 1,
            Correction::Tolerated => {}
        }
    }

    /// Share of drift checks that found playback in sync.
    pub fn in_sync_percentage(&self) -> f64 {
        // ---
        if self.drift_checks == 0 {
            0.0
        } else {
            (self.drift_checks_in_sync as f64 / self.drift_checks as f64) * 100.0
        }
    }

    /// Commands applied per minute since start.
    pub fn commands_per_minute(&self, now: i64) -> f64 {
        // ---
        let elapsed_min = (now - self.start_ms) as f64 / 60_000.0;
        if elapsed_min <= 0.0 {
            0.0
        } else {
            self.commands_applied as f64 / elapsed_min
        }
    }

    /// Logs statistics if the interval has elapsed.
    pub fn maybe_log(&mut self, now: i64) {
        // ---
        if now - self.last_log_ms >= self.log_interval_ms {
            self.log(now);
            self.last_log_ms = now;
        }
    }

    /// Force log current statistics.
    pub fn log(&self, now: i64) {
        // ---
        info!(
            "Sync Stats: {} cmds ({:.2}/min, {} ignored), offset {}, drift {}, {:.1}% in sync, {} speed / {} skip corrections",
            self.commands_applied,
            self.commands_per_minute(now),
            self.commands_ignored,
            fmt_ms(self.last_offset_ms),
            fmt_ms(self.last_drift_ms),
            self.in_sync_percentage(),
            self.speed_corrections,
            self.skip_corrections
        );
    }
}

fn fmt_ms(value: Option<f64>) -> String {
    // ---
    match value {
        Some(ms) => format!("{ms:.1}ms"),
        None => "n/a".to_string(),
    }
}

impl Default for SyncStats {
    fn default() -> Self {
        // ---
        Self::new(0, 5_000)
    }
}
