//! Clock-offset estimation against a reference clock.
//!
//! A probe is a four-timestamp exchange (NTP style). Each resolved probe
//! yields one [`ClockSample`]; the [`ClockFilter`] keeps the most recent
//! samples and reports a trimmed mean so a single asymmetric round trip
//! cannot drag the estimate around.
//!
//! The synchronizer itself performs no IO. Callers either drive it through
//! [`ClockSynchronizer::begin_probe`] / [`ClockSynchronizer::resolve_probe`]
//! (message based exchanges, e.g. peer pings) or use the async
//! [`ClockSynchronizer::probe`] against a [`TimeSource`].

use crate::error::{Result, SyncError};
use crate::time::Clock;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::debug;

/// Number of samples kept by the filter.
pub const TRACKED_SAMPLES: usize = 8;

/// Probe interval while converging.
pub const GREEDY_INTERVAL_MS: i64 = 1_000;

/// Probe interval once converged.
pub const LOW_PROFILE_INTERVAL_MS: i64 = 60_000;

/// Probes sent at the greedy interval after a reset.
pub const GREEDY_PROBE_COUNT: u32 = 3;

/// One complete probe exchange.
///
/// All four values are epoch milliseconds; the middle two come from the
/// remote clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSample {
    // ---
    /// Local time the request left.
    pub request_sent: i64,

    /// Remote time the request arrived.
    pub request_received: i64,

    /// Remote time the response left.
    pub response_sent: i64,

    /// Local time the response arrived.
    pub response_received: i64,
}

impl ClockSample {
    // ---
    /// Remote clock minus local clock, in milliseconds.
    pub fn offset_ms(&self) -> f64 {
        // ---
        ((self.request_received - self.request_sent) + (self.response_sent - self.response_received))
            as f64
            / 2.0
    }

    /// Network round trip excluding remote processing time.
    pub fn round_trip_ms(&self) -> i64 {
        // ---
        let total = self.response_received - self.request_sent;
        let remote = self.response_sent - self.request_received;
        (total - remote).max(0)
    }

    /// One-way latency estimate.
    pub fn latency_ms(&self) -> f64 {
        // ---
        self.round_trip_ms() as f64 / 2.0
    }
}

/// The remote half of a probe exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteTimestamps {
    // ---
    pub request_received: i64,
    pub response_sent: i64,
}

/// Current best estimate of the remote clock.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OffsetEstimate {
    // ---
    /// Remote clock minus local clock.
    pub offset_ms: f64,

    /// Filtered round trip.
    pub round_trip_ms: f64,
}

impl OffsetEstimate {
    // ---
    pub fn latency_ms(&self) -> f64 {
        // ---
        self.round_trip_ms / 2.0
    }

    /// Maps a remote timestamp onto the local clock.
    pub fn remote_to_local(&self, remote_ms: i64) -> i64 {
        // ---
        remote_ms - self.offset_ms.round() as i64
    }

    /// Maps a local timestamp onto the remote clock.
    pub fn local_to_remote(&self, local_ms: i64) -> i64 {
        // ---
        local_ms + self.offset_ms.round() as i64
    }
}

/// Outcome of one resolved probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeOutcome {
    pub sample: ClockSample,
    pub estimate: OffsetEstimate,
}

/// Mean of the values left after dropping a quarter from each end.
pub fn trimmed_mean(mut values: Vec<f64>) -> f64 {
    // ---
    if values.is_empty() {
        return 0.0;
    }

    values.sort_by(|a, b| a.total_cmp(b));
    let trim = values.len() / 4;
    let kept = &values[trim..values.len() - trim];
    kept.iter().sum::<f64>() / kept.len() as f64
}

/// Bounded sample history with trimmed-mean output.
#[derive(Debug, Clone)]
pub struct ClockFilter {
    // ---
    samples: VecDeque<ClockSample>,
    capacity: usize,
    estimate: Option<OffsetEstimate>,
}

impl ClockFilter {
    // ---
    pub fn new(capacity: usize) -> Self {
        // ---
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            estimate: None,
        }
    }

    /// Adds a sample, evicting the oldest past capacity, and returns the new estimate.
    pub fn push(&mut self, sample: ClockSample) -> OffsetEstimate {
        // ---
        self.samples.push_back(sample);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }

        let offsets = self.samples.iter().map(ClockSample::offset_ms).collect();
        let round_trips = self
            .samples
            .iter()
            .map(|s| s.round_trip_ms() as f64)
            .collect();

        let estimate = OffsetEstimate {
            offset_ms: trimmed_mean(offsets),
            round_trip_ms: trimmed_mean(round_trips),
        };
        self.estimate = Some(estimate);
        estimate
    }

    pub fn estimate(&self) -> Option<OffsetEstimate> {
        // ---
        self.estimate
    }

    pub fn len(&self) -> usize {
        // ---
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        // ---
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        // ---
        self.samples.clear();
        self.estimate = None;
    }
}

/// Decides when the next probe is due.
///
/// Probes run at the greedy interval right after a reset so the estimate
/// converges quickly, then back off to the low-profile interval.
#[derive(Debug, Clone)]
pub struct ProbeSchedule {
    // ---
    greedy_remaining: u32,
    greedy_count: u32,
    greedy_interval_ms: i64,
    low_profile_interval_ms: i64,

    /// `None` means due immediately.
    next_due: Option<i64>,
}

impl ProbeSchedule {
    // ---
    pub fn new(greedy_count: u32, greedy_interval_ms: i64, low_profile_interval_ms: i64) -> Self {
        // ---
        Self {
            greedy_remaining: greedy_count,
            greedy_count,
            greedy_interval_ms,
            low_profile_interval_ms,
            next_due: None,
        }
    }

    /// Makes a probe due now and restarts the greedy phase.
    pub fn force_update(&mut self) {
        // ---
        self.greedy_remaining = self.greedy_count;
        self.next_due = None;
    }

    pub fn due_at(&self, now: i64) -> i64 {
        // ---
        self.next_due.unwrap_or(now)
    }

    pub fn is_due(&self, now: i64) -> bool {
        // ---
        self.due_at(now) <= now
    }

    /// Records that a probe went out at `now`.
    pub fn on_probe_started(&mut self, now: i64) {
        // ---
        let interval = if self.greedy_remaining > 0 {
            self.greedy_remaining -= 1;
            self.greedy_interval_ms
        } else {
            self.low_profile_interval_ms
        };
        self.next_due = Some(now + interval);
    }
}

impl Default for ProbeSchedule {
    fn default() -> Self {
        // ---
        Self::new(GREEDY_PROBE_COUNT, GREEDY_INTERVAL_MS, LOW_PROFILE_INTERVAL_MS)
    }
}

/// An in-flight probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTicket {
    pub id: u64,
    pub sent_at: i64,
    pub deadline: i64,
}

/// In-flight probes keyed by request id.
#[derive(Debug, Default)]
pub struct PendingProbes {
    // ---
    next_id: u64,
    pending: HashMap<u64, ProbeTicket>,
}

impl PendingProbes {
    // ---
    pub fn begin(&mut self, now: i64, timeout_ms: i64) -> ProbeTicket {
        // ---
        self.next_id += 1;
        let ticket = ProbeTicket {
            id: self.next_id,
            sent_at: now,
            deadline: now + timeout_ms,
        };
        self.pending.insert(ticket.id, ticket);
        ticket
    }

    pub fn take(&mut self, id: u64) -> Option<ProbeTicket> {
        // ---
        self.pending.remove(&id)
    }

    /// Removes and returns every probe whose deadline has passed.
    pub fn expire(&mut self, now: i64) -> Vec<ProbeTicket> {
        // ---
        let expired: Vec<u64> = self
            .pending
            .values()
            .filter(|t| t.deadline <= now)
            .map(|t| t.id)
            .collect();

        let mut tickets: Vec<ProbeTicket> = expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect();
        tickets.sort_by_key(|t| t.id);
        tickets
    }

    pub fn next_deadline(&self) -> Option<i64> {
        // ---
        self.pending.values().map(|t| t.deadline).min()
    }

    pub fn len(&self) -> usize {
        // ---
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        // ---
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        // ---
        self.pending.clear();
    }
}

/// Clock synchronizer configuration.
#[derive(Debug, Clone)]
pub struct ClockSyncConfig {
    // ---
    /// Samples kept by the filter
    pub tracked_samples: usize,

    /// Deadline for a single probe
    pub probe_timeout_ms: i64,

    pub greedy_probe_count: u32,
    pub greedy_interval_ms: i64,
    pub low_profile_interval_ms: i64,
}

impl Default for ClockSyncConfig {
    fn default() -> Self {
        // ---
        Self {
            tracked_samples: TRACKED_SAMPLES,
            probe_timeout_ms: 5_000,
            greedy_probe_count: GREEDY_PROBE_COUNT,
            greedy_interval_ms: GREEDY_INTERVAL_MS,
            low_profile_interval_ms: LOW_PROFILE_INTERVAL_MS,
        }
    }
}

/// Something that can answer a time probe.
#[async_trait]
pub trait TimeSource: Send + Sync {
    /// Asks the remote side for its receive/transmit timestamps.
    async fn query_time(&self) -> anyhow::Result<RemoteTimestamps>;
}

/// Offset/latency estimator for one reference clock.
///
/// Retry policy and cadence belong to the caller; the synchronizer only
/// reports when a probe is due.
#[derive(Debug)]
pub struct ClockSynchronizer {
    // ---
    config: ClockSyncConfig,
    filter: ClockFilter,
    pending: PendingProbes,
    schedule: ProbeSchedule,
}

impl ClockSynchronizer {
    // ---
    pub fn new(config: ClockSyncConfig) -> Self {
        // ---
        let filter = ClockFilter::new(config.tracked_samples);
        let schedule = ProbeSchedule::new(
            config.greedy_probe_count,
            config.greedy_interval_ms,
            config.low_profile_interval_ms,
        );
        Self {
            config,
            filter,
            pending: PendingProbes::default(),
            schedule,
        }
    }

    /// Registers an outgoing probe.
    pub fn begin_probe(&mut self, now: i64) -> ProbeTicket {
        // ---
        self.schedule.on_probe_started(now);
        self.pending.begin(now, self.config.probe_timeout_ms)
    }

    /// Completes probe `id` with the remote timestamps received at `now`.
    pub fn resolve_probe(
        &mut self,
        id: u64,
        remote: RemoteTimestamps,
        now: i64,
    ) -> Result<ProbeOutcome> {
        // ---
        let ticket = self.pending.take(id).ok_or(SyncError::UnknownProbe(id))?;

        let sample = ClockSample {
            request_sent: ticket.sent_at,
            request_received: remote.request_received,
            response_sent: remote.response_sent,
            response_received: now,
        };
        let estimate = self.filter.push(sample);

        debug!(
            "probe {} resolved: sample offset={:.1}ms rtt={}ms -> estimate offset={:.1}ms rtt={:.1}ms",
            id,
            sample.offset_ms(),
            sample.round_trip_ms(),
            estimate.offset_ms,
            estimate.round_trip_ms
        );

        Ok(ProbeOutcome { sample, estimate })
    }

    /// Drops probe `id` after a transport failure.
    pub fn fail_probe(&mut self, id: u64, reason: impl Into<String>) -> SyncError {
        // ---
        match self.pending.take(id) {
            Some(_) => SyncError::ProbeFailed {
                id,
                reason: reason.into(),
            },
            None => SyncError::UnknownProbe(id),
        }
    }

    /// Drops probe `id` after its deadline passed elsewhere (e.g. an async timeout).
    ///
    /// An id that is no longer pending yields `UnknownProbe`.
    pub fn cancel_probe(&mut self, id: u64, now: i64) -> SyncError {
        // ---
        match self.pending.take(id) {
            Some(ticket) => SyncError::ProbeTimeout {
                id,
                waited_ms: now - ticket.sent_at,
            },
            None => SyncError::UnknownProbe(id),
        }
    }

    /// Forgets every in-flight request. Answers that arrive later resolve as
    /// `UnknownProbe`. Returns how many were dropped.
    pub fn cancel_all(&mut self) -> usize {
        // ---
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    /// Expires overdue probes.
    pub fn expire_probes(&mut self, now: i64) -> Vec<SyncError> {
        // ---
        self.pending
            .expire(now)
            .into_iter()
            .map(|t| SyncError::ProbeTimeout {
                id: t.id,
                waited_ms: now - t.sent_at,
            })
            .collect()
    }

    pub fn current_offset(&self) -> OffsetEstimate {
        // ---
        self.filter.estimate().unwrap_or_default()
    }

    pub fn has_estimate(&self) -> bool {
        // ---
        self.filter.estimate().is_some()
    }

    /// Requests an immediate probe and a fresh greedy phase.
    pub fn force_update(&mut self) {
        // ---
        self.schedule.force_update();
    }

    /// Whether a new probe should go out now.
    pub fn is_probe_due(&self, now: i64) -> bool {
        // ---
        self.pending.is_empty() && self.schedule.is_due(now)
    }

    /// Next instant the caller needs to look at this synchronizer.
    pub fn next_wakeup(&self, now: i64) -> i64 {
        // ---
        match self.pending.next_deadline() {
            Some(deadline) => deadline,
            None => self.schedule.due_at(now),
        }
    }

    pub fn pending_probes(&self) -> usize {
        // ---
        self.pending.len()
    }

    pub fn probe_timeout(&self) -> Duration {
        // ---
        Duration::from_millis(self.config.probe_timeout_ms.max(0) as u64)
    }

    /// Forgets every sample and in-flight probe.
    pub fn reset(&mut self) {
        // ---
        self.filter.clear();
        self.pending.clear();
        self.schedule.force_update();
    }

    /// Runs one probe against `source`, failing with `ProbeTimeout` after `deadline`.
    pub async fn probe<S>(
        &mut self,
        source: &S,
        clock: &dyn Clock,
        deadline: Duration,
    ) -> Result<OffsetEstimate>
    where
        S: TimeSource + ?Sized,
    {
        // ---
        let ticket = self.begin_probe(clock.now_ms());

        match tokio::time::timeout(deadline, source.query_time()).await {
            Ok(Ok(remote)) => self
                .resolve_probe(ticket.id, remote, clock.now_ms())
                .map(|outcome| outcome.estimate),
            Ok(Err(e)) => Err(self.fail_probe(ticket.id, e.to_string())),
            Err(_) => Err(self.cancel_probe(ticket.id, clock.now_ms())),
        }
    }
}

impl Default for ClockSynchronizer {
    fn default() -> Self {
        // ---
        Self::new(ClockSyncConfig::default())
    }
}
