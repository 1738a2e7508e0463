//! Rolling buffer of playback-position differences reported by a peer.
//!
//! Peers that asked for playback updates receive our local drift against
//! the group timeline. The buffer keeps the most recent samples and reports
//! a centered average that ignores the extremes at both ends.

use std::collections::VecDeque;

/// Diff buffer configuration.
#[derive(Debug, Clone)]
pub struct DiffBufferConfig {
    // ---
    /// Maximum samples kept
    pub capacity: usize,

    /// Samples that contribute to the average once the buffer is large enough
    pub window: usize,
}

impl Default for DiffBufferConfig {
    fn default() -> Self {
        // ---
        Self {
            capacity: 40,
            window: 25,
        }
    }
}

/// One reported difference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackDiffSample {
    /// Signed difference in milliseconds (positive: ahead of the group).
    pub diff_ms: f64,

    /// Local time the sample arrived.
    pub at_ms: i64,
}

/// Fixed-capacity FIFO of [`PlaybackDiffSample`]s.
///
/// # Example
///
/// ```
/// use peer::diff_buffer::{DiffBuffer, DiffBufferConfig};
///
/// let mut buffer = DiffBuffer::new(DiffBufferConfig::default());
/// buffer.push(12.0, 1_000);
/// buffer.push(-4.0, 2_000);
/// assert_eq!(buffer.average(), Some(4.0));
/// ```
#[derive(Debug, Clone)]
pub struct DiffBuffer {
    // ---
    config: DiffBufferConfig,
    samples: VecDeque<PlaybackDiffSample>,
}

impl DiffBuffer {
    // ---
    pub fn new(config: DiffBufferConfig) -> Self {
        // ---
        let samples = VecDeque::with_capacity(config.capacity);
        Self { config, samples }
    }

    /// Adds a sample, evicting the oldest one when full.
    pub fn push(&mut self, diff_ms: f64, at_ms: i64) {
        // ---
        if self.config.capacity == 0 {
            return;
        }
        while self.samples.len() >= self.config.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(PlaybackDiffSample { diff_ms, at_ms });
    }

    /// Average difference.
    ///
    /// With fewer than `window` samples every sample counts. Otherwise the
    /// samples are sorted and only the `window` values in the middle are
    /// averaged.
    pub fn average(&self) -> Option<f64> {
        // ---
        if self.samples.is_empty() {
            return None;
        }

        let mut values: Vec<f64> = self.samples.iter().map(|s| s.diff_ms).collect();
        if values.len() < self.config.window || self.config.window == 0 {
            return Some(values.iter().sum::<f64>() / values.len() as f64);
        }

        values.sort_by(|a, b| a.total_cmp(b));
        let start = (values.len() - self.config.window) / 2;
        let centered = &values[start..start + self.config.window];
        Some(centered.iter().sum::<f64>() / centered.len() as f64)
    }

    /// Most recent sample.
    pub fn latest(&self) -> Option<PlaybackDiffSample> {
        self.samples.back().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

impl Default for DiffBuffer {
    fn default() -> Self {
        Self::new(DiffBufferConfig::default())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_empty_buffer_has_no_average() {
        // ---
        let buffer = DiffBuffer::default();
        assert_eq!(buffer.average(), None);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_small_buffer_averages_everything() {
        // ---
        let mut buffer = DiffBuffer::default();
        for (i, diff) in [10.0, 20.0, 30.0, 1000.0].into_iter().enumerate() {
            buffer.push(diff, i as i64);
        }
        assert_eq!(buffer.average(), Some(265.0));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        // ---
        let mut buffer = DiffBuffer::default();
        for i in 0..45 {
            buffer.push(i as f64, i);
        }
        assert_eq!(buffer.len(), 40);
        assert_eq!(buffer.latest().map(|s| s.at_ms), Some(44));

        // Samples 5..45 remain; the centered 25 are 12..37
        let expected = (12..37).sum::<i64>() as f64 / 25.0;
        assert_eq!(buffer.average(), Some(expected));
    }

    #[test]
    fn test_centered_average_ignores_outliers() {
        // ---
        let mut buffer = DiffBuffer::default();
        for i in 0..25 {
            buffer.push(5.0, i);
        }
        // Two extremes at each end get dropped once the buffer passes the window
        buffer.push(-10_000.0, 25);
        buffer.push(-9_000.0, 26);
        buffer.push(9_000.0, 27);
        buffer.push(10_000.0, 28);

        assert_eq!(buffer.len(), 29);
        assert_eq!(buffer.average(), Some(5.0));
    }
}
