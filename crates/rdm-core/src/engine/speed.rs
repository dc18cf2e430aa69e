//! Sliding-window speed tracker for `realtime_speed` (§4.5): a 1-3 s window
//! over byte deltas, independent of the lifetime `average_speed`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(2);

/// Tracks `(instant, cumulative_bytes)` samples and reports bytes/sec over
/// the trailing window.
pub struct SpeedTracker {
    samples: VecDeque<(Instant, u64)>,
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self {
            samples: VecDeque::new(),
        }
    }
}

impl SpeedTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the current cumulative downloaded-bytes total and returns the
    /// instantaneous rate over the trailing window.
    pub fn sample(&mut self, now: Instant, cumulative_bytes: u64) -> f64 {
        self.samples.push_back((now, cumulative_bytes));
        while let Some(&(t, _)) = self.samples.front() {
            if now.duration_since(t) > WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        match (self.samples.front(), self.samples.back()) {
            (Some(&(t0, b0)), Some(&(t1, b1))) if t1 > t0 => {
                let elapsed = t1.duration_since(t0).as_secs_f64();
                (b1.saturating_sub(b0)) as f64 / elapsed
            }
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_sample_reports_zero() {
        let mut tracker = SpeedTracker::new();
        let now = Instant::now();
        assert_eq!(tracker.sample(now, 1000), 0.0);
    }

    #[test]
    fn rate_over_window_matches_byte_delta_over_elapsed() {
        let mut tracker = SpeedTracker::new();
        let t0 = Instant::now();
        tracker.sample(t0, 0);
        let t1 = t0 + Duration::from_millis(500);
        let rate = tracker.sample(t1, 5000);
        assert!((rate - 10_000.0).abs() < 1.0);
    }

    #[test]
    fn old_samples_fall_out_of_the_window() {
        let mut tracker = SpeedTracker::new();
        let t0 = Instant::now();
        tracker.sample(t0, 0);
        let t1 = t0 + Duration::from_secs(5);
        tracker.sample(t1, 1_000_000);
        let t2 = t1 + Duration::from_millis(200);
        let rate = tracker.sample(t2, 1_020_000);
        // t0's sample should have fallen out; only t1..t2 should count.
        assert!((rate - 100_000.0).abs() < 1.0);
    }
}
