//! Sliding-window counters and percentile math.
//!
//! Each metric keeps `(timestamp, value)` samples for the trailing window;
//! cleanup happens lazily on read so the write path stays a push.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default observation window.
pub const WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct SlidingWindow {
    window: Duration,
    samples: Mutex<VecDeque<(Instant, f64)>>,
}

impl SlidingWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, value: f64) {
        self.samples.lock().push_back((Instant::now(), value));
    }

    fn pruned(&self) -> Vec<f64> {
        let cutoff = Instant::now() - self.window;
        let mut samples = self.samples.lock();
        while samples.front().is_some_and(|(t, _)| *t < cutoff) {
            samples.pop_front();
        }
        samples.iter().map(|(_, v)| *v).collect()
    }

    /// Events per second over the window.
    pub fn rate(&self) -> f64 {
        self.pruned().len() as f64 / self.window.as_secs_f64()
    }

    pub fn count(&self) -> usize {
        self.pruned().len()
    }

    pub fn sum(&self) -> f64 {
        self.pruned().iter().sum()
    }

    /// `(avg, p50, p90, p99)` over current values; zeros when empty.
    pub fn stats(&self) -> WindowStats {
        let mut values = self.pruned();
        if values.is_empty() {
            return WindowStats::default();
        }
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let avg = values.iter().sum::<f64>() / values.len() as f64;
        WindowStats {
            avg,
            p50: percentile(&values, 50.0),
            p90: percentile(&values, 90.0),
            p99: percentile(&values, 99.0),
        }
    }
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self::new(WINDOW)
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct WindowStats {
    pub avg: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

/// Nearest-rank percentile over an ascending-sorted slice.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() - 1) as f64 * p / 100.0).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}
