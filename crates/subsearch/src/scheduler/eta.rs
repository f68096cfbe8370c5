//! Rolling estimate of how long one job takes.

use std::collections::VecDeque;
use std::time::Duration;

/// Average of the most recent sample durations, with a fixed fallback.
///
/// Samples at or above the outlier cap are discarded so a single runaway
/// crawl does not inflate every queued job's estimate.
#[derive(Debug, Clone)]
pub struct EtaEstimator {
    history: VecDeque<Duration>,
    capacity: usize,
    fallback: Duration,
    outlier: Duration,
}

impl EtaEstimator {
    pub fn new(capacity: usize, fallback: Duration, outlier: Duration) -> Self {
        Self {
            history: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            fallback,
            outlier,
        }
    }

    /// Adds a sample. Returns false if it was rejected as an outlier.
    pub fn record(&mut self, duration: Duration) -> bool {
        if duration >= self.outlier {
            return false;
        }
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(duration);
        true
    }

    /// Seeds from samples ordered newest first.
    pub fn seed(&mut self, newest_first: impl IntoIterator<Item = Duration>) {
        let mut samples: Vec<Duration> = newest_first.into_iter().take(self.capacity).collect();
        samples.reverse();
        for sample in samples {
            self.record(sample);
        }
    }

    pub fn average(&self) -> Duration {
        if self.history.is_empty() {
            return self.fallback;
        }
        let total: Duration = self.history.iter().sum();
        total / self.history.len() as u32
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}
