//! Priority admission control for crawl jobs.
//!
//! The scheduler owns the queue and the running set. It knows nothing
//! about what a job does: execution goes through [`JobExecutor`] and
//! queue position updates go out through [`QueueListener`].

pub mod eta;
pub mod priority;

use std::time::Duration;

use serde::Serialize;

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::job::{CancellationToken, JobState, Priority};

pub use eta::EtaEstimator;
pub use priority::PriorityScheduler;

/// What an executor reports once a job's thread is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOutcome {
    pub state: JobState,
    pub elapsed: Duration,
    /// Whether this run should feed the ETA average.
    pub eta_sample: bool,
}

/// Runs one admitted job to a terminal state on the calling thread.
pub trait JobExecutor: Send + Sync {
    fn execute(&self, job_id: &str, token: CancellationToken) -> JobOutcome;

    /// The job was popped from the queue but could not be started.
    fn admission_failed(&self, job_id: &str, error: &SchedulerError);
}

/// Receives the full queue snapshot after every change.
pub trait QueueListener: Send + Sync {
    fn queue_changed(&self, queue: &[QueuePosition]);
}

/// A listener that discards updates.
pub struct NoopListener;

impl QueueListener for NoopListener {
    fn queue_changed(&self, _queue: &[QueuePosition]) {}
}

/// One queued job's place in line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuePosition {
    pub job_id: String,
    pub priority: Priority,
    /// 1-based.
    pub position: usize,
    pub jobs_ahead: usize,
    pub eta_start: Duration,
    pub eta_completion: Duration,
}

/// Runtime knobs, resolved from [`SchedulerConfig`].
#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub max_concurrency: usize,
    pub default_eta: Duration,
    pub eta_history: usize,
    pub eta_outlier: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for SchedulerSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrent_jobs.max(1),
            default_eta: Duration::from_secs(config.default_eta_secs),
            eta_history: config.eta_history,
            eta_outlier: Duration::from_secs(config.eta_outlier_secs),
        }
    }
}
