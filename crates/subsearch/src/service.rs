//! The facade the front end and background producers talk to.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::catalog::CatalogClient;
use crate::config::Config;
use crate::db::item_repo::{self, ItemFilter, ItemRow};
use crate::db::job_repo::JobFilter;
use crate::db::stats_repo::{self, RollingStats};
use crate::db::{format_timestamp, Database};
use crate::discovery::MAX_BREADTH;
use crate::error::{JobError, Result};
use crate::job::{JobParams, JobRecord, JobSource, JobState, JobStore, Priority};
use crate::notify::Notifier;
use crate::runner::JobRunner;
use crate::scheduler::{PriorityScheduler, QueueListener, QueuePosition, SchedulerSettings};
use crate::sink::{ItemStore, Mirror};

pub const INTERRUPTED: &str = "Interrupted by restart";
pub const STALE: &str = "Job stuck in running state, marked as failed by cleanup";

/// Everything needed to create one job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub params: JobParams,
    pub source: JobSource,
    /// Overrides the source's default priority.
    pub priority: Option<Priority>,
    pub notification_target: Option<String>,
    pub retry_count: u32,
    pub retried_from: Option<String>,
}

impl JobRequest {
    pub fn new(params: JobParams, source: JobSource) -> Self {
        Self {
            params,
            source,
            priority: None,
            notification_target: None,
            retry_count: 0,
            retried_from: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_notification(mut self, target: impl Into<String>) -> Self {
        self.notification_target = Some(target.into());
        self
    }
}

/// Result of [`SearchService::request_stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Ok,
    AlreadyDone,
    Unknown,
}

/// Point-in-time view of a job for status polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub job_id: String,
    pub state: JobState,
    pub checked: u64,
    pub found: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs_ahead: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Owns the job store and the scheduler and wires the runner between them.
pub struct SearchService {
    config: Config,
    store: Arc<JobStore>,
    scheduler: PriorityScheduler,
    notifier: Arc<dyn Notifier>,
}

impl SearchService {
    pub fn new(
        config: Config,
        db: Database,
        catalog: Arc<dyn CatalogClient>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let mirror = Mirror::from_config(&config.mirror)?.map(Arc::new);
        if let Some(mirror) = &mirror {
            info!("Mirroring matched items to {}", mirror.endpoint());
        }
        let items: Arc<dyn ItemStore> = Arc::new(db.clone());
        Ok(Self::with_item_store(config, db, catalog, items, mirror, notifier))
    }

    /// Like [`SearchService::new`] with an explicit item store and mirror.
    pub fn with_item_store(
        config: Config,
        db: Database,
        catalog: Arc<dyn CatalogClient>,
        items: Arc<dyn ItemStore>,
        mirror: Option<Arc<Mirror>>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let store = Arc::new(JobStore::new(db));
        let runner = JobRunner::new(Arc::clone(&store), catalog, items, &config)
            .with_mirror(mirror)
            .with_notifier(Arc::clone(&notifier));
        let scheduler = PriorityScheduler::new(
            SchedulerSettings::from(&config.scheduler),
            Arc::new(runner),
            Arc::clone(&store) as Arc<dyn QueueListener>,
        );
        Self {
            config,
            store,
            scheduler,
            notifier,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &PriorityScheduler {
        &self.scheduler
    }

    pub fn database(&self) -> &Database {
        self.store.database()
    }

    /// Validates and normalizes parameters for a new job.
    ///
    /// Only user-originated jobs are held to the public result cap.
    pub fn normalize(
        &self,
        mut params: JobParams,
        source: JobSource,
    ) -> std::result::Result<JobParams, JobError> {
        let keyword = params.keyword.trim();
        if keyword.is_empty() {
            return Err(JobError::InvalidParams("keyword must not be empty".to_string()));
        }
        params.keyword = keyword.to_string();
        params.result_cap = if source.is_automated() {
            params.result_cap.max(1)
        } else {
            params
                .result_cap
                .clamp(1, self.config.crawl.public_limit_cap.max(1))
        };
        params.breadth = params.breadth.clamp(1, MAX_BREADTH);
        Ok(params)
    }

    /// Creates a job and queues it. Returns the new job id.
    pub fn submit(&self, request: JobRequest) -> Result<String> {
        let params = self.normalize(request.params, request.source)?;
        let priority = request
            .priority
            .unwrap_or_else(|| request.source.default_priority());
        let mut record = JobRecord::new(params, priority, request.source);
        record.notification_target = request.notification_target;
        record.retry_count = request.retry_count;
        record.retried_from = request.retried_from;

        let record = self.store.create(record)?;
        if let Err(e) = self.scheduler.enqueue(&record.id, priority) {
            warn!("Job {} could not be queued: {}", record.id, e);
            self.finish_and_notify(&record.id, JobState::Error, Some(e.to_string()));
            return Err(e.into());
        }
        info!(
            "Submitted job {} ({}, priority {}) for '{}'",
            record.id, record.source, priority, record.params.keyword
        );
        Ok(record.id)
    }

    /// Submits an interactive job at `priority`.
    pub fn submit_job(&self, params: JobParams, priority: Priority) -> Result<String> {
        self.submit(JobRequest::new(params, JobSource::Interactive).with_priority(priority))
    }

    pub fn get_job(&self, job_id: &str) -> Option<JobRecord> {
        self.store.get(job_id)
    }

    /// Best-effort status view, or `None` for an unknown id.
    pub fn get_status(&self, job_id: &str) -> Option<JobSnapshot> {
        let record = self.store.get(job_id)?;
        let live = if record.state == JobState::Queued {
            self.scheduler.position(job_id)
        } else {
            None
        };
        let (queue_position, jobs_ahead, eta_secs) = match (live, record.queue) {
            (Some(pos), _) => (
                Some(pos.position),
                Some(pos.jobs_ahead),
                Some(pos.eta_start.as_secs()),
            ),
            (None, Some(queue)) if record.state == JobState::Queued => {
                (Some(queue.position), Some(queue.jobs_ahead), Some(queue.eta_secs))
            }
            _ => (None, None, None),
        };
        Some(JobSnapshot {
            job_id: record.id,
            state: record.state,
            checked: record.checked,
            found: record.found,
            queue_position,
            jobs_ahead,
            eta_secs,
            error: record.error,
        })
    }

    /// Stops a queued or running job.
    ///
    /// A queued job goes straight to `stopped`. A running job is flagged and
    /// its token cancelled; the runner finishes it at its next check.
    pub fn request_stop(&self, job_id: &str) -> Result<StopOutcome> {
        let Some(record) = self.store.get(job_id) else {
            return Ok(StopOutcome::Unknown);
        };
        if record.state.is_terminal() {
            return Ok(StopOutcome::AlreadyDone);
        }

        self.store.request_stop(job_id)?;
        if self.scheduler.remove(job_id) {
            info!("Stopped queued job {}", job_id);
            self.finish_and_notify(job_id, JobState::Stopped, None);
            return Ok(StopOutcome::Ok);
        }
        if self.scheduler.cancel(job_id) {
            info!("Stop requested for running job {}", job_id);
            return Ok(StopOutcome::Ok);
        }

        // Neither queued nor running here, so no thread will finish it.
        match self.store.finish(job_id, JobState::Stopped, record.checked, record.found, None) {
            Ok(finished) => {
                self.notify(&finished);
                Ok(StopOutcome::Ok)
            }
            Err(JobError::InvalidTransition { .. }) => Ok(StopOutcome::AlreadyDone),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_queue(&self, limit: usize) -> Vec<QueuePosition> {
        self.scheduler.list_queue(limit)
    }

    /// The running job, if any. With more than one slot this is the
    /// lowest id; see [`SearchService::running_jobs`].
    pub fn get_running(&self) -> Option<String> {
        self.scheduler.running().into_iter().next()
    }

    pub fn running_jobs(&self) -> Vec<String> {
        self.scheduler.running()
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Result<(Vec<JobRecord>, u64)> {
        Ok(self.store.list(filter)?)
    }

    pub fn search_items(&self, filter: &ItemFilter) -> Result<(Vec<ItemRow>, u64)> {
        Ok(item_repo::query(self.store.database(), filter)?)
    }

    pub fn stats(&self, since: DateTime<Utc>) -> Result<RollingStats> {
        Ok(stats_repo::rolling_stats(
            self.store.database(),
            &format_timestamp(since),
        )?)
    }

    /// Reconciles persisted jobs after a restart.
    ///
    /// Returns the number of queued jobs put back in line.
    pub fn recover(&self) -> Result<usize> {
        for record in self.store.in_state(JobState::Running)? {
            warn!("Job {} was running at shutdown", record.id);
            self.finish_and_notify(&record.id, JobState::Error, Some(INTERRUPTED.to_string()));
        }

        let history = self.store.recent_durations(
            JobSource::Interactive,
            Duration::from_secs(self.config.scheduler.eta_outlier_secs),
            self.config.scheduler.eta_history,
        )?;
        debug!("Seeding ETA history with {} samples", history.len());
        self.scheduler.seed_history(history);

        let mut requeued = 0;
        for record in self.store.in_state(JobState::Queued)? {
            match self.scheduler.enqueue(&record.id, record.priority) {
                Ok(()) => requeued += 1,
                Err(e) => warn!("Could not requeue job {}: {}", record.id, e),
            }
        }
        if requeued > 0 {
            info!("Requeued {} jobs from a previous run", requeued);
        }
        Ok(requeued)
    }

    /// Forces running jobs that stopped reporting progress to `error` and
    /// frees their slots.
    pub fn sweep_stale(&self, stale_after: Duration) -> Result<Vec<String>> {
        let stale_after = chrono::Duration::from_std(stale_after)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = Utc::now() - stale_after;
        let mut swept = Vec::new();
        for record in self.store.stale_running(cutoff)? {
            warn!(
                "Job {} has not reported progress since {}, marking as failed",
                record.id, record.updated_at
            );
            if self.finish_and_notify(&record.id, JobState::Error, Some(STALE.to_string())) {
                swept.push(record.id.clone());
            }
            self.scheduler.release(&record.id);
        }
        Ok(swept)
    }

    /// Resubmits recently errored jobs that still have attempts left.
    pub fn retry_errored(
        &self,
        since: DateTime<Utc>,
        max_attempts: u32,
        batch: usize,
    ) -> Result<Vec<String>> {
        let mut retried = Vec::new();
        for record in self.store.retry_candidates(since, max_attempts, batch)? {
            let request = JobRequest {
                params: record.params.clone(),
                source: JobSource::Retry,
                priority: Some(Priority::RETRY),
                notification_target: record.notification_target.clone(),
                retry_count: record.retry_count + 1,
                retried_from: Some(record.id.clone()),
            };
            let new_id = match self.submit(request) {
                Ok(id) => id,
                Err(e) => {
                    warn!("Retry of job {} could not be submitted: {}", record.id, e);
                    continue;
                }
            };
            if let Err(e) = self
                .store
                .annotate_error(&record.id, &format!(" (retried as {})", new_id))
            {
                warn!("Could not annotate job {}: {}", record.id, e);
            }
            info!(
                "Retrying job {} as {} (attempt {})",
                record.id,
                new_id,
                record.retry_count + 1
            );
            retried.push(new_id);
        }
        Ok(retried)
    }

    /// Stops admitting, cancels running jobs and waits for them to wind down.
    pub fn shutdown(&self, grace: Duration) {
        self.scheduler.shutdown();
        let deadline = Instant::now() + grace;
        while self.scheduler.running_count() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        let left = self.scheduler.running_count();
        if left > 0 {
            warn!("{} jobs still running after shutdown grace period", left);
        }
    }

    fn finish_and_notify(&self, job_id: &str, state: JobState, message: Option<String>) -> bool {
        let current = self.store.get(job_id);
        let (checked, found) = current.map(|r| (r.checked, r.found)).unwrap_or((0, 0));
        match self.store.finish(job_id, state, checked, found, message) {
            Ok(record) => {
                self.notify(&record);
                true
            }
            Err(e) => {
                error!("Could not move job {} to {}: {}", job_id, state, e);
                false
            }
        }
    }

    fn notify(&self, record: &JobRecord) {
        if record.notification_target.is_none() {
            return;
        }
        if let Err(e) = self.notifier.job_finished(record) {
            warn!("Notification for job {} failed: {}", record.id, e);
        }
    }
}
