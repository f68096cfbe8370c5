//! Write-through job store: live records in memory, every change in the database.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::progress::{JobEvent, JobProgressBroadcaster};
use super::record::{JobRecord, JobSource, JobState, QueueMetadata};
use crate::db::job_repo::{self, JobFilter};
use crate::db::{format_timestamp, parse_timestamp, Database, DatabaseError};
use crate::error::JobError;
use crate::scheduler::{QueuePosition, QueueListener};

/// Persistent job store backed by rusqlite.
///
/// Non-terminal records are cached so status polling never touches SQLite.
/// Every mutation is written through before it is broadcast; a record
/// leaves the cache once its terminal state is durable.
pub struct JobStore {
    db: Database,
    cache: RwLock<HashMap<String, JobRecord>>,
    progress: JobProgressBroadcaster,
}

impl JobStore {
    pub fn new(db: Database) -> Self {
        Self::with_broadcaster(db, JobProgressBroadcaster::default())
    }

    pub fn with_broadcaster(db: Database, progress: JobProgressBroadcaster) -> Self {
        Self {
            db,
            cache: RwLock::new(HashMap::new()),
            progress,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn progress(&self) -> &JobProgressBroadcaster {
        &self.progress
    }

    fn read_cache(&self) -> RwLockReadGuard<'_, HashMap<String, JobRecord>> {
        match self.cache.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Job store cache lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write_cache(&self) -> RwLockWriteGuard<'_, HashMap<String, JobRecord>> {
        match self.cache.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Job store cache lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn persist_error(job_id: &str, source: DatabaseError) -> JobError {
        JobError::Persist {
            job_id: job_id.to_string(),
            source,
        }
    }

    /// Persists a new record and starts tracking it.
    pub fn create(&self, record: JobRecord) -> Result<JobRecord, JobError> {
        job_repo::insert(&self.db, &record.to_row())
            .map_err(|e| Self::persist_error(&record.id, e))?;
        self.write_cache().insert(record.id.clone(), record.clone());
        self.progress.send(JobEvent::from_record(&record));
        log::debug!(
            "Created job {} ({}, priority {}) for '{}'",
            record.id,
            record.source,
            record.priority,
            record.params.keyword
        );
        Ok(record)
    }

    /// Returns a job by ID, checking the cache then the database.
    pub fn get(&self, job_id: &str) -> Option<JobRecord> {
        if let Some(record) = self.read_cache().get(job_id) {
            return Some(record.clone());
        }
        match job_repo::find_by_id(&self.db, job_id) {
            Ok(Some(row)) => match JobRecord::from_row(&row) {
                Ok(record) => Some(record),
                Err(e) => {
                    log::error!("Stored job {} is unreadable: {}", job_id, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                log::error!("Failed to load job {}: {}", job_id, e);
                None
            }
        }
    }

    /// Applies `f` to the record under the cache lock and writes it through.
    ///
    /// The in-memory copy is updated even if persisting fails, so observers
    /// in this process still see the latest state.
    fn mutate<F>(&self, job_id: &str, f: F) -> Result<JobRecord, JobError>
    where
        F: FnOnce(&mut JobRecord) -> Result<(), JobError>,
    {
        let mut cache = self.write_cache();
        let mut record = match cache.get(job_id) {
            Some(record) => record.clone(),
            None => {
                let row = job_repo::find_by_id(&self.db, job_id)
                    .map_err(|e| Self::persist_error(job_id, e))?
                    .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
                JobRecord::from_row(&row).map_err(|e| Self::persist_error(job_id, e))?
            }
        };

        f(&mut record)?;

        let persisted = job_repo::update(&self.db, &record.to_row());
        if record.state.is_terminal() && persisted.is_ok() {
            cache.remove(job_id);
        } else {
            cache.insert(job_id.to_string(), record.clone());
        }
        drop(cache);

        self.progress.send(JobEvent::from_record(&record));
        persisted.map_err(|e| Self::persist_error(job_id, e))?;
        Ok(record)
    }

    /// `queued → running`.
    pub fn mark_running(&self, job_id: &str) -> Result<JobRecord, JobError> {
        self.mutate(job_id, |record| record.transition(JobState::Running))
    }

    /// Records progress on a running job. Ignored once the job is terminal.
    pub fn update_progress(&self, job_id: &str, checked: u64, found: u64) -> Result<(), JobError> {
        self.mutate(job_id, |record| {
            if record.state == JobState::Running {
                record.set_progress(checked, found);
            }
            Ok(())
        })
        .map(|_| ())
    }

    /// Moves a job into a terminal state with its final counts.
    pub fn finish(
        &self,
        job_id: &str,
        state: JobState,
        checked: u64,
        found: u64,
        error: Option<String>,
    ) -> Result<JobRecord, JobError> {
        self.mutate(job_id, |record| {
            if record.state == JobState::Running {
                record.set_progress(checked, found);
            }
            record.transition(state)?;
            if error.is_some() {
                record.error = error;
            }
            Ok(())
        })
    }

    /// Flags a live job as stop-requested. Terminal jobs are left untouched.
    pub fn request_stop(&self, job_id: &str) -> Result<JobRecord, JobError> {
        self.mutate(job_id, |record| {
            if !record.state.is_terminal() {
                record.stop_requested = true;
                record.updated_at = Utc::now();
            }
            Ok(())
        })
    }

    /// Appends a note to a finished job's error text. State is unchanged.
    pub fn annotate_error(&self, job_id: &str, note: &str) -> Result<JobRecord, JobError> {
        self.mutate(job_id, |record| {
            let base = record.error.take().unwrap_or_default();
            record.error = Some(format!("{}{}", base, note));
            record.updated_at = Utc::now();
            Ok(())
        })
    }

    fn set_queue(&self, job_id: &str, queue: QueueMetadata) -> Result<(), JobError> {
        let unchanged = self
            .read_cache()
            .get(job_id)
            .map(|r| r.state != JobState::Queued || r.queue == Some(queue))
            .unwrap_or(false);
        if unchanged {
            return Ok(());
        }
        self.mutate(job_id, |record| {
            if record.state == JobState::Queued {
                record.queue = Some(queue);
                record.updated_at = Utc::now();
            }
            Ok(())
        })
        .map(|_| ())
    }

    fn load_rows(
        &self,
        rows: Result<Vec<job_repo::JobRow>, DatabaseError>,
    ) -> Result<Vec<JobRecord>, DatabaseError> {
        let rows = rows?;
        let cache = self.read_cache();
        rows.iter()
            .map(|row| match cache.get(&row.id) {
                Some(live) => Ok(live.clone()),
                None => JobRecord::from_row(row),
            })
            .collect()
    }

    /// Queries jobs with filters and pagination, newest first.
    pub fn list(&self, filter: &JobFilter) -> Result<(Vec<JobRecord>, u64), DatabaseError> {
        let (rows, total) = job_repo::query(&self.db, filter)?;
        Ok((self.load_rows(Ok(rows))?, total))
    }

    /// Every job in `state`, oldest first.
    pub fn in_state(&self, state: JobState) -> Result<Vec<JobRecord>, DatabaseError> {
        self.load_rows(job_repo::find_by_state(&self.db, state.as_str()))
    }

    /// Running jobs with no progress written since `cutoff`.
    pub fn stale_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobRecord>, DatabaseError> {
        self.load_rows(job_repo::find_stale_running(&self.db, &format_timestamp(cutoff)))
    }

    /// Errored jobs eligible for retry, oldest failure first.
    pub fn retry_candidates(
        &self,
        since: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<JobRecord>, DatabaseError> {
        self.load_rows(job_repo::find_retry_candidates(
            &self.db,
            &format_timestamp(since),
            max_attempts,
            limit,
        ))
    }

    /// Queued plus running jobs.
    pub fn count_active(&self) -> Result<u64, DatabaseError> {
        Ok(job_repo::count_by_state(&self.db, JobState::Queued.as_str())?
            + job_repo::count_by_state(&self.db, JobState::Running.as_str())?)
    }

    pub fn last_finished_at(&self) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        Ok(job_repo::latest_completed_at(&self.db)?
            .as_deref()
            .and_then(parse_timestamp))
    }

    /// Durations of recent completed jobs from `source`, newest first.
    pub fn recent_durations(
        &self,
        source: JobSource,
        below: Duration,
        limit: usize,
    ) -> Result<Vec<Duration>, DatabaseError> {
        let below_ms = below.as_millis().min(i64::MAX as u128) as i64;
        Ok(job_repo::recent_durations(&self.db, source.as_str(), below_ms, limit)?
            .into_iter()
            .map(|ms| Duration::from_millis(ms.max(0) as u64))
            .collect())
    }

    pub fn has_active_keyword(&self, keyword: &str) -> Result<bool, DatabaseError> {
        job_repo::has_active_keyword(&self.db, keyword.trim())
    }
}

impl QueueListener for JobStore {
    fn queue_changed(&self, queue: &[QueuePosition]) {
        for entry in queue {
            let metadata = QueueMetadata {
                position: entry.position,
                jobs_ahead: entry.jobs_ahead,
                eta_secs: entry.eta_start.as_secs(),
            };
            if let Err(e) = self.set_queue(&entry.job_id, metadata) {
                log::warn!("Failed to record queue position for job {}: {}", entry.job_id, e);
            }
        }
    }
}
