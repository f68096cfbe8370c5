//! The persisted job record and its lifecycle state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::job_repo::JobRow;
use crate::db::{format_timestamp, parse_timestamp, DatabaseError};
use crate::error::JobError;

/// Lifecycle state of a job.
///
/// `queued → running → {complete | stopped | error}`, plus `queued → stopped`
/// for jobs cancelled before admission. Terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Complete,
    Stopped,
    Error,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Complete => "complete",
            JobState::Stopped => "stopped",
            JobState::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobState::Queued),
            "running" => Some(JobState::Running),
            "complete" => Some(JobState::Complete),
            "stopped" => Some(JobState::Stopped),
            "error" => Some(JobState::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Stopped | JobState::Error)
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Stopped)
                | (Queued, Error)
                | (Running, Complete)
                | (Running, Stopped)
                | (Running, Error)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lower values are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub u8);

impl Priority {
    pub const INTERACTIVE: Priority = Priority(0);
    pub const RETRY: Priority = Priority(5);
    pub const AUTOMATED: Priority = Priority(9);
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who asked for the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSource {
    Interactive,
    Retry,
    AutoRandom,
    AutoIngest,
}

impl JobSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobSource::Interactive => "interactive",
            JobSource::Retry => "retry",
            JobSource::AutoRandom => "auto_random",
            JobSource::AutoIngest => "auto_ingest",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "interactive" => Some(JobSource::Interactive),
            "retry" => Some(JobSource::Retry),
            "auto_random" => Some(JobSource::AutoRandom),
            "auto_ingest" => Some(JobSource::AutoIngest),
            _ => None,
        }
    }

    pub fn default_priority(&self) -> Priority {
        match self {
            JobSource::Interactive => Priority::INTERACTIVE,
            JobSource::Retry => Priority::RETRY,
            JobSource::AutoRandom | JobSource::AutoIngest => Priority::AUTOMATED,
        }
    }

    pub fn is_automated(&self) -> bool {
        matches!(self, JobSource::AutoRandom | JobSource::AutoIngest)
    }
}

impl fmt::Display for JobSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Activity-window filter on an item's newest post.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "thresholdUtc")]
pub enum ActivityFilter {
    #[default]
    Any,
    /// Newest post at or after this unix time.
    ActiveAfter(i64),
    /// Newest post strictly before this unix time.
    InactiveBefore(i64),
}

impl ActivityFilter {
    pub fn is_active(&self) -> bool {
        !matches!(self, ActivityFilter::Any)
    }

    fn mode(&self) -> &'static str {
        match self {
            ActivityFilter::Any => "any",
            ActivityFilter::ActiveAfter(_) => "active_after",
            ActivityFilter::InactiveBefore(_) => "inactive_before",
        }
    }

    fn threshold(&self) -> Option<i64> {
        match self {
            ActivityFilter::Any => None,
            ActivityFilter::ActiveAfter(t) | ActivityFilter::InactiveBefore(t) => Some(*t),
        }
    }

    fn from_parts(mode: &str, threshold: Option<i64>) -> Option<Self> {
        match (mode, threshold) {
            ("any", _) => Some(ActivityFilter::Any),
            ("active_after", Some(t)) => Some(ActivityFilter::ActiveAfter(t)),
            ("inactive_before", Some(t)) => Some(ActivityFilter::InactiveBefore(t)),
            _ => None,
        }
    }
}

/// Search parameters. Immutable once the job is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobParams {
    pub keyword: String,
    pub result_cap: usize,
    pub breadth: u8,
    #[serde(default)]
    pub unmoderated_only: bool,
    #[serde(default)]
    pub exclude_nsfw: bool,
    #[serde(default)]
    pub min_subscribers: u64,
    #[serde(default)]
    pub activity: ActivityFilter,
}

impl JobParams {
    pub fn new(keyword: impl Into<String>, result_cap: usize) -> Self {
        Self {
            keyword: keyword.into(),
            result_cap,
            breadth: 5,
            unmoderated_only: false,
            exclude_nsfw: false,
            min_subscribers: 0,
            activity: ActivityFilter::Any,
        }
    }
}

/// Position of a queued job, valid only while it is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetadata {
    /// 1-based position among queued jobs.
    pub position: usize,
    pub jobs_ahead: usize,
    pub eta_secs: u64,
}

/// One crawl request and everything observed about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub source: JobSource,
    pub priority: Priority,
    pub state: JobState,
    pub params: JobParams,
    pub checked: u64,
    pub found: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub stop_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_target: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retried_from: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// A fresh queued record with a random id.
    pub fn new(params: JobParams, priority: Priority, source: JobSource) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source,
            priority,
            state: JobState::Queued,
            params,
            checked: 0,
            found: 0,
            queue: None,
            result_count: None,
            duration_ms: None,
            error: None,
            stop_requested: false,
            notification_target: None,
            retry_count: 0,
            retried_from: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Moves to `next`, maintaining timestamps and queue metadata.
    pub fn transition(&mut self, next: JobState) -> Result<(), JobError> {
        if !self.state.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                job_id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        let now = Utc::now();
        self.state = next;
        self.queue = None;
        self.updated_at = now;
        match next {
            JobState::Running => self.started_at = Some(now),
            JobState::Queued => {}
            JobState::Complete | JobState::Stopped | JobState::Error => {
                self.completed_at = Some(now);
                self.result_count = Some(self.found);
                self.duration_ms = self
                    .started_at
                    .map(|start| (now - start).num_milliseconds().max(0) as u64);
            }
        }
        Ok(())
    }

    /// Records progress. `found` never exceeds `checked`.
    pub fn set_progress(&mut self, checked: u64, found: u64) {
        self.checked = checked.max(self.checked);
        self.found = found.max(self.found).min(self.checked);
        self.updated_at = Utc::now();
    }

    pub fn to_row(&self) -> JobRow {
        JobRow {
            id: self.id.clone(),
            source: self.source.as_str().to_string(),
            priority: i64::from(self.priority.0),
            state: self.state.as_str().to_string(),
            keyword: self.params.keyword.clone(),
            result_cap: self.params.result_cap as i64,
            breadth: i64::from(self.params.breadth),
            unmoderated_only: self.params.unmoderated_only,
            exclude_nsfw: self.params.exclude_nsfw,
            min_subscribers: self.params.min_subscribers.min(i64::MAX as u64) as i64,
            activity_mode: self.params.activity.mode().to_string(),
            activity_threshold_utc: self.params.activity.threshold(),
            checked_count: self.checked as i64,
            found_count: self.found as i64,
            result_count: self.result_count.map(|c| c as i64),
            queue_position: self.queue.map(|q| q.position as i64),
            jobs_ahead: self.queue.map(|q| q.jobs_ahead as i64),
            eta_secs: self.queue.map(|q| q.eta_secs as i64),
            error: self.error.clone(),
            stop_requested: self.stop_requested,
            notification_target: self.notification_target.clone(),
            retry_count: i64::from(self.retry_count),
            retried_from: self.retried_from.clone(),
            duration_ms: self.duration_ms.map(|d| d as i64),
            created_at: format_timestamp(self.created_at),
            started_at: self.started_at.map(format_timestamp),
            completed_at: self.completed_at.map(format_timestamp),
            updated_at: format_timestamp(self.updated_at),
        }
    }

    pub fn from_row(row: &JobRow) -> Result<Self, DatabaseError> {
        let invalid = |column: &str, value: &str| DatabaseError::InvalidValue {
            column: column.to_string(),
            value: value.to_string(),
        };

        let state = JobState::parse(&row.state).ok_or_else(|| invalid("state", &row.state))?;
        let source = JobSource::parse(&row.source).ok_or_else(|| invalid("source", &row.source))?;
        let activity = ActivityFilter::from_parts(&row.activity_mode, row.activity_threshold_utc)
            .ok_or_else(|| invalid("activity_mode", &row.activity_mode))?;
        let created_at =
            parse_timestamp(&row.created_at).ok_or_else(|| invalid("created_at", &row.created_at))?;

        let queue = match (row.queue_position, row.jobs_ahead, row.eta_secs) {
            (Some(position), Some(ahead), Some(eta)) if state == JobState::Queued => {
                Some(QueueMetadata {
                    position: position.max(0) as usize,
                    jobs_ahead: ahead.max(0) as usize,
                    eta_secs: eta.max(0) as u64,
                })
            }
            _ => None,
        };

        Ok(Self {
            id: row.id.clone(),
            source,
            priority: Priority(row.priority.clamp(0, i64::from(u8::MAX)) as u8),
            state,
            params: JobParams {
                keyword: row.keyword.clone(),
                result_cap: row.result_cap.max(0) as usize,
                breadth: row.breadth.clamp(0, i64::from(u8::MAX)) as u8,
                unmoderated_only: row.unmoderated_only,
                exclude_nsfw: row.exclude_nsfw,
                min_subscribers: row.min_subscribers.max(0) as u64,
                activity,
            },
            checked: row.checked_count.max(0) as u64,
            found: row.found_count.max(0) as u64,
            queue,
            result_count: row.result_count.map(|c| c.max(0) as u64),
            duration_ms: row.duration_ms.map(|d| d.max(0) as u64),
            error: row.error.clone(),
            stop_requested: row.stop_requested,
            notification_target: row.notification_target.clone(),
            retry_count: row.retry_count.clamp(0, i64::from(u32::MAX)) as u32,
            retried_from: row.retried_from.clone(),
            created_at,
            started_at: row.started_at.as_deref().and_then(parse_timestamp),
            completed_at: row.completed_at.as_deref().and_then(parse_timestamp),
            updated_at: parse_timestamp(&row.updated_at).unwrap_or(created_at),
        })
    }
}
