//! Job repository: CRUD and lifecycle queries for the `jobs` table.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// A raw job row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: String,
    pub source: String,
    pub priority: i64,
    pub state: String,
    pub keyword: String,
    pub result_cap: i64,
    pub breadth: i64,
    pub unmoderated_only: bool,
    pub exclude_nsfw: bool,
    pub min_subscribers: i64,
    pub activity_mode: String,
    pub activity_threshold_utc: Option<i64>,
    pub checked_count: i64,
    pub found_count: i64,
    pub result_count: Option<i64>,
    pub queue_position: Option<i64>,
    pub jobs_ahead: Option<i64>,
    pub eta_secs: Option<i64>,
    pub error: Option<String>,
    pub stop_requested: bool,
    pub notification_target: Option<String>,
    pub retry_count: i64,
    pub retried_from: Option<String>,
    pub duration_ms: Option<i64>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            source: row.get("source")?,
            priority: row.get("priority")?,
            state: row.get("state")?,
            keyword: row.get("keyword")?,
            result_cap: row.get("result_cap")?,
            breadth: row.get("breadth")?,
            unmoderated_only: row.get("unmoderated_only")?,
            exclude_nsfw: row.get("exclude_nsfw")?,
            min_subscribers: row.get("min_subscribers")?,
            activity_mode: row.get("activity_mode")?,
            activity_threshold_utc: row.get("activity_threshold_utc")?,
            checked_count: row.get("checked_count")?,
            found_count: row.get("found_count")?,
            result_count: row.get("result_count")?,
            queue_position: row.get("queue_position")?,
            jobs_ahead: row.get("jobs_ahead")?,
            eta_secs: row.get("eta_secs")?,
            error: row.get("error")?,
            stop_requested: row.get("stop_requested")?,
            notification_target: row.get("notification_target")?,
            retry_count: row.get("retry_count")?,
            retried_from: row.get("retried_from")?,
            duration_ms: row.get("duration_ms")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Query filter parameters for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub state: Option<String>,
    pub source: Option<String>,
    pub keyword: Option<String>,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Inserts a new job row.
pub fn insert(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO jobs (id, source, priority, state, keyword, result_cap, breadth,
             unmoderated_only, exclude_nsfw, min_subscribers, activity_mode,
             activity_threshold_utc, checked_count, found_count, result_count, queue_position,
             jobs_ahead, eta_secs, error, stop_requested, notification_target, retry_count,
             retried_from, duration_ms, created_at, started_at, completed_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
             ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28)",
            params![
                job.id,
                job.source,
                job.priority,
                job.state,
                job.keyword,
                job.result_cap,
                job.breadth,
                job.unmoderated_only,
                job.exclude_nsfw,
                job.min_subscribers,
                job.activity_mode,
                job.activity_threshold_utc,
                job.checked_count,
                job.found_count,
                job.result_count,
                job.queue_position,
                job.jobs_ahead,
                job.eta_secs,
                job.error,
                job.stop_requested,
                job.notification_target,
                job.retry_count,
                job.retried_from,
                job.duration_ms,
                job.created_at,
                job.started_at,
                job.completed_at,
                job.updated_at,
            ],
        )?;
        Ok(())
    })
}

/// Updates the mutable columns of a job. Parameters, `id`, and `created_at` never change.
pub fn update(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE jobs SET state=?2, checked_count=?3, found_count=?4, result_count=?5,
             queue_position=?6, jobs_ahead=?7, eta_secs=?8, error=?9, stop_requested=?10,
             duration_ms=?11, started_at=?12, completed_at=?13, updated_at=?14
             WHERE id=?1",
            params![
                job.id,
                job.state,
                job.checked_count,
                job.found_count,
                job.result_count,
                job.queue_position,
                job.jobs_ahead,
                job.eta_secs,
                job.error,
                job.stop_requested,
                job.duration_ms,
                job.started_at,
                job.completed_at,
                job.updated_at,
            ],
        )?;
        Ok(())
    })
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], JobRow::from_row)
            .optional()?;
        Ok(row)
    })
}

/// Queries jobs with filters, newest first, returning (rows, total_count).
pub fn query(db: &Database, filter: &JobFilter) -> Result<(Vec<JobRow>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref state) = filter.state {
            conditions.push(format!("state = ?{}", param_values.len() + 1));
            param_values.push(Box::new(state.clone()));
        }
        if let Some(ref source) = filter.source {
            conditions.push(format!("source = ?{}", param_values.len() + 1));
            param_values.push(Box::new(source.clone()));
        }
        if let Some(ref keyword) = filter.keyword {
            conditions.push(format!("keyword = ?{} COLLATE NOCASE", param_values.len() + 1));
            param_values.push(Box::new(keyword.clone()));
        }
        if let Some(ref from_date) = filter.from_date {
            conditions.push(format!("created_at >= ?{}", param_values.len() + 1));
            param_values.push(Box::new(from_date.clone()));
        }
        if let Some(ref to_date) = filter.to_date {
            conditions.push(format!("created_at <= ?{}", param_values.len() + 1));
            param_values.push(Box::new(to_date.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

        let limit = filter.limit.unwrap_or(100) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;
        param_values.push(Box::new(limit));
        param_values.push(Box::new(offset));
        let query_sql = format!(
            "SELECT * FROM jobs {} ORDER BY created_at DESC LIMIT ?{} OFFSET ?{}",
            where_clause,
            param_values.len() - 1,
            param_values.len()
        );

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&query_sql)?;
        let rows: Vec<JobRow> = stmt
            .query_map(params_ref.as_slice(), JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((rows, total))
    })
}

fn collect_rows(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::types::ToSql],
) -> Result<Vec<JobRow>, DatabaseError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, JobRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Counts jobs in the given state.
pub fn count_by_state(db: &Database, state: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE state = ?1",
            params![state],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// All jobs in a state, oldest first.
pub fn find_by_state(db: &Database, state: &str) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        collect_rows(
            conn,
            "SELECT * FROM jobs WHERE state = ?1 ORDER BY created_at ASC",
            &[&state],
        )
    })
}

/// Running jobs whose last write (start or progress) is earlier than the cutoff.
pub fn find_stale_running(db: &Database, idle_before: &str) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        collect_rows(
            conn,
            "SELECT * FROM jobs WHERE state = 'running' AND updated_at < ?1
             ORDER BY updated_at ASC",
            &[&idle_before],
        )
    })
}

/// Errored jobs eligible for another attempt, oldest failure first.
pub fn find_retry_candidates(
    db: &Database,
    finished_since: &str,
    max_attempts: u32,
    limit: usize,
) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        collect_rows(
            conn,
            "SELECT * FROM jobs WHERE state = 'error'
             AND source IN ('interactive', 'retry')
             AND completed_at IS NOT NULL AND completed_at >= ?1
             AND retry_count < ?2
             AND COALESCE(error, '') NOT LIKE '%stopped%'
             AND COALESCE(error, '') NOT LIKE '%retried as%'
             ORDER BY completed_at ASC LIMIT ?3",
            &[&finished_since, &(max_attempts as i64), &(limit as i64)],
        )
    })
}

/// Completion time of the most recently finished job, if any.
pub fn latest_completed_at(db: &Database) -> Result<Option<String>, DatabaseError> {
    db.with_conn(|conn| {
        let latest: Option<String> = conn.query_row(
            "SELECT MAX(completed_at) FROM jobs WHERE state IN ('complete', 'stopped', 'error')",
            [],
            |r| r.get(0),
        )?;
        Ok(latest)
    })
}

/// Durations of the most recent completed jobs from `source`, newest first.
pub fn recent_durations(
    db: &Database,
    source: &str,
    below_ms: i64,
    limit: usize,
) -> Result<Vec<i64>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT duration_ms FROM jobs WHERE state = 'complete' AND source = ?1
             AND duration_ms IS NOT NULL AND duration_ms < ?2
             ORDER BY completed_at DESC LIMIT ?3",
        )?;
        let durations = stmt
            .query_map(params![source, below_ms, limit as i64], |r| r.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(durations)
    })
}

/// Whether a queued or running job already exists for this keyword.
pub fn has_active_keyword(db: &Database, keyword: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE state IN ('queued', 'running')
             AND keyword = ?1 COLLATE NOCASE",
            params![keyword],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    })
}
