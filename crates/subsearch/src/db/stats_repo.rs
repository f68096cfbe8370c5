//! Rolling statistics over the jobs and items tables.

use rusqlite::params;
use serde::Serialize;

use super::{Database, DatabaseError};

/// Aggregate counters for a time window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollingStats {
    pub since: String,
    pub items_first_seen: u64,
    pub items_updated: u64,
    pub jobs_completed_interactive: u64,
    pub jobs_completed_automated: u64,
    pub jobs_failed: u64,
}

/// Counts activity at or after `since` (an RFC 3339 timestamp).
///
/// Interactive covers operator and retry submissions; automated covers
/// every background producer.
pub fn rolling_stats(db: &Database, since: &str) -> Result<RollingStats, DatabaseError> {
    db.with_conn(|conn| {
        let items_first_seen: u64 = conn.query_row(
            "SELECT COUNT(*) FROM items WHERE first_seen_at >= ?1",
            params![since],
            |r| r.get(0),
        )?;
        let items_updated: u64 = conn.query_row(
            "SELECT COUNT(*) FROM items WHERE updated_at >= ?1",
            params![since],
            |r| r.get(0),
        )?;

        let (interactive, automated, failed): (u64, u64, u64) = conn.query_row(
            "SELECT
               COALESCE(SUM(CASE WHEN state = 'complete' AND source IN ('interactive', 'retry') THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(CASE WHEN state = 'complete' AND source NOT IN ('interactive', 'retry') THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(CASE WHEN state = 'error' THEN 1 ELSE 0 END), 0)
             FROM jobs WHERE completed_at IS NOT NULL AND completed_at >= ?1",
            params![since],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )?;

        Ok(RollingStats {
            since: since.to_string(),
            items_first_seen,
            items_updated,
            jobs_completed_interactive: interactive,
            jobs_completed_automated: automated,
            jobs_failed: failed,
        })
    })
}
