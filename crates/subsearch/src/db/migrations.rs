//! Schema versioning.
//!
//! The schema version lives in SQLite's `user_version` pragma. Each step
//! runs in its own transaction together with the version bump, so a
//! failed step leaves the database at the previous version.

use rusqlite::Connection;

use super::error::DatabaseError;

/// Ordered schema steps. Step `n` moves the database to version `n + 1`.
const STEPS: &[(&str, &str)] = &[
    ("create_jobs_table", include_str!("sql/001_create_jobs.sql")),
    ("create_items_table", include_str!("sql/002_create_items.sql")),
];

/// Version a fully migrated database reports.
pub fn latest_version() -> u32 {
    STEPS.len() as u32
}

pub fn schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

/// Brings the schema up to [`latest_version`].
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    let current = schema_version(conn)?;
    if current > latest_version() {
        return Err(DatabaseError::Migration {
            version: current,
            reason: format!(
                "database is newer than this build (supports up to v{})",
                latest_version()
            ),
        });
    }

    for (index, (name, sql)) in STEPS.iter().enumerate().skip(current as usize) {
        let version = index as u32 + 1;
        log::info!("Applying schema v{}: {}", version, name);

        let failed = |e: rusqlite::Error| DatabaseError::Migration {
            version,
            reason: e.to_string(),
        };
        let tx = conn.unchecked_transaction().map_err(failed)?;
        tx.execute_batch(sql).map_err(failed)?;
        tx.pragma_update(None, "user_version", version).map_err(failed)?;
        tx.commit().map_err(failed)?;
    }

    Ok(())
}
