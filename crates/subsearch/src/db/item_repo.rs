//! Item repository: batched merge-upsert and paged queries for the `items` table.

use std::collections::HashSet;

use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use super::{Database, DatabaseError};
use crate::catalog::CandidateItem;

/// A stored item. `name` is the lower-cased catalog key.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRow {
    pub name: String,
    pub display_name: String,
    pub display_name_prefixed: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub subscribers: Option<i64>,
    pub over18: bool,
    pub mod_count: Option<i64>,
    pub has_moderator: Option<bool>,
    pub last_activity_utc: Option<i64>,
    pub last_mod_activity_utc: Option<i64>,
    pub last_keyword: Option<String>,
    pub last_job_id: Option<String>,
    pub first_seen_at: String,
    pub updated_at: String,
}

impl ItemRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            name: row.get("name")?,
            display_name: row.get("display_name")?,
            display_name_prefixed: row.get("display_name_prefixed")?,
            title: row.get("title")?,
            description: row.get("description")?,
            url: row.get("url")?,
            subscribers: row.get("subscribers")?,
            over18: row.get("over18")?,
            mod_count: row.get("mod_count")?,
            has_moderator: row.get("has_moderator")?,
            last_activity_utc: row.get("last_activity_utc")?,
            last_mod_activity_utc: row.get("last_mod_activity_utc")?,
            last_keyword: row.get("last_keyword")?,
            last_job_id: row.get("last_job_id")?,
            first_seen_at: row.get("first_seen_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    /// Builds a row from an evaluated candidate observed by `job_id` while searching `keyword`.
    pub fn from_candidate(item: &CandidateItem, keyword: &str, job_id: Option<&str>, now: &str) -> Self {
        Self {
            name: item.key(),
            display_name: item.name.clone(),
            display_name_prefixed: item.display_name_prefixed.clone(),
            title: item.title.clone(),
            description: item.description.clone(),
            url: item.url.clone(),
            subscribers: item.subscribers.map(|s| s.min(i64::MAX as u64) as i64),
            over18: item.over18,
            mod_count: item.mod_count.map(i64::from),
            has_moderator: item.has_moderator(),
            last_activity_utc: item.last_activity_utc,
            last_mod_activity_utc: item.last_mod_activity_utc,
            last_keyword: Some(keyword.to_string()),
            last_job_id: job_id.map(str::to_string),
            first_seen_at: now.to_string(),
            updated_at: now.to_string(),
        }
    }
}

/// Merge-upsert. Nullable observations only replace stored values when
/// present, and blank text never replaces stored text.
const UPSERT_SQL: &str = "INSERT INTO items (name, display_name, display_name_prefixed, title,
     description, url, subscribers, over18, mod_count, has_moderator, last_activity_utc,
     last_mod_activity_utc, last_keyword, last_job_id, first_seen_at, updated_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
     ON CONFLICT(name) DO UPDATE SET
       display_name = COALESCE(NULLIF(excluded.display_name, ''), items.display_name),
       display_name_prefixed = COALESCE(NULLIF(excluded.display_name_prefixed, ''), items.display_name_prefixed),
       title = COALESCE(NULLIF(excluded.title, ''), items.title),
       description = COALESCE(NULLIF(excluded.description, ''), items.description),
       url = COALESCE(NULLIF(excluded.url, ''), items.url),
       subscribers = COALESCE(excluded.subscribers, items.subscribers),
       over18 = excluded.over18,
       mod_count = COALESCE(excluded.mod_count, items.mod_count),
       has_moderator = COALESCE(excluded.has_moderator, items.has_moderator),
       last_activity_utc = COALESCE(excluded.last_activity_utc, items.last_activity_utc),
       last_mod_activity_utc = COALESCE(excluded.last_mod_activity_utc, items.last_mod_activity_utc),
       last_keyword = excluded.last_keyword,
       last_job_id = COALESCE(excluded.last_job_id, items.last_job_id),
       updated_at = excluded.updated_at";

/// Writes a batch of items in one transaction. Returns the number of rows written.
///
/// The merge happens inside each statement, so concurrent batches from
/// different jobs serialize on the connection without losing updates.
pub fn upsert_batch(db: &Database, items: &[ItemRow]) -> Result<usize, DatabaseError> {
    if items.is_empty() {
        return Ok(0);
    }
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(UPSERT_SQL)?;
            for item in items {
                stmt.execute(params![
                    item.name,
                    item.display_name,
                    item.display_name_prefixed,
                    item.title,
                    item.description,
                    item.url,
                    item.subscribers,
                    item.over18,
                    item.mod_count,
                    item.has_moderator,
                    item.last_activity_utc,
                    item.last_mod_activity_utc,
                    item.last_keyword,
                    item.last_job_id,
                    item.first_seen_at,
                    item.updated_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(items.len())
    })
}

/// Finds an item by name (case-insensitive).
pub fn find_by_name(db: &Database, name: &str) -> Result<Option<ItemRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM items WHERE name = ?1",
                params![name.to_lowercase()],
                ItemRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Column an item listing is ordered by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ItemSort {
    #[default]
    Subscribers,
    Name,
    UpdatedAt,
}

impl ItemSort {
    fn column(self) -> &'static str {
        match self {
            ItemSort::Subscribers => "subscribers",
            ItemSort::Name => "name",
            ItemSort::UpdatedAt => "updated_at",
        }
    }
}

/// Query filter parameters for item listing.
#[derive(Debug, Default, Clone)]
pub struct ItemFilter {
    pub name_contains: Option<String>,
    pub unmoderated_only: bool,
    pub exclude_over18: bool,
    pub min_subscribers: Option<i64>,
    pub max_subscribers: Option<i64>,
    pub sort: ItemSort,
    pub ascending: bool,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Queries items with filters, returning (rows, total_count).
pub fn query(db: &Database, filter: &ItemFilter) -> Result<(Vec<ItemRow>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref needle) = filter.name_contains {
            conditions.push(format!("instr(name, ?{}) > 0", param_values.len() + 1));
            param_values.push(Box::new(needle.to_lowercase()));
        }
        if filter.unmoderated_only {
            conditions.push("has_moderator = 0".to_string());
        }
        if filter.exclude_over18 {
            conditions.push("over18 = 0".to_string());
        }
        if let Some(min) = filter.min_subscribers {
            conditions.push(format!("subscribers >= ?{}", param_values.len() + 1));
            param_values.push(Box::new(min));
        }
        if let Some(max) = filter.max_subscribers {
            conditions.push(format!("subscribers <= ?{}", param_values.len() + 1));
            param_values.push(Box::new(max));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM items {}", where_clause);
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

        let limit = filter.limit.unwrap_or(100) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;
        param_values.push(Box::new(limit));
        param_values.push(Box::new(offset));
        let direction = if filter.ascending { "ASC" } else { "DESC" };
        // Unknown popularity sorts last in either direction.
        let query_sql = format!(
            "SELECT * FROM items {} ORDER BY {} IS NULL, {} {}, name ASC LIMIT ?{} OFFSET ?{}",
            where_clause,
            filter.sort.column(),
            filter.sort.column(),
            direction,
            param_values.len() - 1,
            param_values.len()
        );

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&query_sql)?;
        let rows: Vec<ItemRow> = stmt
            .query_map(params_ref.as_slice(), ItemRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((rows, total))
    })
}

/// Number of stored items last observed while searching `keyword`.
pub fn count_keyword_matches(db: &Database, keyword: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM items WHERE last_keyword = ?1 COLLATE NOCASE",
            params![keyword.trim()],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Keys of items already evaluated for `keyword`.
pub fn known_names(db: &Database, keyword: &str) -> Result<HashSet<String>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT name FROM items WHERE last_keyword = ?1 COLLATE NOCASE")?;
        let names = stmt
            .query_map(params![keyword.trim()], |r| r.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(names)
    })
}
