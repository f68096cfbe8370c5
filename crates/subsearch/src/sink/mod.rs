//! Batched persistence of evaluated items.

pub mod mirror;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;

use crate::catalog::CandidateItem;
use crate::db::item_repo::{self, ItemRow};
use crate::db::{format_timestamp, Database, DatabaseError};

pub use mirror::{Mirror, MirrorPayload};

/// Durable destination for item batches.
///
/// Implementations must merge concurrently submitted batches without
/// losing the more informative value for any field.
pub trait ItemStore: Send + Sync {
    fn upsert_items(&self, items: &[ItemRow]) -> Result<usize, DatabaseError>;

    /// Keys of items already stored for `keyword`.
    fn known_names(&self, _keyword: &str) -> Result<HashSet<String>, DatabaseError> {
        Ok(HashSet::new())
    }
}

impl ItemStore for Database {
    fn upsert_items(&self, items: &[ItemRow]) -> Result<usize, DatabaseError> {
        item_repo::upsert_batch(self, items)
    }

    fn known_names(&self, keyword: &str) -> Result<HashSet<String>, DatabaseError> {
        item_repo::known_names(self, keyword)
    }
}

struct Pending {
    row: ItemRow,
    matched: bool,
}

/// Buffers evaluated items for one job and writes them in batches.
///
/// `found` counts matched items that have been durably written, never
/// items still sitting in the buffer.
pub struct ResultSink {
    store: Arc<dyn ItemStore>,
    mirror: Option<Arc<Mirror>>,
    keyword: String,
    job_id: Option<String>,
    batch_size: usize,
    buffer: Vec<Pending>,
    flushed_matches: u64,
    flushed_total: u64,
}

impl ResultSink {
    pub fn new(store: Arc<dyn ItemStore>, keyword: &str, batch_size: usize) -> Self {
        Self {
            store,
            mirror: None,
            keyword: keyword.trim().to_string(),
            job_id: None,
            batch_size: batch_size.max(1),
            buffer: Vec::with_capacity(batch_size.max(1)),
            flushed_matches: 0,
            flushed_total: 0,
        }
    }

    pub fn with_job_id(mut self, job_id: &str) -> Self {
        self.job_id = Some(job_id.to_string());
        self
    }

    pub fn with_mirror(mut self, mirror: Option<Arc<Mirror>>) -> Self {
        self.mirror = mirror;
        self
    }

    /// Buffers an item, flushing once the batch is full.
    pub fn submit(&mut self, item: &CandidateItem, matched: bool) -> Result<(), DatabaseError> {
        let now = format_timestamp(Utc::now());
        self.buffer.push(Pending {
            row: ItemRow::from_candidate(item, &self.keyword, self.job_id.as_deref(), &now),
            matched,
        });
        if self.buffer.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Writes everything buffered. On failure the buffer is kept intact.
    pub fn flush(&mut self) -> Result<usize, DatabaseError> {
        if self.buffer.is_empty() {
            return Ok(0);
        }
        let rows: Vec<ItemRow> = self.buffer.iter().map(|p| p.row.clone()).collect();
        let written = self.store.upsert_items(&rows)?;

        let matched: Vec<ItemRow> = self
            .buffer
            .drain(..)
            .filter(|p| p.matched)
            .map(|p| p.row)
            .collect();
        self.flushed_matches += matched.len() as u64;
        self.flushed_total += written as u64;
        log::debug!(
            "Flushed {} items ({} matched) for '{}'",
            written,
            matched.len(),
            self.keyword
        );

        if let Some(mirror) = &self.mirror {
            mirror.dispatch(matched);
        }
        Ok(written)
    }

    /// Matched items durably written so far.
    pub fn found(&self) -> u64 {
        self.flushed_matches
    }

    pub fn written(&self) -> u64 {
        self.flushed_total
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Records batch sizes and can be told to fail.
    #[derive(Default)]
    struct RecordingStore {
        batches: std::sync::Mutex<Vec<usize>>,
        fail: AtomicBool,
        writes: AtomicUsize,
    }

    impl ItemStore for RecordingStore {
        fn upsert_items(&self, items: &[ItemRow]) -> Result<usize, DatabaseError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(DatabaseError::LockPoisoned);
            }
            self.batches.lock().unwrap().push(items.len());
            self.writes.fetch_add(items.len(), Ordering::SeqCst);
            Ok(items.len())
        }
    }

    #[test]
    fn test_batches_at_threshold() {
        let store = Arc::new(RecordingStore::default());
        let mut sink = ResultSink::new(store.clone(), "kw", 3);

        for i in 0..7 {
            sink.submit(&CandidateItem::new(format!("item{}", i)), i % 2 == 0)
                .unwrap();
        }
        assert_eq!(*store.batches.lock().unwrap(), vec![3, 3]);
        assert_eq!(sink.pending(), 1);
        assert_eq!(sink.found(), 3);

        sink.flush().unwrap();
        assert_eq!(sink.found(), 4);
        assert_eq!(sink.written(), 7);
        assert_eq!(sink.flush().unwrap(), 0);
    }

    #[test]
    fn test_found_only_counts_durable_writes() {
        let store = Arc::new(RecordingStore::default());
        let mut sink = ResultSink::new(store.clone(), "kw", 10);
        sink.submit(&CandidateItem::new("a"), true).unwrap();
        assert_eq!(sink.found(), 0);

        store.fail.store(true, Ordering::SeqCst);
        assert!(sink.flush().is_err());
        assert_eq!(sink.found(), 0);
        assert_eq!(sink.pending(), 1);

        store.fail.store(false, Ordering::SeqCst);
        sink.flush().unwrap();
        assert_eq!(sink.found(), 1);
    }

    #[test]
    fn test_database_store_merges() {
        let db = Database::open_in_memory().unwrap();
        let store: Arc<dyn ItemStore> = Arc::new(db.clone());

        let mut first = ResultSink::new(store.clone(), "cats", 1).with_job_id("j1");
        let mut item = CandidateItem::new("Cats");
        item.subscribers = Some(900);
        item.mod_count = Some(2);
        first.submit(&item, true).unwrap();

        let mut second = ResultSink::new(store, "felines", 1).with_job_id("j2");
        second.submit(&CandidateItem::new("cats"), false).unwrap();

        let stored = item_repo::find_by_name(&db, "cats").unwrap().unwrap();
        assert_eq!(stored.subscribers, Some(900));
        assert_eq!(stored.has_moderator, Some(true));
        assert_eq!(stored.last_keyword.as_deref(), Some("felines"));
        assert_eq!(stored.last_job_id.as_deref(), Some("j2"));
    }

    #[test]
    fn test_concurrent_jobs_keep_informative_values() {
        let db = Database::open_in_memory().unwrap();
        let store: Arc<dyn ItemStore> = Arc::new(db.clone());
        let names: Vec<String> = (0..25).map(|i| format!("shared{}", i)).collect();
        let start = std::sync::Barrier::new(2);

        std::thread::scope(|scope| {
            let informed = scope.spawn(|| {
                let mut sink = ResultSink::new(store.clone(), "cats", 5).with_job_id("informed");
                start.wait();
                for round in 0..20u64 {
                    for name in &names {
                        let mut item = CandidateItem::new(name.clone());
                        item.subscribers = Some(1_000 + round);
                        item.mod_count = Some(3);
                        item.last_mod_activity_utc = Some(500);
                        sink.submit(&item, true).unwrap();
                    }
                }
                sink.flush().unwrap();
            });
            let blind = scope.spawn(|| {
                let mut sink = ResultSink::new(store.clone(), "felines", 5).with_job_id("blind");
                start.wait();
                for _ in 0..20 {
                    for name in &names {
                        sink.submit(&CandidateItem::new(name.clone()), false).unwrap();
                    }
                }
                sink.flush().unwrap();
            });
            informed.join().unwrap();
            blind.join().unwrap();
        });

        for name in &names {
            let stored = item_repo::find_by_name(&db, name).unwrap().unwrap();
            assert!(stored.subscribers.unwrap_or(0) >= 1_000, "{} lost subscribers", name);
            assert_eq!(stored.has_moderator, Some(true), "{} lost moderation", name);
            assert_eq!(stored.mod_count, Some(3));
            assert_eq!(stored.last_mod_activity_utc, Some(500));
        }
    }
}
