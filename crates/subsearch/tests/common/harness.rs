//! Test harness wiring a `SearchService` over fixtures.

#![allow(dead_code)]

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use subsearch::catalog::{CandidateItem, InMemoryCatalog};
use subsearch::config::{load_config_from_str, Config};
use subsearch::db::Database;
use subsearch::job::{JobRecord, JobState};
use subsearch::notify::Notifier;
use subsearch::service::SearchService;

const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Captures every finished job it is told about.
#[derive(Default)]
pub struct RecordingNotifier {
    pub finished: Mutex<Vec<JobRecord>>,
}

impl RecordingNotifier {
    pub fn ids(&self) -> Vec<String> {
        self.finished
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.id.clone())
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn job_finished(&self, record: &JobRecord) -> Result<(), String> {
        self.finished.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// A one-shot latch. Waiters give up after a timeout so a failed test
/// never leaves a job thread parked forever.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cond.notify_all();
    }

    pub fn wait(&self) {
        let guard = self.open.lock().unwrap();
        let _ = self
            .cond
            .wait_timeout_while(guard, WAIT_TIMEOUT, |open| !*open)
            .unwrap();
    }
}

/// Isolated service over an in-memory database and a scripted catalog.
pub struct TestHarness {
    pub db: Database,
    pub catalog: Arc<InMemoryCatalog>,
    pub notifier: Arc<RecordingNotifier>,
    pub service: Arc<SearchService>,
}

impl TestHarness {
    /// One job slot, small batches, progress on every candidate.
    pub fn new() -> Self {
        Self::with_config(Self::test_config())
    }

    pub fn test_config() -> Config {
        load_config_from_str(
            r#"{
                "scheduler": { "maxConcurrentJobs": 1, "jobTimeoutSecs": 60 },
                "crawl": { "persistBatchSize": 10, "progressEvery": 1 }
            }"#,
        )
        .expect("test config should parse")
    }

    pub fn with_config(config: Config) -> Self {
        let db = Database::open_in_memory().expect("Failed to create test database");
        Self::with_database(config, db)
    }

    /// A fresh service over an existing database, as after a restart.
    pub fn with_database(config: Config, db: Database) -> Self {
        let catalog = Arc::new(InMemoryCatalog::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let service = SearchService::new(config, db.clone(), catalog.clone(), notifier.clone())
            .expect("Failed to build service");
        Self {
            db,
            catalog,
            notifier,
            service: Arc::new(service),
        }
    }

    pub fn seed(&self, items: impl IntoIterator<Item = CandidateItem>) {
        for item in items {
            self.catalog.add_item(item);
        }
    }

    pub fn job(&self, id: &str) -> JobRecord {
        self.service.get_job(id).expect("job should exist")
    }

    /// Polls until `check` holds for the job or the wait times out.
    pub fn wait_until(&self, id: &str, check: impl Fn(&JobRecord) -> bool) -> JobRecord {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            let record = self.job(id);
            if check(&record) {
                return record;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting on job {} (state {})",
                id,
                record.state
            );
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn wait_for_state(&self, id: &str, state: JobState) -> JobRecord {
        self.wait_until(id, |r| r.state == state)
    }

    /// Waits for a terminal state and for the scheduler slot to drain.
    pub fn wait_terminal(&self, id: &str) -> JobRecord {
        let record = self.wait_until(id, |r| r.state.is_terminal());
        let deadline = Instant::now() + WAIT_TIMEOUT;
        while self.service.scheduler().is_running(id) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        record
    }
}
