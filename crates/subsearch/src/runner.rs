//! Executes one admitted crawl job on the scheduler's thread.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::catalog::CatalogClient;
use crate::config::Config;
use crate::db::DatabaseError;
use crate::discovery::{DiscoveryEngine, PlanSettings};
use crate::error::SchedulerError;
use crate::evaluator::{EvaluatorSettings, ItemEvaluator, ItemFilters};
use crate::job::{CancellationToken, JobRecord, JobSource, JobState, JobStore, StopReason};
use crate::notify::Notifier;
use crate::scheduler::{JobExecutor, JobOutcome};
use crate::sink::{ItemStore, Mirror, ResultSink};

pub const TIMED_OUT: &str = "Job timed out";

#[derive(Debug, Clone, Copy)]
pub struct RunnerSettings {
    pub job_timeout: Duration,
    pub batch_size: usize,
    pub progress_every: u64,
    pub persist_rejected: bool,
    pub skip_known: bool,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for RunnerSettings {
    fn from(config: &Config) -> Self {
        Self {
            job_timeout: Duration::from_secs(config.scheduler.job_timeout_secs),
            batch_size: config.crawl.persist_batch_size,
            progress_every: config.crawl.progress_every.max(1),
            persist_rejected: config.crawl.persist_rejected,
            skip_known: config.crawl.skip_known,
        }
    }
}

/// How the crawl loop ended, before the final flush.
enum CrawlEnd {
    Exhausted,
    CapReached,
    Interrupted(StopReason),
}

struct CrawlTally {
    checked: u64,
    matched: u64,
    skipped: u64,
}

/// Drives discovery, evaluation and persistence for a job.
pub struct JobRunner {
    store: Arc<JobStore>,
    discovery: DiscoveryEngine,
    evaluator: ItemEvaluator,
    items: Arc<dyn ItemStore>,
    mirror: Option<Arc<Mirror>>,
    notifier: Option<Arc<dyn Notifier>>,
    settings: RunnerSettings,
}

impl JobRunner {
    pub fn new(
        store: Arc<JobStore>,
        catalog: Arc<dyn CatalogClient>,
        items: Arc<dyn ItemStore>,
        config: &Config,
    ) -> Self {
        let plan = PlanSettings {
            popular_sample_max: config.crawl.popular_sample_max,
            min_token_len: config.crawl.min_token_len,
        };
        Self {
            store,
            discovery: DiscoveryEngine::new(Arc::clone(&catalog), plan),
            evaluator: ItemEvaluator::new(catalog, EvaluatorSettings::from(&config.crawl)),
            items,
            mirror: None,
            notifier: None,
            settings: RunnerSettings::from(config),
        }
    }

    pub fn with_mirror(mut self, mirror: Option<Arc<Mirror>>) -> Self {
        self.mirror = mirror;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_settings(mut self, settings: RunnerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    fn known_names(&self, keyword: &str) -> HashSet<String> {
        if !self.settings.skip_known {
            return HashSet::new();
        }
        match self.items.known_names(keyword) {
            Ok(names) => names,
            Err(e) => {
                warn!("Could not load known items for '{}': {}", keyword, e);
                HashSet::new()
            }
        }
    }

    fn crawl(
        &self,
        record: &JobRecord,
        token: &CancellationToken,
        sink: &mut ResultSink,
        tally: &mut CrawlTally,
    ) -> Result<CrawlEnd, DatabaseError> {
        let params = &record.params;
        let filters = ItemFilters::from(params);
        let cap = params.result_cap.max(1) as u64;
        let known = self.known_names(&params.keyword);
        let mut budget = self.evaluator.budget();
        let mut discovery = self
            .discovery
            .discover(&params.keyword, params.result_cap, params.breadth);

        loop {
            if let Some(reason) = token.check() {
                return Ok(CrawlEnd::Interrupted(reason));
            }
            let Some(candidate) = discovery.next() else {
                debug!("Discovery exhausted: {:?}", discovery.stats());
                return Ok(CrawlEnd::Exhausted);
            };
            tally.checked += 1;

            if known.contains(&candidate.key()) {
                tally.skipped += 1;
            } else {
                let evaluation = self.evaluator.evaluate(candidate, &filters, &mut budget);
                if evaluation.passes {
                    tally.matched += 1;
                    sink.submit(&evaluation.item, true)?;
                } else if self.settings.persist_rejected {
                    sink.submit(&evaluation.item, false)?;
                }
            }

            if tally.checked % self.settings.progress_every == 0 {
                if let Err(e) = self.store.update_progress(&record.id, tally.checked, sink.found()) {
                    warn!("Progress update for job {} failed: {}", record.id, e);
                }
            }
            if tally.matched >= cap {
                return Ok(CrawlEnd::CapReached);
            }
        }
    }

    /// Moves the job to a terminal state and notifies once if that stuck.
    fn finalize(
        &self,
        job_id: &str,
        state: JobState,
        checked: u64,
        found: u64,
        message: Option<String>,
    ) -> JobState {
        match self.store.finish(job_id, state, checked, found, message) {
            Ok(record) => {
                self.notify(&record);
                record.state
            }
            Err(e) => {
                // Someone else (the stale sweep, a stop while queued) got
                // there first; report whatever the record now says.
                warn!("Could not finalize job {}: {}", job_id, e);
                self.store.get(job_id).map(|r| r.state).unwrap_or(state)
            }
        }
    }

    pub fn notify(&self, record: &JobRecord) {
        if record.notification_target.is_none() || !record.state.is_terminal() {
            return;
        }
        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.job_finished(record) {
                warn!("Notification for job {} failed: {}", record.id, e);
            }
        }
    }
}

impl JobExecutor for JobRunner {
    fn execute(&self, job_id: &str, token: CancellationToken) -> JobOutcome {
        let started = Instant::now();
        let record = match self.store.mark_running(job_id) {
            Ok(record) => record,
            Err(e) => {
                error!("Job {} could not start: {}", job_id, e);
                let state = self.finalize(job_id, JobState::Error, 0, 0, Some(e.to_string()));
                return JobOutcome {
                    state,
                    elapsed: started.elapsed(),
                    eta_sample: false,
                };
            }
        };
        token.set_deadline(started + self.settings.job_timeout);

        let span = tracing::info_span!(
            "job",
            job_id = %record.id,
            keyword = %record.params.keyword,
            source = %record.source
        );
        let _enter = span.enter();
        info!(
            "Job {} started: '{}' cap {} breadth {}",
            record.id, record.params.keyword, record.params.result_cap, record.params.breadth
        );

        let mut sink = ResultSink::new(
            Arc::clone(&self.items),
            &record.params.keyword,
            self.settings.batch_size,
        )
        .with_job_id(&record.id)
        .with_mirror(self.mirror.clone());
        let mut tally = CrawlTally {
            checked: 0,
            matched: 0,
            skipped: 0,
        };

        let crawled = self.crawl(&record, &token, &mut sink, &mut tally);
        let flushed = sink.flush();

        let (state, message) = match (crawled, flushed) {
            (Err(e), _) | (Ok(_), Err(e)) => (JobState::Error, Some(e.to_string())),
            (Ok(CrawlEnd::Interrupted(StopReason::Stopped)), Ok(_)) => (JobState::Stopped, None),
            (Ok(CrawlEnd::Interrupted(StopReason::TimedOut)), Ok(_)) => {
                (JobState::Error, Some(TIMED_OUT.to_string()))
            }
            (Ok(CrawlEnd::Exhausted | CrawlEnd::CapReached), Ok(_)) => (JobState::Complete, None),
        };

        let elapsed = started.elapsed();
        let found = sink.found();
        info!(
            "Job {} ended {}: {} found, {} checked ({} known skipped) in {:.1}s",
            record.id,
            state,
            found,
            tally.checked,
            tally.skipped,
            elapsed.as_secs_f64()
        );
        if let Some(message) = &message {
            warn!("Job {} error: {}", record.id, message);
        }

        let state = self.finalize(&record.id, state, tally.checked, found, message);
        JobOutcome {
            state,
            elapsed,
            eta_sample: record.source == JobSource::Interactive,
        }
    }

    fn admission_failed(&self, job_id: &str, error: &SchedulerError) {
        error!("Job {} was dequeued but not started: {}", job_id, error);
        self.finalize(job_id, JobState::Error, 0, 0, Some(error.to_string()));
    }
}
