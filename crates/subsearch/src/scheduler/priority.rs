use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use log::{debug, error, info, warn};

use super::{
    EtaEstimator, JobExecutor, JobOutcome, QueueListener, QueuePosition, SchedulerSettings,
};
use crate::error::SchedulerError;
use crate::job::{CancellationToken, JobState, Priority};

/// Ordering key: priority first, then enqueue sequence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Priority,
    seq: u64,
    job_id: String,
}

struct QueueState {
    queue: BTreeSet<QueueKey>,
    index: HashMap<String, QueueKey>,
    running: HashMap<String, CancellationToken>,
    next_seq: u64,
    max_concurrency: usize,
    eta: EtaEstimator,
    shut_down: bool,
}

impl QueueState {
    fn snapshot(&self, limit: usize) -> Vec<QueuePosition> {
        let avg = self.eta.average();
        self.queue
            .iter()
            .take(limit)
            .enumerate()
            .map(|(idx, key)| QueuePosition {
                job_id: key.job_id.clone(),
                priority: key.priority,
                position: idx + 1,
                jobs_ahead: idx,
                eta_start: avg * idx as u32,
                eta_completion: avg * (idx as u32 + 1),
            })
            .collect()
    }
}

struct Inner {
    state: Mutex<QueueState>,
    /// Serializes listener notifications so snapshots arrive in order.
    publish: Mutex<()>,
    executor: Arc<dyn JobExecutor>,
    listener: Arc<dyn QueueListener>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                warn!("Scheduler lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn publish(&self) {
        let _order = match self.publish.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let snapshot = self.lock().snapshot(usize::MAX);
        self.listener.queue_changed(&snapshot);
    }
}

/// Releases the slot when the execution thread ends, even by panic.
struct CompletionGuard {
    inner: Arc<Inner>,
    job_id: String,
    outcome: Option<JobOutcome>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("Execution thread for job {} panicked", self.job_id);
        }
        complete(&self.inner, &self.job_id, self.outcome.as_ref());
    }
}

fn admit(inner: &Arc<Inner>) -> usize {
    let mut admitted = 0;
    let mut failures = Vec::new();
    {
        let mut state = inner.lock();
        while !state.shut_down && state.running.len() < state.max_concurrency {
            let Some(key) = state.queue.pop_first() else {
                break;
            };
            state.index.remove(&key.job_id);
            let token = CancellationToken::new();
            state.running.insert(key.job_id.clone(), token.clone());

            let thread_inner = Arc::clone(inner);
            let job_id = key.job_id.clone();
            let name: String = format!("job-{}", key.job_id.chars().take(8).collect::<String>());
            let spawned = thread::Builder::new().name(name).spawn(move || {
                let mut guard = CompletionGuard {
                    inner: Arc::clone(&thread_inner),
                    job_id: job_id.clone(),
                    outcome: None,
                };
                guard.outcome = Some(thread_inner.executor.execute(&job_id, token));
            });

            match spawned {
                Ok(_) => {
                    debug!(
                        "Admitted job {} (priority {}, {} running)",
                        key.job_id,
                        key.priority,
                        state.running.len()
                    );
                    admitted += 1;
                }
                Err(e) => {
                    state.running.remove(&key.job_id);
                    failures.push((key.job_id, SchedulerError::SpawnFailed(e.to_string())));
                }
            }
        }
    }

    for (job_id, err) in &failures {
        error!("Could not start job {}: {}", job_id, err);
        inner.executor.admission_failed(job_id, err);
    }
    if admitted > 0 || !failures.is_empty() {
        inner.publish();
    }
    admitted
}

fn complete(inner: &Arc<Inner>, job_id: &str, outcome: Option<&JobOutcome>) {
    {
        let mut state = inner.lock();
        if state.running.remove(job_id).is_none() {
            debug!("Ignoring completion for job {} which no longer holds a slot", job_id);
            return;
        }
        if let Some(outcome) = outcome {
            if outcome.eta_sample && outcome.state == JobState::Complete {
                state.eta.record(outcome.elapsed);
            }
        }
    }
    inner.publish();
    admit(inner);
}

/// Strict-priority, FIFO-within-tier admission under a concurrency cap.
///
/// Each admitted job runs on its own named thread. All queue and slot
/// bookkeeping happens under one lock, so concurrent completions can
/// never admit more than `max_concurrency` jobs.
#[derive(Clone)]
pub struct PriorityScheduler {
    inner: Arc<Inner>,
}

impl PriorityScheduler {
    pub fn new(
        settings: SchedulerSettings,
        executor: Arc<dyn JobExecutor>,
        listener: Arc<dyn QueueListener>,
    ) -> Self {
        let state = QueueState {
            queue: BTreeSet::new(),
            index: HashMap::new(),
            running: HashMap::new(),
            next_seq: 0,
            max_concurrency: settings.max_concurrency.max(1),
            eta: EtaEstimator::new(settings.eta_history, settings.default_eta, settings.eta_outlier),
            shut_down: false,
        };
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                publish: Mutex::new(()),
                executor,
                listener,
            }),
        }
    }

    /// Queues a job, publishes positions, then tries to admit.
    pub fn enqueue(&self, job_id: &str, priority: Priority) -> Result<(), SchedulerError> {
        {
            let mut state = self.inner.lock();
            if state.shut_down {
                return Err(SchedulerError::ShutDown);
            }
            if state.index.contains_key(job_id) || state.running.contains_key(job_id) {
                return Err(SchedulerError::AlreadyScheduled(job_id.to_string()));
            }
            let key = QueueKey {
                priority,
                seq: state.next_seq,
                job_id: job_id.to_string(),
            };
            state.next_seq += 1;
            state.index.insert(job_id.to_string(), key.clone());
            state.queue.insert(key);
        }
        debug!("Enqueued job {} at priority {}", job_id, priority);
        self.inner.publish();
        self.attempt_admission();
        Ok(())
    }

    /// Starts queued jobs while slots are free. Returns how many started.
    pub fn attempt_admission(&self) -> usize {
        admit(&self.inner)
    }

    /// Removes a job that has not started yet.
    pub fn remove(&self, job_id: &str) -> bool {
        let removed = {
            let mut state = self.inner.lock();
            match state.index.remove(job_id) {
                Some(key) => state.queue.remove(&key),
                None => false,
            }
        };
        if removed {
            debug!("Removed queued job {}", job_id);
            self.inner.publish();
        }
        removed
    }

    /// Frees the job's slot and admits the next job. A no-op for ids that hold no slot.
    pub fn on_completion(&self, job_id: &str) {
        complete(&self.inner, job_id, None);
    }

    /// Signals a running job to stop. Returns false if it is not running.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.inner.lock().running.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels a running job and reclaims its slot immediately, without
    /// waiting for its thread to notice.
    pub fn release(&self, job_id: &str) -> bool {
        let token = self.inner.lock().running.remove(job_id);
        match token {
            Some(token) => {
                token.cancel();
                warn!("Released slot held by job {}", job_id);
                self.inner.publish();
                self.attempt_admission();
                true
            }
            None => false,
        }
    }

    /// The first `limit` queued jobs in admission order.
    pub fn list_queue(&self, limit: usize) -> Vec<QueuePosition> {
        self.inner.lock().snapshot(limit)
    }

    pub fn position(&self, job_id: &str) -> Option<QueuePosition> {
        self.inner
            .lock()
            .snapshot(usize::MAX)
            .into_iter()
            .find(|p| p.job_id == job_id)
    }

    /// Ids of running jobs, sorted.
    pub fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().running.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn running_count(&self) -> usize {
        self.inner.lock().running.len()
    }

    pub fn queued_count(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_queued(&self, job_id: &str) -> bool {
        self.inner.lock().index.contains_key(job_id)
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.inner.lock().running.contains_key(job_id)
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.lock().max_concurrency
    }

    /// Current per-job duration estimate.
    pub fn average_job_duration(&self) -> std::time::Duration {
        self.inner.lock().eta.average()
    }

    /// Seeds the ETA history from samples ordered newest first.
    pub fn seed_history(&self, newest_first: impl IntoIterator<Item = std::time::Duration>) {
        self.inner.lock().eta.seed(newest_first);
    }

    /// Stops admitting and cancels running jobs. Queued jobs stay queued.
    pub fn shutdown(&self) {
        let mut state = self.inner.lock();
        state.shut_down = true;
        for token in state.running.values() {
            token.cancel();
        }
        info!(
            "Scheduler shut down with {} running and {} queued",
            state.running.len(),
            state.queue.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    use crate::scheduler::NoopListener;

    /// Blocks each job until the test releases it, recording start order.
    struct GatedExecutor {
        started: Mutex<Vec<String>>,
        gates: Mutex<HashMap<String, mpsc::Sender<()>>>,
        active: AtomicUsize,
        peak: AtomicUsize,
        started_tx: Mutex<mpsc::Sender<String>>,
    }

    impl GatedExecutor {
        fn new() -> (Arc<Self>, mpsc::Receiver<String>) {
            let (tx, rx) = mpsc::channel();
            let executor = Arc::new(Self {
                started: Mutex::new(Vec::new()),
                gates: Mutex::new(HashMap::new()),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                started_tx: Mutex::new(tx),
            });
            (executor, rx)
        }

        fn release(&self, job_id: &str) {
            if let Some(gate) = self.gates.lock().unwrap().remove(job_id) {
                let _ = gate.send(());
            }
        }
    }

    impl JobExecutor for GatedExecutor {
        fn execute(&self, job_id: &str, token: CancellationToken) -> JobOutcome {
            let (tx, rx) = mpsc::channel();
            self.gates.lock().unwrap().insert(job_id.to_string(), tx);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.started.lock().unwrap().push(job_id.to_string());
            let _ = self.started_tx.lock().unwrap().send(job_id.to_string());

            let mut state = JobState::Complete;
            loop {
                if rx.recv_timeout(Duration::from_millis(10)).is_ok() {
                    break;
                }
                if token.is_cancelled() {
                    state = JobState::Stopped;
                    break;
                }
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            JobOutcome {
                state,
                elapsed: Duration::from_secs(30),
                eta_sample: true,
            }
        }

        fn admission_failed(&self, _job_id: &str, _error: &SchedulerError) {}
    }

    fn scheduler(max: usize, executor: Arc<GatedExecutor>) -> PriorityScheduler {
        PriorityScheduler::new(
            SchedulerSettings {
                max_concurrency: max,
                ..SchedulerSettings::default()
            },
            executor,
            Arc::new(NoopListener),
        )
    }

    fn wait_started(rx: &mpsc::Receiver<String>) -> String {
        rx.recv_timeout(Duration::from_secs(5)).expect("job did not start")
    }

    #[test]
    fn test_priority_then_fifo() {
        let (executor, started) = GatedExecutor::new();
        let sched = scheduler(1, executor.clone());

        sched.enqueue("blocker", Priority::INTERACTIVE).unwrap();
        assert_eq!(wait_started(&started), "blocker");

        sched.enqueue("auto-1", Priority::AUTOMATED).unwrap();
        sched.enqueue("user-1", Priority::INTERACTIVE).unwrap();
        sched.enqueue("retry-1", Priority::RETRY).unwrap();
        sched.enqueue("user-2", Priority::INTERACTIVE).unwrap();

        let order: Vec<String> = sched.list_queue(10).into_iter().map(|p| p.job_id).collect();
        assert_eq!(order, vec!["user-1", "user-2", "retry-1", "auto-1"]);

        let mut ran = Vec::new();
        executor.release("blocker");
        for _ in 0..4 {
            let next = wait_started(&started);
            executor.release(&next);
            ran.push(next);
        }
        assert_eq!(ran, vec!["user-1", "user-2", "retry-1", "auto-1"]);
    }

    #[test]
    fn test_admission_bound_under_concurrent_completions() {
        let (executor, started) = GatedExecutor::new();
        let sched = scheduler(2, executor.clone());

        for i in 0..8 {
            sched.enqueue(&format!("job-{}", i), Priority::AUTOMATED).unwrap();
        }
        assert_eq!(sched.running_count(), 2);
        assert_eq!(sched.queued_count(), 6);

        let mut done = 0;
        while done < 8 {
            let id = wait_started(&started);
            executor.release(&id);
            done += 1;
        }
        assert!(executor.peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_positions_and_eta() {
        let (executor, started) = GatedExecutor::new();
        let sched = scheduler(1, executor.clone());
        sched.seed_history([Duration::from_secs(40), Duration::from_secs(20)]);

        sched.enqueue("a", Priority::INTERACTIVE).unwrap();
        wait_started(&started);
        sched.enqueue("b", Priority::AUTOMATED).unwrap();
        sched.enqueue("c", Priority::AUTOMATED).unwrap();

        let queue = sched.list_queue(10);
        assert_eq!(queue[0].position, 1);
        assert_eq!(queue[0].jobs_ahead, 0);
        assert_eq!(queue[0].eta_start, Duration::ZERO);
        assert_eq!(queue[1].eta_start, Duration::from_secs(30));
        assert_eq!(queue[1].eta_completion, Duration::from_secs(60));
        assert_eq!(sched.list_queue(1).len(), 1);

        sched.shutdown();
    }

    #[test]
    fn test_remove_only_affects_queued_jobs() {
        let (executor, started) = GatedExecutor::new();
        let sched = scheduler(1, executor.clone());

        sched.enqueue("running", Priority::INTERACTIVE).unwrap();
        wait_started(&started);
        sched.enqueue("waiting", Priority::INTERACTIVE).unwrap();

        assert!(!sched.remove("running"));
        assert!(sched.remove("waiting"));
        assert!(!sched.remove("waiting"));
        assert_eq!(sched.queued_count(), 0);
        sched.shutdown();
    }

    #[test]
    fn test_duplicate_enqueue_rejected() {
        let (executor, started) = GatedExecutor::new();
        let sched = scheduler(1, executor.clone());
        sched.enqueue("a", Priority::INTERACTIVE).unwrap();
        wait_started(&started);
        assert!(matches!(
            sched.enqueue("a", Priority::INTERACTIVE),
            Err(SchedulerError::AlreadyScheduled(_))
        ));
        sched.shutdown();
    }

    #[test]
    fn test_release_frees_slot_and_ignores_late_completion() {
        let (executor, started) = GatedExecutor::new();
        let sched = scheduler(1, executor.clone());

        sched.enqueue("stuck", Priority::INTERACTIVE).unwrap();
        wait_started(&started);
        sched.enqueue("next", Priority::INTERACTIVE).unwrap();

        assert!(sched.release("stuck"));
        assert_eq!(wait_started(&started), "next");

        // The stuck thread notices its token and exits; its completion is a no-op.
        sched.on_completion("stuck");
        assert!(sched.is_running("next"));
        assert_eq!(sched.running_count(), 1);
        sched.shutdown();
    }

    #[test]
    fn test_cancel_signals_running_job() {
        let (executor, started) = GatedExecutor::new();
        let sched = scheduler(1, executor.clone());
        sched.enqueue("a", Priority::INTERACTIVE).unwrap();
        wait_started(&started);

        assert!(sched.cancel("a"));
        assert!(!sched.cancel("unknown"));
        for _ in 0..500 {
            if sched.running_count() == 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(sched.running_count(), 0);
    }

    #[test]
    fn test_shutdown_rejects_new_work() {
        let (executor, _started) = GatedExecutor::new();
        let sched = scheduler(1, executor);
        sched.shutdown();
        assert!(matches!(
            sched.enqueue("late", Priority::INTERACTIVE),
            Err(SchedulerError::ShutDown)
        ));
    }
}
