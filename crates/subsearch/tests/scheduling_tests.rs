//! Queue ordering, admission and stop handling through the service.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use common::{numbered_items, Gate, TestHarness};
use subsearch::job::{JobParams, JobSource, JobState, Priority};
use subsearch::service::{JobRequest, StopOutcome};

fn params(keyword: &str, cap: usize) -> JobParams {
    let mut params = JobParams::new(keyword, cap);
    params.breadth = 1;
    params
}

/// Blocks the job crawling `blocker*` items on its first candidate until
/// the returned gate opens, and records the order keywords are first seen.
fn install_blocker(harness: &TestHarness) -> (Arc<Gate>, Arc<Mutex<Vec<String>>>) {
    let gate = Gate::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    let hook_gate = Arc::clone(&gate);
    let hook_order = Arc::clone(&order);
    harness.catalog.on_yield(move |item| {
        let prefix: String = item.name.chars().take_while(|c| c.is_alphabetic()).collect();
        {
            let mut order = hook_order.lock().unwrap();
            if !order.contains(&prefix) {
                order.push(prefix.clone());
            }
        }
        if prefix == "blocker" {
            hook_gate.wait();
        }
    });
    (gate, order)
}

#[test]
fn test_urgent_job_starts_first_and_waiter_sees_position() {
    let harness = TestHarness::new();
    harness.seed(numbered_items("blocker", 1));
    harness.seed(numbered_items("alpha", 3));
    harness.seed(numbered_items("beta", 3));
    let (gate, order) = install_blocker(&harness);

    let blocker = harness
        .service
        .submit_job(params("blocker", 5), Priority::INTERACTIVE)
        .unwrap();
    harness.wait_for_state(&blocker, JobState::Running);

    // Automated first, then interactive: the interactive one still wins.
    let b = harness
        .service
        .submit(JobRequest::new(params("beta", 5), JobSource::AutoRandom))
        .unwrap();
    let a = harness
        .service
        .submit_job(params("alpha", 5), Priority::INTERACTIVE)
        .unwrap();

    let queue = harness.service.list_queue(10);
    assert_eq!(queue.len(), 2);
    assert_eq!(queue[0].job_id, a);
    assert_eq!(queue[0].position, 1);
    assert_eq!(queue[1].job_id, b);
    assert_eq!(queue[1].position, 2);
    assert_eq!(queue[1].jobs_ahead, 1);

    let status = harness.service.get_status(&b).unwrap();
    assert_eq!(status.state, JobState::Queued);
    assert_eq!(status.queue_position, Some(2));
    assert_eq!(harness.service.get_running(), Some(blocker.clone()));

    gate.open();
    let a_done = harness.wait_terminal(&a);
    let b_done = harness.wait_terminal(&b);
    assert_eq!(a_done.state, JobState::Complete);
    assert_eq!(b_done.state, JobState::Complete);
    assert!(a_done.started_at.unwrap() <= b_done.started_at.unwrap());
    assert_eq!(*order.lock().unwrap(), vec!["blocker", "alpha", "beta"]);
}

#[test]
fn test_waiting_job_keeps_position_one_until_runner_finishes() {
    let harness = TestHarness::new();
    harness.seed(numbered_items("blocker", 1));
    harness.seed(numbered_items("beta", 2));
    let (gate, _) = install_blocker(&harness);

    let a = harness
        .service
        .submit_job(params("blocker", 5), Priority::INTERACTIVE)
        .unwrap();
    harness.wait_for_state(&a, JobState::Running);
    let b = harness
        .service
        .submit_job(params("beta", 5), Priority::AUTOMATED)
        .unwrap();

    let record = harness.wait_until(&b, |r| r.queue.is_some());
    let queue = record.queue.unwrap();
    assert_eq!(queue.position, 1);
    assert_eq!(queue.jobs_ahead, 0);
    assert_eq!(harness.job(&b).state, JobState::Queued);

    gate.open();
    harness.wait_terminal(&a);
    let finished = harness.wait_terminal(&b);
    assert_eq!(finished.state, JobState::Complete);
    assert!(finished.queue.is_none());
}

#[test]
fn test_equal_priority_runs_in_submission_order() {
    let harness = TestHarness::new();
    harness.seed(numbered_items("blocker", 1));
    for prefix in ["one", "two", "three"] {
        harness.seed(numbered_items(prefix, 1));
    }
    let (gate, order) = install_blocker(&harness);

    let blocker = harness
        .service
        .submit_job(params("blocker", 5), Priority::INTERACTIVE)
        .unwrap();
    harness.wait_for_state(&blocker, JobState::Running);

    let ids: Vec<String> = ["one", "two", "three"]
        .iter()
        .map(|kw| harness.service.submit_job(params(kw, 5), Priority(3)).unwrap())
        .collect();

    gate.open();
    for id in &ids {
        harness.wait_terminal(id);
    }
    assert_eq!(
        *order.lock().unwrap(),
        vec!["blocker", "one", "two", "three"]
    );
}

#[test]
fn test_running_never_exceeds_concurrency() {
    let mut config = TestHarness::test_config();
    config.scheduler.max_concurrent_jobs = 2;
    let harness = TestHarness::with_config(config);
    for prefix in ["aa", "bb", "cc", "dd", "ee"] {
        harness.seed(numbered_items(prefix, 5));
    }

    let peak = Arc::new(AtomicUsize::new(0));
    let scheduler = harness.service.scheduler().clone();
    let hook_peak = Arc::clone(&peak);
    harness.catalog.on_yield(move |_| {
        hook_peak.fetch_max(scheduler.running_count(), Ordering::SeqCst);
        std::thread::sleep(std::time::Duration::from_millis(2));
    });

    let ids: Vec<String> = ["aa", "bb", "cc", "dd", "ee"]
        .iter()
        .map(|kw| {
            harness
                .service
                .submit_job(params(kw, 5), Priority::INTERACTIVE)
                .unwrap()
        })
        .collect();
    for id in &ids {
        assert_eq!(harness.wait_terminal(id).state, JobState::Complete);
    }
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak >= 1 && peak <= 2, "peak running was {}", peak);
}

#[test]
fn test_stop_outcomes() {
    let harness = TestHarness::new();
    harness.seed(numbered_items("blocker", 1));
    let (gate, _) = install_blocker(&harness);

    let running = harness
        .service
        .submit_job(params("blocker", 5), Priority::INTERACTIVE)
        .unwrap();
    harness.wait_for_state(&running, JobState::Running);
    let queued = harness
        .service
        .submit(JobRequest::new(params("quiet", 5), JobSource::AutoIngest).with_notification("ops"))
        .unwrap();

    assert_eq!(harness.service.request_stop("nope").unwrap(), StopOutcome::Unknown);
    assert_eq!(harness.service.request_stop(&queued).unwrap(), StopOutcome::Ok);
    let stopped = harness.job(&queued);
    assert_eq!(stopped.state, JobState::Stopped);
    assert!(stopped.stop_requested);
    assert!(!harness.service.scheduler().is_queued(&queued));
    assert_eq!(harness.notifier.ids(), vec![queued.clone()]);

    assert_eq!(harness.service.request_stop(&running).unwrap(), StopOutcome::Ok);
    gate.open();
    let record = harness.wait_terminal(&running);
    assert_eq!(record.state, JobState::Stopped);
    assert!(record.error.is_none());

    assert_eq!(
        harness.service.request_stop(&running).unwrap(),
        StopOutcome::AlreadyDone
    );
}

#[test]
fn test_blank_keyword_is_rejected_and_cap_is_clamped() {
    let harness = TestHarness::new();
    assert!(harness
        .service
        .submit_job(JobParams::new("   ", 10), Priority::INTERACTIVE)
        .is_err());

    let id = harness
        .service
        .submit_job(JobParams::new("  cats ", 1_000_000), Priority::INTERACTIVE)
        .unwrap();
    let record = harness.wait_terminal(&id);
    assert_eq!(record.params.keyword, "cats");
    assert_eq!(
        record.params.result_cap,
        harness.service.config().crawl.public_limit_cap
    );
}
