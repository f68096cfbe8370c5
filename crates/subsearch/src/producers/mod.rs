//! Periodic background tasks that feed and tend the job queue.
//!
//! Each producer runs on its own thread with a current-thread tokio runtime,
//! ticking on an interval and also reacting to manual triggers.

pub mod idle_random;
pub mod ingest;
pub mod retry;
pub mod sweep;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::error::{Result, SchedulerError};
use crate::service::SearchService;

pub use idle_random::{clean_keyword, IdleRandomSearch};
pub use ingest::KeywordIngest;
pub use retry::ErroredRetry;
pub use sweep::StaleJobSweep;

/// One unit of periodic work.
pub trait Producer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Does one pass and reports how many jobs it touched.
    fn run_once(&self) -> Result<usize>;
}

/// Drives a [`Producer`] on a background thread until stopped.
pub struct ProducerHandle {
    name: &'static str,
    shutdown: Arc<AtomicBool>,
    trigger: broadcast::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl ProducerHandle {
    /// Starts the loop. The first pass happens one `interval` from now.
    pub fn start(producer: Arc<dyn Producer>, interval: Duration) -> Result<Self> {
        let name = producer.name();
        let shutdown = Arc::new(AtomicBool::new(false));
        let (trigger, mut trigger_rx) = broadcast::channel::<()>(16);
        let flag = Arc::clone(&shutdown);
        let interval = interval.max(Duration::from_millis(10));

        let thread = std::thread::Builder::new()
            .name(format!("producer-{}", name))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        log::error!("Producer {} could not start its runtime: {}", name, e);
                        return;
                    }
                };

                rt.block_on(async {
                    let mut timer = tokio::time::interval(interval);
                    timer.tick().await; // skip immediate first tick

                    loop {
                        if flag.load(Ordering::Acquire) {
                            break;
                        }

                        tokio::select! {
                            _ = timer.tick() => {},
                            Ok(()) = trigger_rx.recv() => {
                                log::debug!("Producer {} triggered manually", name);
                            },
                        }

                        if flag.load(Ordering::Acquire) {
                            break;
                        }

                        let task = Arc::clone(&producer);
                        match tokio::task::spawn_blocking(move || task.run_once()).await {
                            Ok(Ok(0)) => {}
                            Ok(Ok(n)) => log::info!("Producer {} touched {} jobs", name, n),
                            Ok(Err(e)) => log::error!("Producer {} failed: {}", name, e),
                            Err(e) => log::error!("Producer {} panicked: {}", name, e),
                        }
                    }
                });
                log::debug!("Producer {} stopped", name);
            })
            .map_err(|e| SchedulerError::SpawnFailed(e.to_string()))?;

        log::info!("Started producer {} every {:?}", name, interval);
        Ok(Self {
            name,
            shutdown,
            trigger,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Runs a pass now instead of waiting for the next tick.
    pub fn trigger(&self) {
        let _ = self.trigger.send(());
    }

    /// Signals the loop to stop.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        // Wake the select so it sees the flag.
        let _ = self.trigger.send(());
    }

    /// Stops the loop and waits for the thread to exit.
    pub fn join(mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("Producer {} thread panicked", self.name);
            }
        }
    }
}

impl Drop for ProducerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Starts every enabled producer for `service`.
pub fn start_all(service: &Arc<SearchService>) -> Result<Vec<ProducerHandle>> {
    let config = service.config().producers.clone();
    let mut handles = Vec::new();

    handles.push(ProducerHandle::start(
        Arc::new(StaleJobSweep::new(Arc::clone(service), &config.sweep)),
        Duration::from_secs(config.sweep.interval_secs),
    )?);
    if config.retry.enabled {
        handles.push(ProducerHandle::start(
            Arc::new(ErroredRetry::new(Arc::clone(service), &config.retry)),
            Duration::from_secs(config.retry.interval_secs),
        )?);
    }
    if config.ingest.enabled && !config.ingest.keywords.is_empty() {
        handles.push(ProducerHandle::start(
            Arc::new(KeywordIngest::new(Arc::clone(service), &config.ingest)),
            Duration::from_secs(config.ingest.interval_mins * 60),
        )?);
    }
    if config.idle_random.enabled {
        handles.push(ProducerHandle::start(
            Arc::new(IdleRandomSearch::new(Arc::clone(service), &config.idle_random)?),
            Duration::from_secs(config.idle_random.check_interval_secs),
        )?);
    }
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counting {
        runs: AtomicUsize,
    }

    impl Producer for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn run_once(&self) -> Result<usize> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        }
    }

    #[test]
    fn test_manual_trigger_runs_a_pass() {
        let producer = Arc::new(Counting::default());
        let handle = ProducerHandle::start(producer.clone(), Duration::from_secs(3600)).unwrap();

        // Retry the trigger until the loop has subscribed and run.
        for _ in 0..100 {
            handle.trigger();
            std::thread::sleep(Duration::from_millis(10));
            if producer.runs.load(Ordering::SeqCst) > 0 {
                break;
            }
        }
        assert!(producer.runs.load(Ordering::SeqCst) > 0);
        handle.join();
    }

    #[test]
    fn test_handle_shutdown() {
        let producer = Arc::new(Counting::default());
        let handle = ProducerHandle::start(producer.clone(), Duration::from_millis(20)).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(handle.name(), "counting");
        handle.join();

        let after = producer.runs.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(producer.runs.load(Ordering::SeqCst), after);
    }
}
