//! Cooperative cancellation shared between a running job and its controllers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Why a job should stop iterating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Stopped,
    TimedOut,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    deadline: Mutex<Option<Instant>>,
}

/// A stop flag plus an optional absolute deadline.
///
/// Clones share state. The running job calls [`check`](Self::check) once per
/// candidate; anyone holding a clone may [`cancel`](Self::cancel).
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn set_deadline(&self, deadline: Instant) {
        let mut guard = match self.inner.deadline.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(deadline);
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.inner.deadline.lock() {
            Ok(g) => *g,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// An explicit stop wins over an expired deadline.
    pub fn check(&self) -> Option<StopReason> {
        if self.is_cancelled() {
            return Some(StopReason::Stopped);
        }
        match self.deadline() {
            Some(deadline) if Instant::now() >= deadline => Some(StopReason::TimedOut),
            _ => None,
        }
    }
}
