//! Resubmits recently errored jobs.

use std::sync::Arc;

use chrono::{Duration, Utc};

use super::Producer;
use crate::config::RetryConfig;
use crate::error::Result;
use crate::service::SearchService;

pub struct ErroredRetry {
    service: Arc<SearchService>,
    lookback: Duration,
    max_attempts: u32,
    batch: usize,
}

impl ErroredRetry {
    pub fn new(service: Arc<SearchService>, config: &RetryConfig) -> Self {
        Self {
            service,
            lookback: Duration::hours(config.lookback_hours.max(0)),
            max_attempts: config.max_attempts,
            batch: config.batch,
        }
    }
}

impl Producer for ErroredRetry {
    fn name(&self) -> &'static str {
        "errored-retry"
    }

    fn run_once(&self) -> Result<usize> {
        let since = Utc::now() - self.lookback;
        let retried = self
            .service
            .retry_errored(since, self.max_attempts, self.batch)?;
        Ok(retried.len())
    }
}
