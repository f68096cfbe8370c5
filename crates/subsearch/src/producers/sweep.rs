//! Reaps jobs that have been `running` for too long.

use std::sync::Arc;
use std::time::Duration;

use super::Producer;
use crate::config::SweepConfig;
use crate::error::Result;
use crate::service::SearchService;

pub struct StaleJobSweep {
    service: Arc<SearchService>,
    stale_after: Duration,
}

impl StaleJobSweep {
    pub fn new(service: Arc<SearchService>, config: &SweepConfig) -> Self {
        Self {
            service,
            stale_after: Duration::from_secs(config.stale_after_secs),
        }
    }
}

impl Producer for StaleJobSweep {
    fn name(&self) -> &'static str {
        "stale-sweep"
    }

    fn run_once(&self) -> Result<usize> {
        let swept = self.service.sweep_stale(self.stale_after)?;
        if !swept.is_empty() {
            log::warn!("Marked {} stale jobs as failed: {:?}", swept.len(), swept);
        }
        Ok(swept.len())
    }
}
