//! Keeps a fixed list of keywords crawled on a schedule.

use std::sync::Arc;

use super::Producer;
use crate::config::IngestConfig;
use crate::error::Result;
use crate::job::{JobParams, JobSource};
use crate::service::{JobRequest, SearchService};

pub struct KeywordIngest {
    service: Arc<SearchService>,
    keywords: Vec<String>,
    limit: usize,
    min_subscribers: u64,
}

impl KeywordIngest {
    pub fn new(service: Arc<SearchService>, config: &IngestConfig) -> Self {
        let mut keywords: Vec<String> = Vec::new();
        for keyword in &config.keywords {
            let keyword = keyword.trim().to_lowercase();
            if !keyword.is_empty() && !keywords.contains(&keyword) {
                keywords.push(keyword);
            }
        }
        Self {
            service,
            keywords,
            limit: config.limit,
            min_subscribers: config.min_subscribers,
        }
    }
}

impl Producer for KeywordIngest {
    fn name(&self) -> &'static str {
        "keyword-ingest"
    }

    fn run_once(&self) -> Result<usize> {
        let mut submitted = 0;
        for keyword in &self.keywords {
            if self.service.store().has_active_keyword(keyword)? {
                log::debug!("Ingest for '{}' skipped, already active", keyword);
                continue;
            }
            let mut params = JobParams::new(keyword.as_str(), self.limit);
            params.min_subscribers = self.min_subscribers;
            self.service
                .submit(JobRequest::new(params, JobSource::AutoIngest))?;
            submitted += 1;
        }
        Ok(submitted)
    }
}
