//! Keeps the crawler busy with random keywords when nobody else is.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use reqwest::Client;
use url::Url;

use super::Producer;
use crate::config::IdleRandomConfig;
use crate::error::{ConfigError, Result};
use crate::job::{JobParams, JobSource};
use crate::service::{JobRequest, SearchService};

static NON_LETTERS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^A-Za-z ]").unwrap());
static SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

const WORD_API_TIMEOUT: Duration = Duration::from_secs(10);

/// Strips everything but ASCII letters and spaces, then lower-cases.
pub fn clean_keyword(raw: &str) -> String {
    let letters = NON_LETTERS.replace_all(raw, "");
    SPACES.replace_all(letters.trim(), " ").to_lowercase()
}

pub struct IdleRandomSearch {
    service: Arc<SearchService>,
    idle: chrono::Duration,
    limit: usize,
    word_api: Option<(Url, Client)>,
    fallback_words: Vec<String>,
}

impl IdleRandomSearch {
    pub fn new(service: Arc<SearchService>, config: &IdleRandomConfig) -> Result<Self> {
        let word_api = match config.word_api_url.as_deref().filter(|u| !u.trim().is_empty()) {
            Some(raw) => {
                let url = Url::parse(raw).map_err(|e| ConfigError::Validation {
                    message: format!("producers.idleRandom.wordApiUrl '{}': {}", raw, e),
                })?;
                let client = Client::builder()
                    .timeout(WORD_API_TIMEOUT)
                    .build()
                    .map_err(|e| ConfigError::Validation {
                        message: format!("failed to build word API client: {}", e),
                    })?;
                Some((url, client))
            }
            None => None,
        };
        Ok(Self {
            service,
            idle: chrono::Duration::seconds(config.idle_secs.min(i64::MAX as u64) as i64),
            limit: config.limit,
            word_api,
            fallback_words: config
                .fallback_words
                .iter()
                .map(|w| clean_keyword(w))
                .filter(|w| !w.is_empty())
                .collect(),
        })
    }

    fn is_idle(&self) -> Result<bool> {
        let scheduler = self.service.scheduler();
        if scheduler.running_count() > 0 || scheduler.queued_count() > 0 {
            return Ok(false);
        }
        if self.service.store().count_active()? > 0 {
            return Ok(false);
        }
        Ok(match self.service.store().last_finished_at()? {
            Some(last) => Utc::now() - last >= self.idle,
            None => true,
        })
    }

    fn fetch_word(&self) -> Option<String> {
        let (url, client) = self.word_api.as_ref()?;
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .ok()?;
        let fetched = rt.block_on(async {
            client
                .get(url.clone())
                .send()
                .await?
                .error_for_status()?
                .json::<Vec<String>>()
                .await
        });
        match fetched {
            Ok(words) => words
                .iter()
                .map(|w| clean_keyword(w))
                .find(|w| !w.is_empty()),
            Err(e) => {
                log::warn!("Word API {} failed, using fallback words: {}", url, e);
                None
            }
        }
    }

    fn fallback_word(&self) -> Option<String> {
        if self.fallback_words.is_empty() {
            return None;
        }
        let slot = (Utc::now().timestamp() / 60).unsigned_abs() as usize;
        Some(self.fallback_words[slot % self.fallback_words.len()].clone())
    }
}

impl Producer for IdleRandomSearch {
    fn name(&self) -> &'static str {
        "idle-random"
    }

    fn run_once(&self) -> Result<usize> {
        if !self.is_idle()? {
            return Ok(0);
        }
        let Some(keyword) = self.fetch_word().or_else(|| self.fallback_word()) else {
            log::warn!("Idle random search has no words to pick from");
            return Ok(0);
        };
        let id = self.service.submit(JobRequest::new(
            JobParams::new(keyword.as_str(), self.limit),
            JobSource::AutoRandom,
        ))?;
        log::info!("Idle random search submitted job {} for '{}'", id, keyword);
        Ok(1)
    }
}
