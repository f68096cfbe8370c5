use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub crawl: CrawlConfig,
    #[serde(default)]
    pub producers: ProducersConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ─── Scheduler ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    #[serde(default = "default_eta_secs")]
    pub default_eta_secs: u64,
    /// Number of recent completions kept for the ETA average.
    #[serde(default = "default_eta_history")]
    pub eta_history: usize,
    /// Completions at or above this duration are left out of the ETA average.
    #[serde(default = "default_eta_outlier_secs")]
    pub eta_outlier_secs: u64,
}

fn default_max_concurrent_jobs() -> usize {
    1
}

fn default_job_timeout_secs() -> u64 {
    3600
}

fn default_eta_secs() -> u64 {
    60
}

fn default_eta_history() -> usize {
    20
}

fn default_eta_outlier_secs() -> u64 {
    600
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            job_timeout_secs: default_job_timeout_secs(),
            default_eta_secs: default_eta_secs(),
            eta_history: default_eta_history(),
            eta_outlier_secs: default_eta_outlier_secs(),
        }
    }
}

// ─── Crawl ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlConfig {
    #[serde(default = "default_persist_batch_size")]
    pub persist_batch_size: usize,
    #[serde(default = "default_public_limit_cap")]
    pub public_limit_cap: usize,
    #[serde(default = "default_breadth")]
    pub default_breadth: u8,
    #[serde(default = "default_popular_sample_max")]
    pub popular_sample_max: usize,
    #[serde(default = "default_min_token_len")]
    pub min_token_len: usize,
    /// Progress is written through every this many checked candidates.
    #[serde(default = "default_progress_every")]
    pub progress_every: u64,
    /// Store candidates that were evaluated but rejected by the filters.
    #[serde(default = "default_true")]
    pub persist_rejected: bool,
    /// Skip candidates already stored for the same keyword.
    #[serde(default)]
    pub skip_known: bool,
    #[serde(default = "default_true")]
    pub mod_activity: bool,
    #[serde(default = "default_mod_activity_sample")]
    pub mod_activity_sample: usize,
    #[serde(default = "default_mod_activity_cache_capacity")]
    pub mod_activity_cache_capacity: u64,
    /// How long a looked-up moderator activity timestamp stays cached.
    #[serde(default = "default_mod_activity_ttl_secs")]
    pub mod_activity_ttl_secs: u64,
    /// Moderator-activity fetches allowed per job. Cache hits don't count.
    #[serde(default = "default_mod_activity_fetch_limit")]
    pub mod_activity_fetch_limit: usize,
}

fn default_persist_batch_size() -> usize {
    32
}

fn default_public_limit_cap() -> usize {
    2000
}

fn default_breadth() -> u8 {
    5
}

fn default_popular_sample_max() -> usize {
    500
}

fn default_min_token_len() -> usize {
    3
}

fn default_progress_every() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_mod_activity_sample() -> usize {
    5
}

fn default_mod_activity_cache_capacity() -> u64 {
    8000
}

fn default_mod_activity_ttl_secs() -> u64 {
    3600
}

fn default_mod_activity_fetch_limit() -> usize {
    8000
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            persist_batch_size: default_persist_batch_size(),
            public_limit_cap: default_public_limit_cap(),
            default_breadth: default_breadth(),
            popular_sample_max: default_popular_sample_max(),
            min_token_len: default_min_token_len(),
            progress_every: default_progress_every(),
            persist_rejected: true,
            skip_known: false,
            mod_activity: true,
            mod_activity_sample: default_mod_activity_sample(),
            mod_activity_cache_capacity: default_mod_activity_cache_capacity(),
            mod_activity_ttl_secs: default_mod_activity_ttl_secs(),
            mod_activity_fetch_limit: default_mod_activity_fetch_limit(),
        }
    }
}

// ─── Producers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducersConfig {
    #[serde(default)]
    pub idle_random: IdleRandomConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdleRandomConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_idle_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Minimum quiet period since the last finished job.
    #[serde(default = "default_idle_secs")]
    pub idle_secs: u64,
    #[serde(default = "default_random_limit")]
    pub limit: usize,
    #[serde(default)]
    pub word_api_url: Option<String>,
    #[serde(default = "default_fallback_words")]
    pub fallback_words: Vec<String>,
}

fn default_idle_check_interval_secs() -> u64 {
    60
}

fn default_idle_secs() -> u64 {
    420
}

fn default_random_limit() -> usize {
    2000
}

fn default_fallback_words() -> Vec<String> {
    [
        "atlas", "harbor", "mosaic", "cocoa", "summit", "glow", "orbit", "quartz", "tango",
        "whistle",
    ]
    .iter()
    .map(|w| w.to_string())
    .collect()
}

impl Default for IdleRandomConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval_secs: default_idle_check_interval_secs(),
            idle_secs: default_idle_secs(),
            limit: default_random_limit(),
            word_api_url: None,
            fallback_words: default_fallback_words(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ingest_interval_mins")]
    pub interval_mins: u64,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_ingest_limit")]
    pub limit: usize,
    #[serde(default)]
    pub min_subscribers: u64,
}

fn default_ingest_interval_mins() -> u64 {
    180
}

fn default_ingest_limit() -> usize {
    1000
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_mins: default_ingest_interval_mins(),
            keywords: Vec::new(),
            limit: default_ingest_limit(),
            min_subscribers: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_retry_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: i64,
    #[serde(default = "default_retry_batch")]
    pub batch: usize,
}

fn default_retry_interval_secs() -> u64 {
    600
}

fn default_max_attempts() -> u32 {
    3
}

fn default_lookback_hours() -> i64 {
    24
}

fn default_retry_batch() -> usize {
    10
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_retry_interval_secs(),
            max_attempts: default_max_attempts(),
            lookback_hours: default_lookback_hours(),
            batch: default_retry_batch(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,
    /// A running job with no progress for this long is considered stuck.
    /// Always kept above `scheduler.jobTimeoutSecs`.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_stale_after_secs() -> u64 {
    3900
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

// ─── External collaborators ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub client_secret_file: Option<String>,
    #[serde(default)]
    pub client_secret_env: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Attempts per request when the API answers 429 or 5xx.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
}

fn default_user_agent() -> String {
    format!("subsearch/{}", env!("CARGO_PKG_VERSION"))
}

fn default_request_timeout_secs() -> u64 {
    20
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_url() -> String {
    "https://oauth.reddit.com".to_string()
}

fn default_auth_url() -> String {
    "https://www.reddit.com/api/v1/access_token".to_string()
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            client_id: None,
            client_secret: None,
            client_secret_file: None,
            client_secret_env: None,
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            base_url: default_base_url(),
            auth_url: default_auth_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorConfig {
    /// Upstream aggregation endpoint. Mirroring is disabled when unset.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub token_file: Option<String>,
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default = "default_mirror_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_mirror_batch_max")]
    pub batch_max: usize,
    #[serde(default = "default_source_label")]
    pub source_label: String,
}

fn default_mirror_timeout_secs() -> u64 {
    10
}

fn default_mirror_batch_max() -> usize {
    500
}

fn default_source_label() -> String {
    "subsearch".to_string()
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            token: None,
            token_file: None,
            token_env: None,
            timeout_secs: default_mirror_timeout_secs(),
            batch_max: default_mirror_batch_max(),
            source_label: default_source_label(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Compact,
        }
    }
}
