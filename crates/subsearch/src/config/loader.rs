use std::path::{Path, PathBuf};

use crate::config::schema::Config;
use crate::error::ConfigError;

const ENV_MAX_CONCURRENT_JOBS: &str = "SUBSEARCH_MAX_CONCURRENT_JOBS";
const ENV_JOB_TIMEOUT: &str = "SUBSEARCH_JOB_TIMEOUT";
const ENV_DB_PATH: &str = "SUBSEARCH_DB_PATH";

/// Headroom kept between the job timeout and the stale-job threshold.
const STALE_MARGIN_SECS: u64 = 300;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let mut config: Config = serde_json::from_str(content)?;

    apply_env_overrides(&mut config)?;
    validate_config(&mut config)?;

    Ok(config)
}

fn apply_env_overrides(config: &mut Config) -> Result<(), ConfigError> {
    if let Some(value) = env_value(ENV_MAX_CONCURRENT_JOBS) {
        config.scheduler.max_concurrent_jobs = parse_override(ENV_MAX_CONCURRENT_JOBS, &value)?;
    }
    if let Some(value) = env_value(ENV_JOB_TIMEOUT) {
        config.scheduler.job_timeout_secs = parse_override(ENV_JOB_TIMEOUT, &value)?;
    }
    if let Some(value) = env_value(ENV_DB_PATH) {
        config.database.path = Some(PathBuf::from(value));
    }
    Ok(())
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_override<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidOverride {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

/// Validates the config and clamps numeric knobs into their supported ranges.
pub fn validate_config(config: &mut Config) -> Result<(), ConfigError> {
    if config.catalog.user_agent.trim().is_empty() {
        return Err(ConfigError::Validation {
            message: "catalog.userAgent must not be empty".to_string(),
        });
    }

    if let Some(endpoint) = &config.mirror.endpoint {
        url::Url::parse(endpoint).map_err(|e| ConfigError::Validation {
            message: format!("mirror.endpoint '{}' is not a valid URL: {}", endpoint, e),
        })?;
    }

    if let Some(api) = &config.producers.idle_random.word_api_url {
        url::Url::parse(api).map_err(|e| ConfigError::Validation {
            message: format!("producers.idleRandom.wordApiUrl '{}' is invalid: {}", api, e),
        })?;
    }

    let scheduler = &mut config.scheduler;
    scheduler.max_concurrent_jobs = clamp("maxConcurrentJobs", scheduler.max_concurrent_jobs, 1, 10);
    scheduler.job_timeout_secs = clamp("jobTimeoutSecs", scheduler.job_timeout_secs, 60, 86_400);
    scheduler.eta_history = scheduler.eta_history.max(1);
    scheduler.default_eta_secs = scheduler.default_eta_secs.max(1);

    let sweep = &mut config.producers.sweep;
    if sweep.stale_after_secs <= scheduler.job_timeout_secs {
        let raised = scheduler.job_timeout_secs + STALE_MARGIN_SECS;
        log::warn!(
            "staleAfterSecs = {} does not exceed jobTimeoutSecs = {}, raising to {}",
            sweep.stale_after_secs,
            scheduler.job_timeout_secs,
            raised
        );
        sweep.stale_after_secs = raised;
    }
    sweep.interval_secs = sweep.interval_secs.max(1);

    let crawl = &mut config.crawl;
    crawl.persist_batch_size = clamp("persistBatchSize", crawl.persist_batch_size, 5, 256);
    crawl.public_limit_cap = clamp("publicLimitCap", crawl.public_limit_cap, 200, 5000);
    crawl.default_breadth = clamp("defaultBreadth", crawl.default_breadth, 1, 5);
    crawl.progress_every = crawl.progress_every.max(1);

    let idle = &mut config.producers.idle_random;
    idle.limit = idle.limit.min(crawl.public_limit_cap).max(1);
    if idle.fallback_words.iter().all(|w| w.trim().is_empty()) {
        return Err(ConfigError::Validation {
            message: "producers.idleRandom.fallbackWords must contain at least one word"
                .to_string(),
        });
    }

    let ingest = &mut config.producers.ingest;
    ingest.limit = ingest.limit.min(crawl.public_limit_cap).max(1);
    ingest.interval_mins = ingest.interval_mins.max(1);

    Ok(())
}

fn clamp<T: PartialOrd + Copy + std::fmt::Display>(name: &str, value: T, min: T, max: T) -> T {
    if value < min {
        log::warn!("{} = {} is below {}, clamping", name, value, min);
        min
    } else if value > max {
        log::warn!("{} = {} is above {}, clamping", name, value, max);
        max
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    #[serial]
    fn test_empty_config_uses_defaults() {
        let config = load_config_from_str("{}").unwrap();
        assert_eq!(config.scheduler.max_concurrent_jobs, 1);
        assert_eq!(config.scheduler.job_timeout_secs, 3600);
        assert_eq!(config.crawl.persist_batch_size, 32);
        assert_eq!(config.crawl.public_limit_cap, 2000);
        assert_eq!(config.crawl.mod_activity_ttl_secs, 3600);
        assert_eq!(config.crawl.mod_activity_fetch_limit, 8000);
        assert_eq!(config.producers.retry.max_attempts, 3);
        assert_eq!(config.producers.idle_random.fallback_words.len(), 10);
        assert!(config.mirror.endpoint.is_none());
    }

    #[test]
    #[serial]
    fn test_out_of_range_values_are_clamped() {
        let json = r#"{
            "scheduler": { "maxConcurrentJobs": 50, "jobTimeoutSecs": 5 },
            "crawl": { "persistBatchSize": 1, "publicLimitCap": 100000, "defaultBreadth": 9 }
        }"#;
        let config = load_config_from_str(json).unwrap();
        assert_eq!(config.scheduler.max_concurrent_jobs, 10);
        assert_eq!(config.scheduler.job_timeout_secs, 60);
        assert_eq!(config.crawl.persist_batch_size, 5);
        assert_eq!(config.crawl.public_limit_cap, 5000);
        assert_eq!(config.crawl.default_breadth, 5);
    }

    #[test]
    #[serial]
    fn test_stale_threshold_exceeds_job_timeout() {
        let config = load_config_from_str("{}").unwrap();
        assert!(config.producers.sweep.stale_after_secs > config.scheduler.job_timeout_secs);

        let json = r#"{
            "scheduler": { "jobTimeoutSecs": 7200 },
            "producers": { "sweep": { "staleAfterSecs": 1800 } }
        }"#;
        let config = load_config_from_str(json).unwrap();
        assert_eq!(config.producers.sweep.stale_after_secs, 7200 + STALE_MARGIN_SECS);
    }

    #[test]
    #[serial]
    fn test_invalid_mirror_endpoint() {
        let json = r#"{ "mirror": { "endpoint": "not a url" } }"#;
        let result = load_config_from_str(json);
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    #[serial]
    fn test_empty_user_agent_rejected() {
        let json = r#"{ "catalog": { "userAgent": "  " } }"#;
        assert!(load_config_from_str(json).is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var(ENV_MAX_CONCURRENT_JOBS, "3");
        std::env::set_var(ENV_DB_PATH, "/tmp/override.db");
        let config = load_config_from_str("{}");
        std::env::remove_var(ENV_MAX_CONCURRENT_JOBS);
        std::env::remove_var(ENV_DB_PATH);

        let config = config.unwrap();
        assert_eq!(config.scheduler.max_concurrent_jobs, 3);
        assert_eq!(
            config.database.path.as_deref(),
            Some(Path::new("/tmp/override.db"))
        );
    }

    #[test]
    #[serial]
    fn test_bad_env_override() {
        std::env::set_var(ENV_JOB_TIMEOUT, "soon");
        let result = load_config_from_str("{}");
        std::env::remove_var(ENV_JOB_TIMEOUT);

        assert!(matches!(result, Err(ConfigError::InvalidOverride { .. })));
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "producers": {{ "ingest": {{ "enabled": true, "keywords": ["rust", "golang"] }} }} }}"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert!(config.producers.ingest.enabled);
        assert_eq!(config.producers.ingest.keywords, vec!["rust", "golang"]);
        assert_eq!(config.producers.ingest.limit, 1000);
    }

    #[test]
    fn test_missing_file() {
        let result = load_config("/nonexistent/subsearch.json");
        assert!(matches!(result, Err(ConfigError::ReadFile { .. })));
    }
}
