use std::path::PathBuf;
use thiserror::Error;

use crate::job::JobState;

#[derive(Error, Debug)]
pub enum SubsearchError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] crate::catalog::CatalogError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Secret error: {0}")]
    Secret(#[from] crate::secrets::SecretError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Invalid environment override '{name}': {reason}")]
    InvalidOverride { name: String, reason: String },
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Invalid job parameters: {0}")]
    InvalidParams(String),

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: JobState,
        to: JobState,
    },

    #[error("Failed to persist job {job_id}: {source}")]
    Persist {
        job_id: String,
        #[source]
        source: crate::db::DatabaseError,
    },
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Failed to spawn execution thread: {0}")]
    SpawnFailed(String),

    #[error("Job {0} is already scheduled")]
    AlreadyScheduled(String),

    #[error("Scheduler has been shut down")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, SubsearchError>;
