pub mod catalog;
pub mod config;
pub mod db;
pub mod discovery;
pub mod error;
pub mod evaluator;
pub mod job;
pub mod logging;
pub mod notify;
pub mod producers;
pub mod runner;
pub mod scheduler;
pub mod secrets;
pub mod service;
pub mod sink;

pub use catalog::{CandidateItem, CatalogClient, CatalogError, InMemoryCatalog, RedditCatalog};
pub use config::{load_config, Config};
pub use db::{Database, DatabaseError};
pub use discovery::{Discovery, DiscoveryEngine};
pub use error::{ConfigError, JobError, Result, SchedulerError, SubsearchError};
pub use evaluator::{ItemEvaluator, ItemFilters};
pub use job::{JobParams, JobRecord, JobSource, JobState, JobStore, Priority};
pub use notify::{LogNotifier, Notifier};
pub use runner::JobRunner;
pub use scheduler::{PriorityScheduler, QueuePosition};
pub use service::{JobRequest, JobSnapshot, SearchService, StopOutcome};
pub use sink::{ItemStore, ResultSink};
