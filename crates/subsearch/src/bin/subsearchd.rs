//! Crawler daemon: runs the scheduler and background producers until Ctrl-C.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use log::{error, info};

use subsearch::catalog::RedditCatalog;
use subsearch::config::{load_config, load_config_from_str, Config};
use subsearch::db::{resolve_database_path, Database};
use subsearch::notify::LogNotifier;
use subsearch::producers;
use subsearch::service::SearchService;

const ENV_CONFIG: &str = "SUBSEARCH_CONFIG";

/// How long running jobs get to observe cancellation on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

fn config_path() -> Option<PathBuf> {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os(ENV_CONFIG).map(PathBuf::from))
}

fn load() -> subsearch::Result<Config> {
    match config_path() {
        Some(path) => Ok(load_config(path)?),
        None => Ok(load_config_from_str("{}")?),
    }
}

fn run(config: Config) -> subsearch::Result<()> {
    let db_path = resolve_database_path(config.database.path.as_deref())?;
    info!("Using database {:?}", db_path);
    let db = Database::open(&db_path)?;
    let catalog = Arc::new(RedditCatalog::new(&config.catalog)?);

    let service = Arc::new(SearchService::new(
        config,
        db,
        catalog,
        Arc::new(LogNotifier),
    )?);
    service.recover()?;
    let handles = producers::start_all(&service)?;

    let (tx, rx) = mpsc::channel();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = tx.send(());
    }) {
        error!("Could not install Ctrl-C handler: {}", e);
    }
    info!(
        "subsearchd ready: {} producers, {} job slots",
        handles.len(),
        service.scheduler().max_concurrency()
    );
    let _ = rx.recv();

    info!("Shutting down");
    for handle in handles {
        handle.join();
    }
    service.shutdown(SHUTDOWN_GRACE);
    Ok(())
}

fn main() -> ExitCode {
    let config = match load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("subsearchd: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = subsearch::logging::init(&config.logging) {
        eprintln!("subsearchd: {}", e);
        return ExitCode::FAILURE;
    }
    info!("Starting subsearchd v{}", env!("CARGO_PKG_VERSION"));

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("subsearchd failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
