//! syncsys processor binary
//!
//! Serves the request mailbox until Ctrl+C or a fatal channel failure.

use std::{
    fs::OpenOptions,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::{Arc, Mutex},
};

use clap::Parser;
use syncsys::{
    channel::{Mailbox, dir::DirMailbox},
    config::{LoggingConfig, SyncConfig},
    processor::Processor,
    store::sqlite::SqliteStore,
};
use tracing_subscriber::{EnvFilter, fmt};

/// Central database processor for shared-folder synchronization
#[derive(Parser, Debug)]
#[command(name = "syncsys-processor")]
#[command(version)]
struct Args {
    /// JSON configuration file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides logging.level (DEBUG, INFO, WARNING, ERROR)
    #[arg(short, long)]
    log_level: Option<String>,
}

fn init_tracing(logging: &LoggingConfig) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.filter_directive()));
    match &logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| format!("cannot open log file {}: {e}", path.display()))?;
            fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            fmt().with_env_filter(filter).with_target(true).init();
        }
    }
    Ok(())
}

fn open_mailbox(config: &SyncConfig, path: &Path) -> Result<Arc<dyn Mailbox>, String> {
    let folder = &config.shared_folder;
    let mut mailbox = DirMailbox::open(path)
        .map_err(|e| e.to_string())?
        .with_retry(folder.retry_policy());
    if folder.archive {
        mailbox = mailbox.with_archive().map_err(|e| e.to_string())?;
    }
    Ok(Arc::new(mailbox))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match SyncConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("failed to load configuration: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => SyncConfig::default(),
    };
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Err(e) = init_tracing(&config.logging) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    tracing::info!(
        database = %config.database.path.display(),
        requests = %config.shared_folder.requests.display(),
        responses = %config.shared_folder.responses.display(),
        "syncsys processor starting"
    );

    let store = match SqliteStore::open(&config.database.path) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "failed to open database");
            return ExitCode::FAILURE;
        }
    };
    let mailboxes = open_mailbox(&config, &config.shared_folder.requests)
        .and_then(|req| Ok((req, open_mailbox(&config, &config.shared_folder.responses)?)));
    let (requests, responses) = match mailboxes {
        Ok(pair) => pair,
        Err(e) => {
            tracing::error!(error = %e, "failed to open mailboxes");
            return ExitCode::FAILURE;
        }
    };

    let handle = match Processor::new(Box::new(store), requests, responses, config.processor.clone()).spawn() {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "failed to start processor");
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C, draining in-flight requests");
        }
        error = handle.stopped() => {
            if let Some(error) = error {
                tracing::error!(%error, "processor stopped");
            }
        }
    }

    match handle.shutdown().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "processor exited with an error");
            ExitCode::FAILURE
        }
    }
}
