use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use tracing::{Subscriber, subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt};

use crate::config::LoggingSection;

const LOG_FILE_PREFIX: &str = "nearlink.log";

static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

fn install_subscriber<S>(subscriber: S) -> Result<()>
where
    S: Subscriber + Send + Sync + 'static,
{
    if TRACING_INITIALIZED.get().is_some() {
        return Ok(());
    }

    subscriber::set_global_default(subscriber)?;
    let _ = TRACING_INITIALIZED.set(());
    Ok(())
}

pub fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "nearlink=debug"
    } else {
        "nearlink=info"
    }
}

/// Install the tracing subscriber, adding a daily JSON log file when configured.
pub fn init_tracing(verbose: bool, logging: &LoggingSection) -> Result<()> {
    let default_level = default_filter(verbose);
    let make_env_filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match &logging.json_dir {
        Some(directory) => {
            let writer = build_json_writer(directory)?;
            let subscriber = tracing_subscriber::registry()
                .with(make_env_filter())
                .with(fmt::layer().compact().with_target(false))
                .with(
                    fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_target(true)
                        .with_writer(writer)
                        .with_filter(LevelFilter::DEBUG),
                );
            install_subscriber(subscriber)?;
        }
        None => {
            let subscriber = tracing_subscriber::registry()
                .with(make_env_filter())
                .with(fmt::layer().compact().with_target(false));
            install_subscriber(subscriber)?;
        }
    }

    Ok(())
}

fn build_json_writer(directory: &Path) -> Result<NonBlocking> {
    fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory {}", directory.display()))?;

    let appender = rolling::daily(directory, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = LOG_GUARD.set(guard);
    Ok(writer)
}
