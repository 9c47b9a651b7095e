//! Tracing setup for the daemon.
//!
//! Production writes JSON lines to a daily-rolling `sonar.*` file and a
//! compact copy to stdout (no ANSI, for the journal). Development prints
//! pretty, span-annotated output. Every strategy task runs inside the
//! engine's `engine{strategy=..}` span, so file logs can be filtered per run.

use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Used when neither `RUST_LOG` nor `SONAR_LOG_LEVEL` is set. Per-request
/// HTTP traces stay quiet unless asked for.
const DEFAULT_FILTER: &str = "info,tower_http=warn";

const LOG_FILE_PREFIX: &str = "sonar";

static WRITER_GUARDS: OnceLock<Vec<WorkerGuard>> = OnceLock::new();

/// Install the global subscriber.
///
/// # Errors
///
/// Fails if the filter does not parse, the log directory cannot be created,
/// or a subscriber is already installed.
pub fn init(is_production: bool) -> anyhow::Result<()> {
    let filter = env_filter()?;
    if is_production {
        init_production(filter)
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_file(true)
                    .with_line_number(true)
                    .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE),
            )
            .try_init()
            .context("installing development subscriber")
    }
}

fn env_filter() -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directives =
        std::env::var("SONAR_LOG_LEVEL").unwrap_or_else(|_| DEFAULT_FILTER.to_string());
    EnvFilter::try_new(&directives).with_context(|| format!("invalid log filter {directives:?}"))
}

fn init_production(filter: EnvFilter) -> anyhow::Result<()> {
    let dir = log_directory();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("creating log directory {}", dir.display()))?;

    let (file, file_guard) = tracing_appender::non_blocking(RollingFileAppender::new(
        Rotation::DAILY,
        &dir,
        LOG_FILE_PREFIX,
    ));
    let (stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(file)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(stdout)
                .with_ansi(false),
        )
        .try_init()
        .context("installing production subscriber")?;

    // Dropping a guard stops its writer thread.
    let _ = WRITER_GUARDS.set(vec![file_guard, stdout_guard]);
    tracing::info!(dir = %dir.display(), "logging to file");
    Ok(())
}

/// `SONAR_LOG_DIR`, else `/var/log/sonar` on Linux, else the per-user data
/// directory.
fn log_directory() -> PathBuf {
    if let Some(dir) = std::env::var_os("SONAR_LOG_DIR") {
        return PathBuf::from(dir);
    }
    if cfg!(target_os = "linux") {
        return PathBuf::from("/var/log").join(LOG_FILE_PREFIX);
    }
    directories::ProjectDirs::from("", "", LOG_FILE_PREFIX)
        .map_or_else(|| PathBuf::from("logs"), |dirs| dirs.data_dir().join("logs"))
}
