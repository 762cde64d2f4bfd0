//! Logging setup for agentrelay using tracing.

use anyhow::Result;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Overrides the platform log directory.
pub const ENV_LOG_DIR: &str = "AGENTRELAY_LOG_DIR";

const DEFAULT_FILTER: &str = "info,agentrelay=debug";

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Process role, used as the log file prefix ("host", "translator", ...).
    pub role: String,
    /// Console only when false.
    pub file: bool,
    /// Explicit log directory; falls back to `AGENTRELAY_LOG_DIR` and then the data dir.
    pub dir: Option<PathBuf>,
}

/// Keeps the non-blocking file writer flushing until dropped.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
    pub log_dir: Option<PathBuf>,
}

/// Initialize logging with console output and an optional daily-rolled file.
pub fn init(options: LogOptions) -> Result<LogGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true);

    let (file_layer, guard, log_dir) = if options.file {
        let log_dir = match options.dir.clone() {
            Some(dir) => dir,
            None => get_log_dir()?,
        };
        std::fs::create_dir_all(&log_dir)?;

        let prefix = if options.role.is_empty() {
            "agentrelay.log".to_string()
        } else {
            format!("agentrelay-{}.log", options.role)
        };
        let file_appender = tracing_appender::rolling::daily(&log_dir, prefix);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed();
        (Some(layer), Some(guard), Some(log_dir))
    } else {
        (None, None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()?;

    tracing::info!(role = %options.role, "agentrelay logging initialized");
    if let Some(dir) = &log_dir {
        tracing::info!("Log directory: {}", dir.display());
    }

    Ok(LogGuard {
        _file: guard,
        log_dir,
    })
}

/// Get the log directory path.
fn get_log_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_LOG_DIR) {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }

    let dirs = directories::ProjectDirs::from("com", "agentrelay", "agentrelay")
        .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;

    Ok(dirs.data_dir().join("logs"))
}
