//! Logging configuration with journald support on Linux.
//!
//! Sets up tracing-based logging that goes to systemd's journal on Linux,
//! with a daily rolling file as the fallback, or to stderr when asked.

use anyhow::Result;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::APP_ID;

/// Filter variable, e.g. `PHOTOTAGS_LOG=debug` or `PHOTOTAGS_LOG=phototags::db=trace`.
pub const LOG_ENV: &str = "PHOTOTAGS_LOG";

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Directory for the file backend; defaults to `<data local dir>/phototags/logs`.
    pub log_dir: Option<PathBuf>,
    /// Log to stderr instead of journald or a file.
    pub stderr: bool,
}

/// Install the global subscriber.
///
/// Returns the file writer's guard when the file backend is used; keep it
/// alive until exit so buffered lines are flushed. Installing twice is an
/// error.
pub fn init(options: LogOptions) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    if options.stderr {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()?;
        return Ok(None);
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(journald_layer.with_syslog_identifier(APP_ID.to_string()))
                .try_init()?;

            tracing::debug!("Logging initialized with journald backend");
            return Ok(None);
        }
    }

    let log_dir = options.log_dir.unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_ID)
            .join("logs")
    });
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, format!("{APP_ID}.log"));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .try_init()?;

    tracing::debug!(?log_dir, "Logging initialized with file backend");
    Ok(Some(guard))
}
