//! Tracing setup shared by both binaries.
//!
//! On Linux events go to the systemd journal when it is reachable. Otherwise
//! they go to the configured fallback: a daily rolling file for the CLI, whose
//! stdout carries JSON, or stderr for the daemon.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "SURVEY_MIRROR_LOG";

const DEFAULT_FILTER: &str = "info";

/// Where logs go when journald is not available.
#[derive(Debug, Clone)]
pub enum Fallback {
    /// Daily rolling `survey-mirror.log` in the given directory, or the
    /// platform data directory when `None`.
    File(Option<PathBuf>),
    Stderr,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber. Fails if one is already installed.
///
/// Filter directives come from `SURVEY_MIRROR_LOG`, e.g.
/// `SURVEY_MIRROR_LOG=survey_mirror::sync=debug`.
pub fn init(fallback: Fallback) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(journald) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(journald)
                .try_init()
                .context("Failed to install journald subscriber")?;
            tracing::debug!("Logging to journald");
            return Ok(());
        }
    }

    match fallback {
        Fallback::Stderr => {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(fmt::layer().with_writer(std::io::stderr))
                .try_init()
                .context("Failed to install stderr subscriber")?;
        }
        Fallback::File(dir) => {
            let dir = dir.unwrap_or_else(default_log_dir);
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

            let appender = tracing_appender::rolling::daily(&dir, "survey-mirror.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            // Dropping the guard stops the writer thread
            static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
                std::sync::OnceLock::new();
            let _ = GUARD.set(guard);

            tracing_subscriber::registry()
                .with(env_filter())
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .try_init()
                .context("Failed to install file subscriber")?;
            tracing::debug!(dir = %dir.display(), "Logging to file");
        }
    }
    Ok(())
}

fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("survey-mirror")
        .join("logs")
}
