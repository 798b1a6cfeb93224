//! Background refresher for survey-mirror.
//!
//! Keeps the subjects listed under `[daemon] subjects` in the config file
//! synchronized, one pass every `interval_secs`. It shares the SQLite cache
//! and attachment directory with the `survey-mirror` CLI.
//!
//! ## Usage
//!
//! ```bash
//! survey-mirror-daemon              # Run in foreground
//! survey-mirror-daemon --once       # Refresh every subject once and exit
//! ```

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use survey_mirror::config::Config;
use survey_mirror::db::Database;
use survey_mirror::logging::{self, Fallback};
use survey_mirror::remote::ArcGisClient;
use survey_mirror::tasks::{JobStatus, JobTracker};

/// How often a running job is polled.
const POLL: Duration = Duration::from_secs(1);

/// Upper bound on one subject's sync before the daemon moves on.
const JOB_TIMEOUT: Duration = Duration::from_secs(60 * 60);

struct DaemonArgs {
    /// Overrides `daemon.interval_secs`
    interval: Option<u64>,
    once: bool,
    config_path: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = parse_args();

    logging::init(Fallback::Stderr)?;

    info!("survey-mirror daemon starting");

    let config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if config.daemon.subjects.is_empty() {
        warn!("No subjects configured under [daemon] subjects, nothing to do");
    }

    let db = Database::open(&config.db_path).context("Failed to open database")?;
    db.initialize()?;
    info!(path = %config.db_path.display(), "Database opened");

    let client = ArcGisClient::new(&config.remote, &config.fields.object_id);
    let tracker = JobTracker::new(&config, Arc::new(db), Arc::new(client))?;

    if args.once {
        info!("Running in single-shot mode");
        refresh_all(&tracker, &config.daemon.subjects);
    } else {
        let interval = args.interval.unwrap_or(config.daemon.interval_secs).max(1);
        info!(interval_secs = interval, "Running in daemon mode");
        loop {
            refresh_all(&tracker, &config.daemon.subjects);
            tracker.purge_expired();
            thread::sleep(Duration::from_secs(interval));
        }
    }

    info!("survey-mirror daemon stopped");
    Ok(())
}

fn parse_args() -> DaemonArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = DaemonArgs {
        interval: None,
        once: false,
        config_path: None,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--once" | "-1" => {
                parsed.once = true;
            }
            "--interval" | "-i" => {
                if i + 1 < args.len() {
                    if let Ok(interval) = args[i + 1].parse() {
                        parsed.interval = Some(interval);
                    }
                    i += 1;
                }
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    parsed.config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    parsed
}

fn print_help() {
    println!(
        r#"survey-mirror-daemon - Scheduled refresh of survey-mirror subjects

USAGE:
    survey-mirror-daemon [OPTIONS]

OPTIONS:
    --once, -1          Refresh every configured subject once and exit
    --interval, -i N    Seconds between passes (default: daemon.interval_secs)
    --config, -c PATH   Path to config file
    --help, -h          Show this help message

ENVIRONMENT:
    SURVEY_MIRROR_CONFIG   Path to config file (overrides default location)
    SURVEY_MIRROR_LOG      Log filter (trace, debug, info, warn, error)
"#
    );
}

/// One pass over every subject. Failures are logged and the pass continues.
fn refresh_all(tracker: &JobTracker, subjects: &[String]) {
    for subject in subjects {
        if let Err(e) = refresh(tracker, subject) {
            error!(subject = %subject, error = %e, "Refresh failed");
        }
    }
}

fn refresh(tracker: &JobTracker, subject: &str) -> Result<()> {
    let ticket = tracker.start_sync(subject, false)?;
    if ticket.fresh {
        info!(subject, "Cache is fresh, skipping remote pass");
    }

    let job = tracker.wait(ticket.job_id, POLL, JOB_TIMEOUT)?;
    match job.status {
        JobStatus::Completed => {
            info!(
                subject,
                job = %job.id,
                from_cache = job.from_cache,
                fetched = job.counters.fetched,
                photos = job.counters.attachments_downloaded,
                failed_photos = job.counters.attachments_failed,
                "Subject refreshed"
            );
            Ok(())
        }
        JobStatus::Failed => anyhow::bail!(job.error.unwrap_or_else(|| "unknown error".to_string())),
        status => {
            warn!(subject, job = %job.id, status = %status, "Sync still running after timeout, moving on");
            Ok(())
        }
    }
}
