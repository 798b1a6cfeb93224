use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use survey_mirror::config::Config;
use survey_mirror::db::Database;
use survey_mirror::logging::{self, Fallback};
use survey_mirror::query::{CompositeQuery, DateRange, FilterField, PreviewRequest, QueryOutcome, SortSpec};
use survey_mirror::remote::ArcGisClient;
use survey_mirror::tasks::{JobStatus, JobTracker};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

enum Command {
    Sync { subject: String, force: bool },
    Query(CompositeQuery),
    Summary { subject: String },
}

struct CliArgs {
    config_path: Option<PathBuf>,
    command: Command,
}

fn parse_args() -> Result<CliArgs> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut config_path = None;
    let mut positional = Vec::new();
    let mut force = false;
    let mut filters = Vec::new();
    let mut from = None;
    let mut to = None;
    let mut sort = None;
    let mut page = 1;
    let mut page_size = survey_mirror::query::DEFAULT_PAGE_SIZE;

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| iter.next().with_context(|| format!("{} requires a value", flag));
        match arg.as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("survey-mirror {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => config_path = Some(PathBuf::from(value("--config")?)),
            "--force" | "-f" => force = true,
            "--filter" => {
                let raw = value("--filter")?;
                let (field, val) = raw
                    .split_once('=')
                    .with_context(|| format!("filter '{}' is not field=value", raw))?;
                let field = FilterField::parse(field).with_context(|| format!("unknown filter field '{}'", field))?;
                filters.push((field, val.to_string()));
            }
            "--from" => from = Some(parse_day(&value("--from")?)?),
            "--to" => to = Some(parse_day(&value("--to")?)?),
            "--sort" => {
                let raw = value("--sort")?;
                sort = Some(SortSpec::parse(&raw).with_context(|| format!("invalid sort '{}'", raw))?);
            }
            "--page" => page = value("--page")?.parse().context("--page must be a number")?,
            "--page-size" => page_size = value("--page-size")?.parse().context("--page-size must be a number")?,
            other if other.starts_with('-') => bail!("unknown argument: {}", other),
            _ => positional.push(arg.clone()),
        }
    }

    let mut positional = positional.into_iter();
    let name = positional.next().context("missing command (sync, query or summary)")?;
    let subject = positional.next().context("missing SUBJECT")?;
    if let Some(extra) = positional.next() {
        bail!("unexpected argument: {}", extra);
    }

    let command = match name.as_str() {
        "sync" => Command::Sync { subject, force },
        "query" => {
            let mut query = CompositeQuery::new(subject)
                .date_range(DateRange::between_days(from, to))
                .page(page, page_size);
            query.filters = filters;
            if let Some(sort) = sort {
                query = query.sort(sort);
            }
            Command::Query(query)
        }
        "summary" => Command::Summary { subject },
        other => bail!("unknown command: {}", other),
    };

    Ok(CliArgs { config_path, command })
}

fn parse_day(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").with_context(|| format!("'{}' is not a YYYY-MM-DD date", raw))
}

fn print_help() {
    println!(
        r#"survey-mirror - local mirror of a survey feature service

USAGE:
    survey-mirror [OPTIONS] sync SUBJECT [--force]
    survey-mirror [OPTIONS] query SUBJECT [QUERY OPTIONS]
    survey-mirror [OPTIONS] summary SUBJECT

OPTIONS:
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

SYNC OPTIONS:
    --force, -f         Ignore the cache and re-download everything

QUERY OPTIONS:
    --filter FIELD=VALUE   Exact match; repeatable. Fields: supervisor,
                           site_component, component_type, activity,
                           reference_installation, detected_fact
    --from YYYY-MM-DD      Survey date lower bound (inclusive)
    --to YYYY-MM-DD        Survey date upper bound (inclusive)
    --sort FIELD[:desc]    surveyed_at, edited_at, object_id, supervisor,
                           site_component, component_type, activity
    --page N               1-based page number (default: 1)
    --page-size N          Rows per page, 1-500 (default: 25)

ENVIRONMENT:
    SURVEY_MIRROR_CONFIG   Path to config file (overrides default location)
    SURVEY_MIRROR_LOG      Log filter (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/survey-mirror/config.toml

See also: survey-mirror-daemon --help"#
    );
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_sync(tracker: &JobTracker, subject: &str, force: bool) -> Result<()> {
    let ticket = tracker.start_sync(subject, force)?;
    if ticket.reused {
        eprintln!("Joining running job {} for {}", ticket.job_id, subject);
    } else if ticket.fresh {
        eprintln!("Cache for {} is fresh", subject);
    }

    let mut last_status = None;
    let mut last_percent = None;
    let job = loop {
        let job = tracker.status(ticket.job_id)?;
        let percent = job.percent();
        if last_status != Some(job.status) || last_percent != Some(percent) {
            eprintln!(
                "[{}] {:>3}%  parents {}/{}  photos {}/{}",
                job.status,
                percent,
                job.counters.fetched,
                job.counters.total,
                job.counters.attachments_downloaded,
                job.counters.attachments_total
            );
            last_status = Some(job.status);
            last_percent = Some(percent);
        }
        if job.status.is_terminal() {
            break job;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    };

    if job.status == JobStatus::Failed {
        bail!("sync failed: {}", job.error.unwrap_or_default());
    }
    if job.counters.attachments_failed > 0 {
        eprintln!("{} attachment(s) could not be downloaded", job.counters.attachments_failed);
    }

    match tracker.preview(job.id, PreviewRequest::default())? {
        QueryOutcome::Ready(page) => print_json(&page),
        QueryOutcome::NotReady { status } => bail!("preview not ready ({})", status),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            print_help();
            std::process::exit(1);
        }
    };

    let _ = logging::init(Fallback::File(Some(Config::config_dir().join("logs"))));

    let config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let db = Database::open(&config.db_path)
        .with_context(|| format!("Failed to open database {}", config.db_path.display()))?;
    db.initialize()?;

    let client = ArcGisClient::new(&config.remote, &config.fields.object_id);
    let tracker = JobTracker::new(&config, Arc::new(db), Arc::new(client))?;

    match args.command {
        Command::Sync { subject, force } => {
            if config.remote.base_url.trim().is_empty() {
                bail!("remote.base_url is not configured");
            }
            run_sync(&tracker, &subject, force).await
        }
        Command::Query(query) => match tracker.query(&query)? {
            QueryOutcome::Ready(page) => print_json(&page),
            outcome @ QueryOutcome::NotReady { .. } => print_json(&outcome),
        },
        Command::Summary { subject } => print_json(&tracker.summary(&subject)?),
    }
}
