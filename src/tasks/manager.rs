//! Job tracker: starts syncs in the background, enforces one running job per
//! subject, and answers status and preview polls.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;

use super::{JobHandle, JobId, JobStatus, SyncJob};
use crate::config::Config;
use crate::db::{CacheSummary, Database};
use crate::error::{require_subject, Result, SyncError};
use crate::query::{CompositeQuery, PreviewRequest, QueryEngine, QueryOutcome};
use crate::remote::RemoteLayerClient;
use crate::sync::{SyncOptions, Synchronizer};

/// Answer to a sync request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncTicket {
    pub job_id: JobId,
    /// The subject's cache was fresh when the request arrived.
    pub fresh: bool,
    /// An already running job for the subject was returned.
    pub reused: bool,
}

#[derive(Default)]
struct Registry {
    jobs: HashMap<JobId, Arc<JobHandle>>,
    /// Latest job per subject.
    by_subject: HashMap<String, JobId>,
}

struct Inner {
    db: Arc<Database>,
    synchronizer: Synchronizer,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    retention: chrono::Duration,
    fresh_for: chrono::Duration,
    preview_page_size: usize,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look a job up without purging, falling back to the job table for jobs
    /// recorded by an earlier process.
    fn lookup(&self, id: JobId) -> Result<SyncJob> {
        if let Some(handle) = self.registry().jobs.get(&id) {
            return Ok(handle.snapshot());
        }
        self.db.get_job(id)?.ok_or(SyncError::JobNotFound(id))
    }
}

/// Shared handle to the tracker. Cloning is cheap.
#[derive(Clone)]
pub struct JobTracker {
    inner: Arc<Inner>,
}

impl JobTracker {
    pub fn new(config: &Config, db: Arc<Database>, client: Arc<dyn RemoteLayerClient>) -> Result<Self> {
        let interrupted = db.fail_interrupted_jobs(Utc::now())?;
        if interrupted > 0 {
            tracing::warn!(count = interrupted, "Marked jobs from a previous run as failed");
        }
        let next_id = db.max_job_id()? + 1;

        let synchronizer = Synchronizer::new(config, db.clone(), client)?;

        Ok(Self {
            inner: Arc::new(Inner {
                db,
                synchronizer,
                registry: Mutex::new(Registry::default()),
                next_id: AtomicU64::new(next_id),
                retention: config.cache.job_retention(),
                fresh_for: config.cache.fresh_for(),
                preview_page_size: config.cache.preview_page_size,
            }),
        })
    }

    /// Start a sync for `subject`, or return the job already running for it.
    pub fn start_sync(&self, subject: &str, force: bool) -> Result<SyncTicket> {
        let subject = require_subject(subject)?;
        self.purge_expired();

        let fresh = !force && self.inner.db.summary(subject)?.is_fresh(Utc::now(), self.inner.fresh_for);

        let mut registry = self.inner.registry();
        if let Some(id) = registry.by_subject.get(subject).copied() {
            if let Some(handle) = registry.jobs.get(&id) {
                if !handle.snapshot().status.is_terminal() {
                    tracing::debug!(subject, job = %id, "Sync already running, reusing job");
                    return Ok(SyncTicket {
                        job_id: id,
                        fresh,
                        reused: true,
                    });
                }
            }
        }

        let id = JobId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let handle = Arc::new(JobHandle::new(SyncJob::new(id, subject, Utc::now()), self.inner.db.clone()));
        registry.jobs.insert(id, handle.clone());
        registry.by_subject.insert(subject.to_string(), id);
        drop(registry);

        let inner = self.inner.clone();
        let worker = handle.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("sync-{}", id))
            .spawn(move || run_job(&inner, &worker, force));

        if let Err(e) = spawned {
            handle.fail(&format!("could not start worker: {}", e));
            return Err(SyncError::Io(e));
        }

        tracing::info!(subject, job = %id, force, fresh, "Sync job started");
        Ok(SyncTicket {
            job_id: id,
            fresh,
            reused: false,
        })
    }

    pub fn status(&self, id: JobId) -> Result<SyncJob> {
        self.purge_expired();
        self.inner.lookup(id)
    }

    /// A page of the job's subject, once the job has completed.
    pub fn preview(&self, id: JobId, request: PreviewRequest) -> Result<QueryOutcome> {
        let job = self.status(id)?;
        if job.status != JobStatus::Completed {
            return Ok(QueryOutcome::NotReady { status: job.status });
        }
        let query = request.into_query(&job.subject, self.inner.preview_page_size);
        Ok(QueryOutcome::Ready(QueryEngine::new(&self.inner.db).query(&query)?))
    }

    /// Query a subject directly. While a sync for it is in flight the answer
    /// is `NotReady`.
    pub fn query(&self, query: &CompositeQuery) -> Result<QueryOutcome> {
        let subject = require_subject(&query.subject)?;
        let running = {
            let registry = self.inner.registry();
            registry
                .by_subject
                .get(subject)
                .and_then(|id| registry.jobs.get(id))
                .map(|handle| handle.snapshot().status)
                .filter(|status| !status.is_terminal())
        };
        if let Some(status) = running {
            return Ok(QueryOutcome::NotReady { status });
        }
        Ok(QueryOutcome::Ready(QueryEngine::new(&self.inner.db).query(query)?))
    }

    pub fn summary(&self, subject: &str) -> Result<CacheSummary> {
        let subject = require_subject(subject)?;
        self.inner.db.summary(subject)
    }

    /// Block until the job is terminal or `timeout` passes, polling every
    /// `poll`. Returns the last snapshot either way.
    pub fn wait(&self, id: JobId, poll: Duration, timeout: Duration) -> Result<SyncJob> {
        let started = Instant::now();
        loop {
            let job = self.inner.lookup(id)?;
            if job.status.is_terminal() || started.elapsed() >= timeout {
                return Ok(job);
            }
            std::thread::sleep(poll);
        }
    }

    /// Drop finished jobs older than the retention window. Returns how many
    /// in-memory jobs were dropped.
    pub fn purge_expired(&self) -> usize {
        let cutoff = Utc::now()
            .checked_sub_signed(self.inner.retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let removed = {
            let mut registry = self.inner.registry();
            let before = registry.jobs.len();
            registry.jobs.retain(|_, handle| {
                let job = handle.snapshot();
                !(job.status.is_terminal() && job.updated_at < cutoff)
            });
            let Registry { jobs, by_subject } = &mut *registry;
            by_subject.retain(|_, id| jobs.contains_key(id));
            before - jobs.len()
        };

        if let Err(e) = self.inner.db.delete_finished_jobs_before(cutoff) {
            tracing::warn!(error = %e, "Failed to purge expired jobs");
        }
        removed
    }
}

/// Worker body. Every outcome, including a panic, ends in a terminal state.
fn run_job(inner: &Inner, handle: &JobHandle, force: bool) {
    let job = handle.snapshot();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let result = inner.synchronizer.sync(&job.subject, SyncOptions { force }, handle)?;
        handle.set_status(JobStatus::Preparing);
        QueryEngine::new(&inner.db).prepare(&job.subject, inner.preview_page_size)?;
        Ok::<_, SyncError>(result)
    }));

    match outcome {
        Ok(Ok(result)) => {
            tracing::info!(
                job = %job.id,
                subject = %job.subject,
                from_cache = result.from_cache,
                written = result.parents_written,
                deleted = result.parents_deleted,
                "Sync job completed"
            );
            handle.complete(&result);
        }
        Ok(Err(e)) => {
            tracing::error!(job = %job.id, subject = %job.subject, error = %e, "Sync job failed");
            handle.fail(&e.to_string());
        }
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(job = %job.id, subject = %job.subject, panic = %message, "Sync worker panicked");
            handle.fail(&format!("worker panicked: {}", message));
        }
    }
}
