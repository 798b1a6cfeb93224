//! Sync jobs: identifiers, the status state machine and the live job state
//! object that the orchestrator updates and pollers read.

pub mod manager;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::db::Database;
use crate::sync::{SyncProgress, SyncResult};

pub use manager::{JobTracker, SyncTicket};

/// Unique identifier for a sync job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a sync job.
///
/// `pending → checking_cache → syncing → downloading_photos → preparing →
/// completed | failed`. A cache hit skips straight from `checking_cache` to
/// `preparing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    CheckingCache,
    Syncing,
    DownloadingPhotos,
    Preparing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::CheckingCache => "checking_cache",
            JobStatus::Syncing => "syncing",
            JobStatus::DownloadingPhotos => "downloading_photos",
            JobStatus::Preparing => "preparing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "checking_cache" => Some(JobStatus::CheckingCache),
            "syncing" => Some(JobStatus::Syncing),
            "downloading_photos" => Some(JobStatus::DownloadingPhotos),
            "preparing" => Some(JobStatus::Preparing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress counters reported while a sync runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounters {
    pub total: u64,
    pub fetched: u64,
    pub attachments_total: u64,
    pub attachments_downloaded: u64,
    pub attachments_failed: u64,
}

/// Snapshot of a sync job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncJob {
    pub id: JobId,
    pub subject: String,
    pub status: JobStatus,
    pub counters: SyncCounters,
    pub from_cache: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncJob {
    pub fn new(id: JobId, subject: &str, now: DateTime<Utc>) -> Self {
        Self {
            id,
            subject: subject.to_string(),
            status: JobStatus::Pending,
            counters: SyncCounters::default(),
            from_cache: false,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Progress percentage (0-100) over parents and attachments combined.
    pub fn percent(&self) -> u8 {
        let c = &self.counters;
        let total = c.total + c.attachments_total;
        if self.status == JobStatus::Completed {
            100
        } else if total == 0 {
            0
        } else {
            let done = c.fetched.min(c.total) + c.attachments_downloaded + c.attachments_failed;
            ((done as f64 / total as f64) * 100.0).min(100.0) as u8
        }
    }
}

/// Live state of a running job, shared between its worker and pollers.
pub struct JobHandle {
    job: Mutex<SyncJob>,
    db: Arc<Database>,
}

impl JobHandle {
    pub(crate) fn new(job: SyncJob, db: Arc<Database>) -> Self {
        let handle = Self {
            job: Mutex::new(job),
            db,
        };
        handle.persist(&handle.lock());
        handle
    }

    fn lock(&self) -> MutexGuard<'_, SyncJob> {
        self.job.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, job: &SyncJob) {
        if let Err(e) = self.db.save_job(job) {
            tracing::warn!(job = %job.id, error = %e, "Failed to persist job state");
        }
    }

    pub fn id(&self) -> JobId {
        self.lock().id
    }

    pub fn snapshot(&self) -> SyncJob {
        self.lock().clone()
    }

    pub fn set_status(&self, status: JobStatus) {
        let mut job = self.lock();
        if job.status.is_terminal() {
            return;
        }
        job.status = status;
        job.updated_at = Utc::now();
        tracing::debug!(job = %job.id, subject = %job.subject, status = %status, "Job status changed");
        self.persist(&job);
    }

    pub(crate) fn complete(&self, result: &SyncResult) {
        let mut job = self.lock();
        job.status = JobStatus::Completed;
        job.counters = result.counters;
        job.from_cache = result.from_cache;
        job.updated_at = Utc::now();
        self.persist(&job);
    }

    pub(crate) fn fail(&self, message: &str) {
        let mut job = self.lock();
        job.status = JobStatus::Failed;
        job.error = Some(message.to_string());
        job.updated_at = Utc::now();
        self.persist(&job);
    }
}

impl SyncProgress for JobHandle {
    fn phase(&self, status: JobStatus) {
        self.set_status(status);
    }

    fn counters(&self, counters: &SyncCounters) {
        let mut job = self.lock();
        job.counters = *counters;
        job.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_db;

    #[test]
    fn test_status_round_trip_and_terminal() {
        let all = [
            JobStatus::Pending,
            JobStatus::CheckingCache,
            JobStatus::Syncing,
            JobStatus::DownloadingPhotos,
            JobStatus::Preparing,
            JobStatus::Completed,
            JobStatus::Failed,
        ];
        for status in all {
            assert_eq!(JobStatus::from_str(status.as_str()), Some(status));
        }
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Preparing.is_terminal());
    }

    #[test]
    fn test_percent() {
        let mut job = SyncJob::new(JobId(1), "S", Utc::now());
        assert_eq!(job.percent(), 0);

        job.counters = SyncCounters {
            total: 4,
            fetched: 2,
            attachments_total: 4,
            attachments_downloaded: 1,
            attachments_failed: 1,
        };
        assert_eq!(job.percent(), 50);

        job.status = JobStatus::Completed;
        assert_eq!(job.percent(), 100);
    }

    #[test]
    fn test_handle_ignores_updates_after_terminal() {
        let (_dir, db) = temp_db();
        let handle = JobHandle::new(SyncJob::new(JobId(3), "S", Utc::now()), Arc::new(db));

        handle.fail("boom");
        handle.set_status(JobStatus::Syncing);

        let job = handle.snapshot();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("boom"));
    }
}
