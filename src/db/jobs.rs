//! Persistence for sync jobs.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};

use super::Database;
use crate::error::Result;
use crate::tasks::{JobId, JobStatus, SyncCounters, SyncJob};

const JOB_COLUMNS: &str = "id, subject, status, total, fetched, attachments_total, \
    attachments_downloaded, attachments_failed, from_cache, error_message, created_at, updated_at";

fn job_from_row(row: &Row) -> rusqlite::Result<SyncJob> {
    let status: String = row.get(2)?;
    let status = JobStatus::from_str(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(2, Type::Text, format!("unknown status '{}'", status).into())
    })?;

    Ok(SyncJob {
        id: JobId(row.get::<_, i64>(0)? as u64),
        subject: row.get(1)?,
        status,
        counters: SyncCounters {
            total: row.get::<_, i64>(3)? as u64,
            fetched: row.get::<_, i64>(4)? as u64,
            attachments_total: row.get::<_, i64>(5)? as u64,
            attachments_downloaded: row.get::<_, i64>(6)? as u64,
            attachments_failed: row.get::<_, i64>(7)? as u64,
        },
        from_cache: row.get(8)?,
        error: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

impl Database {
    pub fn save_job(&self, job: &SyncJob) -> Result<()> {
        let conn = self.conn();
        let c = &job.counters;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO sync_jobs (
                id, subject, status, total, fetched, attachments_total,
                attachments_downloaded, attachments_failed, from_cache, error_message,
                created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                job.id.0 as i64,
                job.subject,
                job.status.as_str(),
                c.total as i64,
                c.fetched as i64,
                c.attachments_total as i64,
                c.attachments_downloaded as i64,
                c.attachments_failed as i64,
                job.from_cache,
                job.error,
                job.created_at,
                job.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_job(&self, id: JobId) -> Result<Option<SyncJob>> {
        let conn = self.conn();
        let sql = format!("SELECT {} FROM sync_jobs WHERE id = ?1", JOB_COLUMNS);
        let job = conn.query_row(&sql, [id.0 as i64], job_from_row).optional()?;
        Ok(job)
    }

    pub fn max_job_id(&self) -> Result<u64> {
        let conn = self.conn();
        let max: Option<i64> = conn.query_row("SELECT MAX(id) FROM sync_jobs", [], |row| row.get(0))?;
        Ok(max.unwrap_or(0).max(0) as u64)
    }

    /// Remove finished jobs last updated before `cutoff`.
    pub fn delete_finished_jobs_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn();
        let removed = conn.execute(
            "DELETE FROM sync_jobs WHERE status IN ('completed', 'failed') AND updated_at < ?1",
            params![cutoff],
        )?;
        Ok(removed)
    }

    /// Fail jobs a previous process left running. Returns how many were found.
    pub fn fail_interrupted_jobs(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn();
        let failed = conn.execute(
            "UPDATE sync_jobs SET status = 'failed', error_message = 'interrupted', updated_at = ?1 \
             WHERE status NOT IN ('completed', 'failed')",
            params![now],
        )?;
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_db;
    use chrono::Duration;

    #[test]
    fn test_save_and_get_job() {
        let (_dir, db) = temp_db();
        let mut job = SyncJob::new(JobId(7), "S1", Utc::now());
        job.status = JobStatus::DownloadingPhotos;
        job.counters.fetched = 3;
        job.counters.attachments_total = 5;
        db.save_job(&job).unwrap();

        let loaded = db.get_job(JobId(7)).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::DownloadingPhotos);
        assert_eq!(loaded.counters.fetched, 3);
        assert_eq!(loaded.counters.attachments_total, 5);
        assert_eq!(db.max_job_id().unwrap(), 7);
        assert!(db.get_job(JobId(8)).unwrap().is_none());
    }

    #[test]
    fn test_interrupted_and_expired_jobs() {
        let (_dir, db) = temp_db();
        let old = Utc::now() - Duration::hours(2);

        let mut running = SyncJob::new(JobId(1), "S1", old);
        running.status = JobStatus::Syncing;
        db.save_job(&running).unwrap();

        let mut done = SyncJob::new(JobId(2), "S2", old);
        done.status = JobStatus::Completed;
        db.save_job(&done).unwrap();

        assert_eq!(db.fail_interrupted_jobs(Utc::now()).unwrap(), 1);
        let failed = db.get_job(JobId(1)).unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("interrupted"));

        let removed = db.delete_finished_jobs_before(Utc::now() - Duration::hours(1)).unwrap();
        assert_eq!(removed, 1);
        assert!(db.get_job(JobId(2)).unwrap().is_none());
        assert!(db.get_job(JobId(1)).unwrap().is_some());
    }
}
