use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use super::Database;
use crate::error::Result;

/// Per-subject aggregate, computed on demand.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheSummary {
    pub subject: String,
    pub exists: bool,
    pub record_count: i64,
    pub photo_count: i64,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl CacheSummary {
    /// Whether the last successful sync is younger than `fresh_for`.
    pub fn is_fresh(&self, now: DateTime<Utc>, fresh_for: Duration) -> bool {
        match self.last_sync_at {
            Some(at) => now.signed_duration_since(at) < fresh_for,
            None => false,
        }
    }
}

impl Database {
    pub fn summary(&self, subject: &str) -> Result<CacheSummary> {
        let conn = self.conn();

        let record_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM subject_parents WHERE subject = ?1 AND deleted = 0",
            [subject],
            |row| row.get(0),
        )?;
        let photo_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM photo_attachments WHERE subject = ?1",
            [subject],
            |row| row.get(0),
        )?;
        let last_sync_at: Option<DateTime<Utc>> = conn
            .query_row(
                "SELECT last_sync_at FROM subject_syncs WHERE subject = ?1",
                [subject],
                |row| row.get(0),
            )
            .optional()?;

        Ok(CacheSummary {
            subject: subject.to_string(),
            exists: last_sync_at.is_some() || record_count > 0,
            record_count,
            photo_count,
            last_sync_at,
        })
    }

    /// Mark a subject as successfully synced at `at`.
    pub fn record_sync(&self, subject: &str, at: DateTime<Utc>, record_count: i64) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO subject_syncs (subject, last_sync_at, record_count)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(subject) DO UPDATE SET
                last_sync_at = excluded.last_sync_at,
                record_count = excluded.record_count
            "#,
            params![subject, at, record_count],
        )?;
        Ok(())
    }
}
