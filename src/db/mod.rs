//! Local cache store backed by SQLite.
//!
//! The connection sits behind a mutex so one [`Database`] can be shared
//! between a job's worker thread, the attachment pool and readers. Operations
//! that need several statements take the lock once and work on the
//! connection directly.

mod schema;
pub mod jobs;
pub mod photos;
pub mod records;
pub mod summary;

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::Result;

pub use photos::PhotoAttachment;
pub use records::{ParentUpdate, ReconcilePlan, ReconcileStats, StoredParent};
pub use schema::{MIGRATIONS, SCHEMA};
pub use summary::CacheSummary;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn initialize(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch(SCHEMA)?;
        for migration in MIGRATIONS {
            // Fails harmlessly when the column already exists
            let _ = conn.execute(migration, []);
        }
        Ok(())
    }

    /// Lock the connection. A panic on another thread while holding the lock
    /// does not invalidate SQLite state, so poisoning is ignored.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
