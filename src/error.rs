//! Error taxonomy for the sync engine.

use thiserror::Error;

use crate::tasks::JobId;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport failure or an error payload returned by the feature service.
    #[error("remote service error: {0}")]
    RemoteService(String),

    /// A single attachment could not be fetched or written. Never fatal to a sync.
    #[error("attachment '{filename}' failed: {message}")]
    Attachment { filename: String, message: String },

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("a subject key is required")]
    SubjectRequired,

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    pub fn remote(message: impl Into<String>) -> Self {
        SyncError::RemoteService(message.into())
    }

    pub fn attachment(filename: impl Into<String>, message: impl ToString) -> Self {
        SyncError::Attachment {
            filename: filename.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Trim a subject key, rejecting empty input.
pub fn require_subject(subject: &str) -> Result<&str> {
    let subject = subject.trim();
    if subject.is_empty() {
        Err(SyncError::SubjectRequired)
    } else {
        Ok(subject)
    }
}
