//! Incremental local mirror of a layered survey feature service.
//!
//! A subject's parent features and their description and fact children are
//! pulled from the service, reconciled into SQLite, and their photo
//! attachments downloaded to disk. Syncs run as background jobs tracked by
//! [`tasks::JobTracker`]; the cached data is read through [`query`].

pub mod attachments;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod query;
pub mod records;
pub mod remote;
pub mod sync;
pub mod tasks;

pub use config::Config;
pub use error::{Result, SyncError};
pub use tasks::{JobTracker, SyncTicket};
