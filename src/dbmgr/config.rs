//! Manager configuration and pluggable collaborators.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::options::ConnectionOptions;
use crate::errors::Error;

/// Resolve a database id to the file backing it. Must be pure and cheap.
pub type FnGetPath = Arc<dyn Fn(&str) -> Result<PathBuf, Error> + Send + Sync>;

/// Produce the database file for a new id, flushed to disk. Must be
/// idempotent.
pub type FnCreateDb = Arc<dyn Fn(&str, &ConnectionOptions) -> Result<(), Error> + Send + Sync>;

/// Decide whether `user`/`password` may open `database`. An error counts as
/// a denial.
pub type FnCheckAccess = Arc<dyn Fn(&str, &str, &str) -> Result<bool, Error> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub base_dir: PathBuf,
    /// A new open is refused once this many databases are open. Advisory:
    /// concurrent openers may overshoot by their own count.
    pub max_open: usize,
    pub max_idle_time: Duration,
    pub sweep_each: Duration,
    /// Cadence for checkpointing WAL-journal databases. Zero disables.
    pub checkpoint_each: Duration,
    pub log_open_close: bool,
    pub default_options: ConnectionOptions,
}

impl Default for ManagerConfig {
    fn default() -> ManagerConfig {
        ManagerConfig {
            base_dir: PathBuf::from("/tmp"),
            max_open: 500,
            max_idle_time: Duration::from_secs(600),
            sweep_each: Duration::from_secs(30),
            checkpoint_each: Duration::from_secs(300),
            log_open_close: true,
            default_options: ConnectionOptions::default(),
        }
    }
}
