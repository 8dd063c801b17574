//! Store configuration
//!
//! Selects where the database lives and how the engine handles contention.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default time a connection waits on a locked database before failing
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Store configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreConfig {
    /// Database file, `None` for a private in-memory database
    path: Option<PathBuf>,
    /// How long the engine retries on `SQLITE_BUSY`
    busy_timeout: Duration,
    /// Write-ahead logging (file databases only)
    wal: bool,
}

impl StoreConfig {
    /// In-memory database, discarded when the last handle is dropped
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// File-backed database at `path` (created if missing)
    #[must_use]
    pub fn at(path: impl AsRef<Path>) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_wal(mut self, wal: bool) -> Self {
        self.wal = wal;
        self
    }

    /// Database file, if any
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        self.busy_timeout
    }

    /// WAL is only honoured for file databases
    #[must_use]
    pub fn wal(&self) -> bool {
        self.wal && self.path.is_some()
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            wal: false,
        }
    }
}
