// File: registry/src/errors.rs
//! Error types for the data directory registry
//!
//! Every failure carries the id, path or field it concerns so callers can
//! report it without re-reading the directory.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = RegistryError> = std::result::Result<T, E>;

/// Main error type for registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("instance already exists: {instance_id}")]
    InstanceAlreadyExists { instance_id: String },

    #[error("instance not found: {instance_id}")]
    InstanceNotFound { instance_id: String },

    #[error("invalid instance {}: {defect}", path.display())]
    InvalidInstance {
        path: PathBuf,
        #[source]
        defect: InstanceDefect,
    },

    #[error("invalid instance directory {}: state.json not found", path.display())]
    InvalidInstanceDir { path: PathBuf },

    #[error("invalid id '{id}': must be a single, non-empty path component")]
    InvalidId { id: String },

    #[error("temporary directory already exists: {id}")]
    TempDirAlreadyExists { id: String },

    #[error("temporary directory does not exist: {id}")]
    TempDirDoesNotExist { id: String },

    #[error("temporary path is not a directory: {}", path.display())]
    TempIsNotDir { path: PathBuf },

    #[error("backup already exists: {backup_id}")]
    BackupAlreadyExists { backup_id: String },

    #[error("backup not found: {backup_id}")]
    BackupNotFound { backup_id: String },

    #[error("invalid backup id '{value}': {reason}")]
    InvalidBackupId { value: String, reason: String },

    #[error("monitoring stack not found: {}", path.display())]
    MonitoringStackNotFound { path: PathBuf },

    #[error("{} is not a directory", path.display())]
    NotADirectory { path: PathBuf },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize instance state: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Why an instance failed validation or parsing
#[derive(Debug, Error)]
pub enum InstanceDefect {
    #[error("{0} is empty")]
    EmptyField(&'static str),

    #[error("{0} is not usable as a directory name")]
    UnsafeId(&'static str),

    #[error("invalid state.json file: {0}")]
    Malformed(#[source] serde_json::Error),
}

/// Lock acquisition and release failures
#[derive(Debug, Error)]
pub enum LockError {
    #[error("{} is not locked", path.display())]
    NotLocked { path: PathBuf },

    #[error("lock I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl RegistryError {
    /// Wrap an I/O error with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        RegistryError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RegistryError::InstanceNotFound { .. }
                | RegistryError::TempDirDoesNotExist { .. }
                | RegistryError::BackupNotFound { .. }
                | RegistryError::MonitoringStackNotFound { .. }
        )
    }
}

/// Extension for attaching a path to `io::Result`s
pub(crate) trait IoContext<T> {
    fn at(self, path: &std::path::Path) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, path: &std::path::Path) -> Result<T> {
        self.map_err(|e| RegistryError::io(path, e))
    }
}
