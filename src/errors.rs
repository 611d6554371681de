//! Error types for sync operations

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Local sync root is missing: {0}")]
    RootMissing(PathBuf),

    #[error("Remote repository error: {0}")]
    Remote(String),

    #[error("Remote object not found: {0}")]
    RemoteNotFound(String),

    #[error("Permission denied on remote operation: {0}")]
    PermissionDenied(String),

    #[error("Path {path} is outside the sync root {root}")]
    OutsideRoot { path: PathBuf, root: PathBuf },

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config encode error: {0}")]
    ConfigEncode(#[from] toml::ser::Error),

    #[error("Watcher error: {0}")]
    Watcher(#[from] notify::Error),

    #[error("Scheduler is not running")]
    SchedulerStopped,
}

impl SyncError {
    /// True for the one condition that aborts a whole reconciliation pass
    /// instead of being absorbed into its success flag.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::RootMissing(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
