//! Error types for the watcher pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from watching and debouncing.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Failed to initialize watcher: {reason}")]
    InitFailed { reason: String },

    #[error("Cannot watch path {path}: {reason}")]
    PathWatchFailed { path: PathBuf, reason: String },

    #[error("Invalid watch configuration: {reason}")]
    ConfigError { reason: String },

    #[error("No watch roots configured")]
    NoRoots,
}

impl From<notify::Error> for WatchError {
    fn from(e: notify::Error) -> Self {
        WatchError::InitFailed {
            reason: e.to_string(),
        }
    }
}
