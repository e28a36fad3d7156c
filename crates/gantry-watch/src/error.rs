//! Watcher error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the file watcher.
#[derive(Error, Debug)]
pub enum WatchError {
    /// The underlying filesystem notification backend failed.
    #[error("watch backend error: {0}")]
    Notify(#[from] notify::Error),

    /// Filesystem access failed.
    #[error("watch io error at {}: {source}", .path.display())]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Result type for watcher operations.
pub type Result<T> = std::result::Result<T, WatchError>;
