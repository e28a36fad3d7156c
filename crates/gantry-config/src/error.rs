//! Configuration error types.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from the configuration store.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Filesystem access failed.
    #[error("config io error at {}: {source}", .path.display())]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Plugin name is unusable as a directory component.
    #[error("invalid plugin name '{name}' for config storage")]
    InvalidName {
        /// The offending name.
        name: String,
    },
}

impl ConfigError {
    /// Create an IO error with path context.
    #[must_use]
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;
