//! Error types for Gantry operations.

use crate::state::PluginState;
use std::path::PathBuf;
use thiserror::Error;

/// Lifecycle operation, used to qualify [`Error::OperationFailed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Loading a plugin from its bundle.
    Load,
    /// Enabling a loaded plugin.
    Enable,
    /// Disabling an enabled plugin.
    Disable,
    /// Reloading a plugin in place.
    Reload,
    /// Unloading a plugin and tearing down its namespace.
    Unload,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Load => write!(f, "load"),
            Self::Enable => write!(f, "enable"),
            Self::Disable => write!(f, "disable"),
            Self::Reload => write!(f, "reload"),
            Self::Unload => write!(f, "unload"),
        }
    }
}

/// Main error type for Gantry.
#[derive(Error, Debug)]
pub enum Error {
    /// Bundle manifest missing a required field or unreadable.
    #[error("invalid metadata in '{}': {reason}", .bundle.display())]
    Metadata {
        /// Bundle path.
        bundle: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Namespace construction or entry instantiation failed.
    #[error("failed to load '{}': {reason}", .bundle.display())]
    Load {
        /// Bundle path.
        bundle: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Plugin not registered.
    #[error("plugin '{name}' is not registered")]
    NotFound {
        /// Plugin name.
        name: String,
    },

    /// Duplicate registration attempt.
    #[error("plugin '{name}' is already registered")]
    AlreadyRegistered {
        /// Plugin name.
        name: String,
    },

    /// State machine violation.
    #[error("plugin '{name}': invalid state transition {from} -> {to}")]
    InvalidTransition {
        /// Plugin name.
        name: String,
        /// State before the attempted transition.
        from: PluginState,
        /// Requested state.
        to: PluginState,
    },

    /// A listed dependency is absent from the plugin set.
    #[error("plugin '{plugin}' depends on missing plugin '{dependency}'")]
    MissingDependency {
        /// Dependent plugin.
        plugin: String,
        /// The missing dependency.
        dependency: String,
    },

    /// Cycle in the dependency graph.
    #[error("circular dependency detected: {}", .cycle.join(" -> "))]
    CircularDependency {
        /// The cycle, starting and ending with the same name.
        cycle: Vec<String>,
    },

    /// A lifecycle operation failed; wraps the underlying error.
    #[error("{op} failed for plugin '{name}': {source}")]
    OperationFailed {
        /// Which operation failed.
        op: Operation,
        /// Plugin name.
        name: String,
        /// Underlying error.
        #[source]
        source: Box<Error>,
    },

    /// An update stage failed. Surfaced inside update reports rather than
    /// aborting the batch.
    #[error("update of '{name}' failed during {stage}: {reason}")]
    Update {
        /// Plugin name.
        name: String,
        /// Stage that failed (backup, copy, restore, ...).
        stage: String,
        /// What went wrong.
        reason: String,
    },

    /// Snapshot capture or restore failed.
    #[error("state error: {reason}")]
    State {
        /// What went wrong.
        reason: String,
    },

    /// Version string is not dotted-numeric.
    #[error("invalid version '{raw}'")]
    InvalidVersion {
        /// The offending string.
        raw: String,
    },

    /// IO error with path context.
    #[error("io error at {}: {source}", .path.display())]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Create an IO error with path context.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a metadata error.
    #[must_use]
    pub fn metadata(bundle: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Metadata {
            bundle: bundle.into(),
            reason: reason.into(),
        }
    }

    /// Create a load error.
    #[must_use]
    pub fn load(bundle: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Load {
            bundle: bundle.into(),
            reason: reason.into(),
        }
    }

    /// Create a state error.
    #[must_use]
    pub fn state(reason: impl Into<String>) -> Self {
        Self::State {
            reason: reason.into(),
        }
    }

    /// Wrap an error as a failed lifecycle operation.
    #[must_use]
    pub fn operation(op: Operation, name: impl Into<String>, source: Error) -> Self {
        Self::OperationFailed {
            op,
            name: name.into(),
            source: Box::new(source),
        }
    }
}

/// Result type for Gantry operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_display() {
        assert_eq!(Operation::Load.to_string(), "load");
        assert_eq!(Operation::Reload.to_string(), "reload");
    }

    #[test]
    fn cycle_display() {
        let err = Error::CircularDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "circular dependency detected: a -> b -> a");
    }

    #[test]
    fn operation_failed_wraps_source() {
        let inner = Error::NotFound { name: "x".into() };
        let err = Error::operation(Operation::Enable, "x", inner);
        assert!(err.to_string().contains("enable failed for plugin 'x'"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
