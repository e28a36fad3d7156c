//! Update candidate and result types.

use gantry_core::Version;
use std::path::PathBuf;
use std::time::Duration;

/// How a pending bundle relates to the installed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// No bundle with this plugin name is installed.
    Install,
    /// The pending version is newer than the installed one.
    Update,
    /// The pending version is not newer; applied only when version
    /// checking is disabled.
    Downgrade,
}

impl std::fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Install => write!(f, "install"),
            Self::Update => write!(f, "update"),
            Self::Downgrade => write!(f, "downgrade"),
        }
    }
}

/// A pending bundle selected for application.
#[derive(Debug, Clone)]
pub struct UpdateCandidate {
    /// Plugin name from the pending bundle's manifest.
    pub name: String,
    /// Installed version, when a matching bundle exists.
    pub current_version: Option<Version>,
    /// Version of the pending bundle.
    pub new_version: Version,
    /// Pending bundle file in the updates directory.
    pub source: PathBuf,
    /// Live bundle file the candidate will replace or create.
    pub target: PathBuf,
    /// Candidate classification.
    pub kind: UpdateKind,
}

/// Outcome of a scan over the updates directory.
#[derive(Debug, Clone, Default)]
pub struct UpdateScan {
    /// Candidates in application order.
    pub candidates: Vec<UpdateCandidate>,
    /// Pending files skipped by the version check, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
    /// Pending files whose metadata could not be read.
    pub invalid_files: Vec<(PathBuf, String)>,
}

impl UpdateScan {
    /// Whether the scan found nothing to do at all.
    #[must_use]
    pub fn no_updates(&self) -> bool {
        self.candidates.is_empty() && self.skipped.is_empty() && self.invalid_files.is_empty()
    }
}

/// A failed candidate inside an [`UpdateReport`].
#[derive(Debug, Clone)]
pub struct UpdateFailure {
    /// Plugin name.
    pub name: String,
    /// Stage that failed (`backup`, `copy`, `restore`).
    pub stage: String,
    /// What went wrong.
    pub reason: String,
}

/// Aggregated result of an apply batch.
#[derive(Debug, Clone, Default)]
pub struct UpdateReport {
    /// Successfully applied plugin names, in order.
    pub applied: Vec<String>,
    /// Failed candidates with stage and reason.
    pub failed: Vec<UpdateFailure>,
    /// Files skipped by the version check.
    pub skipped: Vec<(PathBuf, String)>,
    /// Files with unreadable metadata.
    pub invalid_files: Vec<(PathBuf, String)>,
}

impl UpdateReport {
    /// Whether there was nothing to apply.
    #[must_use]
    pub fn no_updates(&self) -> bool {
        self.applied.is_empty()
            && self.failed.is_empty()
            && self.skipped.is_empty()
            && self.invalid_files.is_empty()
    }
}

/// Update manager behavior flags.
#[derive(Debug, Clone)]
pub struct UpdateOptions {
    /// Skip candidates whose version is not newer than the installed one.
    pub check_version_constraints: bool,
    /// Back up the live bundle before replacing it.
    pub create_backups: bool,
    /// Delete backups of successfully applied updates after the batch.
    pub auto_cleanup_backups: bool,
    /// Delete successfully applied update files after the batch.
    pub cleanup_update_files: bool,
    /// Age beyond which [`UpdateManager::cleanup_old_backups`] deletes a
    /// backup. `None` disables retention cleanup.
    pub max_backup_age: Option<Duration>,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            check_version_constraints: true,
            create_backups: true,
            auto_cleanup_backups: false,
            cleanup_update_files: true,
            max_backup_age: None,
        }
    }
}

impl UpdateOptions {
    /// Toggle version checking.
    #[must_use]
    pub const fn with_version_check(mut self, enabled: bool) -> Self {
        self.check_version_constraints = enabled;
        self
    }

    /// Toggle pre-replacement backups.
    #[must_use]
    pub const fn with_backups(mut self, enabled: bool) -> Self {
        self.create_backups = enabled;
        self
    }

    /// Toggle deleting backups of successful updates.
    #[must_use]
    pub const fn with_auto_cleanup_backups(mut self, enabled: bool) -> Self {
        self.auto_cleanup_backups = enabled;
        self
    }

    /// Toggle deleting applied update files.
    #[must_use]
    pub const fn with_cleanup_update_files(mut self, enabled: bool) -> Self {
        self.cleanup_update_files = enabled;
        self
    }

    /// Set the backup retention age.
    #[must_use]
    pub const fn with_max_backup_age(mut self, age: Duration) -> Self {
        self.max_backup_age = Some(age);
        self
    }
}
