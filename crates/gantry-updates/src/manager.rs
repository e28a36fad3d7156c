//! Update scanning and application.

use crate::backup::{self, backup_file, latest_backup};
use crate::types::{
    UpdateCandidate, UpdateFailure, UpdateKind, UpdateOptions, UpdateReport, UpdateScan,
};
use gantry_core::{Bundle, Error, Result, Version};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Scans, applies, and rolls back bundle updates.
///
/// Works purely on the filesystem; the plugin manager re-loads affected
/// plugins afterwards.
#[derive(Debug, Clone)]
pub struct UpdateManager {
    plugins_dir: PathBuf,
    updates_dir: PathBuf,
    backups_dir: PathBuf,
    options: UpdateOptions,
}

impl UpdateManager {
    /// Create a manager. The backup directory defaults to
    /// `plugin-backups`, a peer of the plugins directory.
    #[must_use]
    pub fn new(
        plugins_dir: impl Into<PathBuf>,
        updates_dir: impl Into<PathBuf>,
        options: UpdateOptions,
    ) -> Self {
        let plugins_dir = plugins_dir.into();
        let backups_dir = plugins_dir
            .parent()
            .map_or_else(|| PathBuf::from("plugin-backups"), Path::to_path_buf)
            .join("plugin-backups");
        Self {
            plugins_dir,
            updates_dir: updates_dir.into(),
            backups_dir,
            options,
        }
    }

    /// Override the backup directory.
    #[must_use]
    pub fn with_backups_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backups_dir = dir.into();
        self
    }

    /// Backup directory in use.
    #[must_use]
    pub fn backups_dir(&self) -> &Path {
        &self.backups_dir
    }

    /// Enumerate pending bundles and classify them against the
    /// installed set.
    pub fn scan(&self) -> Result<UpdateScan> {
        let mut scan = UpdateScan::default();
        if !self.updates_dir.exists() {
            return Ok(scan);
        }

        let installed = self.installed_bundles();

        for pending in bundle_files(&self.updates_dir) {
            let meta = match Bundle::read_metadata(&pending) {
                Ok(Some(meta)) => meta,
                Ok(None) => {
                    scan.invalid_files
                        .push((pending, "bundle has no manifest".to_string()));
                    continue;
                }
                Err(e) => {
                    scan.invalid_files.push((pending, e.to_string()));
                    continue;
                }
            };

            let existing = installed.get(&meta.name);
            let candidate = match existing {
                None => {
                    let target = pending.file_name().map_or_else(
                        || {
                            self.plugins_dir
                                .join(format!("{}.{}", meta.name, gantry_core::BUNDLE_EXTENSION))
                        },
                        |file_name| self.plugins_dir.join(file_name),
                    );
                    UpdateCandidate {
                        name: meta.name,
                        current_version: None,
                        new_version: meta.version,
                        source: pending,
                        target,
                        kind: UpdateKind::Install,
                    }
                }
                Some((target, current)) => {
                    let kind = match current {
                        Some(current) if meta.version > *current => UpdateKind::Update,
                        Some(current) => {
                            if self.options.check_version_constraints {
                                scan.skipped.push((
                                    pending,
                                    format!(
                                        "version {} is not newer than installed {current}",
                                        meta.version
                                    ),
                                ));
                                continue;
                            }
                            UpdateKind::Downgrade
                        }
                        // Installed version unreadable: the comparison
                        // fails open when checking is disabled.
                        None => {
                            if self.options.check_version_constraints {
                                scan.skipped.push((
                                    pending,
                                    "installed version is unreadable".to_string(),
                                ));
                                continue;
                            }
                            UpdateKind::Update
                        }
                    };
                    UpdateCandidate {
                        name: meta.name,
                        current_version: current.clone(),
                        new_version: meta.version,
                        source: pending,
                        target: target.clone(),
                        kind,
                    }
                }
            };
            scan.candidates.push(candidate);
        }

        debug!(
            candidates = scan.candidates.len(),
            skipped = scan.skipped.len(),
            invalid = scan.invalid_files.len(),
            "update scan complete"
        );
        Ok(scan)
    }

    /// Apply the candidates of a scan in list order.
    ///
    /// Per-candidate failures are recorded and the batch continues.
    pub fn apply(&self, scan: UpdateScan) -> UpdateReport {
        let mut report = UpdateReport {
            skipped: scan.skipped,
            invalid_files: scan.invalid_files,
            ..UpdateReport::default()
        };
        let mut applied_files: Vec<(PathBuf, Option<PathBuf>)> = Vec::new();

        for candidate in scan.candidates {
            let backup = if candidate.kind == UpdateKind::Install || !self.options.create_backups {
                None
            } else {
                match backup_file(&candidate.target, &self.backups_dir, &candidate.name) {
                    Ok(path) => Some(path),
                    Err(e) => {
                        warn!(plugin = %candidate.name, error = %e, "backup failed, skipping candidate");
                        report.failed.push(UpdateFailure {
                            name: candidate.name,
                            stage: "backup".to_string(),
                            reason: e.to_string(),
                        });
                        continue;
                    }
                }
            };

            match copy_over(&candidate.source, &candidate.target) {
                Ok(()) => {
                    info!(
                        plugin = %candidate.name,
                        kind = %candidate.kind,
                        version = %candidate.new_version,
                        "update applied"
                    );
                    report.applied.push(candidate.name);
                    applied_files.push((candidate.source, backup));
                }
                Err(e) => {
                    warn!(plugin = %candidate.name, error = %e, "update copy failed");
                    if let Some(backup) = &backup {
                        if let Err(restore_err) = copy_over(backup, &candidate.target) {
                            warn!(
                                plugin = %candidate.name,
                                error = %restore_err,
                                "restore from backup failed"
                            );
                            report.failed.push(UpdateFailure {
                                name: candidate.name.clone(),
                                stage: "restore".to_string(),
                                reason: restore_err.to_string(),
                            });
                        }
                    }
                    report.failed.push(UpdateFailure {
                        name: candidate.name,
                        stage: "copy".to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        for (source, backup) in applied_files {
            if self.options.cleanup_update_files {
                if let Err(e) = std::fs::remove_file(&source) {
                    warn!(file = %source.display(), error = %e, "cannot remove applied update file");
                }
            }
            if self.options.auto_cleanup_backups
                && let Some(backup) = backup
                && let Err(e) = std::fs::remove_file(&backup)
            {
                warn!(file = %backup.display(), error = %e, "cannot remove backup");
            }
        }

        report
    }

    /// Scan and apply in one step.
    pub fn apply_pending(&self) -> Result<UpdateReport> {
        let scan = self.scan()?;
        if scan.no_updates() {
            debug!("no pending updates");
            return Ok(UpdateReport::default());
        }
        Ok(self.apply(scan))
    }

    /// Restore a plugin's live bundle from its most recent backup.
    pub fn rollback(&self, name: &str) -> Result<PathBuf> {
        let backup = latest_backup(&self.backups_dir, name).ok_or_else(|| Error::Update {
            name: name.to_string(),
            stage: "rollback".to_string(),
            reason: "no backup found".to_string(),
        })?;

        let target = self
            .installed_bundles()
            .get(name)
            .map(|(path, _)| path.clone())
            .unwrap_or_else(|| {
                self.plugins_dir
                    .join(format!("{name}.{}", gantry_core::BUNDLE_EXTENSION))
            });

        copy_over(&backup, &target)?;
        info!(plugin = name, backup = %backup.display(), "rolled back from backup");
        Ok(target)
    }

    /// Delete backups older than the configured retention age.
    pub fn cleanup_old_backups(&self) -> Result<usize> {
        let Some(age) = self.options.max_backup_age else {
            return Ok(0);
        };
        let cutoff = SystemTime::now() - age;
        let mut removed = 0;
        for path in backup::list_backups(&self.backups_dir) {
            if backup::mtime(&path) < cutoff {
                std::fs::remove_file(&path).map_err(|e| Error::io(&path, e))?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "old backups cleaned up");
        }
        Ok(removed)
    }

    /// Map installed plugin names to their bundle path and version.
    ///
    /// Bundles with unreadable metadata fall back to their file stem as
    /// the name, with no version.
    fn installed_bundles(&self) -> HashMap<String, (PathBuf, Option<Version>)> {
        let mut installed = HashMap::new();
        for path in bundle_files(&self.plugins_dir) {
            match Bundle::read_metadata(&path) {
                Ok(Some(meta)) => {
                    installed.insert(meta.name, (path, Some(meta.version)));
                }
                _ => {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        installed.insert(stem.to_string(), (path.clone(), None));
                    }
                }
            }
        }
        installed
    }
}

/// Bundle files in a directory, sorted by name for determinism.
fn bundle_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .filter(|p| Bundle::is_bundle(p))
        .collect();
    files.sort();
    files
}

fn copy_over(source: &Path, target: &Path) -> Result<()> {
    std::fs::copy(source, target)
        .map(|_| ())
        .map_err(|e| Error::io(target, e))
}
