//! Timestamped backup files.
//!
//! Naming convention: `<name>-<YYYYMMDD-HHMMSS>-backup.<ext>`, so the
//! set of backups for a plugin can be recovered by listing the backup
//! directory.

use chrono::Local;
use gantry_core::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

const BACKUP_SUFFIX: &str = "-backup";

/// Copy `source` into `backup_dir` under the timestamped backup name.
pub fn backup_file(source: &Path, backup_dir: &Path, name: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(backup_dir).map_err(|e| Error::io(backup_dir, e))?;

    let ext = source
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or(gantry_core::BUNDLE_EXTENSION);
    let stamp = Local::now().format("%Y%m%d-%H%M%S");
    let backup = backup_dir.join(format!("{name}-{stamp}{BACKUP_SUFFIX}.{ext}"));

    std::fs::copy(source, &backup).map_err(|e| Error::io(&backup, e))?;
    debug!(plugin = name, backup = %backup.display(), "bundle backed up");
    Ok(backup)
}

/// Most recent backup for a plugin by filesystem mtime, if any.
#[must_use]
pub fn latest_backup(backup_dir: &Path, name: &str) -> Option<PathBuf> {
    backups_for(backup_dir, name)
        .into_iter()
        .max_by_key(|path| mtime(path))
}

/// All backup files for a plugin.
#[must_use]
pub(crate) fn backups_for(backup_dir: &Path, name: &str) -> Vec<PathBuf> {
    let prefix = format!("{name}-");
    list_backups(backup_dir)
        .into_iter()
        .filter(|path| {
            path.file_name()
                .and_then(|f| f.to_str())
                .is_some_and(|f| f.starts_with(&prefix))
        })
        .collect()
}

/// Every backup file in the directory.
#[must_use]
pub(crate) fn list_backups(backup_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(backup_dir) else {
        return Vec::new();
    };
    entries
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .is_some_and(|s| s.ends_with(BACKUP_SUFFIX))
        })
        .collect()
}

pub(crate) fn mtime(path: &Path) -> SystemTime {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn backup_naming_convention() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("demo.gpk");
        std::fs::write(&source, b"v1").unwrap();

        let backup = backup_file(&source, &dir.path().join("backups"), "demo").unwrap();
        let file = backup.file_name().unwrap().to_str().unwrap();
        assert!(file.starts_with("demo-"));
        assert!(file.ends_with("-backup.gpk"));
        assert_eq!(std::fs::read(&backup).unwrap(), b"v1");
    }

    #[test]
    fn latest_backup_by_mtime() {
        let dir = TempDir::new().unwrap();
        let backups = dir.path().join("backups");
        std::fs::create_dir_all(&backups).unwrap();

        let older = backups.join("demo-20240101-000000-backup.gpk");
        let newer = backups.join("demo-20240102-000000-backup.gpk");
        std::fs::write(&older, b"old").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(&newer, b"new").unwrap();

        assert_eq!(latest_backup(&backups, "demo"), Some(newer));
        assert_eq!(latest_backup(&backups, "other"), None);
    }
}
