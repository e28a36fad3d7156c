//! Atomic bundle upgrades for the Gantry plugin host.
//!
//! Scans a pending-updates directory, classifies candidates against the
//! live plugin directory, applies them with timestamped backups, and can
//! roll a plugin back to its most recent backup.

mod backup;
mod manager;
mod types;

pub use backup::{backup_file, latest_backup};
pub use manager::UpdateManager;
pub use types::{
    UpdateCandidate, UpdateFailure, UpdateKind, UpdateOptions, UpdateReport, UpdateScan,
};
