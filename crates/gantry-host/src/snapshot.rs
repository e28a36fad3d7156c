//! Hot-reload state snapshots.
//!
//! A snapshot captures a plugin's restorable runtime state: config
//! entries, a plugin-supplied custom data map, and the ids of its active
//! tasks. Snapshots are serialized as JSON and written atomically
//! (write-temp-then-rename).

use gantry_core::{Error, Result, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Serialized capture of a plugin's runtime state.
///
/// The on-disk schema uses camelCase keys (`pluginName`, `configData`,
/// `customData`, `activeTaskIds`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    /// Owning plugin.
    pub plugin_name: String,
    /// Plugin version at capture time.
    pub version: Version,
    /// Capture time, milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Config entries at capture time.
    pub config_data: BTreeMap<String, String>,
    /// Plugin-supplied custom data.
    pub custom_data: BTreeMap<String, serde_json::Value>,
    /// Ids of tasks active at capture time.
    pub active_task_ids: Vec<u64>,
}

impl StateSnapshot {
    /// Create an empty snapshot stamped with the current time.
    #[must_use]
    pub fn new(plugin_name: impl Into<String>, version: Version) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            plugin_name: plugin_name.into(),
            version,
            timestamp,
            config_data: BTreeMap::new(),
            custom_data: BTreeMap::new(),
            active_task_ids: Vec::new(),
        }
    }
}

/// On-disk snapshot store: one `<name>.state` file per plugin.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Create a store rooted at `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Snapshot file path for a plugin.
    #[must_use]
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.state"))
    }

    /// Persist a snapshot atomically.
    pub fn write(&self, snapshot: &StateSnapshot) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir).map_err(|e| Error::io(&self.dir, e))?;
        let path = self.path_for(&snapshot.plugin_name);
        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| Error::state(format!("cannot serialize snapshot: {e}")))?;

        let tmp = path.with_extension("state.tmp");
        std::fs::write(&tmp, json).map_err(|e| Error::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| Error::io(&path, e))?;
        debug!(plugin = %snapshot.plugin_name, path = %path.display(), "snapshot written");
        Ok(path)
    }

    /// Read a plugin's snapshot, or `None` when absent.
    pub fn read(&self, name: &str) -> Result<Option<StateSnapshot>> {
        let path = self.path_for(name);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| Error::state(format!("corrupt snapshot {}: {e}", path.display())))
    }

    /// Delete a plugin's snapshot, if present.
    pub fn remove(&self, name: &str) {
        let path = self.path_for(name);
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }
    }

    /// The store's directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
