//! Plugin configuration store.

use crate::error::{ConfigError, Result};
use crate::properties;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const CONFIG_FILE: &str = "config.properties";

/// Configuration for a single plugin, backed by a properties file.
pub struct PluginConfig {
    path: PathBuf,
    values: RwLock<BTreeMap<String, String>>,
}

impl std::fmt::Debug for PluginConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginConfig")
            .field("path", &self.path)
            .field("keys", &self.values.read().len())
            .finish()
    }
}

impl PluginConfig {
    /// Open a config file, creating it (with the given defaults) when
    /// absent.
    pub fn open(path: PathBuf, defaults: BTreeMap<String, String>) -> Result<Self> {
        let config = Self {
            path,
            values: RwLock::new(defaults),
        };
        if config.path.exists() {
            config.reload()?;
        } else {
            if let Some(parent) = config.path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| ConfigError::io(parent, e))?;
            }
            config.save()?;
        }
        Ok(config)
    }

    /// Backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// String value, or `default` when the key is absent.
    #[must_use]
    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.values
            .read()
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    /// 32-bit integer value; `default` when absent or unparsable.
    #[must_use]
    pub fn get_int(&self, key: &str, default: i32) -> i32 {
        self.parsed(key).unwrap_or(default)
    }

    /// 64-bit integer value; `default` when absent or unparsable.
    #[must_use]
    pub fn get_long(&self, key: &str, default: i64) -> i64 {
        self.parsed(key).unwrap_or(default)
    }

    /// Floating-point value; `default` when absent or unparsable.
    #[must_use]
    pub fn get_double(&self, key: &str, default: f64) -> f64 {
        self.parsed(key).unwrap_or(default)
    }

    /// Boolean value. `true`, `yes`, `1`, and `on` (case-insensitive)
    /// parse as true; any other present value is false.
    #[must_use]
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.values.read().get(key) {
            Some(raw) => {
                matches!(
                    raw.to_ascii_lowercase().as_str(),
                    "true" | "yes" | "1" | "on"
                )
            }
            None => default,
        }
    }

    /// Comma-separated list value; empty when absent.
    #[must_use]
    pub fn get_string_list(&self, key: &str) -> Vec<String> {
        self.values
            .read()
            .get(key)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Set a value. Lists are stored comma-separated by callers.
    pub fn set(&self, key: impl Into<String>, value: impl ToString) {
        self.values.write().insert(key.into(), value.to_string());
    }

    /// Whether a key is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.read().contains_key(key)
    }

    /// All keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.values.read().keys().cloned().collect()
    }

    /// A copy of every key/value pair.
    #[must_use]
    pub fn all(&self) -> BTreeMap<String, String> {
        self.values.read().clone()
    }

    /// Persist to disk atomically (write temp, then rename).
    pub fn save(&self) -> Result<()> {
        let text = properties::render(&self.values.read());
        let tmp = self.path.with_extension("properties.tmp");
        std::fs::write(&tmp, text).map_err(|e| ConfigError::io(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| ConfigError::io(&self.path, e))?;
        debug!(path = %self.path.display(), "config saved");
        Ok(())
    }

    /// Re-read values from disk, discarding unsaved changes.
    pub fn reload(&self) -> Result<()> {
        let text =
            std::fs::read_to_string(&self.path).map_err(|e| ConfigError::io(&self.path, e))?;
        *self.values.write() = properties::parse(&text);
        Ok(())
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.values.read().get(key).and_then(|raw| raw.parse().ok())
    }
}

/// Store handing out per-plugin configs under a shared data directory.
pub struct ConfigStore {
    data_dir: PathBuf,
    handles: DashMap<String, Arc<PluginConfig>>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("data_dir", &self.data_dir)
            .field("open", &self.handles.len())
            .finish()
    }
}

impl ConfigStore {
    /// Create a store rooted at `data_dir`.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            handles: DashMap::new(),
        }
    }

    /// Root data directory.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Config handle for a plugin, opening (and creating) the backing
    /// file on first access.
    pub fn plugin(&self, name: &str) -> Result<Arc<PluginConfig>> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(ConfigError::InvalidName { name: name.into() });
        }
        if let Some(existing) = self.handles.get(name) {
            return Ok(Arc::clone(&existing));
        }
        let path = self.data_dir.join(name).join(CONFIG_FILE);
        let config = Arc::new(PluginConfig::open(path, BTreeMap::new())?);
        self.handles.insert(name.to_string(), Arc::clone(&config));
        Ok(config)
    }

    /// Drop the cached handle for a plugin (the file stays on disk).
    pub fn evict(&self, name: &str) {
        self.handles.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn creates_file_on_first_access() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());

        let config = store.plugin("demo").unwrap();
        assert!(dir.path().join("demo").join(CONFIG_FILE).exists());
        assert!(config.keys().is_empty());
    }

    #[test]
    fn rejects_path_like_names() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());
        assert!(store.plugin("..").is_err());
        assert!(store.plugin("a/b").is_err());
        assert!(store.plugin("").is_err());
    }

    #[test]
    fn typed_getters() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());
        let config = store.plugin("demo").unwrap();

        config.set("count", 42);
        config.set("ratio", 0.5);
        config.set("big", 9_000_000_000_i64);
        config.set("flag", "YES");
        config.set("items", "a, b , c");

        assert_eq!(config.get_int("count", 0), 42);
        assert_eq!(config.get_long("big", 0), 9_000_000_000);
        assert!((config.get_double("ratio", 0.0) - 0.5).abs() < f64::EPSILON);
        assert!(config.get_bool("flag", false));
        assert_eq!(config.get_string_list("items"), vec!["a", "b", "c"]);

        // defaults
        assert_eq!(config.get_int("absent", 7), 7);
        assert!(config.get_bool("absent", true));
        assert_eq!(config.get_string("absent", "d"), "d");
        assert!(config.get_string_list("absent").is_empty());
    }

    #[test]
    fn bool_falsy_values() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());
        let config = store.plugin("demo").unwrap();

        config.set("off", "off");
        config.set("junk", "maybe");
        assert!(!config.get_bool("off", true));
        assert!(!config.get_bool("junk", true));
    }

    #[test]
    fn save_reload_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());
        let config = store.plugin("demo").unwrap();

        config.set("count", 42);
        config.set("items", "x,y");
        config.save().unwrap();

        config.set("count", 99);
        config.reload().unwrap();

        assert_eq!(config.get_int("count", 0), 42);
        assert_eq!(config.keys(), vec!["count", "items"]);
        assert_eq!(config.get_string_list("items"), vec!["x", "y"]);
    }

    #[test]
    fn no_temp_file_left_after_save() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());
        let config = store.plugin("demo").unwrap();
        config.set("k", "v");
        config.save().unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path().join("demo"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries, vec![CONFIG_FILE]);
    }
}
