//! Extension points and extensions.
//!
//! An extension point is a string-identified capability contract;
//! extensions are instances provided by plugins, ordered per point by
//! ascending ordinal. Both indexes (by point, by plugin) stay
//! cross-consistent: unloading a plugin removes its extensions from
//! every point list.

use crate::namespace::PluginNamespace;
use gantry_core::{Error, Result};
use parking_lot::RwLock;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Contract for extension instances.
pub trait Extension: Any + Send + Sync {
    /// Identifier of the extension point this extension satisfies.
    fn extension_point(&self) -> &str;

    /// Sort key: lower ordinal sorts first (= higher priority).
    fn ordinal(&self) -> i32 {
        0
    }

    /// Disabled extensions are skipped at registration.
    fn enabled(&self) -> bool {
        true
    }

    /// Human-readable description.
    fn description(&self) -> &str {
        ""
    }

    /// Downcast access for consumers.
    fn as_any(&self) -> &dyn Any;
}

#[derive(Clone)]
struct ExtensionWrapper {
    instance: Arc<dyn Extension>,
    ordinal: i32,
    point: String,
    plugin: String,
    // Keeps the owning plugin's code alive while the extension is
    // registered.
    _namespace: Arc<PluginNamespace>,
}

/// Diagnostics snapshot of the extension manager.
#[derive(Debug, Clone, Default)]
pub struct ExtensionInfo {
    /// Registered extension points.
    pub points: usize,
    /// Registered extensions.
    pub extensions: usize,
    /// Extension count per point.
    pub per_point: BTreeMap<String, usize>,
}

/// Registry of extension points and their extensions.
#[derive(Default)]
pub struct ExtensionManager {
    by_point: RwLock<HashMap<String, Vec<ExtensionWrapper>>>,
    by_plugin: RwLock<HashMap<String, Vec<ExtensionWrapper>>>,
}

impl std::fmt::Debug for ExtensionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionManager")
            .field("points", &self.by_point.read().len())
            .finish_non_exhaustive()
    }
}

impl ExtensionManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an extension point, creating its (empty) list if absent.
    pub fn register_extension_point(&self, point: &str) -> Result<()> {
        if point.trim().is_empty() {
            return Err(Error::state("extension point id must not be empty"));
        }
        self.by_point.write().entry(point.to_string()).or_default();
        debug!(point, "extension point registered");
        Ok(())
    }

    /// Whether a point has been declared.
    #[must_use]
    pub fn has_extension_point(&self, point: &str) -> bool {
        self.by_point.read().contains_key(point)
    }

    /// Instantiate and register a plugin's extension candidates.
    ///
    /// For each candidate entry id: instantiate it in the plugin's
    /// namespace, skip disabled instances, and file it under its
    /// declared extension point. Unloadable candidates and unknown
    /// points are skipped with a warning. Each affected point list is
    /// re-sorted by ordinal ascending after insertion.
    pub fn register_extensions(
        &self,
        plugin: &str,
        namespace: &Arc<PluginNamespace>,
        candidates: &[String],
    ) {
        for entry in candidates {
            let instance = match namespace.instantiate_extension(entry) {
                Ok(instance) => instance,
                Err(e) => {
                    warn!(plugin, entry, error = %e, "skipping unloadable extension");
                    continue;
                }
            };
            if !instance.enabled() {
                debug!(plugin, entry, "skipping disabled extension");
                continue;
            }
            let point = instance.extension_point().to_string();
            if !self.has_extension_point(&point) {
                warn!(plugin, entry, point, "extension targets unknown extension point");
                continue;
            }

            let wrapper = ExtensionWrapper {
                ordinal: instance.ordinal(),
                instance,
                point: point.clone(),
                plugin: plugin.to_string(),
                _namespace: Arc::clone(namespace),
            };

            let mut by_point = self.by_point.write();
            let list = by_point.entry(point.clone()).or_default();
            list.push(wrapper.clone());
            list.sort_by_key(|w| w.ordinal);
            drop(by_point);

            self.by_plugin
                .write()
                .entry(plugin.to_string())
                .or_default()
                .push(wrapper);
            debug!(plugin, entry, point, "extension registered");
        }
    }

    /// All extensions for a point, in ordinal order.
    #[must_use]
    pub fn get(&self, point: &str) -> Vec<Arc<dyn Extension>> {
        self.by_point.read().get(point).map_or_else(Vec::new, |list| {
            list.iter().map(|w| Arc::clone(&w.instance)).collect()
        })
    }

    /// The highest-priority extension for a point, if any.
    #[must_use]
    pub fn get_first(&self, point: &str) -> Option<Arc<dyn Extension>> {
        self.by_point
            .read()
            .get(point)
            .and_then(|list| list.first())
            .map(|w| Arc::clone(&w.instance))
    }

    /// Extensions for a point owned by one plugin, in ordinal order.
    #[must_use]
    pub fn get_by_plugin(&self, point: &str, plugin: &str) -> Vec<Arc<dyn Extension>> {
        self.by_point.read().get(point).map_or_else(Vec::new, |list| {
            list.iter()
                .filter(|w| w.plugin == plugin)
                .map(|w| Arc::clone(&w.instance))
                .collect()
        })
    }

    /// Remove every extension owned by a plugin from both indexes.
    pub fn unregister_plugin(&self, plugin: &str) {
        let removed = self.by_plugin.write().remove(plugin);
        let Some(removed) = removed else { return };

        let mut by_point = self.by_point.write();
        for wrapper in &removed {
            if let Some(list) = by_point.get_mut(&wrapper.point) {
                list.retain(|w| w.plugin != plugin);
            }
        }
        debug!(plugin, count = removed.len(), "plugin extensions unregistered");
    }

    /// Remove all points and extensions.
    pub fn clear_all(&self) {
        self.by_point.write().clear();
        self.by_plugin.write().clear();
    }

    /// Diagnostics snapshot.
    #[must_use]
    pub fn info(&self) -> ExtensionInfo {
        let by_point = self.by_point.read();
        ExtensionInfo {
            points: by_point.len(),
            extensions: by_point.values().map(Vec::len).sum(),
            per_point: by_point
                .iter()
                .map(|(point, list)| (point.clone(), list.len()))
                .collect(),
        }
    }
}
