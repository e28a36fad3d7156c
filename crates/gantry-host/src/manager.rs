//! The plugin manager: composition root of the host.
//!
//! Discovery, dependency-ordered loading, enable/disable, reload,
//! unload, and shutdown. Batch operations log per-plugin failures and
//! keep going; single-plugin operations surface typed errors.

use crate::api::{Plugin, PluginContext};
use crate::event_bus::EventBus;
use crate::extensions::ExtensionManager;
use crate::loader::PluginLoader;
use crate::registry::{PluginRegistry, RegistryStatus};
use crate::scheduler::TaskScheduler;
use crate::timing::LifecycleTimings;
use dashmap::DashMap;
use gantry_config::ConfigStore;
use gantry_core::{Bundle, Error, Operation, PluginMetadata, PluginState, Result};
use gantry_updates::{UpdateManager, UpdateOptions, UpdateReport};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Plugin manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Directory holding active bundles.
    pub plugins_dir: PathBuf,
    /// Per-plugin data (config) directory.
    pub data_dir: PathBuf,
    /// Staging directory for loaded bundle copies.
    pub staging_dir: PathBuf,
    /// Hot-reload snapshot directory.
    pub state_dir: PathBuf,
    /// Pending-updates directory.
    pub updates_dir: PathBuf,
    /// Apply pending updates at the start of [`PluginManager::load_all`].
    pub apply_updates_on_load: bool,
    /// Plugin names skipped at discovery.
    pub disabled_plugins: HashSet<String>,
    /// Update manager behavior.
    pub update_options: UpdateOptions,
}

impl ManagerOptions {
    /// Options rooted at a plugins directory; the data, staging, state,
    /// and updates directories default to peers of it.
    #[must_use]
    pub fn new(plugins_dir: impl Into<PathBuf>) -> Self {
        let plugins_dir = plugins_dir.into();
        let parent = plugins_dir
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self {
            data_dir: parent.join("plugin-data"),
            staging_dir: parent.join("plugin-staging"),
            state_dir: parent.join("plugin-state"),
            updates_dir: parent.join("updates"),
            plugins_dir,
            apply_updates_on_load: true,
            disabled_plugins: HashSet::new(),
            update_options: UpdateOptions::default(),
        }
    }

    /// Toggle applying updates during `load_all`.
    #[must_use]
    pub fn with_apply_updates(mut self, enabled: bool) -> Self {
        self.apply_updates_on_load = enabled;
        self
    }

    /// Skip the named plugins at discovery.
    #[must_use]
    pub fn with_disabled_plugins(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.disabled_plugins = names.into_iter().collect();
        self
    }

    /// Set update manager behavior.
    #[must_use]
    pub fn with_update_options(mut self, options: UpdateOptions) -> Self {
        self.update_options = options;
        self
    }
}

/// Aggregated result of [`PluginManager::load_all`].
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// Plugins loaded, in dependency order.
    pub loaded: Vec<String>,
    /// Plugins (or files) that failed, with the reason.
    pub failed: Vec<(String, String)>,
    /// Plugins skipped because they are on the disabled list.
    pub skipped: Vec<String>,
    /// Result of the update pass, when one ran.
    pub update_report: Option<UpdateReport>,
}

/// The plugin host's composition root.
pub struct PluginManager {
    options: ManagerOptions,
    registry: Arc<PluginRegistry>,
    loader: Arc<PluginLoader>,
    extensions: Arc<ExtensionManager>,
    bus: Arc<EventBus>,
    scheduler: Arc<TaskScheduler>,
    configs: Arc<ConfigStore>,
    updates: UpdateManager,
    metadata: DashMap<String, PluginMetadata>,
    contexts: DashMap<String, Arc<PluginContext>>,
    load_order: RwLock<Vec<String>>,
    timings: Arc<LifecycleTimings>,
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins_dir", &self.options.plugins_dir)
            .field("status", &self.registry.status())
            .finish_non_exhaustive()
    }
}

impl PluginManager {
    /// Build a manager and its subsystems from options.
    #[must_use]
    pub fn new(options: ManagerOptions) -> Self {
        let extensions = Arc::new(ExtensionManager::new());
        let loader = Arc::new(PluginLoader::new(
            options.staging_dir.clone(),
            Arc::clone(&extensions),
        ));
        let updates = UpdateManager::new(
            options.plugins_dir.clone(),
            options.updates_dir.clone(),
            options.update_options.clone(),
        );
        Self {
            registry: Arc::new(PluginRegistry::new()),
            loader,
            extensions,
            bus: Arc::new(EventBus::default()),
            scheduler: Arc::new(TaskScheduler::default()),
            configs: Arc::new(ConfigStore::new(options.data_dir.clone())),
            updates,
            metadata: DashMap::new(),
            contexts: DashMap::new(),
            load_order: RwLock::new(Vec::new()),
            timings: Arc::new(LifecycleTimings::new()),
            options,
        }
    }

    /// The registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// The loader.
    #[must_use]
    pub fn loader(&self) -> &Arc<PluginLoader> {
        &self.loader
    }

    /// The extension manager.
    #[must_use]
    pub fn extensions(&self) -> &Arc<ExtensionManager> {
        &self.extensions
    }

    /// The event bus.
    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The task scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// The config store.
    #[must_use]
    pub fn configs(&self) -> &Arc<ConfigStore> {
        &self.configs
    }

    /// The update manager.
    #[must_use]
    pub fn updates(&self) -> &UpdateManager {
        &self.updates
    }

    /// Lifecycle timing records.
    #[must_use]
    pub fn timings(&self) -> &Arc<LifecycleTimings> {
        &self.timings
    }

    /// Manager options.
    #[must_use]
    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// Cached metadata for a plugin.
    #[must_use]
    pub fn metadata(&self, name: &str) -> Option<PluginMetadata> {
        self.metadata.get(name).map(|entry| entry.clone())
    }

    /// Registry status snapshot.
    #[must_use]
    pub fn status(&self) -> RegistryStatus {
        self.registry.status()
    }

    /// Names in load order.
    #[must_use]
    pub fn load_order(&self) -> Vec<String> {
        self.load_order.read().clone()
    }

    /// Whether a plugin is currently enabled.
    #[must_use]
    pub fn is_enabled(&self, name: &str) -> bool {
        self.registry.get_state(name).is_active()
    }

    /// Apply pending updates (when configured), discover bundles,
    /// resolve dependency order, and load every plugin.
    ///
    /// Per-plugin failures are logged and recorded; unresolvable
    /// dependencies ([`Error::MissingDependency`] /
    /// [`Error::CircularDependency`]) abort the batch.
    #[instrument(skip(self))]
    pub async fn load_all(&self) -> Result<LoadReport> {
        let mut report = LoadReport::default();

        if self.options.apply_updates_on_load {
            match self.updates.apply_pending() {
                Ok(update_report) => {
                    if !update_report.no_updates() {
                        info!(
                            applied = update_report.applied.len(),
                            failed = update_report.failed.len(),
                            "pending updates applied"
                        );
                    }
                    report.update_report = Some(update_report);
                }
                Err(e) => warn!(error = %e, "update pass failed"),
            }
        }

        let mut plugins: HashMap<String, PluginMetadata> = HashMap::new();
        let mut files: HashMap<String, PathBuf> = HashMap::new();
        for file in bundle_files(&self.options.plugins_dir) {
            match self.loader.load_metadata(&file) {
                Ok(meta) => {
                    self.metadata.insert(meta.name.clone(), meta.clone());
                    files.insert(meta.name.clone(), file);
                    plugins.insert(meta.name.clone(), meta);
                }
                Err(e) => {
                    // Index unreadable bundles by file stem so the
                    // failure is attributed to a name.
                    let name = file
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .map_or_else(|| file.display().to_string(), String::from);
                    warn!(bundle = %file.display(), error = %e, "unreadable bundle metadata");
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        let order = gantry_resolver::resolve(&plugins)?;
        *self.load_order.write() = order.clone();

        for name in order {
            if self.options.disabled_plugins.contains(&name) {
                debug!(plugin = %name, "skipping disabled plugin");
                report.skipped.push(name);
                continue;
            }
            let file = files[&name].clone();
            match self.try_load(&name, &file).await {
                Ok(()) => report.loaded.push(name),
                Err(e @ Error::InvalidTransition { .. }) => {
                    // State machine violations are not survivable batch
                    // noise; map and propagate.
                    return Err(Error::operation(Operation::Load, name, e));
                }
                Err(e) => {
                    warn!(plugin = %name, error = %e, "plugin failed to load");
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "plugin load complete"
        );
        Ok(report)
    }

    /// Load one plugin from a bundle file. Logs and returns false on
    /// failure; no partial state leaks into the registry.
    pub async fn load_single_plugin(&self, name: &str, file: &Path) -> bool {
        match self.try_load(name, file).await {
            Ok(()) => true,
            Err(e) => {
                warn!(plugin = name, error = %e, "plugin failed to load");
                false
            }
        }
    }

    pub(crate) async fn try_load(&self, name: &str, file: &Path) -> Result<()> {
        let started = std::time::Instant::now();
        let metadata = match self.metadata.get(name) {
            Some(entry) => entry.clone(),
            None => {
                let metadata = self.loader.load_metadata(file)?;
                self.metadata.insert(name.to_string(), metadata.clone());
                metadata
            }
        };

        let (instance, _namespace) = self.loader.load_plugin(file, &metadata)?;
        let config = self
            .configs
            .plugin(name)
            .map_err(|e| Error::load(file, e.to_string()))?;
        let context = Arc::new(PluginContext::new(
            name,
            Arc::clone(&self.bus),
            Arc::clone(&self.scheduler),
            config,
        ));

        if let Err(e) = instance.on_load(&context).await {
            self.extensions.unregister_plugin(name);
            self.loader.cleanup(name);
            return Err(Error::operation(Operation::Load, name, e));
        }

        if let Err(e) = self.registry.register(name, instance) {
            self.extensions.unregister_plugin(name);
            self.loader.cleanup(name);
            return Err(e);
        }
        self.contexts.insert(name.to_string(), context);
        self.timings.record_load_time(name, started.elapsed());
        Ok(())
    }

    /// Enable a plugin: register its event handlers and call
    /// `on_enable`. Enabling an enabled plugin is a no-op.
    #[instrument(skip(self))]
    pub async fn enable(&self, name: &str) -> Result<()> {
        let instance = self.registry.get(name).ok_or_else(|| Error::NotFound {
            name: name.to_string(),
        })?;
        if self.registry.get_state(name).is_active() {
            debug!(plugin = name, "already enabled");
            return Ok(());
        }
        let context = self.context(name)?;

        let started = std::time::Instant::now();
        match self.enable_inner(name, &instance, &context).await {
            Ok(()) => {
                self.timings.record_enable_time(name, started.elapsed());
                info!(plugin = name, "plugin enabled");
                Ok(())
            }
            Err(e) => {
                if let Err(state_err) = self.registry.set_state(name, PluginState::Error) {
                    warn!(plugin = name, error = %state_err, "cannot mark plugin as errored");
                }
                self.bus.unregister(name);
                Err(Error::operation(Operation::Enable, name, e))
            }
        }
    }

    async fn enable_inner(
        &self,
        name: &str,
        instance: &Arc<dyn Plugin>,
        context: &Arc<PluginContext>,
    ) -> Result<()> {
        self.bus
            .register(name, instance.event_registrations(context));
        instance.on_enable(context).await?;
        self.registry.set_state(name, PluginState::Enabled)?;
        Ok(())
    }

    /// Disable a plugin: unregister handlers, call `on_disable`, drop
    /// its extensions. Disabling a disabled plugin is a no-op.
    #[instrument(skip(self))]
    pub async fn disable(&self, name: &str) -> Result<()> {
        let instance = self.registry.get(name).ok_or_else(|| Error::NotFound {
            name: name.to_string(),
        })?;
        if self.registry.get_state(name) == PluginState::Disabled {
            debug!(plugin = name, "already disabled");
            return Ok(());
        }
        let context = self.context(name)?;

        match self.disable_inner(name, &instance, &context).await {
            Ok(()) => {
                info!(plugin = name, "plugin disabled");
                Ok(())
            }
            Err(e) => {
                if let Err(state_err) = self.registry.set_state(name, PluginState::Error) {
                    warn!(plugin = name, error = %state_err, "cannot mark plugin as errored");
                }
                Err(Error::operation(Operation::Disable, name, e))
            }
        }
    }

    async fn disable_inner(
        &self,
        name: &str,
        instance: &Arc<dyn Plugin>,
        context: &Arc<PluginContext>,
    ) -> Result<()> {
        self.bus.unregister(name);
        instance.on_disable(context).await?;
        self.extensions.unregister_plugin(name);
        self.registry.set_state(name, PluginState::Disabled)?;
        Ok(())
    }

    /// Reload a plugin from its bundle, restoring the enabled flag.
    #[instrument(skip(self))]
    pub async fn reload(&self, name: &str) -> Result<()> {
        let was_enabled = self.registry.get_state(name).is_active();
        let metadata = self.metadata(name).ok_or_else(|| Error::NotFound {
            name: name.to_string(),
        })?;

        if was_enabled {
            self.disable(name).await?;
        }
        self.unload(name).await?;

        self.try_load(name, &metadata.source)
            .await
            .map_err(|e| Error::operation(Operation::Reload, name, e))?;
        if was_enabled {
            self.enable(name).await?;
        }
        info!(plugin = name, "plugin reloaded");
        Ok(())
    }

    /// Unload a plugin: best-effort disable, `on_unload`, namespace
    /// teardown, deregistration.
    #[instrument(skip(self))]
    pub async fn unload(&self, name: &str) -> Result<()> {
        let instance = self.registry.get(name).ok_or_else(|| Error::NotFound {
            name: name.to_string(),
        })?;
        if self.registry.get_state(name).is_active()
            && let Err(e) = self.disable(name).await
        {
            warn!(plugin = name, error = %e, "disable before unload failed");
        }

        if let Ok(context) = self.context(name)
            && let Err(e) = instance.on_unload(&context).await
        {
            warn!(plugin = name, error = %e, "on_unload failed");
        }

        self.deregister(name);
        info!(plugin = name, "plugin unloaded");
        Ok(())
    }

    /// Unload variant for the hot-reload path: the plugin must already
    /// be disabled, and an `on_unload` failure aborts instead of being
    /// swallowed.
    pub(crate) async fn unload_strict(&self, name: &str) -> Result<()> {
        let instance = self.registry.get(name).ok_or_else(|| Error::NotFound {
            name: name.to_string(),
        })?;
        let context = self.context(name)?;
        instance
            .on_unload(&context)
            .await
            .map_err(|e| Error::operation(Operation::Unload, name, e))?;

        self.deregister(name);
        info!(plugin = name, "plugin unloaded");
        Ok(())
    }

    fn deregister(&self, name: &str) {
        self.extensions.unregister_plugin(name);
        self.loader.cleanup(name);
        self.registry.unregister(name);
        self.contexts.remove(name);
        self.metadata.remove(name);
        self.configs.evict(name);
        self.timings.forget(name);
    }

    /// Enable every loaded plugin in load order. Failures are logged;
    /// returns the number enabled.
    pub async fn enable_all(&self) -> usize {
        let mut enabled = 0;
        for name in self.load_order() {
            if !self.registry.contains(&name) || self.is_enabled(&name) {
                continue;
            }
            match self.enable(&name).await {
                Ok(()) => enabled += 1,
                Err(e) => warn!(plugin = %name, error = %e, "enable failed"),
            }
        }
        enabled
    }

    /// Disable every enabled plugin in reverse load order.
    pub async fn disable_all(&self) -> usize {
        let mut disabled = 0;
        for name in self.load_order().into_iter().rev() {
            if !self.is_enabled(&name) {
                continue;
            }
            match self.disable(&name).await {
                Ok(()) => disabled += 1,
                Err(e) => warn!(plugin = %name, error = %e, "disable failed"),
            }
        }
        disabled
    }

    /// Full shutdown: disable and unload in reverse dependency order,
    /// then tear down every subsystem.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        info!("shutting down plugin host");
        self.disable_all().await;

        let mut names: Vec<String> = self.load_order().into_iter().rev().collect();
        for name in self.registry.names() {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        for name in names {
            if self.registry.contains(&name)
                && let Err(e) = self.unload(&name).await
            {
                warn!(plugin = %name, error = %e, "unload during shutdown failed");
            }
        }

        self.extensions.clear_all();
        self.scheduler.shutdown().await;
        self.loader.cleanup_all();
        self.registry.clear();
        self.bus.shutdown().await;
        info!("plugin host shut down");
    }

    pub(crate) fn context(&self, name: &str) -> Result<Arc<PluginContext>> {
        self.contexts
            .get(name)
            .map(|entry| Arc::clone(&entry))
            .ok_or_else(|| Error::NotFound {
                name: name.to_string(),
            })
    }

    pub(crate) fn flush_metadata(&self, name: &str) {
        self.metadata.remove(name);
    }
}

/// Bundle files in a directory, sorted for determinism.
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
