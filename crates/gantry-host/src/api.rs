//! The plugin contract.

use crate::event_bus::{EventBus, HandlerRegistration};
use crate::scheduler::{PluginScheduler, TaskScheduler};
use async_trait::async_trait;
use gantry_config::PluginConfig;
use gantry_core::Result;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Contract every plugin implements.
///
/// All hooks default to no-ops so simple plugins only implement what
/// they need. Hook errors put the plugin into the error state; see the
/// plugin manager for exact semantics.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Called once after the plugin's code is loaded.
    async fn on_load(&self, _ctx: &PluginContext) -> Result<()> {
        Ok(())
    }

    /// Called when the plugin is enabled.
    async fn on_enable(&self, _ctx: &PluginContext) -> Result<()> {
        Ok(())
    }

    /// Called when the plugin is disabled.
    async fn on_disable(&self, _ctx: &PluginContext) -> Result<()> {
        Ok(())
    }

    /// Called before the plugin's namespace is torn down.
    async fn on_unload(&self, _ctx: &PluginContext) -> Result<()> {
        Ok(())
    }

    /// Event handlers to register while the plugin is enabled.
    fn event_registrations(&self, _ctx: &PluginContext) -> Vec<HandlerRegistration> {
        Vec::new()
    }

    /// Hot-reload capability, when supported.
    fn hot_reload(&self) -> Option<&dyn HotReloadable> {
        None
    }

    /// State capture/restore capability, when supported.
    fn stateful(&self) -> Option<&dyn Stateful> {
        None
    }
}

/// Opt-in capability: the plugin cooperates with hot reload.
#[async_trait]
pub trait HotReloadable: Send + Sync {
    /// Whether the plugin is currently reloadable.
    fn can_hot_reload(&self) -> bool {
        true
    }

    /// Quiesce before the swap: finish in-flight work, flush buffers.
    async fn prepare_for_reload(&self) -> Result<()> {
        Ok(())
    }
}

/// Opt-in capability: the plugin carries runtime state across reloads.
#[async_trait]
pub trait Stateful: Send + Sync {
    /// Hand out a custom data map for the snapshot.
    async fn capture_state(&self) -> Result<BTreeMap<String, Value>>;

    /// Receive the custom data map from a compatible snapshot.
    async fn restore_state(&self, data: BTreeMap<String, Value>) -> Result<()>;

    /// Receive the task ids that were active before the reload.
    async fn restore_tasks(&self, _task_ids: &[u64]) -> Result<()> {
        Ok(())
    }
}

/// Per-instance context handed to every lifecycle hook.
///
/// Owned by the plugin instance and dropped with it.
pub struct PluginContext {
    name: String,
    bus: Arc<EventBus>,
    scheduler: PluginScheduler,
    config: Arc<PluginConfig>,
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl PluginContext {
    /// Build a context for a plugin.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        bus: Arc<EventBus>,
        scheduler: Arc<TaskScheduler>,
        config: Arc<PluginConfig>,
    ) -> Self {
        let name = name.into();
        Self {
            scheduler: PluginScheduler::new(Arc::clone(&scheduler), name.clone()),
            name,
            bus,
            config,
        }
    }

    /// The owning plugin's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Event bus handle.
    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Scheduler handle; tasks submitted through it are tagged with the
    /// plugin's name.
    #[must_use]
    pub fn scheduler(&self) -> &PluginScheduler {
        &self.scheduler
    }

    /// Plugin configuration handle.
    #[must_use]
    pub fn config(&self) -> &Arc<PluginConfig> {
        &self.config
    }
}
