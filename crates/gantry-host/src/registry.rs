//! The authoritative plugin registry.
//!
//! Two concurrent maps, instances and states, with the invariant that a
//! name is present in one iff it is present in the other. Transition
//! validation and the state write happen under the state map's per-key
//! guard, so transitions for one plugin are totally ordered.

use crate::api::Plugin;
use dashmap::DashMap;
use gantry_core::{Error, PluginState, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// Registry status: total plugins plus per-state counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStatus {
    /// Registered plugins.
    pub total: usize,
    /// Plugins in the loaded state.
    pub loaded: usize,
    /// Plugins in the enabled state.
    pub enabled: usize,
    /// Plugins in the disabled state.
    pub disabled: usize,
    /// Plugins in the error state.
    pub error: usize,
}

impl std::fmt::Display for RegistryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} plugins ({} loaded, {} enabled, {} disabled, {} error)",
            self.total, self.loaded, self.enabled, self.disabled, self.error
        )
    }
}

/// Thread-safe plugin registry. Owns the plugin instances.
#[derive(Default)]
pub struct PluginRegistry {
    instances: DashMap<String, Arc<dyn Plugin>>,
    states: DashMap<String, PluginState>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("status", &self.status())
            .finish()
    }
}

impl PluginRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin in the loaded state.
    pub fn register(&self, name: &str, instance: Arc<dyn Plugin>) -> Result<()> {
        match self.instances.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::AlreadyRegistered {
                name: name.to_string(),
            }),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(instance);
                self.states.insert(name.to_string(), PluginState::Loaded);
                debug!(plugin = name, "plugin registered");
                Ok(())
            }
        }
    }

    /// Remove a plugin and its state. Returns whether it existed.
    pub fn unregister(&self, name: &str) -> bool {
        let existed = self.instances.remove(name).is_some();
        self.states.remove(name);
        if existed {
            debug!(plugin = name, "plugin unregistered");
        }
        existed
    }

    /// Look up a plugin instance.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.instances.get(name).map(|entry| Arc::clone(&entry))
    }

    /// All registered plugins.
    #[must_use]
    pub fn get_all(&self) -> Vec<(String, Arc<dyn Plugin>)> {
        self.instances
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    /// All registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Whether a plugin is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.instances.contains_key(name)
    }

    /// Current state. Unknown names report [`PluginState::Error`];
    /// callers distinguishing existence use [`contains`](Self::contains).
    #[must_use]
    pub fn get_state(&self, name: &str) -> PluginState {
        self.states
            .get(name)
            .map_or(PluginState::Error, |entry| *entry)
    }

    /// Validated state transition.
    ///
    /// Fails with [`Error::NotFound`] for unknown names and
    /// [`Error::InvalidTransition`] for illegal moves (recovery out of
    /// the error state is always legal). The check and the write happen
    /// under the per-name guard.
    pub fn set_state(&self, name: &str, to: PluginState) -> Result<()> {
        let Some(mut entry) = self.states.get_mut(name) else {
            return Err(Error::NotFound {
                name: name.to_string(),
            });
        };
        let from = *entry;
        if !PluginState::can_transition(from, to) {
            return Err(Error::InvalidTransition {
                name: name.to_string(),
                from,
                to,
            });
        }
        *entry = to;
        debug!(plugin = name, %from, %to, "state transition");
        Ok(())
    }

    /// Unvalidated state write, for recovery paths only.
    ///
    /// Unknown names are left untouched (a state without an instance
    /// would break the registry invariant).
    pub fn force_state(&self, name: &str, state: PluginState) {
        match self.states.get_mut(name) {
            Some(mut entry) => {
                warn!(plugin = name, from = %*entry, to = %state, "forced state transition");
                *entry = state;
            }
            None => warn!(plugin = name, "cannot force state of unknown plugin"),
        }
    }

    /// Total plugins and counts per state.
    #[must_use]
    pub fn status(&self) -> RegistryStatus {
        let mut status = RegistryStatus {
            total: self.instances.len(),
            ..RegistryStatus::default()
        };
        for entry in self.states.iter() {
            match *entry.value() {
                PluginState::Loaded => status.loaded += 1,
                PluginState::Enabled => status.enabled += 1,
                PluginState::Disabled => status.disabled += 1,
                PluginState::Error => status.error += 1,
            }
        }
        status
    }

    /// Remove everything.
    pub fn clear(&self) {
        self.instances.clear();
        self.states.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct NoopPlugin;
    impl Plugin for NoopPlugin {}

    fn plugin() -> Arc<dyn Plugin> {
        Arc::new(NoopPlugin)
    }

    #[test]
    fn register_sets_loaded_state() {
        let registry = PluginRegistry::new();
        registry.register("a", plugin()).unwrap();

        assert!(registry.contains("a"));
        assert_eq!(registry.get_state("a"), PluginState::Loaded);
        assert!(registry.get("a").is_some());
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = PluginRegistry::new();
        registry.register("a", plugin()).unwrap();
        assert!(matches!(
            registry.register("a", plugin()),
            Err(Error::AlreadyRegistered { .. })
        ));
    }

    #[test]
    fn unregister_removes_both_maps() {
        let registry = PluginRegistry::new();
        registry.register("a", plugin()).unwrap();

        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert!(!registry.contains("a"));
        // Unknown names default to the error state.
        assert_eq!(registry.get_state("a"), PluginState::Error);
    }

    #[test]
    fn instances_and_states_stay_in_sync() {
        let registry = PluginRegistry::new();
        for name in ["a", "b", "c"] {
            registry.register(name, plugin()).unwrap();
        }
        registry.unregister("b");

        for (name, _) in registry.get_all() {
            assert_ne!(
                registry.get_state(&name),
                PluginState::Error,
                "{name} should have a real state"
            );
        }
        assert_eq!(registry.status().total, 2);
    }

    #[test]
    fn legal_transitions() {
        let registry = PluginRegistry::new();
        registry.register("a", plugin()).unwrap();

        registry.set_state("a", PluginState::Enabled).unwrap();
        registry.set_state("a", PluginState::Disabled).unwrap();
        registry.set_state("a", PluginState::Enabled).unwrap();
        registry.set_state("a", PluginState::Error).unwrap();
        // Recovery out of error.
        registry.set_state("a", PluginState::Loaded).unwrap();
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let registry = PluginRegistry::new();
        registry.register("a", plugin()).unwrap();

        match registry.set_state("a", PluginState::Disabled).unwrap_err() {
            Error::InvalidTransition { from, to, .. } => {
                assert_eq!(from, PluginState::Loaded);
                assert_eq!(to, PluginState::Disabled);
            }
            other => panic!("unexpected error: {other}"),
        }
        // State unchanged after the failed transition.
        assert_eq!(registry.get_state("a"), PluginState::Loaded);

        assert!(matches!(
            registry.set_state("ghost", PluginState::Enabled),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn force_state_bypasses_validation() {
        let registry = PluginRegistry::new();
        registry.register("a", plugin()).unwrap();

        registry.force_state("a", PluginState::Disabled);
        assert_eq!(registry.get_state("a"), PluginState::Disabled);

        // Unknown name: no state is invented.
        registry.force_state("ghost", PluginState::Enabled);
        assert!(!registry.contains("ghost"));
    }

    #[test]
    fn status_counts() {
        let registry = PluginRegistry::new();
        for name in ["a", "b", "c"] {
            registry.register(name, plugin()).unwrap();
        }
        registry.set_state("a", PluginState::Enabled).unwrap();
        registry.set_state("b", PluginState::Error).unwrap();

        let status = registry.status();
        assert_eq!(status.total, 3);
        assert_eq!(status.enabled, 1);
        assert_eq!(status.loaded, 1);
        assert_eq!(status.error, 1);
        assert_eq!(status.disabled, 0);
        assert!(status.to_string().contains("3 plugins"));
    }
}
