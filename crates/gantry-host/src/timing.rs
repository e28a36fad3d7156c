//! Lifecycle timing records.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Per-plugin load and enable durations, for diagnostics.
#[derive(Debug, Default)]
pub struct LifecycleTimings {
    load_times: RwLock<HashMap<String, Duration>>,
    enable_times: RwLock<HashMap<String, Duration>>,
}

impl LifecycleTimings {
    /// Create an empty record set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record how long a plugin took to load.
    pub fn record_load_time(&self, plugin: &str, duration: Duration) {
        self.load_times
            .write()
            .insert(plugin.to_string(), duration);
        debug!(plugin, duration_ms = duration.as_millis(), "load time recorded");
    }

    /// Record how long a plugin took to enable.
    pub fn record_enable_time(&self, plugin: &str, duration: Duration) {
        self.enable_times
            .write()
            .insert(plugin.to_string(), duration);
        debug!(plugin, duration_ms = duration.as_millis(), "enable time recorded");
    }

    /// Load duration for a plugin.
    #[must_use]
    pub fn load_time(&self, plugin: &str) -> Option<Duration> {
        self.load_times.read().get(plugin).copied()
    }

    /// Enable duration for a plugin.
    #[must_use]
    pub fn enable_time(&self, plugin: &str) -> Option<Duration> {
        self.enable_times.read().get(plugin).copied()
    }

    /// Sum of all recorded load durations.
    #[must_use]
    pub fn total_load_time(&self) -> Duration {
        self.load_times.read().values().sum()
    }

    /// Whether a plugin's load exceeded a threshold.
    #[must_use]
    pub fn is_slow_loader(&self, plugin: &str, threshold: Duration) -> bool {
        self.load_times
            .read()
            .get(plugin)
            .is_some_and(|&t| t > threshold)
    }

    /// Drop records for a plugin (on unload).
    pub fn forget(&self, plugin: &str) {
        self.load_times.write().remove(plugin);
        self.enable_times.write().remove(plugin);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_bookkeeping() {
        let timings = LifecycleTimings::new();

        timings.record_load_time("a", Duration::from_millis(100));
        timings.record_load_time("b", Duration::from_millis(50));
        timings.record_enable_time("a", Duration::from_millis(10));

        assert_eq!(timings.load_time("a"), Some(Duration::from_millis(100)));
        assert_eq!(timings.enable_time("a"), Some(Duration::from_millis(10)));
        assert_eq!(timings.total_load_time(), Duration::from_millis(150));

        assert!(timings.is_slow_loader("a", Duration::from_millis(75)));
        assert!(!timings.is_slow_loader("b", Duration::from_millis(75)));

        timings.forget("a");
        assert_eq!(timings.load_time("a"), None);
        assert_eq!(timings.total_load_time(), Duration::from_millis(50));
    }
}
