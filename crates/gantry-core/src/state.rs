//! Plugin lifecycle state machine.

use serde::{Deserialize, Serialize};

/// Plugin state in its lifecycle.
///
/// `Error` is always recoverable: any transition out of it is legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginState {
    /// Plugin code is loaded but the plugin is not running.
    Loaded,
    /// Plugin is active and receiving events.
    Enabled,
    /// Plugin was deliberately stopped.
    Disabled,
    /// Plugin failed during a lifecycle operation.
    Error,
}

impl PluginState {
    /// Check if the plugin is running.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Enabled)
    }

    /// Check if the plugin can be enabled from this state.
    #[must_use]
    pub const fn can_enable(self) -> bool {
        matches!(self, Self::Loaded | Self::Disabled)
    }

    /// Check if the plugin can be disabled from this state.
    #[must_use]
    pub const fn can_disable(self) -> bool {
        matches!(self, Self::Enabled)
    }

    /// Whether `from -> to` is a legal transition.
    ///
    /// Recovery out of `Error` is always allowed.
    #[must_use]
    pub const fn can_transition(from: Self, to: Self) -> bool {
        matches!(
            (from, to),
            (Self::Loaded, Self::Enabled | Self::Error)
                | (Self::Enabled, Self::Disabled | Self::Error)
                | (Self::Disabled, Self::Enabled | Self::Error)
                | (Self::Error, _)
        )
    }
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loaded => write!(f, "loaded"),
            Self::Enabled => write!(f, "enabled"),
            Self::Disabled => write!(f, "disabled"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table() {
        use PluginState::{Disabled, Enabled, Error, Loaded};

        assert!(PluginState::can_transition(Loaded, Enabled));
        assert!(PluginState::can_transition(Loaded, Error));
        assert!(PluginState::can_transition(Enabled, Disabled));
        assert!(PluginState::can_transition(Enabled, Error));
        assert!(PluginState::can_transition(Disabled, Enabled));
        assert!(PluginState::can_transition(Disabled, Error));

        // Recovery out of Error is always legal.
        assert!(PluginState::can_transition(Error, Loaded));
        assert!(PluginState::can_transition(Error, Enabled));
        assert!(PluginState::can_transition(Error, Disabled));

        assert!(!PluginState::can_transition(Loaded, Disabled));
        assert!(!PluginState::can_transition(Enabled, Loaded));
        assert!(!PluginState::can_transition(Disabled, Loaded));
        assert!(!PluginState::can_transition(Enabled, Enabled));
    }

    #[test]
    fn predicates() {
        assert!(PluginState::Enabled.is_active());
        assert!(!PluginState::Loaded.is_active());

        assert!(PluginState::Loaded.can_enable());
        assert!(PluginState::Disabled.can_enable());
        assert!(!PluginState::Enabled.can_enable());

        assert!(PluginState::Enabled.can_disable());
        assert!(!PluginState::Disabled.can_disable());
    }

    #[test]
    fn state_display() {
        assert_eq!(PluginState::Loaded.to_string(), "loaded");
        assert_eq!(PluginState::Error.to_string(), "error");
    }
}
