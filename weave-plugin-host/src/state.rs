//! Plugin lifecycle state machine

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Installed,
    Activating,
    Active,
    Deactivating,
    Disabled,
    Error,
}

/// Input to [`PluginState::transition`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Start activation
    Activate,
    /// `activate` returned successfully
    Activated,
    /// Activation failed or timed out
    Fail,
    /// Start deactivation
    Deactivate,
    /// Deactivation and disposal finished
    Deactivated,
    Disable,
    Enable,
    /// Clear an error so the plugin can be loaded again
    Reload,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid plugin state transition: {event:?} from {from}")]
pub struct StateError {
    pub from: PluginState,
    pub event: LifecycleEvent,
}

impl PluginState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Active => "active",
            Self::Deactivating => "deactivating",
            Self::Disabled => "disabled",
            Self::Error => "error",
        }
    }

    /// Next state after `event`, or an error if the event is not allowed here
    pub fn transition(self, event: LifecycleEvent) -> Result<PluginState, StateError> {
        use LifecycleEvent as E;
        use PluginState as S;

        let next = match (self, event) {
            (S::Installed, E::Activate) => S::Activating,
            (S::Activating, E::Activated) => S::Active,
            (S::Activating, E::Fail) => S::Error,
            (S::Active, E::Deactivate) => S::Deactivating,
            (S::Deactivating, E::Deactivated) => S::Installed,
            (S::Activating | S::Deactivating, E::Disable) => {
                return Err(StateError { from: self, event })
            }
            (_, E::Disable) => S::Disabled,
            (S::Disabled, E::Enable) => S::Installed,
            (S::Error, E::Reload) => S::Installed,
            _ => return Err(StateError { from: self, event }),
        };
        Ok(next)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
