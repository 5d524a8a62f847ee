//! Error types for the Fleet framework.

use thiserror::Error;
use tower::BoxError;

use fleet_core::ClientError;

/// Returned by a handler that decides, after its predicate matched, that it
/// does not want the event after all.
///
/// The router treats this as "try the next route" instead of a failure.
#[derive(Debug, Clone, Error)]
#[error("event skipped by handler")]
pub struct EventSkipped;

// =============================================================================
// Resolution
// =============================================================================

/// Why a declared plugin list could not be turned into a load order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// The dependency graph has at least one cycle. `members` lists every
    /// plugin on a cycle, in declaration order.
    #[error("plugin dependency cycle among: {}", .members.join(", "))]
    Cycle { members: Vec<String> },

    /// `plugin` depends on `dependency`, which is not an enabled plugin of
    /// this bot.
    #[error("plugin '{plugin}' depends on '{dependency}', which is not enabled for this bot")]
    MissingDependency { plugin: String, dependency: String },

    /// The name is not registered in the catalog.
    #[error("unknown plugin '{0}'")]
    UnknownPlugin(String),

    #[error("plugin '{0}' is declared more than once")]
    Duplicate(String),
}

// =============================================================================
// Build
// =============================================================================

/// Why a runtime could not be built. A failed build leaves nothing behind.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// The plugin factory rejected its configuration.
    #[error("plugin '{plugin}' could not be created: {source}")]
    Factory {
        plugin: String,
        #[source]
        source: BoxError,
    },

    /// The plugin's `on_load` hook failed.
    #[error("plugin '{plugin}' failed to initialise: {source}")]
    PluginInit {
        plugin: String,
        #[source]
        source: BoxError,
    },

    /// The bot was stopped while the build was in progress.
    #[error("build cancelled")]
    Cancelled,
}

impl BuildError {
    /// `true` for errors caused by the definition rather than by a plugin at
    /// run time. These are never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Resolve(_) | Self::Factory { .. })
    }
}

// =============================================================================
// Dispatch
// =============================================================================

/// Raised by [`EventContext::send`](crate::EventContext::send).
#[derive(Debug, Clone, Error)]
pub enum SendError {
    /// The runtime serving this event has been cancelled.
    #[error("bot '{0}' is shutting down, outbound message dropped")]
    Cancelled(String),

    #[error(transparent)]
    Client(#[from] ClientError),

    /// The event has no chat to reply to.
    #[error("event has no chat to reply to")]
    NoChat,
}

/// A route's handler failed.
#[derive(Debug, Error)]
#[error("handler '{route}' of plugin '{plugin}' failed: {source}")]
pub struct HandlerFailed {
    pub plugin: String,
    pub route: String,
    #[source]
    pub source: BoxError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_names_every_member() {
        let err = ResolveError::Cycle {
            members: vec!["x".into(), "y".into()],
        };
        assert_eq!(err.to_string(), "plugin dependency cycle among: x, y");
    }

    #[test]
    fn test_configuration_classification() {
        assert!(BuildError::from(ResolveError::UnknownPlugin("p".into())).is_configuration());
        let init = BuildError::PluginInit {
            plugin: "p".into(),
            source: "boom".into(),
        };
        assert!(!init.is_configuration());
        assert!(!BuildError::Cancelled.is_configuration());
    }
}
