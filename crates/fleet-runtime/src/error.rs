//! Runtime error types.
//!
//! - [`ConfigError`]: process configuration and bot definition loading
//! - [`LifecycleError`]: everything a lifecycle operation can fail with; every
//!   variant carries the bot id and the [`Phase`] it failed in
//! - [`WatcherError`]: the change watcher's own failures
//! - [`RuntimeError`]: what [`FleetRuntime::run`](crate::FleetRuntime::run) can fail with
//!
//! [`OpResult`] is what crosses the operational boundary. It never carries a
//! Rust error value, only its rendered message and [`ErrorKind`].

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use fleet_core::{BotState, ErrorKind, Phase};
use fleet_framework::BuildError;

// =============================================================================
// ConfigError
// =============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Unsupported or disabled configuration file format: .{0}")]
    UnsupportedFormat(String),

    #[error("Invalid configuration: {message}")]
    Validation { message: String },

    #[error("Duplicate bot identifier: {0}")]
    DuplicateBotId(String),
}

impl ConfigError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self::Parse(e.to_string())
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;

// =============================================================================
// LifecycleError
// =============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// The definition is malformed or its plugins cannot be resolved.
    #[error("bot '{bot_id}' has an invalid definition ({phase}): {message}")]
    Configuration {
        bot_id: String,
        phase: Phase,
        message: String,
    },

    /// A plugin failed to initialise, or the client refused to connect.
    #[error("bot '{bot_id}' failed to build ({phase}): {message}")]
    Build {
        bot_id: String,
        phase: Phase,
        message: String,
    },

    /// A fault in a live bot: the event stream failed, or an operation
    /// panicked.
    #[error("bot '{bot_id}' faulted ({phase}): {message}")]
    Runtime {
        bot_id: String,
        phase: Phase,
        message: String,
    },

    #[error("bot '{bot_id}' is not managed")]
    NotFound { bot_id: String, phase: Phase },

    #[error("bot '{bot_id}' cannot go from {from} to {to} ({phase})")]
    IllegalTransition {
        bot_id: String,
        phase: Phase,
        from: BotState,
        to: BotState,
    },

    #[error("{phase} of bot '{bot_id}' was cancelled")]
    Cancelled { bot_id: String, phase: Phase },
}

impl LifecycleError {
    pub fn configuration(bot_id: &str, phase: Phase, message: impl ToString) -> Self {
        Self::Configuration {
            bot_id: bot_id.to_string(),
            phase,
            message: message.to_string(),
        }
    }

    pub fn runtime(bot_id: &str, phase: Phase, message: impl ToString) -> Self {
        Self::Runtime {
            bot_id: bot_id.to_string(),
            phase,
            message: message.to_string(),
        }
    }

    pub fn not_found(bot_id: &str, phase: Phase) -> Self {
        Self::NotFound {
            bot_id: bot_id.to_string(),
            phase,
        }
    }

    /// Classifies a runtime build failure.
    pub fn from_build(bot_id: &str, phase: Phase, error: BuildError) -> Self {
        let bot_id = bot_id.to_string();
        match error {
            BuildError::Cancelled => Self::Cancelled { bot_id, phase },
            e if e.is_configuration() => Self::Configuration {
                bot_id,
                phase,
                message: e.to_string(),
            },
            e => Self::Build {
                bot_id,
                phase,
                message: e.to_string(),
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Build { .. } => ErrorKind::Build,
            Self::Runtime { .. } => ErrorKind::Runtime,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::IllegalTransition { .. } => ErrorKind::IllegalTransition,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    pub fn bot_id(&self) -> &str {
        match self {
            Self::Configuration { bot_id, .. }
            | Self::Build { bot_id, .. }
            | Self::Runtime { bot_id, .. }
            | Self::NotFound { bot_id, .. }
            | Self::IllegalTransition { bot_id, .. }
            | Self::Cancelled { bot_id, .. } => bot_id,
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            Self::Configuration { phase, .. }
            | Self::Build { phase, .. }
            | Self::Runtime { phase, .. }
            | Self::NotFound { phase, .. }
            | Self::IllegalTransition { phase, .. }
            | Self::Cancelled { phase, .. } => *phase,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.kind().is_retriable()
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

// =============================================================================
// WatcherError
// =============================================================================

#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("Failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify_debouncer_full::notify::Error,
    },

    #[error("Failed to start file watcher: {0}")]
    Backend(#[from] notify_debouncer_full::notify::Error),

    /// A definition stayed unreadable through every retry.
    #[error("definition '{bot_id}' still unreadable after {attempts} attempts: {message}")]
    Persistent {
        bot_id: String,
        attempts: u32,
        message: String,
    },
}

// =============================================================================
// RuntimeError
// =============================================================================

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Watcher(#[from] WatcherError),

    #[error("Failed to register signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

// =============================================================================
// OpResult
// =============================================================================

/// Outcome of one operational call (`start`, `stop`, `reload`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl OpResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error_kind: None,
        }
    }

    pub fn failed(error: &LifecycleError) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            error_kind: Some(error.kind()),
        }
    }

    pub fn watcher(error: &WatcherError) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            error_kind: Some(ErrorKind::Watcher),
        }
    }
}

impl From<LifecycleResult<String>> for OpResult {
    fn from(result: LifecycleResult<String>) -> Self {
        match result {
            Ok(message) => Self::ok(message),
            Err(e) => Self::failed(&e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_framework::ResolveError;

    #[test]
    fn test_build_errors_are_classified() {
        let cycle = BuildError::from(ResolveError::Cycle {
            members: vec!["x".into(), "y".into()],
        });
        let err = LifecycleError::from_build("b", Phase::Start, cycle);
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(!err.is_retriable());
        assert!(err.to_string().contains("x, y"));

        let init = BuildError::PluginInit {
            plugin: "db".into(),
            source: "timeout".into(),
        };
        let err = LifecycleError::from_build("b", Phase::Reload, init);
        assert_eq!(err.kind(), ErrorKind::Build);
        assert_eq!(err.phase(), Phase::Reload);
        assert!(err.is_retriable());
    }

    #[test]
    fn test_op_result_serialization() {
        let ok = serde_json::to_value(OpResult::ok("started")).unwrap();
        assert_eq!(ok, serde_json::json!({ "success": true, "message": "started" }));

        let failed = OpResult::failed(&LifecycleError::not_found("ghost", Phase::Stop));
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["error_kind"], "not_found");
        assert_eq!(failed.message, "bot 'ghost' is not managed");
    }
}
