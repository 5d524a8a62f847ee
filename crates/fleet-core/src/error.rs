//! Error taxonomy shared across the Fleet crates.
//!
//! Lifecycle errors themselves live in `fleet-runtime`; this module only
//! defines the vocabulary they are classified with, plus the errors raised by
//! the external collaborators.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Phase / ErrorKind
// =============================================================================

/// The lifecycle phase an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Start,
    Stop,
    Reload,
    /// Raised by a live runtime, outside of any explicit operation.
    Runtime,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Reload => "reload",
            Self::Runtime => "runtime",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification of a failed operation, reported at the operational
/// boundary alongside the human-readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed definition, unknown plugin, cyclic or missing dependency.
    Configuration,
    /// A plugin failed to initialise.
    Build,
    /// A live runtime faulted.
    Runtime,
    /// Reading definition or plugin sources failed persistently.
    Watcher,
    /// The bot id is not known.
    NotFound,
    /// The requested state change is not allowed from the current state.
    IllegalTransition,
    /// The operation was superseded by a stop.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Build => "build",
            Self::Runtime => "runtime",
            Self::Watcher => "watcher",
            Self::NotFound => "not_found",
            Self::IllegalTransition => "illegal_transition",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the supervisor may retry after an error of this kind.
    ///
    /// Configuration problems never heal by themselves, so they fail fast.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Build | Self::Runtime)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Collaborator errors
// =============================================================================

/// Errors raised by a [`MessagingClient`](crate::MessagingClient).
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// The platform rejected the credentials or could not be reached.
    #[error("failed to start consuming for bot '{bot_id}': {reason}")]
    Connect { bot_id: String, reason: String },

    /// Delivery of an outbound payload failed.
    #[error("failed to send message: {0}")]
    Send(String),

    /// The event stream broke while consuming.
    #[error("event stream failed: {0}")]
    Stream(String),

    /// The client has no consumer registered for the bot.
    #[error("bot '{0}' is not consuming")]
    NotConsuming(String),
}

/// Errors raised by a [`SessionProvider`](crate::SessionProvider).
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("persistence session unavailable: {0}")]
    Unavailable(String),
}
