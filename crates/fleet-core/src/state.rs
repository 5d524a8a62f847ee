//! Managed bot lifecycle states.
//!
//! ```text
//! Stopped   ──► Starting
//! Starting  ──► Running | Failed | Stopping
//! Running   ──► Reloading | Stopping | Failed
//! Reloading ──► Running | Stopping
//! Failed    ──► Starting | Stopping
//! Stopping  ──► Stopped
//! ```
//!
//! `Reloading` always returns to `Running`: a failed reload keeps the previous
//! runtime serving. `stop` is accepted from every state other than `Stopped`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of one managed bot, owned by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Reloading,
    Failed,
}

impl BotState {
    /// Returns `true` if moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: BotState) -> bool {
        use BotState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Running, Reloading)
                | (Running, Failed)
                | (Reloading, Running)
                | (Reloading, Stopping)
                | (Stopping, Stopped)
                | (Failed, Starting)
                | (Failed, Stopping)
        )
    }

    /// `Starting`, `Running` or `Reloading`: a start request is a no-op.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Reloading)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Reloading => "reloading",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for BotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
