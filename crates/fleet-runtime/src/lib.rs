//! Fleet Runtime - lifecycle layer of the Fleet bot orchestrator.
//!
//! This crate provides:
//! - [`Orchestrator`]: start, stop and hot-reload of many bots, one state
//!   machine per bot, operations on distinct bots running concurrently
//! - [`supervisor`]: restart with exponential backoff and a sliding failure
//!   budget
//! - [`ChangeWatcher`]: debounced file watching that turns definition and
//!   plugin changes into reloads
//! - [`FleetRuntime`]: configuration, logging and all of the above wired into
//!   one process
//!
//! ```rust,ignore
//! use fleet_runtime::FleetRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = FleetRuntime::builder(catalog, client).build()?;
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod runtime;
pub mod supervisor;
pub mod watcher;

#[cfg(test)]
mod testing;

pub use config::{ConfigLoader, DefinitionSource, FleetConfig, FsDefinitionSource};
pub use error::{
    ConfigError, ConfigResult, LifecycleError, LifecycleResult, OpResult, RuntimeError,
    RuntimeResult, WatcherError,
};
pub use logging::{LoggingBuilder, LoggingError, SpanEvents};
pub use orchestrator::{BotStatus, Orchestrator, OrchestratorSettings, StatusReport};
pub use runtime::{FleetRuntime, FleetRuntimeBuilder};
pub use supervisor::{RestartPolicy, SupervisorHandle};
pub use watcher::{ChangeWatcher, ReloadTarget, WatchLayout, WatcherHandle, WatcherSettings};

// Re-export tracing for use by other crates
pub use tracing;
pub use tracing_subscriber;

/// Logging macros and the `instrument` attribute.
pub mod prelude {
    pub use tracing::{Level, debug, error, info, instrument, span, trace, warn};
}
