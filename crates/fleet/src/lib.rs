//! # Fleet
//!
//! Run many independently configured bots in one process. Each bot gets its
//! own plugin set, lifecycle and supervision; definition changes are picked
//! up without restarting the process.
//!
//! ## Architecture
//!
//! ```text
//! bots/*.yaml ──▶ ChangeWatcher ──▶ Orchestrator ──▶ RuntimeBuilder ──▶ Runtime (per bot)
//!                                       │                                  ▲
//!                                       └──── Supervisor (per bot) ────────┘
//!                                              restart with backoff
//! ```
//!
//! - **PluginCatalog**: named plugin templates and their dependencies
//! - **RuntimeBuilder**: turns a definition into a live runtime, all or nothing
//! - **Orchestrator**: start, stop and reload, one state machine per bot
//! - **Supervisor**: relaunches failed bots within a failure budget
//! - **ChangeWatcher**: debounced file watching that triggers reloads
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use fleet::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut catalog = PluginCatalog::new();
//!     catalog.register(PluginDescriptor::new("echo", |_ctx| {
//!         Ok(Plugin::builder("echo")
//!             .matcher(on_message().handler(|ctx| async move {
//!                 let text = ctx.text().unwrap_or_default().to_string();
//!                 ctx.reply(text).await?;
//!                 Ok::<_, BoxError>(())
//!             }))
//!             .build())
//!     }));
//!
//!     let runtime = FleetRuntime::builder(catalog, my_client()).build()?;
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `yaml-config`: YAML configuration and definitions (default)
//! - `toml-config`: TOML configuration and definitions
//! - `json-log`: JSON log output

pub use fleet_core as core;
pub use fleet_framework as framework;
pub use fleet_runtime as runtime;

/// Commonly used types for building a fleet.
///
/// ```rust,ignore
/// use fleet::prelude::*;
/// ```
pub mod prelude {
    // Runtime - main entry point
    pub use fleet_runtime::{FleetRuntime, Orchestrator, OpResult};

    // Plugins
    pub use fleet_framework::{
        Plugin, PluginCatalog, PluginDescriptor, PluginLoadContext, on_any, on_callback,
        on_command, on_message,
    };

    // Handlers
    pub use fleet_framework::{BoxError, EventContext};

    // Data model and collaborator contracts
    pub use fleet_core::{
        BotDefinition, BotState, ClientError, Credentials, DeliveryMode, EventStream,
        InboundEvent, MessagingClient, OutboundPayload, PluginSpec,
    };

    pub use fleet_runtime::prelude::*;
}
