//! # Fleet Framework
//!
//! Everything needed to turn a [`BotDefinition`](fleet_core::BotDefinition)
//! into a live, event-handling [`Runtime`]:
//!
//! - **Plugins**: [`PluginDescriptor`] templates registered in a
//!   [`PluginCatalog`], which resolves a bot's plugin list into a
//!   dependency-ordered load sequence
//! - **Matchers**: predicate + handler pairs built with [`on_command`],
//!   [`on_message`], [`on_callback`] and [`on_any`]
//! - **Routing**: the [`HandlerGraph`] and first-match-wins [`Router`]
//! - **Middleware**: observability, rate limiting and per-event persistence
//!   sessions, as tower layers
//! - **Building**: [`RuntimeBuilder`], which assembles all of the above
//!
//! The framework knows nothing about lifecycles, supervision or hot reload;
//! those live in `fleet-runtime`.

pub mod builder;
pub mod context;
pub mod error;
pub mod matcher;
pub mod middleware;
pub mod plugin;
pub mod router;
pub mod runtime;

#[cfg(test)]
mod testing;

pub use builder::RuntimeBuilder;
pub use context::EventContext;
pub use error::{BuildError, EventSkipped, HandlerFailed, ResolveError, SendError};
pub use matcher::{CheckFn, HandlerService, Matcher, on_any, on_callback, on_command, on_message};
pub use middleware::{DispatchStats, RateLimiter};
pub use plugin::{
    HookFn, Plugin, PluginBuilder, PluginCatalog, PluginDescriptor, PluginFactory,
    PluginLoadContext, ResolvedPlugin,
};
pub use router::{HandlerGraph, Outcome, Rejection, Route, Router};
pub use runtime::{DispatchService, Runtime};

pub use tower::BoxError;
