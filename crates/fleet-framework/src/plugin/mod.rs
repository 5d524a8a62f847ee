//! Plugins: live instances, registered descriptors, and the catalog that
//! resolves a bot's plugin list into a load order.

mod catalog;
mod core;
mod descriptor;

pub use catalog::{PluginCatalog, ResolvedPlugin};
pub use self::core::{HookFn, Plugin, PluginBuilder, PluginLoadContext};
pub use descriptor::{PluginDescriptor, PluginFactory};
