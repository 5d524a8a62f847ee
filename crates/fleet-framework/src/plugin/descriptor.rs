//! Plugin descriptors: the registered templates plugins are built from.

use std::fmt;
use std::sync::Arc;

use tower::BoxError;

use super::core::{Plugin, PluginLoadContext};

/// Factory producing a fresh [`Plugin`] for one runtime build.
pub type PluginFactory =
    Arc<dyn Fn(&PluginLoadContext) -> Result<Plugin, BoxError> + Send + Sync>;

/// A registered plugin template.
///
/// Descriptors live in the [`PluginCatalog`](super::PluginCatalog) and are
/// read-only once the process has started. Cloning is cheap.
///
/// ```rust,ignore
/// let help = PluginDescriptor::new("help", |_ctx| {
///     Ok(Plugin::builder("help")
///         .matcher(on_command("help").handler(help_handler))
///         .build())
/// })
/// .version("1.2.0")
/// .description("Lists available commands");
///
/// let start = PluginDescriptor::new("start", start_factory).depends_on(["help"]);
/// ```
#[derive(Clone)]
pub struct PluginDescriptor {
    name: String,
    version: String,
    description: String,
    depends_on: Vec<String>,
    factory: PluginFactory,
}

impl PluginDescriptor {
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&PluginLoadContext) -> Result<Plugin, BoxError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: String::new(),
            depends_on: Vec::new(),
            factory: Arc::new(factory),
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Declares plugins that must be loaded, and consulted, before this one.
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_version(&self) -> &str {
        &self.version
    }

    pub fn get_description(&self) -> &str {
        &self.description
    }

    pub fn dependencies(&self) -> &[String] {
        &self.depends_on
    }

    /// Creates the live plugin. Fails if the factory produced a plugin under a
    /// different name than the descriptor's.
    pub fn instantiate(&self, ctx: &PluginLoadContext) -> Result<Plugin, BoxError> {
        let plugin = (self.factory)(ctx)?;
        if plugin.name() != self.name {
            return Err(format!(
                "factory for '{}' produced a plugin named '{}'",
                self.name,
                plugin.name()
            )
            .into());
        }
        Ok(plugin)
    }
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("depends_on", &self.depends_on)
            .finish_non_exhaustive()
    }
}
