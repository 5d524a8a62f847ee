use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{error, warn};

use crate::matcher::Matcher;
use crate::runtime::panic_message;

// ─── PluginLoadContext ────────────────────────────────────────────────────────

/// Context passed to a plugin's factory and lifecycle hooks.
///
/// Carries the bot the plugin is being built for and the plugin's config map
/// from the bot definition (an empty object when none was given).
///
/// # Example
///
/// ```rust,ignore
/// #[derive(serde::Deserialize, Default)]
/// #[serde(default)]
/// struct GreetConfig { greeting: String }
///
/// let cfg: GreetConfig = ctx.get_config()?;
/// ```
#[derive(Clone, Debug)]
pub struct PluginLoadContext {
    bot_id: Arc<str>,
    plugin: Arc<str>,
    config: Arc<Value>,
    cancel: CancellationToken,
}

impl PluginLoadContext {
    pub fn new(bot_id: &str, plugin: &str, config: Value, cancel: CancellationToken) -> Self {
        Self {
            bot_id: Arc::from(bot_id),
            plugin: Arc::from(plugin),
            config: Arc::new(config),
            cancel,
        }
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin
    }

    pub fn raw_config(&self) -> &Value {
        &self.config
    }

    /// Deserialises the plugin config into `T`.
    ///
    /// Use `#[serde(default)]` on `T` to make every field optional.
    pub fn get_config<T>(&self) -> serde_json::Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        T::deserialize(self.config.as_ref())
    }

    /// Cancelled when the runtime this plugin belongs to is torn down.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Type of an async lifecycle hook stored inside a [`Plugin`].
pub type HookFn =
    Arc<dyn Fn(Arc<PluginLoadContext>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

fn hook<F, Fut>(f: F) -> HookFn
where
    F: Fn(Arc<PluginLoadContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(
        move |ctx: Arc<PluginLoadContext>| -> BoxFuture<'static, Result<(), BoxError>> {
            Box::pin(f(ctx))
        },
    )
}

// ─── Plugin ───────────────────────────────────────────────────────────────────

/// A live plugin instance: its matchers plus lifecycle hooks.
///
/// Created fresh by a [`PluginDescriptor`](super::PluginDescriptor) factory for
/// every runtime build, so in-memory plugin state never leaks from one runtime
/// generation into the next.
///
/// | Hook | When | Failure |
/// |------|------|---------|
/// | `on_load` | during the build, in dependency order | aborts the build |
/// | `on_start` | after the runtime goes live | logged |
/// | `on_stop` | before the bot stops consuming | logged |
/// | `on_unload` | after the runtime is drained, reverse order | logged |
pub struct Plugin {
    name: Cow<'static, str>,
    matchers: Vec<Matcher>,
    on_load: Option<HookFn>,
    on_start: Option<HookFn>,
    on_stop: Option<HookFn>,
    on_unload: Option<HookFn>,
}

impl Plugin {
    pub fn builder(name: impl Into<Cow<'static, str>>) -> PluginBuilder {
        PluginBuilder {
            plugin: Plugin {
                name: name.into(),
                matchers: Vec::new(),
                on_load: None,
                on_start: None,
                on_stop: None,
                on_unload: None,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matchers(&self) -> &[Matcher] {
        &self.matchers
    }

    pub(crate) async fn on_load(&self, ctx: Arc<PluginLoadContext>) -> Result<(), BoxError> {
        match &self.on_load {
            Some(f) => f(ctx).await,
            None => Ok(()),
        }
    }

    pub(crate) async fn on_start(&self, ctx: Arc<PluginLoadContext>) {
        self.run_quiet_hook(&self.on_start, ctx, "on_start").await;
    }

    pub(crate) async fn on_stop(&self, ctx: Arc<PluginLoadContext>) {
        self.run_quiet_hook(&self.on_stop, ctx, "on_stop").await;
    }

    pub(crate) async fn on_unload(&self, ctx: Arc<PluginLoadContext>) {
        self.run_quiet_hook(&self.on_unload, ctx, "on_unload").await;
    }

    async fn run_quiet_hook(&self, f: &Option<HookFn>, ctx: Arc<PluginLoadContext>, which: &str) {
        let Some(f) = f else { return };
        let bot_id = ctx.bot_id().to_string();
        match AssertUnwindSafe(f(ctx)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(bot_id = %bot_id, plugin = %self.name, hook = which, error = %e, "Plugin hook failed");
            }
            Err(panic) => {
                error!(
                    bot_id = %bot_id,
                    plugin = %self.name,
                    hook = which,
                    panic = %panic_message(&*panic),
                    "Plugin hook panicked"
                );
            }
        }
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("matchers", &self.matchers)
            .finish_non_exhaustive()
    }
}

pub struct PluginBuilder {
    plugin: Plugin,
}

impl PluginBuilder {
    /// Appends a matcher. Order within a plugin is preserved.
    pub fn matcher(mut self, matcher: Matcher) -> Self {
        self.plugin.matchers.push(matcher);
        self
    }

    pub fn on_load<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<PluginLoadContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.plugin.on_load = Some(hook(f));
        self
    }

    pub fn on_start<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<PluginLoadContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.plugin.on_start = Some(hook(f));
        self
    }

    pub fn on_stop<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<PluginLoadContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.plugin.on_stop = Some(hook(f));
        self
    }

    pub fn on_unload<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<PluginLoadContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.plugin.on_unload = Some(hook(f));
        self
    }

    pub fn build(self) -> Plugin {
        self.plugin
    }
}
