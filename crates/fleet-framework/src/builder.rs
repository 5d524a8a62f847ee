//! Builds a [`Runtime`] from a [`BotDefinition`].
//!
//! A build is all-or-nothing. It resolves the plugin load order, creates and
//! loads each plugin in that order, then assembles the handler graph and the
//! middleware chain:
//!
//! ```text
//! Observability → SessionScope → RateLimit → Router (cancellation, access, first match)
//! ```
//!
//! If any step fails (a panicking factory or `on_load` counts as a failure), or
//! the build is cancelled, the plugins loaded so far are
//! unloaded in reverse order and nothing is returned. Builds share no mutable
//! state, so any number may run concurrently.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower::util::BoxCloneSyncService;
use tracing::{debug, info, warn};

use fleet_core::{BotDefinition, BoxedClient, NoopSessions, SessionProvider};

use crate::error::{BuildError, ResolveError};
use crate::middleware::{
    DispatchStats, ObservabilityLayer, RateLimitLayer, RateLimiter, SessionScopeLayer,
};
use crate::plugin::{PluginCatalog, PluginLoadContext, ResolvedPlugin};
use crate::router::{HandlerGraph, Router};
use crate::runtime::{LoadedPlugin, Runtime, RuntimeParts, panic_message};

#[derive(Clone)]
pub struct RuntimeBuilder {
    catalog: Arc<PluginCatalog>,
    client: BoxedClient,
    sessions: Arc<dyn SessionProvider>,
    limiter: Arc<RateLimiter>,
}

impl RuntimeBuilder {
    pub fn new(catalog: Arc<PluginCatalog>, client: BoxedClient) -> Self {
        Self {
            catalog,
            client,
            sessions: NoopSessions::shared(),
            limiter: Arc::new(RateLimiter::new()),
        }
    }

    pub fn with_sessions(mut self, sessions: Arc<dyn SessionProvider>) -> Self {
        self.sessions = sessions;
        self
    }

    /// Shares `limiter` with every runtime this builder produces.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn catalog(&self) -> &Arc<PluginCatalog> {
        &self.catalog
    }

    pub fn client(&self) -> &BoxedClient {
        &self.client
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Resolves the definition's plugin list without building anything.
    pub fn resolve(&self, definition: &BotDefinition) -> Result<Vec<ResolvedPlugin>, ResolveError> {
        self.catalog.resolve(&definition.plugins)
    }

    /// Builds a runtime for `definition`.
    ///
    /// `cancel` is checked between steps and raced against every `on_load`
    /// hook. It only aborts the build: the runtime gets its own token, which
    /// is cancelled by a timed-out drain, by release or on drop.
    pub async fn build(
        &self,
        definition: Arc<BotDefinition>,
        cancel: &CancellationToken,
    ) -> Result<Runtime, BuildError> {
        let bot_id = definition.id.as_str();
        if cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }

        let resolved = self.resolve(&definition)?;
        let runtime_cancel = CancellationToken::new();
        let mut loaded: Vec<LoadedPlugin> = Vec::with_capacity(resolved.len());

        for entry in &resolved {
            if cancel.is_cancelled() {
                unload_all(loaded).await;
                return Err(BuildError::Cancelled);
            }

            let ctx = Arc::new(PluginLoadContext::new(
                bot_id,
                entry.name(),
                entry.config(),
                runtime_cancel.clone(),
            ));

            let created =
                std::panic::catch_unwind(AssertUnwindSafe(|| entry.descriptor.instantiate(&ctx)))
                    .unwrap_or_else(|panic| {
                        Err(format!("factory panicked: {}", panic_message(&*panic)).into())
                    });
            let plugin = match created {
                Ok(plugin) => plugin,
                Err(source) => {
                    unload_all(loaded).await;
                    return Err(BuildError::Factory {
                        plugin: entry.name().to_string(),
                        source,
                    });
                }
            };

            let on_load = AssertUnwindSafe(plugin.on_load(Arc::clone(&ctx))).catch_unwind();
            let load_result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = on_load => Some(result.unwrap_or_else(|panic| {
                    Err(format!("on_load panicked: {}", panic_message(&*panic)).into())
                })),
            };
            match load_result {
                Some(Ok(())) => {
                    debug!(bot_id = %bot_id, plugin = %entry.name(), "Plugin loaded");
                    loaded.push(LoadedPlugin { plugin, ctx });
                }
                Some(Err(source)) => {
                    warn!(bot_id = %bot_id, plugin = %entry.name(), error = %source, "Plugin failed to load");
                    unload_all(loaded).await;
                    return Err(BuildError::PluginInit {
                        plugin: entry.name().to_string(),
                        source,
                    });
                }
                None => {
                    unload_all(loaded).await;
                    return Err(BuildError::Cancelled);
                }
            }
        }

        let mut graph = HandlerGraph::builder();
        for entry in &loaded {
            graph.extend(entry.plugin.name(), entry.plugin.matchers());
        }
        let graph = graph.build();

        let stats = Arc::new(DispatchStats::default());
        let access = Arc::new(definition.access.clone());
        let service = ServiceBuilder::new()
            .layer(ObservabilityLayer::new(Arc::clone(&stats)))
            .layer(SessionScopeLayer::new(Arc::clone(&self.sessions)))
            .layer(RateLimitLayer::new(
                Arc::clone(&self.limiter),
                definition.rate_limit.clone(),
            ))
            .service(Router::new(graph.clone(), Arc::clone(&access)));

        let runtime = Runtime::from_parts(RuntimeParts {
            definition: Arc::clone(&definition),
            plugins: loaded,
            graph,
            service: BoxCloneSyncService::new(service),
            stats,
            client: Arc::clone(&self.client),
            access,
            cancel: runtime_cancel,
        });

        info!(
            bot_id = %bot_id,
            generation = runtime.generation(),
            plugins = ?runtime.plugin_names(),
            routes = runtime.graph().len(),
            "Runtime built"
        );
        Ok(runtime)
    }
}

/// Unloads partially-loaded plugins in reverse order.
async fn unload_all(loaded: Vec<LoadedPlugin>) {
    for entry in loaded.into_iter().rev() {
        entry.plugin.on_unload(entry.ctx).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio::sync::Notify;
    use tower::BoxError;

    use super::*;
    use crate::matcher::{on_command, on_message};
    use crate::plugin::{Plugin, PluginDescriptor};
    use crate::error::SendError;
    use crate::router::{Outcome, Rejection};
    use crate::testing::RecordingClient;
    use fleet_core::{InboundEvent, PluginSpec, RateLimitPolicy};

    type Journal = Arc<Mutex<Vec<String>>>;

    /// A plugin that records its hooks and replies to `/<name>`.
    fn journaling(name: &'static str, journal: &Journal) -> PluginDescriptor {
        let journal = Arc::clone(journal);
        PluginDescriptor::new(name, move |_ctx| {
            let (load, unload) = (Arc::clone(&journal), Arc::clone(&journal));
            Ok(Plugin::builder(name)
                .matcher(on_command(name).handler(move |ctx| async move {
                    ctx.reply(format!("{name} here")).await?;
                    Ok::<_, BoxError>(())
                }))
                .on_load(move |_ctx| {
                    let journal = Arc::clone(&load);
                    async move {
                        journal.lock().push(format!("load:{name}"));
                        Ok(())
                    }
                })
                .on_unload(move |_ctx| {
                    let journal = Arc::clone(&unload);
                    async move {
                        journal.lock().push(format!("unload:{name}"));
                        Ok(())
                    }
                })
                .build())
        })
    }

    fn failing_on_load(name: &'static str) -> PluginDescriptor {
        PluginDescriptor::new(name, move |_ctx| {
            Ok(Plugin::builder(name)
                .on_load(|_ctx| async { Err::<(), BoxError>("database unreachable".into()) })
                .build())
        })
    }

    fn builder_with(descriptors: Vec<PluginDescriptor>) -> (RuntimeBuilder, Arc<RecordingClient>) {
        let mut catalog = PluginCatalog::new();
        for d in descriptors {
            catalog.register(d);
        }
        let client = Arc::new(RecordingClient::default());
        (RuntimeBuilder::new(Arc::new(catalog), client.clone()), client)
    }

    fn definition(id: &str, plugins: &[&str]) -> Arc<BotDefinition> {
        let mut def = BotDefinition::new(id, "token");
        for p in plugins {
            def = def.with_plugin(PluginSpec::named(*p));
        }
        Arc::new(def)
    }

    #[tokio::test]
    async fn test_build_loads_in_dependency_order() {
        let journal = Journal::default();
        let (builder, _) = builder_with(vec![
            journaling("help", &journal),
            journaling("start", &journal).depends_on(["help"]),
        ]);

        let runtime = builder
            .build(definition("a", &["start", "help"]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(runtime.plugin_names(), ["help", "start"]);
        assert_eq!(*journal.lock(), ["load:help", "load:start"]);
        assert_eq!(runtime.graph().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_load_unloads_earlier_plugins_in_reverse() {
        let journal = Journal::default();
        let (builder, _) = builder_with(vec![
            journaling("a", &journal),
            journaling("b", &journal),
            failing_on_load("c"),
        ]);

        let err = builder
            .build(definition("bot", &["a", "b", "c"]), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, BuildError::PluginInit { ref plugin, .. } if plugin == "c"));
        assert!(!err.is_configuration());
        assert_eq!(
            *journal.lock(),
            ["load:a", "load:b", "unload:b", "unload:a"]
        );
    }

    #[tokio::test]
    async fn test_panicking_on_load_fails_build_and_unwinds() {
        let journal = Journal::default();
        let (builder, _) = builder_with(vec![
            journaling("help", &journal),
            PluginDescriptor::new("bomb", |_ctx| {
                Ok(Plugin::builder("bomb")
                    .on_load(|_ctx| async {
                        if true {
                            panic!("init exploded");
                        }
                            Ok::<(), BoxError>(())
                    })
                    .build())
            }),
        ]);

        let err = builder
            .build(definition("bot", &["help", "bomb"]), &CancellationToken::new())
            .await
            .unwrap_err();

        match &err {
            BuildError::PluginInit { plugin, source } => {
                assert_eq!(plugin, "bomb");
                assert!(source.to_string().contains("init exploded"), "{source}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(*journal.lock(), ["load:help", "unload:help"]);
    }

    #[tokio::test]
    async fn test_factory_error_is_configuration() {
        let (builder, _) = builder_with(vec![PluginDescriptor::new("strict", |ctx| {
            let _: u32 = ctx.get_config()?;
            Ok(Plugin::builder("strict").build())
        })]);

        let err = builder
            .build(definition("bot", &["strict"]), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Factory { .. }));
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_resolution_errors_surface_before_loading() {
        let journal = Journal::default();
        let (builder, _) = builder_with(vec![
            journaling("x", &journal).depends_on(["y"]),
            journaling("y", &journal).depends_on(["x"]),
        ]);

        let err = builder
            .build(definition("bot", &["x", "y"]), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Resolve(ResolveError::Cycle { .. })));
        assert!(journal.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_build_returns_nothing() {
        let journal = Journal::default();
        let (builder, _) = builder_with(vec![journaling("a", &journal)]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = builder
            .build(definition("bot", &["a"]), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Cancelled));
        assert!(journal.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_slow_on_load() {
        let (builder, _) = builder_with(vec![PluginDescriptor::new("slow", |_ctx| {
            Ok(Plugin::builder("slow")
                .on_load(|_ctx| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                })
                .build())
        })]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = builder
            .build(definition("bot", &["slow"]), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Cancelled));
    }

    #[tokio::test]
    async fn test_runtime_routes_and_replies() {
        let journal = Journal::default();
        let (builder, client) = builder_with(vec![journaling("help", &journal)]);
        let runtime = builder
            .build(definition("a", &["help"]), &CancellationToken::new())
            .await
            .unwrap();

        let outcome = runtime
            .handle(InboundEvent::message("a", "alice", "chat-1", "/help"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::Handled {
                plugin: "help".into(),
                route: "/help".into()
            }
        );

        let sent = client.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "a");
        assert_eq!(sent[0].1.text, "help here");
    }

    #[tokio::test]
    async fn test_rate_limiter_is_shared_across_builds() {
        let journal = Journal::default();
        let (builder, _) = builder_with(vec![journaling("help", &journal)]);
        let mut def = BotDefinition::new("a", "token").with_plugin(PluginSpec::named("help"));
        def.rate_limit = RateLimitPolicy {
            rate: 1,
            burst: 1,
            period_secs: 3600,
            ..Default::default()
        };
        let def = Arc::new(def);
        let event = || InboundEvent::message("a", "alice", "c", "/help");

        let first = builder.build(Arc::clone(&def), &CancellationToken::new()).await.unwrap();
        assert!(matches!(first.handle(event()).await.unwrap(), Outcome::Handled { .. }));

        // A reload must not refill the user's bucket.
        let second = builder.build(def, &CancellationToken::new()).await.unwrap();
        assert!(second.generation() > first.generation());
        assert_eq!(
            second.handle(event()).await.unwrap(),
            Outcome::Rejected(Rejection::RateLimited)
        );
    }

    #[tokio::test]
    async fn test_dispatch_drain_and_release() {
        let journal = Journal::default();
        let handled = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&handled);
        let (builder, _) = builder_with(vec![
            journaling("help", &journal),
            PluginDescriptor::new("slow", move |_ctx| {
                let seen = Arc::clone(&seen);
                Ok(Plugin::builder("slow")
                    .matcher(on_message().handler(move |_ctx| {
                        let seen = Arc::clone(&seen);
                        async move {
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            seen.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, BoxError>(())
                        }
                    }))
                    .build())
            }),
        ]);
        let runtime = builder
            .build(definition("a", &["help", "slow"]), &CancellationToken::new())
            .await
            .unwrap();

        assert!(runtime.dispatch(InboundEvent::message("a", "u", "c", "hello")));
        assert!(runtime.drain(Duration::from_secs(5)).await);
        assert_eq!(handled.load(Ordering::SeqCst), 1);
        assert!(!runtime.dispatch(InboundEvent::message("a", "u", "c", "late")));

        runtime.release().await;
        runtime.release().await;
        assert_eq!(*journal.lock(), ["load:help", "unload:help"]);
        assert!(runtime.is_released());
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let (builder, _) = builder_with(vec![PluginDescriptor::new("bomb", |_ctx| {
            Ok(Plugin::builder("bomb")
                .matcher(on_message().handler(|_ctx| async {
                    if true {
                        panic!("handler exploded");
                    }
                    Ok::<_, BoxError>(())
                }))
                .build())
        })]);
        let runtime = builder
            .build(definition("a", &["bomb"]), &CancellationToken::new())
            .await
            .unwrap();

        assert!(runtime.dispatch(InboundEvent::message("a", "u", "c", "hi")));
        assert!(runtime.drain(Duration::from_secs(5)).await);
        assert_eq!(runtime.stats().failed(), 1);
    }

    #[tokio::test]
    async fn test_released_runtime_rejects_events() {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        let (builder, _) = builder_with(vec![PluginDescriptor::new("count", move |_ctx| {
            let seen = Arc::clone(&seen);
            Ok(Plugin::builder("count")
                .matcher(on_message().handler(move |_ctx| {
                    let seen = Arc::clone(&seen);
                    async move {
                        seen.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, BoxError>(())
                    }
                }))
                .build())
        })]);
        let runtime = builder
            .build(definition("a", &["count"]), &CancellationToken::new())
            .await
            .unwrap();

        runtime.release().await;
        let outcome = runtime
            .handle(InboundEvent::message("a", "u", "c", "hello"))
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Rejected(Rejection::Cancelled));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timed_out_drain_cancels_outbound_sends() {
        let gate = Arc::new(Notify::new());
        let slot: Arc<Mutex<Option<Result<(), SendError>>>> = Arc::default();
        let (handler_gate, handler_slot) = (Arc::clone(&gate), Arc::clone(&slot));
        let (builder, client) = builder_with(vec![PluginDescriptor::new("straggler", move |_ctx| {
            let (gate, slot) = (Arc::clone(&handler_gate), Arc::clone(&handler_slot));
            Ok(Plugin::builder("straggler")
                .matcher(on_message().handler(move |ctx| {
                    let (gate, slot) = (Arc::clone(&gate), Arc::clone(&slot));
                    async move {
                        gate.notified().await;
                        let sent = ctx.reply("too late").await;
                        *slot.lock() = Some(sent);
                        Ok::<_, BoxError>(())
                    }
                }))
                .build())
        })]);
        let runtime = builder
            .build(definition("a", &["straggler"]), &CancellationToken::new())
            .await
            .unwrap();

        assert!(runtime.dispatch(InboundEvent::message("a", "u", "c", "hello")));
        assert!(!runtime.drain(Duration::from_millis(20)).await);
        assert!(!runtime.is_accepting());

        gate.notify_one();
        assert!(runtime.drain(Duration::from_secs(5)).await);
        assert!(matches!(*slot.lock(), Some(Err(SendError::Cancelled(_)))));
        assert!(client.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_teardown_hooks_are_contained() {
        let journal = Journal::default();
        let (builder, _) = builder_with(vec![
            journaling("help", &journal),
            PluginDescriptor::new("grumpy", |_ctx| {
                Ok(Plugin::builder("grumpy")
                    .on_stop(|_ctx| async {
                        if true {
                            panic!("stop exploded");
                        }
                        Ok::<(), BoxError>(())
                    })
                    .on_unload(|_ctx| async {
                        if true {
                            panic!("unload exploded");
                        }
                        Ok::<(), BoxError>(())
                    })
                    .build())
            }),
        ]);
        let runtime = builder
            .build(definition("a", &["help", "grumpy"]), &CancellationToken::new())
            .await
            .unwrap();

        runtime.notify_stopping().await;
        runtime.release().await;

        assert!(runtime.is_released());
        assert_eq!(*journal.lock(), ["load:help", "unload:help"]);
    }
}
