//! A built, live bot runtime.
//!
//! A [`Runtime`] owns everything one generation of a bot needs to handle
//! events: its plugin instances, the handler graph, and the middleware chain.
//! It is immutable once built; a hot reload builds a new one and swaps it in.
//!
//! Teardown is split in two so the orchestrator can drain before releasing:
//!
//! 1. [`drain`](Runtime::drain) stops accepting events and waits for in-flight
//!    handlers
//! 2. [`release`](Runtime::release) runs every plugin's `on_unload` hook in
//!    reverse load order and cancels the runtime's token

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::util::BoxCloneSyncService;
use tower::{BoxError, ServiceExt};
use tracing::{debug, error, info, warn};

use fleet_core::{AccessRules, BotDefinition, BoxedClient, InboundEvent};

use crate::context::EventContext;
use crate::middleware::DispatchStats;
use crate::plugin::{Plugin, PluginLoadContext};
use crate::router::{HandlerGraph, Outcome};

/// The type-erased middleware chain of one runtime.
pub type DispatchService = BoxCloneSyncService<Arc<EventContext>, Outcome, BoxError>;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// A plugin instance together with the context it was loaded with.
pub(crate) struct LoadedPlugin {
    pub(crate) plugin: Plugin,
    pub(crate) ctx: Arc<PluginLoadContext>,
}

/// Everything [`RuntimeBuilder`](crate::RuntimeBuilder) assembles.
pub(crate) struct RuntimeParts {
    pub(crate) definition: Arc<BotDefinition>,
    pub(crate) plugins: Vec<LoadedPlugin>,
    pub(crate) graph: HandlerGraph,
    pub(crate) service: DispatchService,
    pub(crate) stats: Arc<DispatchStats>,
    pub(crate) client: BoxedClient,
    pub(crate) access: Arc<AccessRules>,
    pub(crate) cancel: CancellationToken,
}

pub struct Runtime {
    bot_id: Arc<str>,
    definition: Arc<BotDefinition>,
    plugins: Vec<LoadedPlugin>,
    graph: HandlerGraph,
    service: DispatchService,
    stats: Arc<DispatchStats>,
    client: BoxedClient,
    access: Arc<AccessRules>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    built_at: OffsetDateTime,
    generation: u64,
    released: AtomicBool,
}

impl Runtime {
    pub(crate) fn from_parts(parts: RuntimeParts) -> Self {
        Self {
            bot_id: Arc::from(parts.definition.id.as_str()),
            definition: parts.definition,
            plugins: parts.plugins,
            graph: parts.graph,
            service: parts.service,
            stats: parts.stats,
            client: parts.client,
            access: parts.access,
            cancel: parts.cancel,
            tracker: TaskTracker::new(),
            built_at: OffsetDateTime::now_utc(),
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            released: AtomicBool::new(false),
        }
    }

    // ─── Accessors ───────────────────────────────────────────────────────────

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    pub fn definition(&self) -> &Arc<BotDefinition> {
        &self.definition
    }

    /// Plugin names in load order.
    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins
            .iter()
            .map(|p| p.plugin.name().to_string())
            .collect()
    }

    pub fn graph(&self) -> &HandlerGraph {
        &self.graph
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    pub fn built_at(&self) -> OffsetDateTime {
        self.built_at
    }

    /// Process-wide, strictly increasing build counter.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of handler tasks still running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_accepting(&self) -> bool {
        !self.tracker.is_closed() && !self.cancel.is_cancelled()
    }

    // ─── Dispatch ────────────────────────────────────────────────────────────

    fn context_for(&self, event: InboundEvent) -> Arc<EventContext> {
        Arc::new(EventContext::new(
            event,
            Arc::clone(&self.client),
            Arc::clone(&self.access),
            self.cancel.clone(),
        ))
    }

    /// Hands `event` to a tracked task and returns immediately.
    ///
    /// Returns `false` if the runtime is draining or released, in which case
    /// the event is dropped.
    pub fn dispatch(&self, event: InboundEvent) -> bool {
        match self.try_dispatch(event) {
            Ok(()) => true,
            Err(_) => {
                debug!(bot_id = %self.bot_id, "Runtime not accepting events, dropping");
                false
            }
        }
    }

    /// Like [`dispatch`](Runtime::dispatch), but hands a refused event back.
    pub fn try_dispatch(&self, event: InboundEvent) -> Result<(), InboundEvent> {
        if !self.is_accepting() {
            return Err(event);
        }

        let ctx = self.context_for(event);
        let service = self.service.clone();
        let stats = Arc::clone(&self.stats);
        let bot_id = Arc::clone(&self.bot_id);

        self.tracker.spawn(async move {
            let handled = AssertUnwindSafe(service.oneshot(ctx)).catch_unwind().await;
            if let Err(panic) = handled {
                stats.record_panic();
                error!(bot_id = %bot_id, panic = %panic_message(&*panic), "Handler panicked");
            }
        });
        Ok(())
    }

    /// Runs `event` through the chain inline and returns its outcome.
    pub async fn handle(&self, event: InboundEvent) -> Result<Outcome, BoxError> {
        self.service.clone().oneshot(self.context_for(event)).await
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    /// Runs `on_start` hooks in load order.
    pub async fn notify_started(&self) {
        for loaded in &self.plugins {
            loaded.plugin.on_start(Arc::clone(&loaded.ctx)).await;
        }
    }

    /// Runs `on_stop` hooks in reverse load order.
    pub async fn notify_stopping(&self) {
        for loaded in self.plugins.iter().rev() {
            loaded.plugin.on_stop(Arc::clone(&loaded.ctx)).await;
        }
    }

    /// Stops accepting events and waits up to `timeout` for in-flight
    /// handlers. Returns `false` on timeout, after cancelling the runtime so
    /// stragglers can no longer send.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();
        if self.tracker.is_empty() {
            return true;
        }

        debug!(bot_id = %self.bot_id, in_flight = self.tracker.len(), "Draining runtime");
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok() {
            return true;
        }

        warn!(
            bot_id = %self.bot_id,
            in_flight = self.tracker.len(),
            timeout_ms = timeout.as_millis() as u64,
            "Drain timed out, cancelling remaining handlers"
        );
        self.cancel.cancel();
        false
    }

    /// Unloads plugins in reverse order. Only the first call has any effect.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.tracker.close();
        self.cancel.cancel();
        for loaded in self.plugins.iter().rev() {
            loaded.plugin.on_unload(Arc::clone(&loaded.ctx)).await;
        }
        info!(bot_id = %self.bot_id, generation = self.generation, "Runtime released");
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("bot_id", &self.bot_id)
            .field("generation", &self.generation)
            .field("plugins", &self.plugin_names())
            .field("routes", &self.graph.len())
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
