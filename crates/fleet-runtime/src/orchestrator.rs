//! The set of managed bots and every lifecycle operation on them.
//!
//! Each bot id maps to one [`ManagedBot`] holding its current definition,
//! state, live runtime and supervisor. All mutations of one bot happen under
//! that bot's operation lock, so operations on the same id are totally
//! ordered while different ids never wait on each other.
//!
//! Operations return [`OpResult`]; panics inside an operation are caught,
//! reported as runtime errors, and never leave the bot in a transitional
//! state.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use futures::FutureExt;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use fleet_core::{BotDefinition, BotState, DeliveryMode, ErrorKind, EventStream, InboundEvent, Phase};
use fleet_framework::{Runtime, RuntimeBuilder};

use crate::config::{DefinitionSource, FleetConfig, validate_definition};
use crate::error::{LifecycleError, LifecycleResult, OpResult};
use crate::supervisor::{self, Lifecycle, RestartPolicy, SupervisorHandle};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub restart: RestartPolicy,
    pub stop_grace: Duration,
    pub drain_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            restart: RestartPolicy::default(),
            stop_grace: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&FleetConfig> for OrchestratorSettings {
    fn from(config: &FleetConfig) -> Self {
        Self {
            restart: config.supervisor.restart_policy(),
            stop_grace: config.lifecycle.stop_grace(),
            drain_timeout: config.lifecycle.drain_timeout(),
        }
    }
}

/// Read-only snapshot of one managed bot.
#[derive(Debug, Clone, Serialize)]
pub struct BotStatus {
    pub id: String,
    pub name: String,
    pub state: BotState,
    pub mode: DeliveryMode,
    pub enabled: bool,
    pub uptime_secs: Option<u64>,
    pub last_error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// Live plugin load order, or the declared plugins when nothing is live.
    pub plugins: Vec<String>,
    pub restarts: u32,
    pub restart_exhausted: bool,
    pub built_at: Option<String>,
    pub generation: Option<u64>,
    pub events_handled: u64,
    pub in_flight: usize,
}

/// Status wrapped in the same envelope as every other operation.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub result: OpResult,
    pub bots: Vec<BotStatus>,
}

// =============================================================================
// ManagedBot
// =============================================================================

#[derive(Debug)]
struct BotRecord {
    definition: Arc<BotDefinition>,
    state: BotState,
    last_error: Option<LifecycleError>,
    running_since: Option<Instant>,
    restarts: u32,
    restart_exhausted: bool,
}

struct ManagedBot {
    id: String,
    /// Serializes every lifecycle operation on this bot.
    op: tokio::sync::Mutex<()>,
    record: RwLock<BotRecord>,
    live: RwLock<Option<Arc<Runtime>>>,
    supervisor: Mutex<Option<SupervisorHandle>>,
    /// Replaced on every start. Cancelling it aborts pending builds and the
    /// supervisor, never the live runtime.
    cancel: Mutex<CancellationToken>,
}

impl ManagedBot {
    fn new(definition: Arc<BotDefinition>, cancel: CancellationToken) -> Self {
        Self {
            id: definition.id.clone(),
            op: tokio::sync::Mutex::new(()),
            record: RwLock::new(BotRecord {
                definition,
                state: BotState::Stopped,
                last_error: None,
                running_since: None,
                restarts: 0,
                restart_exhausted: false,
            }),
            live: RwLock::new(None),
            supervisor: Mutex::new(None),
            cancel: Mutex::new(cancel),
        }
    }

    fn state(&self) -> BotState {
        self.record.read().state
    }

    fn definition(&self) -> Arc<BotDefinition> {
        Arc::clone(&self.record.read().definition)
    }

    fn set_definition(&self, definition: Arc<BotDefinition>) {
        self.record.write().definition = definition;
    }

    fn token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    fn live(&self) -> Option<Arc<Runtime>> {
        self.live.read().clone()
    }

    fn transition(&self, to: BotState, phase: Phase) -> LifecycleResult<()> {
        let mut record = self.record.write();
        let from = record.state;
        if !from.can_transition_to(to) {
            return Err(LifecycleError::IllegalTransition {
                bot_id: self.id.clone(),
                phase,
                from,
                to,
            });
        }
        record.state = to;
        match to {
            BotState::Running => record.running_since = Some(Instant::now()),
            BotState::Stopped | BotState::Failed => record.running_since = None,
            _ => {}
        }
        debug!(bot_id = %self.id, from = %from, to = %to, "State transition");
        Ok(())
    }

    /// Records `error`, moving to `Failed` where the table allows it.
    fn mark_failed(&self, error: LifecycleError) {
        let mut record = self.record.write();
        if record.state.can_transition_to(BotState::Failed) {
            debug!(bot_id = %self.id, from = %record.state, "State transition to failed");
            record.state = BotState::Failed;
            record.running_since = None;
        }
        record.last_error = Some(error);
    }

    /// Leaves a transitional state after a panicked operation: a reload that
    /// still has a live runtime returns to `Running`, anything else is
    /// `Failed`.
    fn recover(&self, error: LifecycleError) {
        let live = self.live.read().is_some();
        let mut record = self.record.write();
        let to = match record.state {
            BotState::Reloading if live => BotState::Running,
            BotState::Starting | BotState::Reloading | BotState::Stopping => BotState::Failed,
            _ => {
                record.last_error = Some(error);
                return;
            }
        };
        warn!(bot_id = %self.id, from = %record.state, to = %to, "Recovering from panicked operation");
        if to == BotState::Failed {
            record.running_since = None;
        }
        record.state = to;
        record.last_error = Some(error);
    }

    fn status(&self) -> BotStatus {
        let record = self.record.read();
        let live = self.live();
        let definition = &record.definition;

        let plugins = match &live {
            Some(rt) => rt.plugin_names(),
            None => definition
                .plugins
                .iter()
                .filter(|p| p.enabled)
                .map(|p| p.name.clone())
                .collect(),
        };

        BotStatus {
            id: self.id.clone(),
            name: definition.display_name().to_string(),
            state: record.state,
            mode: definition.mode,
            enabled: definition.enabled,
            uptime_secs: record.running_since.map(|t| t.elapsed().as_secs()),
            last_error: record.last_error.as_ref().map(ToString::to_string),
            error_kind: record.last_error.as_ref().map(LifecycleError::kind),
            plugins,
            restarts: record.restarts,
            restart_exhausted: record.restart_exhausted,
            built_at: live.as_ref().and_then(|rt| rt.built_at().format(&Rfc3339).ok()),
            generation: live.as_ref().map(|rt| rt.generation()),
            events_handled: live.as_ref().map_or(0, |rt| rt.stats().handled()),
            in_flight: live.as_ref().map_or(0, |rt| rt.in_flight()),
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

struct Inner {
    bots: DashMap<String, Arc<ManagedBot>>,
    builder: RuntimeBuilder,
    source: Arc<dyn DefinitionSource>,
    settings: OrchestratorSettings,
    shutdown: CancellationToken,
}

/// Owns every managed bot. Cloning shares the same set.
///
/// ```rust,ignore
/// let orchestrator = Orchestrator::new(builder, Arc::new(FsDefinitionSource::new("bots")), settings);
/// orchestrator.start("support").await;
/// orchestrator.reload("support").await;
/// println!("{:?}", orchestrator.status_all());
/// ```
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        builder: RuntimeBuilder,
        source: Arc<dyn DefinitionSource>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                bots: DashMap::new(),
                builder,
                source,
                settings,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn builder(&self) -> &RuntimeBuilder {
        &self.inner.builder
    }

    pub fn source(&self) -> &Arc<dyn DefinitionSource> {
        &self.inner.source
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    /// Managed bot ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.bots.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.bots.contains_key(id)
    }

    /// Adds a bot in `Stopped` without starting it. Registering an id that is
    /// already managed is an error.
    pub fn register(&self, definition: BotDefinition) -> LifecycleResult<()> {
        validate_definition(&definition, None)
            .map_err(|e| LifecycleError::configuration(&definition.id, Phase::Start, e))?;
        let id = definition.id.clone();
        match self.inner.bots.entry(id.clone()) {
            Entry::Occupied(_) => Err(LifecycleError::configuration(
                &id,
                Phase::Start,
                "bot is already managed",
            )),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(ManagedBot::new(
                    Arc::new(definition),
                    self.inner.shutdown.child_token(),
                )));
                info!(bot_id = %id, "Bot registered");
                Ok(())
            }
        }
    }

    /// The live runtime of `id`, if any.
    pub fn runtime(&self, id: &str) -> Option<Arc<Runtime>> {
        self.inner.get(id)?.live()
    }

    // ─── Operations ──────────────────────────────────────────────────────────

    pub async fn start(&self, id: &str) -> OpResult {
        let span = info_span!("start", bot_id = %id);
        self.inner
            .guarded(id, Phase::Start, self.inner.start(id))
            .instrument(span)
            .await
    }

    pub async fn stop(&self, id: &str) -> OpResult {
        let span = info_span!("stop", bot_id = %id);
        self.inner
            .guarded(id, Phase::Stop, self.inner.stop(id))
            .instrument(span)
            .await
    }

    pub async fn reload(&self, id: &str) -> OpResult {
        let span = info_span!("reload", bot_id = %id);
        self.inner
            .guarded(id, Phase::Reload, self.inner.reload(id))
            .instrument(span)
            .await
    }

    /// Reloads every managed or defined bot concurrently.
    pub async fn reload_all(&self) -> BTreeMap<String, OpResult> {
        let mut ids: BTreeSet<String> = self.ids().into_iter().collect();
        match self.inner.source.list_ids() {
            Ok(defined) => ids.extend(defined),
            Err(e) => warn!(error = %e, "Failed to list definitions, reloading managed bots only"),
        }
        info!(count = ids.len(), "Reloading all bots");
        self.for_each(ids, |this, id| async move { this.reload(&id).await })
            .await
    }

    /// Reloads every bot whose definition uses `plugin`.
    pub async fn reload_plugin(&self, plugin: &str) -> BTreeMap<String, OpResult> {
        let ids: BTreeSet<String> = self
            .inner
            .bots
            .iter()
            .filter(|e| e.value().definition().uses_plugin(plugin))
            .map(|e| e.key().clone())
            .collect();
        info!(plugin, count = ids.len(), "Reloading bots using plugin");
        self.for_each(ids, |this, id| async move { this.reload(&id).await })
            .await
    }

    /// Starts every enabled bot known to the source or already managed.
    pub async fn start_all(&self) -> BTreeMap<String, OpResult> {
        let mut ids: BTreeSet<String> = self.ids().into_iter().collect();
        match self.inner.source.list_ids() {
            Ok(defined) => ids.extend(defined),
            Err(e) => warn!(error = %e, "Failed to list definitions"),
        }
        self.for_each(ids, |this, id| async move {
            let enabled = match this.inner.get(&id) {
                Some(bot) => bot.definition().enabled,
                None => match this.inner.source.load(&id) {
                    Ok(Some(def)) => def.enabled,
                    _ => true,
                },
            };
            if enabled {
                this.start(&id).await
            } else {
                debug!(bot_id = %id, "Bot disabled, not starting");
                OpResult::ok(format!("bot '{id}' is disabled"))
            }
        })
        .await
    }

    pub async fn stop_all(&self) -> BTreeMap<String, OpResult> {
        let ids: BTreeSet<String> = self.ids().into_iter().collect();
        self.for_each(ids, |this, id| async move { this.stop(&id).await })
            .await
    }

    /// Stops every bot and cancels everything still pending.
    pub async fn shutdown(&self) {
        info!(bots = self.inner.bots.len(), "Shutting down orchestrator");
        let results = self.stop_all().await;
        for (id, result) in results.iter().filter(|(_, r)| !r.success) {
            warn!(bot_id = %id, message = %result.message, "Bot did not stop cleanly");
        }
        self.inner.shutdown.cancel();
    }

    // ─── Status ──────────────────────────────────────────────────────────────

    pub fn status(&self, id: &str) -> LifecycleResult<BotStatus> {
        self.inner
            .get(id)
            .map(|bot| bot.status())
            .ok_or_else(|| LifecycleError::not_found(id, Phase::Runtime))
    }

    /// Status of every managed bot, sorted by id.
    pub fn status_all(&self) -> Vec<BotStatus> {
        let mut all: Vec<BotStatus> = self.inner.bots.iter().map(|e| e.value().status()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Status of `id`, or of every bot when `id` is `None`, as an operation
    /// result.
    pub fn status_report(&self, id: Option<&str>) -> StatusReport {
        let Some(id) = id else {
            let bots = self.status_all();
            return StatusReport {
                result: OpResult::ok(format!("{} bots managed", bots.len())),
                bots,
            };
        };
        match self.status(id) {
            Ok(status) => StatusReport {
                result: OpResult::ok(format!("bot '{id}' is {}", status.state)),
                bots: vec![status],
            },
            Err(e) => StatusReport {
                result: OpResult::failed(&e),
                bots: Vec::new(),
            },
        }
    }

    async fn for_each<F, Fut>(&self, ids: BTreeSet<String>, op: F) -> BTreeMap<String, OpResult>
    where
        F: Fn(Orchestrator, String) -> Fut,
        Fut: Future<Output = OpResult>,
    {
        let ops = ids.into_iter().map(|id| {
            let fut = op(self.clone(), id.clone());
            async move { (id, fut.await) }
        });
        join_all(ops).await.into_iter().collect()
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("bots", &self.ids())
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Operations
// =============================================================================

impl Inner {
    fn get(&self, id: &str) -> Option<Arc<ManagedBot>> {
        self.bots.get(id).map(|e| Arc::clone(e.value()))
    }

    fn insert(&self, definition: Arc<BotDefinition>) -> Arc<ManagedBot> {
        let id = definition.id.clone();
        let bot = self
            .bots
            .entry(id.clone())
            .or_insert_with(|| Arc::new(ManagedBot::new(definition, self.shutdown.child_token())));
        Arc::clone(bot.value())
    }

    /// A managed bot, or one freshly registered from the source.
    fn lookup_or_load(&self, id: &str, phase: Phase) -> LifecycleResult<Arc<ManagedBot>> {
        if let Some(bot) = self.get(id) {
            return Ok(bot);
        }
        match self.source.load(id) {
            Ok(Some(def)) => {
                info!(bot_id = %id, "Bot registered from definition source");
                Ok(self.insert(Arc::new(def)))
            }
            Ok(None) => Err(LifecycleError::not_found(id, phase)),
            Err(e) => Err(LifecycleError::configuration(id, phase, e)),
        }
    }

    /// Runs one operation, turning its result or panic into an [`OpResult`].
    /// A panic never leaves the bot in a transitional state.
    async fn guarded<F>(&self, id: &str, phase: Phase, op: F) -> OpResult
    where
        F: Future<Output = LifecycleResult<String>>,
    {
        match AssertUnwindSafe(op).catch_unwind().await {
            Ok(Ok(message)) => {
                info!(bot_id = %id, phase = %phase, "{message}");
                OpResult::ok(message)
            }
            Ok(Err(e)) => {
                warn!(bot_id = %id, phase = %phase, kind = %e.kind(), error = %e, "Operation failed");
                OpResult::failed(&e)
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                let e = LifecycleError::runtime(id, phase, format!("operation panicked: {message}"));
                error!(bot_id = %id, phase = %phase, error = %e, "Operation panicked");
                if let Some(bot) = self.get(id) {
                    bot.recover(e.clone());
                }
                OpResult::failed(&e)
            }
        }
    }

    // ─── start ───────────────────────────────────────────────────────────────

    async fn start(self: &Arc<Self>, id: &str) -> LifecycleResult<String> {
        let bot = self.lookup_or_load(id, Phase::Start)?;
        let _op = bot.op.lock().await;
        self.start_locked(&bot, Phase::Start).await
    }

    async fn start_locked(self: &Arc<Self>, bot: &Arc<ManagedBot>, phase: Phase) -> LifecycleResult<String> {
        let id = bot.id.as_str();
        let definition = bot.definition();
        if !definition.enabled {
            return Err(LifecycleError::configuration(id, phase, "bot is disabled"));
        }

        let state = bot.state();
        if state.is_active() {
            return Ok(format!("bot '{id}' is already {state}"));
        }

        // A parked bot may still hold its faulted runtime and finished supervisor.
        self.teardown(bot).await;

        let token = self.shutdown.child_token();
        *bot.cancel.lock() = token.clone();
        bot.transition(BotState::Starting, phase)?;
        {
            let mut record = bot.record.write();
            record.restarts = 0;
            record.restart_exhausted = false;
        }

        match self.launch(bot, definition, &token, phase).await {
            Ok((runtime, stream)) => {
                let generation = runtime.generation();
                *bot.live.write() = Some(runtime);
                bot.transition(BotState::Running, phase)?;
                bot.record.write().last_error = None;
                self.supervise(bot, Ok(stream), &token);
                Ok(format!("bot '{id}' started (generation {generation})"))
            }
            Err(e) => {
                bot.mark_failed(e.clone());
                if e.is_retriable() {
                    self.supervise(bot, Err(e.clone()), &token);
                }
                Err(e)
            }
        }
    }

    /// Builds a runtime, connects, and runs `on_start` hooks.
    async fn launch(
        &self,
        bot: &ManagedBot,
        definition: Arc<BotDefinition>,
        token: &CancellationToken,
        phase: Phase,
    ) -> LifecycleResult<(Arc<Runtime>, EventStream)> {
        let runtime = self
            .builder
            .build(Arc::clone(&definition), token)
            .await
            .map_err(|e| LifecycleError::from_build(&bot.id, phase, e))?;
        let runtime = Arc::new(runtime);

        let connected = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = self.builder.client().start_consuming(&bot.id, &definition.credential, definition.mode) => Some(result),
        };
        let stream = match connected {
            Some(Ok(stream)) => stream,
            Some(Err(e)) => {
                runtime.release().await;
                return Err(LifecycleError::Build {
                    bot_id: bot.id.clone(),
                    phase,
                    message: e.to_string(),
                });
            }
            None => {
                runtime.release().await;
                return Err(LifecycleError::Cancelled {
                    bot_id: bot.id.clone(),
                    phase,
                });
            }
        };

        runtime.notify_started().await;
        Ok((runtime, stream))
    }

    fn supervise(
        self: &Arc<Self>,
        bot: &Arc<ManagedBot>,
        initial: Result<EventStream, LifecycleError>,
        token: &CancellationToken,
    ) {
        let lifecycle = Arc::new(BotLifecycle {
            inner: Arc::downgrade(self),
            bot: Arc::clone(bot),
        });
        let handle = supervisor::spawn(
            lifecycle,
            self.settings.restart.clone(),
            initial,
            token.child_token(),
        );
        if let Some(previous) = bot.supervisor.lock().replace(handle) {
            previous.cancel();
        }
    }

    // ─── stop ────────────────────────────────────────────────────────────────

    async fn stop(&self, id: &str) -> LifecycleResult<String> {
        let bot = self
            .get(id)
            .ok_or_else(|| LifecycleError::not_found(id, Phase::Stop))?;

        // Abort a start, restart or reload currently holding the lock.
        bot.cancel.lock().cancel();
        let _op = bot.op.lock().await;
        self.stop_locked(&bot, Phase::Stop).await
    }

    async fn stop_locked(&self, bot: &ManagedBot, phase: Phase) -> LifecycleResult<String> {
        let id = bot.id.as_str();
        if bot.state() == BotState::Stopped {
            return Ok(format!("bot '{id}' is already stopped"));
        }

        bot.transition(BotState::Stopping, phase)?;
        bot.cancel.lock().cancel();
        self.teardown(bot).await;
        bot.transition(BotState::Stopped, phase)?;
        Ok(format!("bot '{id}' stopped"))
    }

    async fn halt_supervisor(&self, bot: &ManagedBot) {
        let handle = bot.supervisor.lock().take();
        if let Some(handle) = handle
            && !handle.shutdown(self.settings.stop_grace).await
        {
            warn!(bot_id = %bot.id, "Supervisor forcibly terminated");
        }
    }

    /// Halts the supervisor, then retires the live runtime.
    async fn teardown(&self, bot: &ManagedBot) {
        self.halt_supervisor(bot).await;
        self.release_live(bot).await;
    }

    /// Disconnects and retires the live runtime, if any.
    async fn release_live(&self, bot: &ManagedBot) {
        let runtime = bot.live.write().take();
        let Some(runtime) = runtime else {
            return;
        };
        runtime.notify_stopping().await;
        if let Err(e) = self.builder.client().stop_consuming(&bot.id).await {
            warn!(bot_id = %bot.id, error = %e, "Failed to stop consuming");
        }
        self.retire(runtime).await;
    }

    /// Drains and releases a runtime that is no longer live.
    async fn retire(&self, runtime: Arc<Runtime>) {
        if !runtime.drain(self.settings.drain_timeout).await {
            warn!(
                bot_id = %runtime.bot_id(),
                generation = runtime.generation(),
                "Runtime did not drain in time"
            );
        }
        runtime.release().await;
    }

    // ─── reload ──────────────────────────────────────────────────────────────

    async fn reload(self: &Arc<Self>, id: &str) -> LifecycleResult<String> {
        let existing = self.get(id);
        let definition = match self.source.load(id) {
            Ok(Some(def)) => Arc::new(def),
            Ok(None) => {
                let Some(bot) = existing else {
                    return Err(LifecycleError::not_found(id, Phase::Reload));
                };
                bot.cancel.lock().cancel();
                let _op = bot.op.lock().await;
                self.stop_locked(&bot, Phase::Reload).await?;
                self.bots.remove_if(id, |_, current| Arc::ptr_eq(current, &bot));
                info!(bot_id = %id, "Definition removed, bot unmanaged");
                return Ok(format!("bot '{id}' removed"));
            }
            Err(e) => {
                let e = LifecycleError::configuration(id, Phase::Reload, e);
                if let Some(bot) = &existing {
                    bot.record.write().last_error = Some(e.clone());
                }
                return Err(e);
            }
        };

        let Some(bot) = existing else {
            let bot = self.insert(Arc::clone(&definition));
            if !definition.enabled {
                return Ok(format!("bot '{id}' added (disabled)"));
            }
            let _op = bot.op.lock().await;
            return self.start_locked(&bot, Phase::Reload).await;
        };

        let _op = bot.op.lock().await;
        let previous = bot.definition();
        match bot.state() {
            BotState::Stopped => {
                bot.set_definition(definition);
                Ok(format!("bot '{id}' definition updated (stopped)"))
            }
            BotState::Failed => {
                bot.set_definition(Arc::clone(&definition));
                if definition.enabled {
                    self.start_locked(&bot, Phase::Reload).await
                } else {
                    self.stop_locked(&bot, Phase::Reload).await
                }
            }
            BotState::Running if !definition.enabled => {
                self.stop_locked(&bot, Phase::Reload).await?;
                bot.set_definition(definition);
                Ok(format!("bot '{id}' disabled and stopped"))
            }
            BotState::Running if definition.requires_reconnect(&previous) => {
                info!(bot_id = %id, "Connection settings changed, restarting");
                self.stop_locked(&bot, Phase::Reload).await?;
                bot.set_definition(definition);
                self.start_locked(&bot, Phase::Reload).await
            }
            BotState::Running => self.swap(&bot, definition).await,
            other => Err(LifecycleError::IllegalTransition {
                bot_id: id.to_string(),
                phase: Phase::Reload,
                from: other,
                to: BotState::Reloading,
            }),
        }
    }

    /// Builds a new runtime alongside the live one and swaps it in. On
    /// failure the live runtime keeps serving.
    async fn swap(&self, bot: &ManagedBot, definition: Arc<BotDefinition>) -> LifecycleResult<String> {
        let id = bot.id.as_str();
        bot.transition(BotState::Reloading, Phase::Reload)?;

        match self.builder.build(Arc::clone(&definition), &bot.token()).await {
            Ok(runtime) => {
                let runtime = Arc::new(runtime);
                let generation = runtime.generation();
                let old = bot.live.write().replace(Arc::clone(&runtime));
                bot.set_definition(definition);
                runtime.notify_started().await;
                bot.transition(BotState::Running, Phase::Reload)?;
                bot.record.write().last_error = None;

                if let Some(old) = old {
                    debug!(bot_id = %id, generation = old.generation(), "Retiring superseded runtime");
                    old.notify_stopping().await;
                    self.retire(old).await;
                }
                Ok(format!("bot '{id}' reloaded (generation {generation})"))
            }
            Err(e) => {
                let e = LifecycleError::from_build(id, Phase::Reload, e);
                bot.transition(BotState::Running, Phase::Reload)?;
                bot.record.write().last_error = Some(e.clone());
                Err(e)
            }
        }
    }
}

// =============================================================================
// Supervisor bridge
// =============================================================================

/// Hands `event` to `runtime`, the live runtime as last read. A reload may
/// have swapped in a new one and closed `runtime` since, in which case the
/// event goes to the replacement.
fn deliver(bot: &ManagedBot, runtime: Option<Arc<Runtime>>, event: InboundEvent) {
    let Some(runtime) = runtime else {
        debug!(bot_id = %bot.id, "No live runtime, dropping event");
        return;
    };
    let Err(event) = runtime.try_dispatch(event) else {
        return;
    };
    match bot.live() {
        Some(current) if !Arc::ptr_eq(&current, &runtime) => {
            if current.try_dispatch(event).is_err() {
                warn!(bot_id = %bot.id, "Replacement runtime refused event, dropping");
            }
        }
        _ => debug!(bot_id = %bot.id, "Runtime not accepting events, dropping"),
    }
}

struct BotLifecycle {
    inner: Weak<Inner>,
    bot: Arc<ManagedBot>,
}

#[async_trait]
impl Lifecycle for BotLifecycle {
    fn bot_id(&self) -> &str {
        &self.bot.id
    }

    fn dispatch(&self, event: InboundEvent) {
        deliver(&self.bot, self.bot.live(), event);
    }

    async fn fault(&self, error: LifecycleError, retry_in: Option<Duration>) {
        let _op = self.bot.op.lock().await;
        self.bot.mark_failed(error);
        if retry_in.is_none() {
            self.bot.record.write().restart_exhausted = true;
            error!(bot_id = %self.bot.id, "Restart budget exhausted, bot parked in failed state");
        }
    }

    async fn relaunch(&self) -> Result<EventStream, LifecycleError> {
        let cancelled = || LifecycleError::Cancelled {
            bot_id: self.bot.id.clone(),
            phase: Phase::Runtime,
        };
        let inner = self.inner.upgrade().ok_or_else(cancelled)?;
        let _op = self.bot.op.lock().await;
        if self.bot.state() != BotState::Failed {
            return Err(cancelled());
        }

        inner.release_live(&self.bot).await;
        let token = self.bot.token();
        self.bot.transition(BotState::Starting, Phase::Runtime)?;

        match inner
            .launch(&self.bot, self.bot.definition(), &token, Phase::Runtime)
            .await
        {
            Ok((runtime, stream)) => {
                *self.bot.live.write() = Some(runtime);
                self.bot.transition(BotState::Running, Phase::Runtime)?;
                let mut record = self.bot.record.write();
                record.restarts += 1;
                record.last_error = None;
                Ok(stream)
            }
            Err(e) => {
                self.bot.mark_failed(e.clone());
                Err(e)
            }
        }
    }
}
