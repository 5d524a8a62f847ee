//! Test doubles for the orchestrator and watcher tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use fleet_core::{
    BotDefinition, ClientError, Credentials, DeliveryMode, EventStream, InboundEvent,
    MessagingClient, OutboundPayload, PluginSpec,
};
use fleet_framework::{
    BoxError, Plugin, PluginCatalog, PluginDescriptor, RuntimeBuilder, on_command, on_message,
};

use crate::config::DefinitionSource;
use crate::error::{ConfigError, ConfigResult};
use crate::orchestrator::{Orchestrator, OrchestratorSettings};

// ─── Client ──────────────────────────────────────────────────────────────────

type Feed = mpsc::UnboundedSender<Result<InboundEvent, ClientError>>;

/// A client whose event streams are fed by the test.
#[derive(Default)]
pub struct ScriptedClient {
    feeds: Mutex<HashMap<String, Feed>>,
    connects: Mutex<HashMap<String, usize>>,
    disconnects: Mutex<HashMap<String, usize>>,
    sent: Mutex<Vec<(String, OutboundPayload)>>,
    panic_on_connect: AtomicBool,
}

impl ScriptedClient {
    /// Makes `start_consuming` panic until turned off again.
    pub fn panic_on_connect(&self, enabled: bool) {
        self.panic_on_connect.store(enabled, Ordering::SeqCst);
    }

    pub fn push(&self, bot_id: &str, event: InboundEvent) {
        let feeds = self.feeds.lock();
        let feed = feeds.get(bot_id).expect("bot is not consuming");
        feed.unbounded_send(Ok(event)).expect("stream dropped");
    }

    /// Fails the bot's current stream.
    pub fn break_stream(&self, bot_id: &str) {
        if let Some(feed) = self.feeds.lock().get(bot_id) {
            let _ = feed.unbounded_send(Err(ClientError::Stream("connection reset".into())));
        }
    }

    pub fn connects(&self, bot_id: &str) -> usize {
        self.connects.lock().get(bot_id).copied().unwrap_or(0)
    }

    pub fn disconnects(&self, bot_id: &str) -> usize {
        self.disconnects.lock().get(bot_id).copied().unwrap_or(0)
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(_, p)| p.text.clone()).collect()
    }

    pub async fn wait_sent(&self, count: usize) {
        for _ in 0..500 {
            if self.sent.lock().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} sent messages, got {:?}", self.sent_texts());
    }
}

#[async_trait]
impl MessagingClient for ScriptedClient {
    async fn start_consuming(
        &self,
        bot_id: &str,
        _credentials: &Credentials,
        _mode: DeliveryMode,
    ) -> Result<EventStream, ClientError> {
        if self.panic_on_connect.load(Ordering::SeqCst) {
            panic!("client exploded");
        }
        let (tx, rx) = mpsc::unbounded();
        self.feeds.lock().insert(bot_id.to_string(), tx);
        *self.connects.lock().entry(bot_id.to_string()).or_default() += 1;
        Ok(rx.boxed())
    }

    async fn stop_consuming(&self, bot_id: &str) -> Result<(), ClientError> {
        self.feeds.lock().remove(bot_id);
        *self.disconnects.lock().entry(bot_id.to_string()).or_default() += 1;
        Ok(())
    }

    async fn send(&self, bot_id: &str, payload: OutboundPayload) -> Result<(), ClientError> {
        self.sent.lock().push((bot_id.to_string(), payload));
        Ok(())
    }
}

// ─── Definitions ─────────────────────────────────────────────────────────────

/// In-memory definitions. An `Err` entry behaves like a malformed file.
#[derive(Clone, Default)]
pub struct MemorySource {
    entries: Arc<RwLock<BTreeMap<String, Result<BotDefinition, String>>>>,
    loads: Arc<AtomicUsize>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, definition: BotDefinition) {
        self.entries.write().insert(definition.id.clone(), Ok(definition));
    }

    pub fn put_broken(&self, id: &str, message: &str) {
        self.entries.write().insert(id.to_string(), Err(message.to_string()));
    }

    pub fn remove(&self, id: &str) {
        self.entries.write().remove(id);
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl DefinitionSource for MemorySource {
    fn load(&self, bot_id: &str) -> ConfigResult<Option<BotDefinition>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        match self.entries.read().get(bot_id) {
            None => Ok(None),
            Some(Ok(def)) => Ok(Some(def.clone())),
            Some(Err(message)) => Err(ConfigError::Parse(message.clone())),
        }
    }

    fn list_ids(&self) -> ConfigResult<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}

pub fn definition(id: &str, plugins: &[&str]) -> BotDefinition {
    plugins
        .iter()
        .fold(BotDefinition::new(id, "token"), |def, p| def.with_plugin(PluginSpec::named(*p)))
}

// ─── Plugins ─────────────────────────────────────────────────────────────────

/// Counters shared with the test plugins of one catalog.
#[derive(Default)]
pub struct Probes {
    pub slow_active: AtomicUsize,
    pub slow_max: AtomicUsize,
    pub failing_attempts: AtomicUsize,
}

fn replying(name: &'static str) -> PluginDescriptor {
    PluginDescriptor::new(name, move |_ctx| {
        Ok(Plugin::builder(name)
            .matcher(on_command(name).handler(move |ctx| async move {
                ctx.reply(format!("{name} here")).await?;
                Ok::<_, BoxError>(())
            }))
            .build())
    })
}

/// `help`, `start` (needs `help`), the `x`/`y` cycle, `echo`, and plugins
/// that are slow, configurable-delay, always failing or panicking on load.
pub fn catalog() -> (PluginCatalog, Arc<Probes>) {
    let probes = Arc::new(Probes::default());
    let mut catalog = PluginCatalog::new();

    catalog
        .register(replying("help"))
        .register(replying("start").depends_on(["help"]))
        .register(replying("x").depends_on(["y"]))
        .register(replying("y").depends_on(["x"]));

    catalog.register(PluginDescriptor::new("echo", |_ctx| {
        Ok(Plugin::builder("echo")
            .matcher(on_message().handler(|ctx| async move {
                let text = ctx.text().unwrap_or_default().to_string();
                ctx.reply(format!("echo: {text}")).await?;
                Ok::<_, BoxError>(())
            }))
            .build())
    }));

    let slow = Arc::clone(&probes);
    catalog.register(PluginDescriptor::new("slow", move |_ctx| {
        let probes = Arc::clone(&slow);
        Ok(Plugin::builder("slow")
            .on_load(move |_ctx| {
                let probes = Arc::clone(&probes);
                async move {
                    let active = probes.slow_active.fetch_add(1, Ordering::SeqCst) + 1;
                    probes.slow_max.fetch_max(active, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    probes.slow_active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build())
    }));

    catalog.register(PluginDescriptor::new("delay", |_ctx| {
        Ok(Plugin::builder("delay")
            .on_load(|ctx| async move {
                let ms = ctx.raw_config().get("ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(())
            })
            .build())
    }));

    let failing = Arc::clone(&probes);
    catalog.register(PluginDescriptor::new("failing", move |_ctx| {
        let probes = Arc::clone(&failing);
        Ok(Plugin::builder("failing")
            .on_load(move |_ctx| {
                let probes = Arc::clone(&probes);
                async move {
                    probes.failing_attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), BoxError>("database unreachable".into())
                }
            })
            .build())
    }));

    catalog.register(PluginDescriptor::new("bomb", |_ctx| {
        Ok(Plugin::builder("bomb")
            .on_load(|_ctx| async {
                if true {
                    panic!("init exploded");
                }
                Ok::<(), BoxError>(())
            })
            .build())
    }));

    (catalog, probes)
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub client: Arc<ScriptedClient>,
    pub source: MemorySource,
    pub probes: Arc<Probes>,
}

pub fn harness(source: MemorySource, settings: OrchestratorSettings) -> Harness {
    let (catalog, probes) = catalog();
    let client = Arc::new(ScriptedClient::default());
    let builder = RuntimeBuilder::new(Arc::new(catalog), client.clone());
    let orchestrator = Orchestrator::new(builder, Arc::new(source.clone()), settings);
    Harness {
        orchestrator,
        client,
        source,
        probes,
    }
}
