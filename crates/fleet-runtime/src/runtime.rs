//! The process-level runtime: configuration, logging, orchestrator and
//! watcher wired together.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use fleet_runtime::FleetRuntime;
//!
//! let runtime = FleetRuntime::builder(catalog, client)
//!     .config_file("deploy/fleet.yaml")
//!     .profile("production")
//!     .build()?;
//!
//! // Starts every enabled bot, watches for changes, stops on Ctrl+C/SIGTERM.
//! runtime.run().await?;
//! ```
//!
//! On Unix, `SIGHUP` reloads every bot.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt, stream};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fleet_core::{BoxedClient, SessionProvider};
use fleet_framework::{PluginCatalog, RateLimiter, RuntimeBuilder};

use crate::config::{ConfigLoader, DefinitionSource, FleetConfig, FsDefinitionSource};
use crate::error::{ConfigResult, OpResult, RuntimeError, RuntimeResult};
use crate::logging::{self, LoggingError};
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::watcher::{ChangeWatcher, WatchLayout, WatcherHandle, WatcherSettings};

pub struct FleetRuntime {
    config: FleetConfig,
    orchestrator: Orchestrator,
}

impl FleetRuntime {
    pub fn builder(catalog: PluginCatalog, client: BoxedClient) -> FleetRuntimeBuilder {
        FleetRuntimeBuilder::new(catalog, client)
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Runs until Ctrl+C or `SIGTERM`.
    pub async fn run(&self) -> RuntimeResult<()> {
        self.run_until(wait_for_shutdown()).await
    }

    /// Runs until `shutdown` completes, then stops every bot.
    pub async fn run_until<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        let results = self.orchestrator.start_all().await;
        log_failures("start", &results);
        info!(bots = results.len(), "Fleet runtime is now running");

        let watcher = match self.start_watcher() {
            Ok(watcher) => watcher,
            Err(e) => {
                self.orchestrator.shutdown().await;
                return Err(e);
            }
        };
        let background = CancellationToken::new();
        let sweeper = self.spawn_sweeper(background.clone());

        let served = self.serve(shutdown).await;

        background.cancel();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
        if let Some(watcher) = watcher {
            watcher.stop().await;
        }
        self.orchestrator.shutdown().await;
        info!("Fleet runtime stopped");
        served
    }

    #[cfg(unix)]
    async fn serve<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        use signal::unix::{SignalKind, signal as unix_signal};

        let hangup = unix_signal(SignalKind::hangup()).map_err(RuntimeError::Signal)?;
        let reloads = stream::unfold(hangup, |mut hangup| async move {
            hangup.recv().await.map(|()| {
                info!("Received SIGHUP, reloading all bots");
                ((), hangup)
            })
        });
        self.serve_reloads(shutdown, reloads).await;
        Ok(())
    }

    #[cfg(not(unix))]
    async fn serve<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        self.serve_reloads(shutdown, stream::pending()).await;
        Ok(())
    }

    /// Reloads every bot on each item of `reloads` until `shutdown`
    /// completes. A reload in progress never holds up shutdown.
    async fn serve_reloads<F, S>(&self, shutdown: F, reloads: S)
    where
        F: Future<Output = ()>,
        S: Stream<Item = ()>,
    {
        tokio::pin!(shutdown);
        tokio::pin!(reloads);
        loop {
            tokio::select! {
                _ = &mut shutdown => return,
                next = reloads.next() => {
                    if next.is_none() {
                        (&mut shutdown).await;
                        return;
                    }
                    let orchestrator = self.orchestrator.clone();
                    let reload = tokio::spawn(async move { orchestrator.reload_all().await });
                    tokio::select! {
                        _ = &mut shutdown => {
                            info!("Shutdown requested while reloading");
                            return;
                        }
                        joined = reload => match joined {
                            Ok(results) => log_failures("reload", &results),
                            Err(e) => error!(error = %e, "Reload task failed"),
                        },
                    }
                }
            }
        }
    }

    fn start_watcher(&self) -> RuntimeResult<Option<WatcherHandle>> {
        let config = &self.config.watcher;
        if !config.enabled {
            debug!("Change watcher disabled");
            return Ok(None);
        }
        let layout = WatchLayout::new(
            &self.config.paths.definitions,
            self.config.paths.plugins.as_deref(),
        );
        let watcher = ChangeWatcher::new(self.orchestrator.clone(), layout, WatcherSettings::from(config));
        Ok(Some(watcher.watch()?))
    }

    fn spawn_sweeper(&self, cancel: CancellationToken) -> Option<tokio::task::JoinHandle<()>> {
        let config = &self.config.rate_limit;
        if config.sweep_interval_secs == 0 {
            return None;
        }
        let limiter: Arc<RateLimiter> = Arc::clone(self.orchestrator.builder().rate_limiter());
        let period = Duration::from_secs(config.sweep_interval_secs);
        let max_idle = Duration::from_secs(config.max_idle_secs);

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let evicted = limiter.sweep_idle(max_idle);
                        if evicted > 0 {
                            debug!(evicted, remaining = limiter.len(), "Swept idle rate-limit buckets");
                        }
                    }
                }
            }
        }))
    }
}

fn log_failures(operation: &str, results: &std::collections::BTreeMap<String, OpResult>) {
    for (id, result) in results.iter().filter(|(_, r)| !r.success) {
        error!(bot_id = %id, operation, message = %result.message, "Operation failed");
    }
}

/// Waits for Ctrl+C or, on Unix, `SIGTERM`.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use signal::unix::{SignalKind, signal as unix_signal};

        match unix_signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    result = signal::ctrl_c() => {
                        if let Err(e) = result {
                            error!(error = %e, "Failed to listen for Ctrl+C");
                        }
                        info!("Received Ctrl+C, shutting down");
                    }
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "Failed to register SIGTERM handler"),
        }
    }

    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(e) => error!(error = %e, "Failed to listen for Ctrl+C, shutting down"),
    }
}

// =============================================================================
// FleetRuntimeBuilder
// =============================================================================

/// Builder for a [`FleetRuntime`].
///
/// Configuration is searched for in the current directory unless
/// [`config_file`](Self::config_file) or [`search_path`](Self::search_path)
/// says otherwise. Definitions come from `paths.definitions` unless a source
/// is given.
pub struct FleetRuntimeBuilder {
    config_loader: ConfigLoader,
    catalog: PluginCatalog,
    client: BoxedClient,
    sessions: Option<Arc<dyn SessionProvider>>,
    source: Option<Arc<dyn DefinitionSource>>,
    searched: bool,
}

impl FleetRuntimeBuilder {
    pub fn new(catalog: PluginCatalog, client: BoxedClient) -> Self {
        Self {
            config_loader: ConfigLoader::new(),
            catalog,
            client,
            sessions: None,
            source: None,
            searched: false,
        }
    }

    pub fn config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.file(path);
        self
    }

    /// Sets the configuration profile (e.g. "development", "production").
    pub fn profile(mut self, profile: impl AsRef<str>) -> Self {
        self.config_loader = self.config_loader.profile(profile);
        self
    }

    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.search_path(path);
        self.searched = true;
        self
    }

    /// Reads `FLEET_*` environment variables (the default).
    pub fn with_env(mut self) -> Self {
        self.config_loader = self.config_loader.with_env();
        self
    }

    pub fn without_env(mut self) -> Self {
        self.config_loader = self.config_loader.without_env();
        self
    }

    pub fn merge(mut self, config: FleetConfig) -> Self {
        self.config_loader = self.config_loader.merge(config);
        self
    }

    pub fn with_sessions(mut self, sessions: Arc<dyn SessionProvider>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_source(mut self, source: Arc<dyn DefinitionSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Loads configuration, installs logging and assembles the orchestrator.
    pub fn build(self) -> ConfigResult<FleetRuntime> {
        let loader = if self.searched {
            self.config_loader
        } else {
            self.config_loader.with_current_dir()
        };
        let config = loader.load()?;

        match logging::init_from_config(&config.logging) {
            Ok(()) => {}
            Err(LoggingError::AlreadyInstalled(_)) => debug!("Global subscriber already installed"),
            Err(e) => eprintln!("Warning: failed to initialize logging ({e})"),
        }

        let mut catalog = self.catalog;
        if !config.plugins.defaults.is_empty() {
            catalog.set_defaults(config.plugins.defaults.iter().cloned());
        }

        let mut builder = RuntimeBuilder::new(Arc::new(catalog), self.client);
        if let Some(sessions) = self.sessions {
            builder = builder.with_sessions(sessions);
        }

        let source: Arc<dyn DefinitionSource> = match self.source {
            Some(source) => source,
            None => Arc::new(FsDefinitionSource::new(&config.paths.definitions)),
        };

        info!(
            log_level = %config.logging.level,
            definitions = %config.paths.definitions.display(),
            watcher = config.watcher.enabled,
            "Runtime initialized from configuration"
        );

        let orchestrator = Orchestrator::new(builder, source, OrchestratorSettings::from(&config));
        Ok(FleetRuntime {
            config,
            orchestrator,
        })
    }
}
