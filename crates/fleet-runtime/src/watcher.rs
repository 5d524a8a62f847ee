//! Change watcher: turns file system churn into reload requests.
//!
//! ```text
//! notify ──▶ classify(path) ──▶ ReloadTarget ──▶ coalescing window ──▶ spawned reload
//! ```
//!
//! Raw events go through `notify-debouncer-full` first, then each path is
//! classified:
//!
//! | Path | Target |
//! |------|--------|
//! | `<definitions>/<id>.yaml` | [`ReloadTarget::Bot`] |
//! | `<definitions>/_*.yaml` (shared fragment) | [`ReloadTarget::All`] |
//! | `<plugins>/<name>[.*\|/...]` | [`ReloadTarget::Plugin`] |
//! | hidden files, editor swap files | ignored |
//!
//! Targets arriving within one debounce window are merged; `All` subsumes
//! everything else. The loop only collects and spawns, so a slow build never
//! delays the detection of the next change.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use notify_debouncer_full::notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, Debouncer, RecommendedCache, new_debouncer};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::{FsDefinitionSource, WatcherConfig, is_ignored_file, is_shared_fragment};
use crate::error::{OpResult, WatcherError};
use crate::orchestrator::Orchestrator;

/// Debounce applied by the notify backend before events reach the loop.
const FS_DEBOUNCE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReloadTarget {
    All,
    Bot(String),
    Plugin(String),
}

// =============================================================================
// WatchLayout
// =============================================================================

/// The watched directories and how paths inside them map to targets.
#[derive(Debug, Clone)]
pub struct WatchLayout {
    definitions: FsDefinitionSource,
    plugins: Option<PathBuf>,
}

impl WatchLayout {
    pub fn new(definitions: impl AsRef<Path>, plugins: Option<&Path>) -> Self {
        Self {
            definitions: FsDefinitionSource::new(absolute(definitions.as_ref())),
            plugins: plugins.map(absolute),
        }
    }

    pub fn definitions_dir(&self) -> &Path {
        self.definitions.dir()
    }

    pub fn plugins_dir(&self) -> Option<&Path> {
        self.plugins.as_deref()
    }

    pub fn classify(&self, path: &Path) -> Option<ReloadTarget> {
        if is_ignored_file(path) {
            return None;
        }

        if let Some(plugins) = &self.plugins
            && let Ok(relative) = path.strip_prefix(plugins)
        {
            let first = Path::new(relative.components().next()?.as_os_str());
            return first
                .file_stem()
                .and_then(|s| s.to_str())
                .map(|name| ReloadTarget::Plugin(name.to_string()));
        }

        if path.parent() == Some(self.definitions.dir()) {
            if is_shared_fragment(path) {
                return Some(ReloadTarget::All);
            }
            return self.definitions.bot_id_for(path).map(ReloadTarget::Bot);
        }
        None
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| match std::env::current_dir() {
        Ok(cwd) if path.is_relative() => cwd.join(path),
        _ => path.to_path_buf(),
    })
}

// =============================================================================
// ChangeWatcher
// =============================================================================

#[derive(Debug, Clone)]
pub struct WatcherSettings {
    /// Coalescing window.
    pub debounce: Duration,
    pub retry_delay: Duration,
    /// Re-reads of an unreadable definition before giving up on that change.
    pub max_retries: u32,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self::from(&WatcherConfig::default())
    }
}

impl From<&WatcherConfig> for WatcherSettings {
    fn from(config: &WatcherConfig) -> Self {
        Self {
            debounce: Duration::from_millis(config.debounce_ms),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            max_retries: config.max_retries,
        }
    }
}

type Reports = Arc<Mutex<BTreeMap<String, OpResult>>>;

#[derive(Clone)]
pub struct ChangeWatcher {
    orchestrator: Orchestrator,
    layout: WatchLayout,
    settings: WatcherSettings,
    reports: Reports,
}

impl ChangeWatcher {
    pub fn new(orchestrator: Orchestrator, layout: WatchLayout, settings: WatcherSettings) -> Self {
        Self {
            orchestrator,
            layout,
            settings,
            reports: Reports::default(),
        }
    }

    /// Starts the loop and watches the layout's directories.
    pub fn watch(self) -> Result<WatcherHandle, WatcherError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let fs = FsWatch::start(&self.layout, tx.clone())?;
        Ok(self.run_with(tx, rx, Some(fs)))
    }

    /// Starts the loop only; targets arrive through [`WatcherHandle::notify`].
    pub fn spawn(self) -> WatcherHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        self.run_with(tx, rx, None)
    }

    fn run_with(
        self,
        tx: mpsc::UnboundedSender<ReloadTarget>,
        rx: mpsc::UnboundedReceiver<ReloadTarget>,
        fs: Option<FsWatch>,
    ) -> WatcherHandle {
        let cancel = CancellationToken::new();
        let reports = Arc::clone(&self.reports);
        let task = tokio::spawn(
            self.detect(rx, cancel.clone())
                .instrument(info_span!("watcher")),
        );
        WatcherHandle {
            tx,
            cancel,
            task,
            reports,
            _fs: fs,
        }
    }

    async fn detect(self, mut rx: mpsc::UnboundedReceiver<ReloadTarget>, cancel: CancellationToken) {
        let tracker = TaskTracker::new();
        let mut pending = BTreeSet::new();
        let window = tokio::time::sleep(self.settings.debounce);
        tokio::pin!(window);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                target = rx.recv() => {
                    let Some(target) = target else { break };
                    debug!(?target, "Change detected");
                    pending.insert(target);
                    window.as_mut().reset(tokio::time::Instant::now() + self.settings.debounce);
                }
                _ = &mut window, if !pending.is_empty() => {
                    let batch = std::mem::take(&mut pending);
                    tracker.spawn(self.clone().apply(batch).in_current_span());
                }
            }
        }

        tracker.close();
        tracker.wait().await;
        debug!("Watcher stopped");
    }

    async fn apply(self, batch: BTreeSet<ReloadTarget>) {
        if batch.contains(&ReloadTarget::All) {
            info!("Shared definition changed, reloading all bots");
            let results = self.orchestrator.reload_all().await;
            self.reports.lock().extend(results);
            return;
        }

        join_all(batch.into_iter().map(|target| {
            let this = self.clone();
            async move {
                match target {
                    ReloadTarget::Bot(id) => this.reload_bot(id).await,
                    ReloadTarget::Plugin(name) => {
                        info!(plugin = %name, "Plugin source changed");
                        let results = this.orchestrator.reload_plugin(&name).await;
                        this.reports.lock().extend(results);
                    }
                    ReloadTarget::All => {}
                }
            }
        }))
        .await;
    }

    /// Reloads `id` once its definition reads cleanly.
    async fn reload_bot(&self, id: String) {
        let source = self.orchestrator.source();
        let mut attempts = 0;
        loop {
            attempts += 1;
            match source.load(&id) {
                Ok(_) => break,
                Err(e) if attempts <= self.settings.max_retries => {
                    debug!(bot_id = %id, attempt = attempts, error = %e, "Definition unreadable, retrying");
                    tokio::time::sleep(self.settings.retry_delay).await;
                }
                Err(e) => {
                    let err = WatcherError::Persistent {
                        bot_id: id.clone(),
                        attempts,
                        message: e.to_string(),
                    };
                    error!(bot_id = %id, error = %err, "Not reloading");
                    self.reports.lock().insert(id, OpResult::watcher(&err));
                    return;
                }
            }
        }

        let result = self.orchestrator.reload(&id).await;
        self.reports.lock().insert(id, result);
    }
}

/// Handle to a running watcher. Dropping it stops file system watching.
pub struct WatcherHandle {
    tx: mpsc::UnboundedSender<ReloadTarget>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    reports: Reports,
    _fs: Option<FsWatch>,
}

impl WatcherHandle {
    /// Queues a target as if a change had been detected.
    pub fn notify(&self, target: ReloadTarget) -> bool {
        self.tx.send(target).is_ok()
    }

    /// The latest outcome per bot id.
    pub fn reports(&self) -> BTreeMap<String, OpResult> {
        self.reports.lock().clone()
    }

    /// Stops detecting and waits for reloads already spawned.
    pub async fn stop(self) {
        drop(self._fs);
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Watcher task ended abnormally");
        }
    }
}

// =============================================================================
// File system backend
// =============================================================================

struct FsWatch {
    _debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
}

impl FsWatch {
    fn start(layout: &WatchLayout, tx: mpsc::UnboundedSender<ReloadTarget>) -> Result<Self, WatcherError> {
        let classifier = layout.clone();
        let mut debouncer = new_debouncer(FS_DEBOUNCE, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    for event in events {
                        if !matches!(
                            event.kind,
                            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                        ) {
                            continue;
                        }
                        for target in event.paths.iter().filter_map(|p| classifier.classify(p)) {
                            let _ = tx.send(target);
                        }
                    }
                }
                Err(errors) => {
                    for e in errors {
                        warn!(error = %e, "File watcher error");
                    }
                }
            }
        })?;

        let dirs = std::iter::once(layout.definitions_dir()).chain(layout.plugins_dir());
        for dir in dirs {
            if !dir.exists() {
                warn!(dir = %dir.display(), "Watched directory does not exist");
                continue;
            }
            debouncer
                .watch(dir, RecursiveMode::Recursive)
                .map_err(|source| WatcherError::Watch {
                    path: dir.to_path_buf(),
                    source,
                })?;
            info!(dir = %dir.display(), "Watching directory");
        }

        Ok(Self {
            _debouncer: debouncer,
        })
    }
}
