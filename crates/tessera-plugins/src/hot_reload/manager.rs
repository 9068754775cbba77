//! Hot-reload manager
//!
//! Owns the plugin modules of a host by name. The host drives it from its
//! main loop: [`PluginManager::step_all`] ticks running modules and
//! [`PluginManager::poll`] turns file changes into loads, reloads and
//! unloads. Listeners follow along through [`PluginManager::subscribe`].

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use error_stack::Report;
use tracing::{debug, error, info, warn};

use tessera_kernel::Context;

use super::loader::{ModuleImage, PluginLoadError, PluginLoader, StaticImage};
use super::module::{ModuleState, PluginModule};
use super::watcher::{PluginWatcher, WatchConfig, WatchEventKind};
use crate::error::{PluginError, PluginResult};
use crate::host::PluginEntryFn;

/// When a changed plugin file is reloaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadStrategy {
    /// On the poll that sees the change
    Immediate,
    /// After the given delay, restarted by further changes
    Debounced(Duration),
    /// Only through [`PluginManager::reload`]
    Manual,
}

impl Default for ReloadStrategy {
    fn default() -> Self {
        Self::Debounced(Duration::from_secs(1))
    }
}

/// Hot-reload configuration
#[derive(Debug, Clone)]
pub struct HotReloadConfig {
    pub strategy: ReloadStrategy,
    /// Reload the previous image when the new one fails to load
    pub auto_rollback: bool,
    /// Consecutive failed reloads before a module stops being retried
    pub max_reload_attempts: u32,
    pub watch: WatchConfig,
    /// Shadow copy directory; a private temporary directory when unset
    pub shadow_dir: Option<PathBuf>,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            strategy: ReloadStrategy::default(),
            auto_rollback: true,
            max_reload_attempts: 3,
            watch: WatchConfig::default(),
            shadow_dir: None,
        }
    }
}

impl HotReloadConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(mut self, strategy: ReloadStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_auto_rollback(mut self, enabled: bool) -> Self {
        self.auto_rollback = enabled;
        self
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_reload_attempts = max;
        self
    }

    pub fn with_watch_config(mut self, watch: WatchConfig) -> Self {
        self.watch = watch;
        self
    }

    pub fn with_shadow_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shadow_dir = Some(dir.into());
        self
    }
}

/// Notification about module lifecycle changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadEvent {
    PluginDiscovered { path: PathBuf },
    ModuleLoaded { module: String, generation: u64 },
    ReloadStarted { module: String },
    ReloadCompleted { module: String, generation: u64, duration: Duration },
    ReloadFailed { module: String, error: String, attempt: u32 },
    RollbackTriggered { module: String, reason: String },
    ModuleUnloaded { module: String },
    PluginRemoved { module: String, path: PathBuf },
}

/// Reload error types
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ReloadError {
    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Module already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("Load error: {0}")]
    Load(#[from] PluginLoadError),

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("{module}: giving up after {attempts} failed reloads")]
    MaxAttemptsExceeded { module: String, attempts: u32 },

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),
}

pub type ReloadResult<T> = Result<T, ReloadError>;

/// Result alias with context-carrying reports
pub type ReloadReport<T> = Result<T, Report<ReloadError>>;

/// Lift a [`ReloadResult`] into a [`ReloadReport`]
pub trait IntoReloadReport<T> {
    fn into_report(self) -> ReloadReport<T>;
}

impl<T> IntoReloadReport<T> for ReloadResult<T> {
    #[inline]
    fn into_report(self) -> ReloadReport<T> {
        self.map_err(Report::new)
    }
}

fn report(error: impl Into<ReloadError>, context: String) -> Report<ReloadError> {
    Report::new(error.into()).attach(context)
}

struct ModuleEntry {
    module: PluginModule,
    path: Option<PathBuf>,
    failed_attempts: u32,
    last_reload: Option<Instant>,
}

/// Owner of every plugin module in a host
pub struct PluginManager {
    config: HotReloadConfig,
    context: Arc<Context>,
    loader: Arc<PluginLoader>,
    watcher: PluginWatcher,
    modules: BTreeMap<String, ModuleEntry>,
    by_path: HashMap<PathBuf, String>,
    scheduled: HashMap<String, Instant>,
    listeners: Vec<Sender<ReloadEvent>>,
}

impl PluginManager {
    pub fn new(context: Arc<Context>, config: HotReloadConfig) -> ReloadResult<Self> {
        let loader = match &config.shadow_dir {
            Some(dir) => PluginLoader::with_shadow_dir(dir)?,
            None => PluginLoader::new()?,
        };
        Ok(Self {
            watcher: PluginWatcher::new(config.watch.clone()),
            config,
            context,
            loader: Arc::new(loader),
            modules: BTreeMap::new(),
            by_path: HashMap::new(),
            scheduled: HashMap::new(),
            listeners: Vec::new(),
        })
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn config(&self) -> &HotReloadConfig {
        &self.config
    }

    pub fn loader(&self) -> &Arc<PluginLoader> {
        &self.loader
    }

    /// Receive every [`ReloadEvent`] emitted from now on
    pub fn subscribe(&mut self) -> Receiver<ReloadEvent> {
        let (tx, rx) = unbounded();
        self.listeners.push(tx);
        rx
    }

    fn emit(&mut self, event: ReloadEvent) {
        debug!(event = ?event, "Reload event");
        self.listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn names(&self) -> Vec<String> {
        self.modules.keys().cloned().collect()
    }

    pub fn module(&self, name: &str) -> Option<&PluginModule> {
        self.modules.get(name).map(|entry| &entry.module)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Load a plugin library; returns the module name
    pub fn load_path(&mut self, path: impl AsRef<Path>) -> ReloadReport<String> {
        let path = path.as_ref();
        let name = PluginLoader::module_name(path);
        if self.modules.contains_key(&name) {
            return Err(report(
                ReloadError::AlreadyLoaded(name),
                format!("loading {}", path.display()),
            ));
        }

        // SAFETY: plugin paths come from the host configuration and are
        // trusted to hold libraries built against this crate.
        let image = unsafe { self.loader.load_library(path) }
            .map_err(|e| report(e, format!("loading {}", path.display())))?;
        self.insert(&name, image, Some(path.to_path_buf()))?;
        Ok(name)
    }

    /// Load a module whose entry point is linked into the host
    pub fn load_static(&mut self, name: &str, entry: PluginEntryFn) -> ReloadReport<()> {
        if self.modules.contains_key(name) {
            return Err(report(
                ReloadError::AlreadyLoaded(name.to_string()),
                format!("loading static module {name}"),
            ));
        }
        self.insert(name, Arc::new(StaticImage::new(name, entry)), None)
    }

    fn insert(&mut self, name: &str, image: Arc<dyn ModuleImage>, path: Option<PathBuf>) -> ReloadReport<()> {
        let mut module = PluginModule::new(name, self.context.clone(), self.loader.clone());
        module
            .load(image)
            .map_err(|e| report(e, format!("loading module {name}")))?;

        let generation = module.generation().map(|g| g.id()).unwrap_or_default();
        if let Some(path) = &path {
            self.by_path.insert(path.clone(), name.to_string());
        }
        self.modules.insert(
            name.to_string(),
            ModuleEntry {
                module,
                path,
                failed_attempts: 0,
                last_reload: None,
            },
        );
        self.emit(ReloadEvent::ModuleLoaded {
            module: name.to_string(),
            generation,
        });
        Ok(())
    }

    /// Load every plugin library in a directory; returns the loaded names
    ///
    /// Libraries that fail to load are logged and skipped.
    pub fn load_directory(&mut self, dir: impl AsRef<Path>) -> ReloadReport<Vec<String>> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir)
            .map_err(|e| report(PluginLoadError::from(e), format!("reading {}", dir.display())))?;

        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && self.config.watch.should_watch(path))
            .collect();
        paths.sort();

        let mut loaded = Vec::new();
        for path in paths {
            match self.load_path(&path) {
                Ok(name) => loaded.push(name),
                Err(e) => warn!(path = ?path, error = ?e, "Skipping plugin"),
            }
        }
        info!(dir = ?dir, count = loaded.len(), "Loaded plugin directory");
        Ok(loaded)
    }

    /// Unload and forget a module
    pub fn unload(&mut self, name: &str) -> ReloadReport<()> {
        let mut entry = self.modules.remove(name).ok_or_else(|| {
            report(ReloadError::ModuleNotFound(name.to_string()), format!("unloading {name}"))
        })?;
        if let Some(path) = &entry.path {
            self.by_path.remove(path);
        }
        self.scheduled.remove(name);

        let result = entry.module.unload();
        self.loader.collect_garbage();
        self.emit(ReloadEvent::ModuleUnloaded {
            module: name.to_string(),
        });
        result
            .map(drop)
            .map_err(|e| report(e, format!("unloading {name}")))
    }

    // ========================================================================
    // Running
    // ========================================================================

    pub fn start(&mut self, name: &str) -> ReloadReport<()> {
        self.entry_mut(name)?
            .module
            .start()
            .map_err(|e| report(e, format!("starting {name}")))
    }

    pub fn stop(&mut self, name: &str) -> ReloadReport<()> {
        self.entry_mut(name)?
            .module
            .stop()
            .map_err(|e| report(e, format!("stopping {name}")))
    }

    /// Start every module; failures are logged
    pub fn start_all(&mut self) -> usize {
        let mut started = 0;
        for (name, entry) in &mut self.modules {
            match entry.module.start() {
                Ok(()) => started += 1,
                Err(e) => warn!(module = %name, error = %e, "Failed to start module"),
            }
        }
        started
    }

    pub fn stop_all(&mut self) {
        for (name, entry) in &mut self.modules {
            if let Err(e) = entry.module.stop() {
                warn!(module = %name, error = %e, "Failed to stop module");
            }
        }
    }

    /// Tick every running module; returns how many were stepped
    pub fn step_all(&mut self, time_step: Duration) -> usize {
        let mut stepped = 0;
        for (name, entry) in &mut self.modules {
            if entry.module.state() != ModuleState::Running {
                continue;
            }
            match entry.module.step(time_step) {
                Ok(()) => stepped += 1,
                Err(e) => warn!(module = %name, error = %e, "Module step failed"),
            }
        }
        stepped
    }

    // ========================================================================
    // Hot reload
    // ========================================================================

    /// Watch a plugin directory for changes
    pub fn watch(&mut self, dir: impl AsRef<Path>) -> ReloadReport<()> {
        let dir = dir.as_ref();
        self.watcher
            .watch(dir)
            .and_then(|()| self.watcher.start())
            .map_err(|e| report(e, format!("watching {}", dir.display())))
    }

    pub fn watcher(&self) -> &PluginWatcher {
        &self.watcher
    }

    /// Process file changes and due reloads; returns the number of reloads
    pub fn poll(&mut self) -> usize {
        self.poll_at(Instant::now())
    }

    pub(crate) fn poll_at(&mut self, now: Instant) -> usize {
        for event in self.watcher.poll_at(now) {
            self.handle_event(event.kind, &event.path, now);
        }
        let reloads = self.run_due(now);
        self.loader.collect_garbage();
        reloads
    }

    fn handle_event(&mut self, kind: WatchEventKind, path: &Path, now: Instant) {
        match kind {
            WatchEventKind::Created => self.on_created(path, now),
            WatchEventKind::Modified => self.on_modified(path, now),
            WatchEventKind::Removed => self.on_removed(path),
            WatchEventKind::Renamed { from } => {
                self.on_removed(&from);
                self.on_created(path, now);
            }
        }
    }

    fn run_due(&mut self, now: Instant) -> usize {
        let mut due: Vec<String> = self
            .scheduled
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(name, _)| name.clone())
            .collect();
        due.sort();

        let mut reloads = 0;
        for name in due {
            self.scheduled.remove(&name);
            match self.reload(&name) {
                Ok(true) => reloads += 1,
                Ok(false) => {}
                Err(e) => error!(module = %name, error = ?e, "Hot reload failed"),
            }
        }
        reloads
    }

    fn on_created(&mut self, path: &Path, now: Instant) {
        if self.by_path.contains_key(path) {
            // Replaced in place: treat as a modification.
            self.on_modified(path, now);
            return;
        }
        self.emit(ReloadEvent::PluginDiscovered {
            path: path.to_path_buf(),
        });
        match self.load_path(path) {
            Ok(name) => {
                if let Err(e) = self.start(&name) {
                    warn!(module = %name, error = ?e, "Discovered module failed to start");
                }
            }
            Err(e) => warn!(path = ?path, error = ?e, "Failed to load discovered plugin"),
        }
    }

    fn on_modified(&mut self, path: &Path, now: Instant) {
        let Some(name) = self.by_path.get(path).cloned() else {
            return;
        };
        match self.config.strategy {
            ReloadStrategy::Immediate => {
                self.scheduled.insert(name, now);
            }
            ReloadStrategy::Debounced(delay) => {
                self.scheduled.insert(name, now + delay);
            }
            ReloadStrategy::Manual => debug!(module = %name, "Change noted, manual reload mode"),
        }
    }

    fn on_removed(&mut self, path: &Path) {
        let Some(name) = self.by_path.get(path).cloned() else {
            return;
        };
        if let Err(e) = self.unload(&name) {
            warn!(module = %name, error = ?e, "Failed to unload removed plugin");
        }
        self.emit(ReloadEvent::PluginRemoved {
            module: name,
            path: path.to_path_buf(),
        });
    }

    /// Reload a module from its library file if the file changed
    ///
    /// The new image is mapped before the old generation is unloaded, so a
    /// file that fails to load leaves the running module untouched. Returns
    /// whether a reload happened.
    pub fn reload(&mut self, name: &str) -> ReloadReport<bool> {
        let max = self.config.max_reload_attempts;
        let entry = self.entry_mut(name)?;
        let failed_attempts = entry.failed_attempts;
        let current = entry.module.image().cloned();
        let Some(path) = entry.path.clone() else {
            return Ok(false);
        };
        if failed_attempts >= max {
            return Err(report(
                ReloadError::MaxAttemptsExceeded {
                    module: name.to_string(),
                    attempts: failed_attempts,
                },
                format!("reloading {}", path.display()),
            ));
        }

        let changed = match current {
            Some(image) => self
                .loader
                .has_changed(image.as_ref())
                .map_err(|e| report(e, format!("hashing {}", path.display())))?,
            None => true,
        };
        if !changed {
            debug!(module = %name, "Library unchanged, skipping reload");
            return Ok(false);
        }

        // SAFETY: same trust as the initial load of this path.
        let image = match unsafe { self.loader.load_library(&path) } {
            Ok(image) => image,
            Err(e) => {
                let attempt = self.record_failure(name);
                self.emit(ReloadEvent::ReloadFailed {
                    module: name.to_string(),
                    error: e.to_string(),
                    attempt,
                });
                return Err(report(e, format!("reloading {}", path.display())));
            }
        };
        self.reload_with(name, image).map(|()| true)
    }

    /// Replace a module's image with `image`
    ///
    /// On failure the previous image is loaded again as a new generation
    /// when auto-rollback is enabled; otherwise the module stays unloaded.
    pub fn reload_with(&mut self, name: &str, image: Arc<dyn ModuleImage>) -> ReloadReport<()> {
        let started = Instant::now();
        self.emit(ReloadEvent::ReloadStarted {
            module: name.to_string(),
        });

        let auto_rollback = self.config.auto_rollback;
        let entry = self.entry_mut(name)?;
        let previous_state = entry.module.state();
        let previous = match previous_state {
            ModuleState::Unloaded => None,
            _ => Some(
                entry
                    .module
                    .unload()
                    .map_err(|e| report(e, format!("unloading {name} for reload")))?,
            ),
        };

        let outcome = entry
            .module
            .load(image)
            .and_then(|()| restore_state(&mut entry.module, previous_state));

        match outcome {
            Ok(()) => {
                entry.failed_attempts = 0;
                entry.last_reload = Some(Instant::now());
                let generation = entry.module.generation().map(|g| g.id()).unwrap_or_default();
                let duration = started.elapsed();
                info!(module = %name, generation, ?duration, "Module reloaded");
                self.emit(ReloadEvent::ReloadCompleted {
                    module: name.to_string(),
                    generation,
                    duration,
                });
                Ok(())
            }
            Err(e) => {
                entry.failed_attempts += 1;
                let attempt = entry.failed_attempts;
                let message = e.to_string();
                error!(module = %name, attempt, error = %message, "Reload failed");

                let rollback = match previous {
                    Some(previous) if auto_rollback => {
                        if entry.module.state() != ModuleState::Unloaded {
                            if let Err(unload_error) = entry.module.unload() {
                                warn!(module = %name, error = %unload_error, "Failed to unload rejected image");
                            }
                        }
                        let restored = entry
                            .module
                            .load(previous)
                            .and_then(|()| restore_state(&mut entry.module, previous_state));
                        if let Err(rollback_error) = &restored {
                            error!(module = %name, error = %rollback_error, "Rollback failed");
                        }
                        true
                    }
                    _ => false,
                };

                self.emit(ReloadEvent::ReloadFailed {
                    module: name.to_string(),
                    error: message.clone(),
                    attempt,
                });
                if rollback {
                    self.emit(ReloadEvent::RollbackTriggered {
                        module: name.to_string(),
                        reason: message,
                    });
                }
                Err(report(e, format!("reloading {name} (attempt {attempt})")))
            }
        }
    }

    fn record_failure(&mut self, name: &str) -> u32 {
        match self.modules.get_mut(name) {
            Some(entry) => {
                entry.failed_attempts += 1;
                entry.failed_attempts
            }
            None => 0,
        }
    }

    fn entry_mut(&mut self, name: &str) -> ReloadReport<&mut ModuleEntry> {
        self.modules
            .get_mut(name)
            .ok_or_else(|| report(ReloadError::ModuleNotFound(name.to_string()), format!("looking up {name}")))
    }

    /// Close every module and stop watching
    pub fn shutdown(&mut self) {
        self.watcher.stop();
        self.scheduled.clear();
        let names: Vec<String> = self.modules.keys().rev().cloned().collect();
        for name in names {
            if let Some(mut entry) = self.modules.remove(&name) {
                if entry.module.state() != ModuleState::Unloaded {
                    if let Err(e) = entry.module.close() {
                        warn!(module = %name, error = %e, "Failed to close module");
                    }
                }
                self.emit(ReloadEvent::ModuleUnloaded { module: name });
            }
        }
        self.by_path.clear();
        self.loader.collect_garbage();
    }
}

/// Bring a freshly loaded module back to the state its predecessor was in
fn restore_state(module: &mut PluginModule, state: ModuleState) -> PluginResult<()> {
    match state {
        ModuleState::Running => module.start(),
        // Stopped is only reachable through a start.
        ModuleState::Stopped => module.start().and_then(|()| module.stop()),
        ModuleState::Loaded | ModuleState::Unloaded => Ok(()),
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("config", &self.config)
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .field("loader", &self.loader)
            .finish()
    }
}

impl Drop for PluginManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
