//! File system watcher for plugin changes
//!
//! The notify backend pushes raw events into a channel from its own thread.
//! [`PluginWatcher::poll`] drains that channel on the caller's thread,
//! filters by [`WatchConfig`], and coalesces bursts: an event is reported
//! once its path has been quiet for the debounce interval.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use notify::{
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    event::{CreateKind, ModifyKind, RemoveKind, RenameMode},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

/// Watch event kinds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEventKind {
    Created,
    Modified,
    Removed,
    Renamed { from: PathBuf },
}

/// Change to a watched plugin file
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub path: PathBuf,
    pub timestamp: Instant,
}

impl WatchEvent {
    pub fn new(kind: WatchEventKind, path: PathBuf) -> Self {
        Self {
            kind,
            path,
            timestamp: Instant::now(),
        }
    }
}

/// Watch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Quiet period before a change is reported
    pub debounce: Duration,
    /// File extensions to watch
    pub extensions: Vec<String>,
    pub recursive: bool,
    /// Ignore patterns: `*suffix`, `prefix*` or an exact file name
    pub ignore_patterns: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            extensions: vec![std::env::consts::DLL_EXTENSION.to_string()],
            recursive: false,
            ignore_patterns: vec!["*.tmp".to_string(), "*.swp".to_string(), "*~".to_string()],
        }
    }
}

impl WatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_debounce(mut self, duration: Duration) -> Self {
        self.debounce = duration;
        self
    }

    pub fn with_extension(mut self, ext: &str) -> Self {
        self.extensions.push(ext.to_string());
        self
    }

    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn with_ignore(mut self, pattern: &str) -> Self {
        self.ignore_patterns.push(pattern.to_string());
        self
    }

    /// Check if a path should be watched
    pub fn should_watch(&self, path: &Path) -> bool {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if !self.extensions.is_empty() && !self.extensions.iter().any(|e| e == ext) {
            return false;
        }

        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        !self.ignore_patterns.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix('*') {
                file_name.ends_with(suffix)
            } else if let Some(prefix) = pattern.strip_suffix('*') {
                file_name.starts_with(prefix)
            } else {
                file_name == pattern
            }
        })
    }

    fn mode(&self) -> RecursiveMode {
        if self.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        }
    }
}

struct Pending {
    kind: WatchEventKind,
    last_seen: Instant,
}

/// Plugin file watcher
pub struct PluginWatcher {
    config: WatchConfig,
    watch_paths: Vec<PathBuf>,
    watcher: Option<RecommendedWatcher>,
    raw_tx: Sender<notify::Result<Event>>,
    raw_rx: Receiver<notify::Result<Event>>,
    pending: HashMap<PathBuf, Pending>,
    rename_from: Option<PathBuf>,
}

impl PluginWatcher {
    pub fn new(config: WatchConfig) -> Self {
        let (raw_tx, raw_rx) = unbounded();
        Self {
            config,
            watch_paths: Vec::new(),
            watcher: None,
            raw_tx,
            raw_rx,
            pending: HashMap::new(),
            rename_from: None,
        }
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }

    /// Add a directory to watch
    pub fn watch<P: AsRef<Path>>(&mut self, path: P) -> notify::Result<()> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            warn!(path = ?path, "Watch path does not exist");
            return Ok(());
        }

        if let Some(watcher) = self.watcher.as_mut() {
            watcher.watch(&path, self.config.mode())?;
        }
        if !self.watch_paths.contains(&path) {
            info!(path = ?path, "Watching plugin directory");
            self.watch_paths.push(path);
        }
        Ok(())
    }

    /// Remove a directory from watching
    pub fn unwatch<P: AsRef<Path>>(&mut self, path: P) -> notify::Result<()> {
        let path = path.as_ref();
        self.watch_paths.retain(|p| p != path);
        if let Some(watcher) = self.watcher.as_mut() {
            watcher.unwatch(path)?;
        }
        Ok(())
    }

    pub fn watched_paths(&self) -> &[PathBuf] {
        &self.watch_paths
    }

    pub fn is_watching<P: AsRef<Path>>(&self, path: P) -> bool {
        self.watch_paths.iter().any(|p| p == path.as_ref())
    }

    /// Start the notify backend on every tracked directory
    pub fn start(&mut self) -> notify::Result<()> {
        if self.watcher.is_some() {
            return Ok(());
        }

        let tx = self.raw_tx.clone();
        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| {
                let _ = tx.send(result);
            },
            Config::default().with_poll_interval(Duration::from_millis(100)),
        )?;

        let mode = self.config.mode();
        for path in &self.watch_paths {
            watcher.watch(path, mode)?;
        }
        self.watcher = Some(watcher);
        info!(paths = self.watch_paths.len(), "Plugin watcher started");
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.watcher.take().is_some() {
            info!("Plugin watcher stopped");
        }
        self.pending.clear();
        self.rename_from = None;
    }

    /// Queue a backend event as if the OS had reported it
    #[cfg(test)]
    pub(crate) fn inject(&self, event: Event) {
        let _ = self.raw_tx.send(Ok(event));
    }

    /// Drain backend events and return those whose debounce has elapsed
    pub fn poll(&mut self) -> Vec<WatchEvent> {
        self.poll_at(Instant::now())
    }

    pub(crate) fn poll_at(&mut self, now: Instant) -> Vec<WatchEvent> {
        let raw: Vec<_> = self.raw_rx.try_iter().collect();
        for result in raw {
            match result {
                Ok(event) => self.ingest(event, now),
                Err(e) => warn!(error = %e, "Watcher backend error"),
            }
        }

        let debounce = self.config.debounce;
        let ready: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, pending)| now.duration_since(pending.last_seen) >= debounce)
            .map(|(path, _)| path.clone())
            .collect();

        let mut events: Vec<WatchEvent> = ready
            .into_iter()
            .filter_map(|path| {
                let pending = self.pending.remove(&path)?;
                Some(WatchEvent {
                    kind: pending.kind,
                    path,
                    timestamp: pending.last_seen,
                })
            })
            .collect();
        events.sort_by_key(|e| e.timestamp);
        events
    }

    fn ingest(&mut self, event: Event, now: Instant) {
        for path in event.paths {
            let kind = match event.kind {
                EventKind::Create(CreateKind::File | CreateKind::Any) => WatchEventKind::Created,
                EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => WatchEventKind::Modified,
                EventKind::Remove(RemoveKind::File | RemoveKind::Any) => WatchEventKind::Removed,
                EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                    self.rename_from = Some(path);
                    continue;
                }
                EventKind::Modify(ModifyKind::Name(RenameMode::To)) => match self.rename_from.take() {
                    Some(from) => WatchEventKind::Renamed { from },
                    None => WatchEventKind::Created,
                },
                _ => continue,
            };
            self.record(path, kind, now);
        }
    }

    fn record(&mut self, path: PathBuf, kind: WatchEventKind, now: Instant) {
        if !self.config.should_watch(&path) {
            trace!(path = ?path, "Ignoring change");
            return;
        }

        // A burst keeps its first kind, except that a final removal wins.
        match self.pending.get_mut(&path) {
            Some(pending) => {
                if kind == WatchEventKind::Removed || pending.kind == WatchEventKind::Removed {
                    pending.kind = kind;
                }
                pending.last_seen = now;
                debug!(path = ?path, "Coalesced change");
            }
            None => {
                self.pending.insert(path, Pending { kind, last_seen: now });
            }
        }
    }

    /// Plugin files already present in the watched directories
    pub fn scan_existing(&self) -> Vec<PathBuf> {
        let mut plugins: Vec<PathBuf> = self
            .watch_paths
            .iter()
            .filter_map(|dir| std::fs::read_dir(dir).ok())
            .flat_map(|entries| entries.flatten())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && self.config.should_watch(path))
            .collect();
        plugins.sort();
        plugins
    }
}

impl std::fmt::Debug for PluginWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginWatcher")
            .field("config", &self.config)
            .field("watch_paths", &self.watch_paths)
            .field("running", &self.watcher.is_some())
            .field("pending", &self.pending.len())
            .finish()
    }
}
