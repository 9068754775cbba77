//! Hot-reload plugin support
//!
//! - Shadow-copied library loading with generation-aware unmapping
//! - Module lifecycle driven through the native entry protocol
//! - File watching with debounced change detection
//! - Reload orchestration with rollback

mod loader;
mod manager;
mod module;
mod watcher;

pub use loader::{
    IntoPluginLoadReport, ModuleImage, PluginKind, PluginLibrary, PluginLoadError, PluginLoadReport, PluginLoadResult,
    PluginLoader, StaticImage,
};
pub use manager::{
    HotReloadConfig, IntoReloadReport, PluginManager, ReloadError, ReloadEvent, ReloadReport, ReloadResult,
    ReloadStrategy,
};
pub use module::{ModuleState, PluginModule};
pub use watcher::{PluginWatcher, WatchConfig, WatchEvent, WatchEventKind};
