//! Tessera plugins
//!
//! Hot-reloadable native plugins on top of the kernel's type registry:
//! - [`application`]: the per-generation plugin instance and its
//!   registration record
//! - [`host`]: the exported entry protocol every plugin module implements
//! - [`hot_reload`]: library loading, module lifecycle, file watching and
//!   reload orchestration

pub mod application;
pub mod error;
pub mod host;
pub mod hot_reload;

pub use application::{
    ApplicationState, Plugin, PluginApplication, Registrar, RegistrationEntry, Removal, SharedApplication,
    TeardownReport,
};
pub use error::{PluginError, PluginResult};
pub use host::{ENTRY_SYMBOL, HostContext, HostOp, PluginEntryFn, PluginFactory, PluginStatus, plugin_main};
pub use hot_reload::{
    HotReloadConfig, ModuleImage, ModuleState, PluginKind, PluginLoader, PluginManager, PluginModule, ReloadError,
    ReloadEvent, ReloadStrategy, StaticImage,
};

pub use tessera_kernel;
