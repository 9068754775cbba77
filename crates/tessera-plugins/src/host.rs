//! Native plugin entry protocol
//!
//! Every plugin module exports one function, [`ENTRY_SYMBOL`], with the
//! [`PluginEntryFn`] signature. The loader calls it with a [`HostContext`]
//! and one of the [`HostOp`] opcodes; the function answers with a
//! [`PluginStatus`] code. Modules generate the export with
//! [`declare_plugin!`](crate::declare_plugin), which forwards to
//! [`plugin_main`] together with the module's plugin factory.
//!
//! The entry point never unwinds into the host: malformed host state and
//! opcodes that arrive while no application is bound return a negative
//! status instead.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use tessera_kernel::error::panic_message;
use tessera_kernel::{Context, Generation};

use crate::application::{Plugin, PluginApplication, SharedApplication};

/// Name of the exported entry function, NUL-terminated for symbol lookup
pub const ENTRY_SYMBOL: &[u8] = b"tessera_plugin_main\0";

/// Signature of the exported entry function
pub type PluginEntryFn = unsafe extern "C" fn(host: *mut HostContext, op: u32) -> i32;

/// Constructor supplied by a module for its plugin
pub type PluginFactory = fn(&Arc<Context>) -> Box<dyn Plugin>;

/// Opcodes delivered to a module's entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum HostOp {
    Load = 0,
    Step = 1,
    Unload = 2,
    Close = 3,
}

impl HostOp {
    pub fn from_raw(op: u32) -> Option<Self> {
        match op {
            0 => Some(Self::Load),
            1 => Some(Self::Step),
            2 => Some(Self::Unload),
            3 => Some(Self::Close),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u32 {
        self as u32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HostOp::Load => "load",
            HostOp::Step => "step",
            HostOp::Unload => "unload",
            HostOp::Close => "close",
        }
    }
}

impl fmt::Display for HostOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status codes returned by the entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum PluginStatus {
    Ok = 0,
    /// The plugin factory or a hook panicked
    Failed = -1,
    /// No application is bound, or the host context is malformed
    InvalidState = -2,
    /// Not built for this host mode, or unknown opcode
    Unsupported = -3,
}

impl PluginStatus {
    pub fn from_raw(status: i32) -> Self {
        match status {
            0 => Self::Ok,
            -2 => Self::InvalidState,
            -3 => Self::Unsupported,
            _ => Self::Failed,
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

/// What a module's host context currently holds
#[derive(Default)]
pub enum ModuleSlot {
    /// Engine context, between generations
    Engine(Arc<Context>),
    /// Application bound by the last Load
    Application(SharedApplication),
    #[default]
    Empty,
}

impl fmt::Debug for ModuleSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleSlot::Engine(_) => f.write_str("Engine"),
            // Formatting may happen from inside a hook that holds the lock.
            ModuleSlot::Application(app) => match app.try_lock() {
                Some(app) => f.debug_tuple("Application").field(&app.name()).finish(),
                None => f.write_str("Application(<locked>)"),
            },
            ModuleSlot::Empty => f.write_str("Empty"),
        }
    }
}

/// Per-module state shared between the host and the module's entry point
#[derive(Debug)]
pub struct HostContext {
    slot: ModuleSlot,
    module_name: String,
    generation: Option<Arc<Generation>>,
}

impl HostContext {
    pub fn new(module_name: &str, context: Arc<Context>) -> Self {
        Self {
            slot: ModuleSlot::Engine(context),
            module_name: module_name.to_string(),
            generation: None,
        }
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    /// Generation handed to the next application built by Load
    pub fn set_generation(&mut self, generation: Option<Arc<Generation>>) {
        self.generation = generation;
    }

    pub fn generation(&self) -> Option<&Arc<Generation>> {
        self.generation.as_ref()
    }

    pub fn slot(&self) -> &ModuleSlot {
        &self.slot
    }

    /// Application bound by the last Load, if any
    pub fn application(&self) -> Option<SharedApplication> {
        match &self.slot {
            ModuleSlot::Application(app) => Some(app.clone()),
            _ => None,
        }
    }

    /// Engine context, whether or not an application is bound
    pub fn engine_context(&self) -> Option<Arc<Context>> {
        match &self.slot {
            ModuleSlot::Engine(context) => Some(context.clone()),
            ModuleSlot::Application(app) => Some(app.lock().context().clone()),
            ModuleSlot::Empty => None,
        }
    }

    /// Put the engine context back, dropping this context's application reference
    pub fn restore_engine(&mut self, context: Arc<Context>) {
        self.slot = ModuleSlot::Engine(context);
    }
}

/// Entry point body shared by every module
///
/// Load builds a new [`PluginApplication`] from `factory` and binds it to
/// the host context; it does not run the plugin's `load` hook, which is
/// the owner's job once the opcode returns. Unload and Close put the engine
/// context back and leave destruction of the application to its owner.
///
/// # Safety
///
/// `host` must be null or point to a valid [`HostContext`] that is not
/// accessed elsewhere for the duration of the call.
#[cfg(not(feature = "static-plugins"))]
pub unsafe fn plugin_main(host: *mut HostContext, op: u32, factory: PluginFactory) -> i32 {
    // SAFETY: validity and exclusivity are guaranteed by the caller.
    let Some(host) = (unsafe { host.as_mut() }) else {
        error!(op, "Plugin entry called without a host context");
        return PluginStatus::InvalidState.code();
    };
    let Some(op) = HostOp::from_raw(op) else {
        warn!(module = %host.module_name, op, "Unknown plugin opcode");
        return PluginStatus::Unsupported.code();
    };

    match catch_unwind(AssertUnwindSafe(|| dispatch(host, op, factory))) {
        Ok(status) => status.code(),
        Err(payload) => {
            error!(
                module = %host.module_name,
                op = %op,
                panic = %panic_message(payload.as_ref()),
                "Plugin entry panicked"
            );
            PluginStatus::Failed.code()
        }
    }
}

/// Entry point body for builds where plugins are linked statically
///
/// # Safety
///
/// Never dereferences `host`.
#[cfg(feature = "static-plugins")]
pub unsafe fn plugin_main(host: *mut HostContext, op: u32, factory: PluginFactory) -> i32 {
    PluginStatus::Unsupported.code()
}

fn dispatch(host: &mut HostContext, op: HostOp, factory: PluginFactory) -> PluginStatus {
    match op {
        HostOp::Load => {
            let Some(context) = host.engine_context() else {
                error!(module = %host.module_name, "Load without an engine context");
                return PluginStatus::InvalidState;
            };
            if matches!(host.slot, ModuleSlot::Application(_)) {
                warn!(module = %host.module_name, "Load replaces a bound application");
            }
            let plugin = factory(&context);
            let app = PluginApplication::new(context, plugin).with_generation(host.generation.clone());
            debug!(
                module = %host.module_name,
                plugin = app.name(),
                generation = ?host.generation.as_ref().map(|g| g.id()),
                "Bound plugin application"
            );
            host.slot = ModuleSlot::Application(Arc::new(Mutex::new(app)));
            PluginStatus::Ok
        }
        HostOp::Step => match host.slot {
            ModuleSlot::Application(_) => PluginStatus::Ok,
            _ => PluginStatus::InvalidState,
        },
        HostOp::Unload | HostOp::Close => {
            let context = match &host.slot {
                ModuleSlot::Application(app) => app.lock().context().clone(),
                _ => {
                    warn!(module = %host.module_name, op = %op, "No application bound");
                    return PluginStatus::InvalidState;
                }
            };
            host.restore_engine(context);
            debug!(module = %host.module_name, op = %op, "Released plugin application");
            PluginStatus::Ok
        }
    }
}

/// Export the module entry point for a plugin factory
///
/// ```rust,ignore
/// tessera_plugins::declare_plugin!(|_context| Box::new(MyPlugin::default()));
/// ```
#[macro_export]
macro_rules! declare_plugin {
    ($factory:expr) => {
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn tessera_plugin_main(host: *mut $crate::host::HostContext, op: u32) -> i32 {
            // SAFETY: forwarded from the loader, which owns `host`.
            unsafe { $crate::host::plugin_main(host, op, $factory) }
        }
    };
}
