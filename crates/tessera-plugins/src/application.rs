//! Plugin applications
//!
//! A [`PluginApplication`] wraps one user [`Plugin`] for the lifetime of one
//! module generation. Every factory the plugin registers through its
//! [`Registrar`] is appended to a registration record, and dropping the
//! application walks that record in order to remove the factory, all
//! attributes and the subsystem of each registered type. The walk runs
//! whether or not the plugin's own `unload` hook ran, so a plugin whose
//! load failed halfway still leaves no registry entries behind.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use tessera_kernel::error::panic_message;
use tessera_kernel::{
    Context, FactoryEntry, Generation, Registrable, RegistryResult, SharedObject, TypeId, TypeRegistry,
};

use crate::error::{PluginError, PluginResult};

// ============================================================================
// Plugin trait
// ============================================================================

/// User code hosted by a plugin module
///
/// Only `load` is required. The remaining hooks default to doing nothing.
pub trait Plugin: Send {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Register factories, attributes and subsystems
    fn load(&mut self, registrar: &mut Registrar<'_>) -> PluginResult<()>;

    /// Called when the host starts running the module; may run repeatedly
    fn start(&mut self, context: &Arc<Context>) -> PluginResult<()> {
        Ok(())
    }

    /// Called when the host pauses the module
    fn stop(&mut self, context: &Arc<Context>) -> PluginResult<()> {
        Ok(())
    }

    /// Undo setup that is not a factory registration (subscriptions, resources)
    fn unload(&mut self, context: &Arc<Context>) -> PluginResult<()> {
        Ok(())
    }

    /// Per-frame tick while running
    fn step(&mut self, context: &Arc<Context>, time_step: Duration) -> PluginResult<()> {
        Ok(())
    }
}

// ============================================================================
// Registration record
// ============================================================================

/// One registration performed by a plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationEntry {
    pub type_id: TypeId,
    pub category: Option<String>,
}

/// Removal performed for one [`RegistrationEntry`] during teardown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    pub type_id: TypeId,
    pub category: Option<String>,
    pub factory_removed: bool,
    pub attributes_removed: usize,
    pub subsystem_removed: bool,
}

/// Outcome of tearing down an application's registrations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub removals: Vec<Removal>,
}

impl TeardownReport {
    pub fn len(&self) -> usize {
        self.removals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.removals.is_empty()
    }
}

/// Registration front-end handed to [`Plugin::load`]
///
/// Each registration is recorded before control returns to the plugin,
/// whether or not the registry accepted it.
pub struct Registrar<'a> {
    context: &'a Arc<Context>,
    generation: Option<&'a Arc<Generation>>,
    record: &'a mut Vec<RegistrationEntry>,
}

impl<'a> Registrar<'a> {
    pub fn context(&self) -> &Arc<Context> {
        self.context
    }

    pub fn registry(&self) -> &TypeRegistry {
        self.context.registry()
    }

    /// Generation the registrations are tagged with
    pub fn generation(&self) -> Option<&Arc<Generation>> {
        self.generation
    }

    /// Register the factory and attributes of `T`
    pub fn register_factory<T: Registrable>(&mut self) -> RegistryResult<()> {
        self.register::<T>(None)
    }

    /// Register the factory and attributes of `T` under a category
    pub fn register_factory_in<T: Registrable>(&mut self, category: &str) -> RegistryResult<()> {
        self.register::<T>(Some(category))
    }

    /// Register `T` and create its subsystem instance
    pub fn register_subsystem<T: Registrable>(&mut self) -> RegistryResult<SharedObject> {
        self.register::<T>(None)?;
        self.registry().register_subsystem_type(T::TYPE_ID)
    }

    fn register<T: Registrable>(&mut self, category: Option<&str>) -> RegistryResult<()> {
        let entry = FactoryEntry::of::<T>()
            .with_category(category)
            .with_generation(self.generation.cloned());
        let category = entry.category().map(str::to_string);
        let result = self.registry().register_factory(entry);
        self.record.push(RegistrationEntry {
            type_id: T::TYPE_ID,
            category,
        });

        match result {
            Ok(()) => {
                T::register_attributes(self.registry());
                Ok(())
            }
            Err(e) => {
                warn!(type_name = T::TYPE_NAME, error = %e, "Plugin registration rejected");
                Err(e)
            }
        }
    }
}

// ============================================================================
// Application
// ============================================================================

/// Lifecycle state of a [`PluginApplication`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplicationState {
    Constructed,
    Loaded,
    Running,
    Stopped,
    Unloading,
}

impl fmt::Display for ApplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ApplicationState::Constructed => "constructed",
            ApplicationState::Loaded => "loaded",
            ApplicationState::Running => "running",
            ApplicationState::Stopped => "stopped",
            ApplicationState::Unloading => "unloading",
        };
        f.write_str(name)
    }
}

/// Application shared between a module's host context and its owner
pub type SharedApplication = Arc<Mutex<PluginApplication>>;

/// One plugin instance bound to one module generation
pub struct PluginApplication {
    // Declared first so the plugin is dropped before the generation token.
    plugin: Box<dyn Plugin>,
    name: String,
    record: Vec<RegistrationEntry>,
    state: ApplicationState,
    context: Arc<Context>,
    generation: Option<Arc<Generation>>,
}

impl PluginApplication {
    pub fn new(context: Arc<Context>, plugin: Box<dyn Plugin>) -> Self {
        let name = plugin.name().to_string();
        Self {
            plugin,
            name,
            record: Vec::new(),
            state: ApplicationState::Constructed,
            context,
            generation: None,
        }
    }

    /// Tag every factory registered by this application with `generation`
    pub fn with_generation(mut self, generation: Option<Arc<Generation>>) -> Self {
        self.generation = generation;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ApplicationState {
        self.state
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn generation(&self) -> Option<&Arc<Generation>> {
        self.generation.as_ref()
    }

    /// Registrations performed so far, in order
    pub fn record(&self) -> &[RegistrationEntry] {
        &self.record
    }

    /// Run the plugin's `load` hook; allowed once, right after construction
    pub fn load(&mut self) -> PluginResult<()> {
        self.expect_state("load", &[ApplicationState::Constructed])?;

        let Self {
            plugin,
            name,
            record,
            context,
            generation,
            ..
        } = self;
        let mut registrar = Registrar {
            context,
            generation: generation.as_ref(),
            record,
        };
        let result = guard(name, "load", || plugin.load(&mut registrar));
        self.state = ApplicationState::Loaded;
        info!(plugin = %self.name, registrations = self.record.len(), ok = result.is_ok(), "Plugin loaded");
        result
    }

    /// Start (or restart) the plugin
    pub fn start(&mut self) -> PluginResult<()> {
        match self.state {
            ApplicationState::Running => Ok(()),
            ApplicationState::Loaded | ApplicationState::Stopped => {
                guard(&self.name, "start", || self.plugin.start(&self.context))?;
                self.state = ApplicationState::Running;
                Ok(())
            }
            _ => Err(self.invalid("start")),
        }
    }

    /// Stop a running plugin; stopping an idle plugin does nothing
    pub fn stop(&mut self) -> PluginResult<()> {
        match self.state {
            ApplicationState::Loaded | ApplicationState::Stopped => Ok(()),
            ApplicationState::Running => {
                let result = guard(&self.name, "stop", || self.plugin.stop(&self.context));
                self.state = ApplicationState::Stopped;
                result
            }
            _ => Err(self.invalid("stop")),
        }
    }

    /// Tick a running plugin
    pub fn step(&mut self, time_step: Duration) -> PluginResult<()> {
        match self.state {
            ApplicationState::Running => guard(&self.name, "step", || self.plugin.step(&self.context, time_step)),
            ApplicationState::Loaded | ApplicationState::Stopped => Ok(()),
            _ => Err(self.invalid("step")),
        }
    }

    /// Run the plugin's `unload` hook, stopping it first if needed
    ///
    /// Registrations are reversed when the application is dropped, not here.
    pub fn unload(&mut self) -> PluginResult<()> {
        self.expect_state(
            "unload",
            &[
                ApplicationState::Loaded,
                ApplicationState::Running,
                ApplicationState::Stopped,
            ],
        )?;
        if self.state == ApplicationState::Running {
            if let Err(e) = self.stop() {
                warn!(plugin = %self.name, error = %e, "Stop before unload failed");
            }
        }
        self.state = ApplicationState::Unloading;
        guard(&self.name, "unload", || self.plugin.unload(&self.context))
    }

    /// Drop the application and report the removals it performed
    pub fn destroy(mut self) -> TeardownReport {
        self.teardown()
    }

    fn teardown(&mut self) -> TeardownReport {
        let record = std::mem::take(&mut self.record);
        let registry = self.context.registry();
        let removals: Vec<Removal> = record
            .into_iter()
            .map(|entry| {
                let factory_removed = registry.remove_factory(entry.type_id, entry.category.as_deref());
                let attributes_removed = registry.remove_all_attributes(entry.type_id);
                let subsystem_removed = registry.remove_subsystem(entry.type_id);
                Removal {
                    type_id: entry.type_id,
                    category: entry.category,
                    factory_removed,
                    attributes_removed,
                    subsystem_removed,
                }
            })
            .collect();

        if !removals.is_empty() {
            debug!(plugin = %self.name, count = removals.len(), "Reversed plugin registrations");
        }
        TeardownReport { removals }
    }

    fn expect_state(&self, operation: &'static str, allowed: &[ApplicationState]) -> PluginResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(self.invalid(operation))
        }
    }

    fn invalid(&self, operation: &'static str) -> PluginError {
        PluginError::InvalidTransition {
            name: self.name.clone(),
            state: self.state.to_string(),
            operation,
        }
    }
}

impl Drop for PluginApplication {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for PluginApplication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginApplication")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("registrations", &self.record.len())
            .field("generation", &self.generation.as_ref().map(|g| g.id()))
            .finish()
    }
}

/// Run a plugin hook, turning a panic into an error
fn guard<F>(name: &str, hook: &'static str, f: F) -> PluginResult<()>
where
    F: FnOnce() -> PluginResult<()>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(PluginError::Panicked {
            name: name.to_string(),
            hook,
            message: panic_message(payload.as_ref()),
        }),
    }
}

#[cfg(test)]
mod tests;
