//! Plugin module lifecycle
//!
//! A [`PluginModule`] drives one named module through
//! `Unloaded -> Loaded -> {Running <-> Stopped} -> Unloaded`, calling the
//! module's entry point with the matching opcodes and the bound
//! [`PluginApplication`](crate::application::PluginApplication) hooks in
//! between. Each load opens a new [`Generation`]; unloading retires it and
//! hands the image to the loader's graveyard.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use tessera_kernel::{Context, Generation};

use super::loader::{ModuleImage, PluginLoader};
use crate::application::{ApplicationState, RegistrationEntry, SharedApplication};
use crate::error::{PluginError, PluginResult};
use crate::host::{HostContext, HostOp, PluginStatus};

/// Lifecycle state of a plugin module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleState {
    Unloaded,
    Loaded,
    Running,
    Stopped,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModuleState::Unloaded => "unloaded",
            ModuleState::Loaded => "loaded",
            ModuleState::Running => "running",
            ModuleState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// One named plugin module and its current generation
pub struct PluginModule {
    name: String,
    state: ModuleState,
    // Boxed so the address handed to the entry point stays put.
    host: Box<HostContext>,
    application: Option<SharedApplication>,
    generation: Option<Arc<Generation>>,
    image: Option<Arc<dyn ModuleImage>>,
    context: Arc<Context>,
    loader: Arc<PluginLoader>,
    generations: u64,
    loaded_at: Option<Instant>,
}

impl PluginModule {
    pub fn new(name: &str, context: Arc<Context>, loader: Arc<PluginLoader>) -> Self {
        Self {
            name: name.to_string(),
            state: ModuleState::Unloaded,
            host: Box::new(HostContext::new(name, context.clone())),
            application: None,
            generation: None,
            image: None,
            context,
            loader,
            generations: 0,
            loaded_at: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub fn generation(&self) -> Option<&Arc<Generation>> {
        self.generation.as_ref()
    }

    /// Number of generations opened so far
    pub fn generation_count(&self) -> u64 {
        self.generations
    }

    pub fn image(&self) -> Option<&Arc<dyn ModuleImage>> {
        self.image.as_ref()
    }

    pub fn loaded_at(&self) -> Option<Instant> {
        self.loaded_at
    }

    pub fn application_state(&self) -> Option<ApplicationState> {
        self.application.as_ref().map(|app| app.lock().state())
    }

    /// Registrations made by the current generation
    pub fn registrations(&self) -> Vec<RegistrationEntry> {
        self.application
            .as_ref()
            .map(|app| app.lock().record().to_vec())
            .unwrap_or_default()
    }

    /// Load a module image as a new generation
    ///
    /// On failure every registration the plugin managed to make is reversed,
    /// the generation is retired and the module stays unloaded.
    pub fn load(&mut self, image: Arc<dyn ModuleImage>) -> PluginResult<()> {
        if self.state != ModuleState::Unloaded {
            return Err(self.invalid("load"));
        }

        self.generations += 1;
        let generation = Generation::new(self.generations, &self.name);
        self.host.set_generation(Some(generation.clone()));

        let status = self.call_entry(image.as_ref(), HostOp::Load);
        if status != PluginStatus::Ok.code() {
            self.abandon(image, &generation);
            return Err(self.entry_error(HostOp::Load, status));
        }

        let Some(app) = self.host.application() else {
            self.abandon(image, &generation);
            return Err(self.entry_error(HostOp::Load, PluginStatus::InvalidState.code()));
        };

        let loaded = app.lock().load();
        if let Err(e) = loaded {
            warn!(module = %self.name, error = %e, "Plugin load hook failed");
            let status = self.call_entry(image.as_ref(), HostOp::Close);
            if status != PluginStatus::Ok.code() {
                self.host.restore_engine(self.context.clone());
            }
            drop(app);
            self.abandon(image, &generation);
            return Err(e);
        }

        info!(
            module = %self.name,
            generation = generation.id(),
            registrations = app.lock().record().len(),
            "Module loaded"
        );
        self.application = Some(app);
        self.generation = Some(generation);
        self.image = Some(image);
        self.loaded_at = Some(Instant::now());
        self.state = ModuleState::Loaded;
        Ok(())
    }

    pub fn start(&mut self) -> PluginResult<()> {
        match self.state {
            ModuleState::Running => Ok(()),
            ModuleState::Loaded | ModuleState::Stopped => {
                self.bound_application("start")?.lock().start()?;
                self.state = ModuleState::Running;
                debug!(module = %self.name, "Module started");
                Ok(())
            }
            ModuleState::Unloaded => Err(self.invalid("start")),
        }
    }

    pub fn stop(&mut self) -> PluginResult<()> {
        match self.state {
            ModuleState::Running => {
                let result = self.bound_application("stop")?.lock().stop();
                self.state = ModuleState::Stopped;
                debug!(module = %self.name, "Module stopped");
                result
            }
            ModuleState::Loaded | ModuleState::Stopped => Ok(()),
            ModuleState::Unloaded => Err(self.invalid("stop")),
        }
    }

    /// Tick a running module; other states are a no-op
    pub fn step(&mut self, time_step: Duration) -> PluginResult<()> {
        if self.state != ModuleState::Running {
            return Ok(());
        }
        let Some(image) = self.image.clone() else {
            return Err(self.invalid("step"));
        };

        let status = self.call_entry(image.as_ref(), HostOp::Step);
        if status != PluginStatus::Ok.code() {
            return Err(self.entry_error(HostOp::Step, status));
        }
        self.bound_application("step")?.lock().step(time_step)
    }

    /// Unload the current generation and return the image it ran from
    ///
    /// Teardown always completes: hook and entry point failures are logged
    /// and the module ends up unloaded regardless.
    pub fn unload(&mut self) -> PluginResult<Arc<dyn ModuleImage>> {
        self.release(HostOp::Unload)
    }

    /// Like [`PluginModule::unload`], for host shutdown
    pub fn close(&mut self) -> PluginResult<Arc<dyn ModuleImage>> {
        self.release(HostOp::Close)
    }

    fn release(&mut self, op: HostOp) -> PluginResult<Arc<dyn ModuleImage>> {
        if self.state == ModuleState::Unloaded {
            return Err(self.invalid(op.as_str()));
        }
        let (Some(app), Some(image), Some(generation)) =
            (self.application.take(), self.image.take(), self.generation.take())
        else {
            self.state = ModuleState::Unloaded;
            return Err(self.invalid(op.as_str()));
        };

        if let Err(e) = app.lock().unload() {
            warn!(module = %self.name, error = %e, "Plugin unload hook failed");
        }

        let status = self.call_entry(image.as_ref(), op);
        if status != PluginStatus::Ok.code() {
            warn!(module = %self.name, op = %op, status, "Entry point refused release");
            self.host.restore_engine(self.context.clone());
        }

        // Last reference: dropping it reverses the plugin's registrations.
        drop(app);
        self.host.set_generation(None);
        self.loader.retire(image.clone(), &generation);
        let generation_id = generation.id();
        drop(generation);
        self.loader.collect_garbage();

        self.state = ModuleState::Unloaded;
        self.loaded_at = None;
        info!(module = %self.name, generation = generation_id, op = %op, "Module released");
        Ok(image)
    }

    /// Retire a generation whose load did not complete
    fn abandon(&mut self, image: Arc<dyn ModuleImage>, generation: &Arc<Generation>) {
        self.host.set_generation(None);
        self.loader.retire(image, generation);
        self.loader.collect_garbage();
    }

    fn call_entry(&mut self, image: &dyn ModuleImage, op: HostOp) -> i32 {
        let entry = image.entry();
        // SAFETY: the image is alive for the duration of the call and the
        // host context is owned by this module.
        unsafe { entry(&mut *self.host, op.as_raw()) }
    }

    fn bound_application(&self, operation: &'static str) -> PluginResult<&SharedApplication> {
        self.application.as_ref().ok_or_else(|| self.invalid(operation))
    }

    fn entry_error(&self, op: HostOp, status: i32) -> PluginError {
        PluginError::EntryPoint {
            name: self.name.clone(),
            operation: op.as_str(),
            status,
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

impl fmt::Debug for PluginModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginModule")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("generation", &self.generation.as_ref().map(|g| g.id()))
            .field("image", &self.image)
            .finish()
    }
}

impl Drop for PluginModule {
    fn drop(&mut self) {
        if self.state != ModuleState::Unloaded {
            if let Err(e) = self.close() {
                warn!(module = %self.name, error = %e, "Failed to close module on drop");
            }
        }
    }
}
