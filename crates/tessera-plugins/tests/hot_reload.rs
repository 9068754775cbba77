//! Hot reload through the plugin manager, with the plugin entry point
//! linked into the test binary instead of a shared library.

#![cfg(not(feature = "static-plugins"))]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use parking_lot::Mutex;
use tessera_kernel::{
    AttributeInfo, Context, Object, ObjectBase, Registrable, RegistryError, TypeRegistry, Variant, downcast_object,
    impl_object,
};
use tessera_plugins::{
    HotReloadConfig, ModuleState, Plugin, PluginError, PluginManager, PluginResult, Registrar, ReloadError,
    ReloadEvent, ReloadStrategy, StaticImage, declare_plugin,
};

/// Modules whose next load fails once
static FAILING: LazyLock<Mutex<HashSet<String>>> = LazyLock::new(|| Mutex::new(HashSet::new()));
static STEPS: AtomicUsize = AtomicUsize::new(0);

struct Spinner {
    base: ObjectBase,
    rate: Mutex<f32>,
}

impl_object!(Spinner);

impl Registrable for Spinner {
    const TYPE_NAME: &'static str = "Spinner";

    fn create(base: ObjectBase) -> Self {
        Self {
            base,
            rate: Mutex::new(90.0),
        }
    }

    fn register_attributes(registry: &TypeRegistry) {
        registry.register_attribute(
            Self::TYPE_ID,
            AttributeInfo::with_accessors::<Spinner, _, _>(
                "Rate",
                Variant::Float(90.0),
                |s| Variant::Float(*s.rate.lock()),
                |s, v| {
                    if let Some(rate) = v.as_f32() {
                        *s.rate.lock() = rate;
                    }
                },
            ),
        );
    }
}

struct Ticker {
    base: ObjectBase,
}

impl_object!(Ticker);

impl Registrable for Ticker {
    const TYPE_NAME: &'static str = "Ticker";

    fn create(base: ObjectBase) -> Self {
        Self { base }
    }
}

struct Demo;

impl Plugin for Demo {
    fn name(&self) -> &str {
        "demo"
    }

    fn load(&mut self, registrar: &mut Registrar<'_>) -> PluginResult<()> {
        registrar.register_factory_in::<Spinner>("Logic")?;
        let module = registrar.generation().map(|g| g.module().to_string()).unwrap_or_default();
        if FAILING.lock().remove(&module) {
            return Err(PluginError::hook("demo", "load", "simulated broken build"));
        }
        registrar.register_subsystem::<Ticker>()?;
        Ok(())
    }

    fn step(&mut self, _context: &Arc<Context>, _time_step: Duration) -> PluginResult<()> {
        STEPS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn create_demo(_context: &Arc<Context>) -> Box<dyn Plugin> {
    Box::new(Demo)
}

declare_plugin!(create_demo);

fn manager() -> PluginManager {
    let config = HotReloadConfig::new().with_strategy(ReloadStrategy::Manual);
    PluginManager::new(Context::new(), config).unwrap()
}

#[test]
fn static_module_registers_and_unregisters() {
    let mut manager = manager();
    let events = manager.subscribe();
    manager.load_static("registers", tessera_plugin_main).unwrap();

    let context = manager.context().clone();
    let registry = context.registry();
    assert!(registry.contains(Spinner::TYPE_ID));
    assert_eq!(registry.types_in_category("Logic"), vec![Spinner::TYPE_ID]);
    assert!(registry.has_subsystem(Ticker::TYPE_ID));
    assert_eq!(manager.module("registers").unwrap().registrations().len(), 2);

    manager.unload("registers").unwrap();
    assert!(!registry.contains(Spinner::TYPE_ID));
    assert!(!registry.has_attributes(Spinner::TYPE_ID));
    assert!(!registry.has_subsystem(Ticker::TYPE_ID));
    assert!(manager.is_empty());

    let received: Vec<_> = events.try_iter().collect();
    assert_eq!(
        received,
        vec![
            ReloadEvent::ModuleLoaded {
                module: "registers".to_string(),
                generation: 1,
            },
            ReloadEvent::ModuleUnloaded {
                module: "registers".to_string(),
            },
        ]
    );
}

#[test]
fn step_reaches_running_modules_only() {
    let mut manager = manager();
    manager.load_static("stepper", tessera_plugin_main).unwrap();

    assert_eq!(manager.step_all(Duration::from_millis(16)), 0);
    assert_eq!(manager.start_all(), 1);
    assert_eq!(
        manager.module("stepper").unwrap().state(),
        ModuleState::Running
    );

    let before = STEPS.load(Ordering::SeqCst);
    assert_eq!(manager.step_all(Duration::from_millis(16)), 1);
    assert!(STEPS.load(Ordering::SeqCst) > before);

    manager.stop_all();
    assert_eq!(manager.step_all(Duration::from_millis(16)), 0);
}

#[test]
fn reload_keeps_live_objects_of_the_old_generation() {
    let mut manager = manager();
    manager.load_static("swapper", tessera_plugin_main).unwrap();
    manager.start("swapper").unwrap();

    let old = manager.context().create_object(Spinner::TYPE_ID).unwrap();
    let old = downcast_object::<Spinner>(old).unwrap();
    *old.rate.lock() = 45.0;
    let old_generation = old.base().generation().unwrap().clone();
    assert_eq!(old_generation.id(), 1);

    let image = Arc::new(StaticImage::new("swapper", tessera_plugin_main).with_hash("rebuilt"));
    manager.reload_with("swapper", image).unwrap();

    let module = manager.module("swapper").unwrap();
    assert_eq!(module.state(), ModuleState::Running);
    assert_eq!(module.generation().unwrap().id(), 2);
    assert!(old_generation.is_retired());

    // The old instance still works; new instances come from generation 2.
    assert_eq!(*old.rate.lock(), 45.0);
    let fresh = manager.context().create_object(Spinner::TYPE_ID).unwrap();
    assert_eq!(fresh.base().generation().unwrap().id(), 2);

    // The first image stays parked until the last generation-1 object goes.
    assert_eq!(manager.loader().retired_count(), 1);
    drop(old);
    drop(old_generation);
    manager.poll();
    assert_eq!(manager.loader().retired_count(), 0);
}

#[test]
fn failed_reload_rolls_back_to_previous_image() {
    let mut manager = manager();
    let events = manager.subscribe();
    manager.load_static("fragile", tessera_plugin_main).unwrap();
    manager.start("fragile").unwrap();

    FAILING.lock().insert("fragile".to_string());
    let image = Arc::new(StaticImage::new("fragile", tessera_plugin_main).with_hash("broken"));
    let err = manager.reload_with("fragile", image).unwrap_err();

    assert!(matches!(
        err.current_context(),
        ReloadError::Plugin(PluginError::Hook { .. })
    ));
    // Generation 2 failed; the previous image came back as generation 3.
    let module = manager.module("fragile").unwrap();
    assert_eq!(module.state(), ModuleState::Running);
    assert_eq!(module.generation().unwrap().id(), 3);
    let registry = manager.context().registry();
    assert!(registry.contains(Spinner::TYPE_ID));
    assert!(registry.has_subsystem(Ticker::TYPE_ID));

    let received: Vec<_> = events.try_iter().collect();
    assert!(received.iter().any(|e| matches!(e, ReloadEvent::ReloadFailed { attempt: 1, .. })));
    assert!(received.iter().any(|e| matches!(e, ReloadEvent::RollbackTriggered { .. })));

    // A fixed build loads and resets the failure count.
    let image = Arc::new(StaticImage::new("fragile", tessera_plugin_main).with_hash("fixed"));
    manager.reload_with("fragile", image).unwrap();
    let module = manager.module("fragile").unwrap();
    assert_eq!(module.state(), ModuleState::Running);
    assert_eq!(module.generation().unwrap().id(), 4);
}

#[test]
fn reload_preserves_stopped_and_loaded_states() {
    let mut manager = manager();
    manager.load_static("paused", tessera_plugin_main).unwrap();
    manager.start("paused").unwrap();
    manager.stop("paused").unwrap();

    let image = Arc::new(StaticImage::new("paused", tessera_plugin_main).with_hash("rebuilt"));
    manager.reload_with("paused", image).unwrap();
    let module = manager.module("paused").unwrap();
    assert_eq!(module.state(), ModuleState::Stopped);
    assert_eq!(module.generation().unwrap().id(), 2);
    assert_eq!(manager.step_all(Duration::from_millis(16)), 0);

    // The rolled back image comes back stopped as well.
    FAILING.lock().insert("paused".to_string());
    let image = Arc::new(StaticImage::new("paused", tessera_plugin_main).with_hash("broken"));
    manager.reload_with("paused", image).unwrap_err();
    let module = manager.module("paused").unwrap();
    assert_eq!(module.state(), ModuleState::Stopped);
    assert_eq!(module.generation().unwrap().id(), 4);

    // A module that was never started stays merely loaded.
    let mut manager = self::manager();
    manager.load_static("idle", tessera_plugin_main).unwrap();
    let image = Arc::new(StaticImage::new("idle", tessera_plugin_main).with_hash("rebuilt"));
    manager.reload_with("idle", image).unwrap();
    assert_eq!(manager.module("idle").unwrap().state(), ModuleState::Loaded);
}

#[test]
fn failed_initial_load_leaves_registry_clean() {
    let mut manager = manager();
    FAILING.lock().insert("broken".to_string());
    let err = manager.load_static("broken", tessera_plugin_main).unwrap_err();

    assert!(matches!(err.current_context(), ReloadError::Plugin(_)));
    assert!(manager.module("broken").is_none());
    assert!(!manager.context().registry().contains(Spinner::TYPE_ID));
    assert!(matches!(
        manager.context().create_object(Spinner::TYPE_ID),
        Err(RegistryError::UnknownType(_))
    ));
}

#[test]
fn duplicate_and_missing_modules_are_reported() {
    let mut manager = manager();
    manager.load_static("twice", tessera_plugin_main).unwrap();
    let err = manager.load_static("twice", tessera_plugin_main).unwrap_err();
    assert!(matches!(err.current_context(), ReloadError::AlreadyLoaded(_)));

    let err = manager.unload("ghost").unwrap_err();
    assert!(matches!(err.current_context(), ReloadError::ModuleNotFound(_)));

    // Static modules have no file to compare against.
    assert!(!manager.reload("twice").unwrap());
}

#[test]
fn shutdown_closes_everything() {
    let mut manager = manager();
    manager.load_static("closing", tessera_plugin_main).unwrap();
    manager.start_all();
    let context = manager.context().clone();

    manager.shutdown();
    assert!(manager.is_empty());
    assert!(context.registry().registered_types().is_empty());
}
