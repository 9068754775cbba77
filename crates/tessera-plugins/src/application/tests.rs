//! Unit tests for [`PluginApplication`]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tessera_kernel::{
    AttributeInfo, Context, Generation, ObjectBase, Registrable, RegistryError, StringHash, TypeRegistry, Variant,
    impl_object,
};

use super::*;

struct Foo {
    base: ObjectBase,
    power: Mutex<i32>,
}

impl_object!(Foo);

impl Registrable for Foo {
    const TYPE_NAME: &'static str = "Foo";

    fn create(base: ObjectBase) -> Self {
        Self {
            base,
            power: Mutex::new(3),
        }
    }

    fn register_attributes(registry: &TypeRegistry) {
        registry.register_attribute(
            Self::TYPE_ID,
            AttributeInfo::with_accessors::<Foo, _, _>(
                "Power",
                Variant::Int(3),
                |foo| Variant::Int(*foo.power.lock()),
                |foo, value| {
                    if let Some(power) = value.as_i32() {
                        *foo.power.lock() = power;
                    }
                },
            ),
        );
    }
}

struct Bar {
    base: ObjectBase,
}

impl_object!(Bar);

impl Registrable for Bar {
    const TYPE_NAME: &'static str = "Bar";

    fn create(base: ObjectBase) -> Self {
        Self { base }
    }
}

struct Clock {
    base: ObjectBase,
}

impl_object!(Clock);

impl Registrable for Clock {
    const TYPE_NAME: &'static str = "Clock";

    fn create(base: ObjectBase) -> Self {
        Self { base }
    }
}

/// Test plugin whose hooks are counted and can be told to misbehave
#[derive(Default)]
struct Recorder {
    fail_after_foo: bool,
    panic_on_start: bool,
    starts: Arc<AtomicUsize>,
    steps: Arc<AtomicUsize>,
    unloads: Arc<AtomicUsize>,
}

impl Plugin for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn load(&mut self, registrar: &mut Registrar<'_>) -> PluginResult<()> {
        registrar.register_factory_in::<Foo>("Logic")?;
        if self.fail_after_foo {
            return Err(PluginError::hook("recorder", "load", "missing dependency"));
        }
        registrar.register_factory::<Bar>()?;
        registrar.register_subsystem::<Clock>()?;
        Ok(())
    }

    fn start(&mut self, _context: &Arc<Context>) -> PluginResult<()> {
        if self.panic_on_start {
            panic!("start exploded");
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn step(&mut self, _context: &Arc<Context>, _time_step: Duration) -> PluginResult<()> {
        self.steps.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unload(&mut self, _context: &Arc<Context>) -> PluginResult<()> {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn loaded(context: &Arc<Context>, recorder: Recorder) -> PluginApplication {
    let mut app = PluginApplication::new(context.clone(), Box::new(recorder));
    app.load().unwrap();
    app
}

#[test]
fn test_registrations_are_recorded_in_order() {
    let context = Context::new();
    let app = loaded(&context, Recorder::default());

    assert_eq!(app.state(), ApplicationState::Loaded);
    assert_eq!(
        app.record(),
        &[
            RegistrationEntry {
                type_id: Foo::TYPE_ID,
                category: Some("Logic".to_string()),
            },
            RegistrationEntry {
                type_id: Bar::TYPE_ID,
                category: None,
            },
            RegistrationEntry {
                type_id: Clock::TYPE_ID,
                category: None,
            },
        ]
    );
    assert!(context.registry().has_attributes(Foo::TYPE_ID));
    assert!(context.registry().has_subsystem(Clock::TYPE_ID));
}

#[test]
fn test_destroy_reverses_every_registration_in_order() {
    let context = Context::new();
    let app = loaded(&context, Recorder::default());

    let report = app.destroy();
    let order: Vec<_> = report.removals.iter().map(|r| r.type_id).collect();
    assert_eq!(order, vec![Foo::TYPE_ID, Bar::TYPE_ID, Clock::TYPE_ID]);
    assert!(report.removals.iter().all(|r| r.factory_removed));
    assert_eq!(report.removals[0].category.as_deref(), Some("Logic"));
    assert_eq!(report.removals[0].attributes_removed, 1);
    assert!(report.removals[2].subsystem_removed);

    let registry = context.registry();
    for type_id in order {
        assert!(!registry.contains(type_id));
        assert!(!registry.has_attributes(type_id));
        assert!(!registry.has_subsystem(type_id));
    }
    assert!(registry.types_in_category("Logic").is_empty());
}

#[test]
fn test_foo_in_logic_scenario() {
    let context = Context::new();
    let app = loaded(&context, Recorder::default());
    let foo = StringHash::new("Foo");

    assert_eq!(context.registry().find_type("Foo"), Some(foo));
    let instance = context.create_object(foo).unwrap();
    assert_eq!(instance.object_type(), foo);

    drop(app);

    assert_eq!(context.registry().find_type("Foo"), None);
    assert!(matches!(
        context.create_object(foo),
        Err(RegistryError::UnknownType(id)) if id == foo
    ));
    assert!(!context.registry().remove_subsystem(foo));
}

#[test]
fn test_partial_load_failure_still_unwinds() {
    let context = Context::new();
    let mut app = PluginApplication::new(
        context.clone(),
        Box::new(Recorder {
            fail_after_foo: true,
            ..Recorder::default()
        }),
    );

    assert!(matches!(app.load(), Err(PluginError::Hook { .. })));
    assert_eq!(app.record().len(), 1);
    assert!(context.registry().contains(Foo::TYPE_ID));

    let report = app.destroy();
    assert_eq!(report.len(), 1);
    assert!(!context.registry().contains(Foo::TYPE_ID));
}

#[test]
fn test_rejected_registration_is_still_recorded() {
    let context = Context::new();
    context.registry().register_type::<Foo>(None).unwrap();

    let mut app = PluginApplication::new(context.clone(), Box::new(Recorder::default()));
    let err = app.load().unwrap_err();

    assert!(matches!(
        err,
        PluginError::Registry(RegistryError::AlreadyRegistered { .. })
    ));
    assert_eq!(app.record().len(), 1);
    assert_eq!(app.record()[0].type_id, Foo::TYPE_ID);
}

#[test]
fn test_lifecycle_transitions() {
    let context = Context::new();
    let recorder = Recorder::default();
    let starts = recorder.starts.clone();
    let steps = recorder.steps.clone();
    let unloads = recorder.unloads.clone();
    let mut app = loaded(&context, recorder);

    // Stepping an idle application is a no-op.
    app.step(Duration::from_millis(16)).unwrap();
    assert_eq!(steps.load(Ordering::SeqCst), 0);

    app.start().unwrap();
    app.start().unwrap();
    assert_eq!(starts.load(Ordering::SeqCst), 1);
    app.step(Duration::from_millis(16)).unwrap();
    assert_eq!(steps.load(Ordering::SeqCst), 1);

    app.stop().unwrap();
    assert_eq!(app.state(), ApplicationState::Stopped);
    app.start().unwrap();
    assert_eq!(starts.load(Ordering::SeqCst), 2);

    app.unload().unwrap();
    assert_eq!(app.state(), ApplicationState::Unloading);
    assert_eq!(unloads.load(Ordering::SeqCst), 1);

    assert!(matches!(
        app.unload(),
        Err(PluginError::InvalidTransition { operation: "unload", .. })
    ));
    assert!(app.start().is_err());
}

#[test]
fn test_load_twice_is_rejected() {
    let context = Context::new();
    let mut app = loaded(&context, Recorder::default());
    assert!(matches!(
        app.load(),
        Err(PluginError::InvalidTransition { operation: "load", .. })
    ));
    assert_eq!(app.record().len(), 3);
}

#[test]
fn test_panicking_hook_becomes_error() {
    let context = Context::new();
    let mut app = loaded(
        &context,
        Recorder {
            panic_on_start: true,
            ..Recorder::default()
        },
    );

    match app.start() {
        Err(PluginError::Panicked { hook, message, .. }) => {
            assert_eq!(hook, "start");
            assert!(message.contains("start exploded"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(app.state(), ApplicationState::Loaded);
}

#[test]
fn test_generation_tags_factories() {
    let context = Context::new();
    let generation = Generation::new(7, "recorder");
    let mut app = PluginApplication::new(context.clone(), Box::new(Recorder::default()))
        .with_generation(Some(generation.clone()));
    app.load().unwrap();

    let entry = context.registry().factory(Foo::TYPE_ID).unwrap();
    assert_eq!(entry.generation().map(|g| g.id()), Some(7));

    let foo = context.registry().create::<Foo>().unwrap();
    generation.retire();
    assert!(matches!(
        context.create_object(Foo::TYPE_ID),
        Err(RegistryError::RetiredGeneration { generation: 7, .. })
    ));
    // Live instances of a retired generation remain usable.
    assert_eq!(*foo.power.lock(), 3);
}
