//! The exported entry point as the loader sees it.

#![cfg(not(feature = "static-plugins"))]

use std::sync::Arc;

use tessera_kernel::{Context, Generation, ObjectBase, Registrable, impl_object};
use tessera_plugins::{
    ApplicationState, HostContext, HostOp, Plugin, PluginResult, PluginStatus, Registrar, declare_plugin,
};

struct Beacon {
    base: ObjectBase,
}

impl_object!(Beacon);

impl Registrable for Beacon {
    const TYPE_NAME: &'static str = "Beacon";

    fn create(base: ObjectBase) -> Self {
        Self { base }
    }
}

struct Signal;

impl Plugin for Signal {
    fn name(&self) -> &str {
        "signal"
    }

    fn load(&mut self, registrar: &mut Registrar<'_>) -> PluginResult<()> {
        registrar.register_factory::<Beacon>()?;
        Ok(())
    }
}

fn create_signal(_context: &Arc<Context>) -> Box<dyn Plugin> {
    Box::new(Signal)
}

declare_plugin!(create_signal);

fn send(host: &mut HostContext, op: HostOp) -> i32 {
    unsafe { tessera_plugin_main(host, op.as_raw()) }
}

#[test]
fn unload_or_close_without_a_module_returns_failure() {
    let mut host = HostContext::new("signal", Context::new());
    assert_eq!(send(&mut host, HostOp::Unload), PluginStatus::InvalidState.code());
    assert_eq!(send(&mut host, HostOp::Close), PluginStatus::InvalidState.code());
    // Still usable afterwards.
    assert_eq!(send(&mut host, HostOp::Load), PluginStatus::Ok.code());
}

#[test]
fn load_binds_application_and_owner_runs_the_load_hook() {
    let context = Context::new();
    let mut host = HostContext::new("signal", context.clone());
    host.set_generation(Some(Generation::new(1, "signal")));

    assert_eq!(send(&mut host, HostOp::Load), 0);
    let app = host.application().unwrap();
    assert_eq!(app.lock().state(), ApplicationState::Constructed);
    assert!(!context.registry().contains(Beacon::TYPE_ID));

    app.lock().load().unwrap();
    assert!(context.registry().contains(Beacon::TYPE_ID));
    assert_eq!(send(&mut host, HostOp::Step), 0);

    assert_eq!(send(&mut host, HostOp::Close), 0);
    assert!(host.application().is_none());
    assert!(context.registry().contains(Beacon::TYPE_ID));

    // The owner's drop reverses the registration.
    drop(app);
    assert!(!context.registry().contains(Beacon::TYPE_ID));
}

#[test]
fn null_host_is_rejected() {
    let status = unsafe { tessera_plugin_main(std::ptr::null_mut(), HostOp::Load.as_raw()) };
    assert_eq!(PluginStatus::from_raw(status), PluginStatus::InvalidState);
}
