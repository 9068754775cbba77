//! Engine context
//!
//! A [`Context`] is the single owned instance that ties the type registry to
//! the event hub every object attaches to. It is created once by the host
//! and passed explicitly to plugins and to the managed bridge.

use std::collections::BTreeMap;
use std::sync::Arc;

use error_stack::Report;

use crate::error::{KernelError, KernelResult};
use crate::event::EventHub;
use crate::hash::TypeId;
use crate::object::{Object, SharedObject};
use crate::registry::{RegistryResult, TypeRegistry};
use crate::variant::Variant;

#[derive(Debug)]
pub struct Context {
    registry: TypeRegistry,
}

impl Context {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: TypeRegistry::new(EventHub::new()),
        })
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventHub> {
        self.registry.events()
    }

    pub fn create_object(&self, type_id: TypeId) -> RegistryResult<SharedObject> {
        self.registry.create_object(type_id)
    }

    /// Serialize the saveable attributes of an object as JSON
    pub fn save_object_json(&self, object: &dyn Object) -> KernelResult<String> {
        let values = self.registry.save_attributes(object);
        serde_json::to_string(&values).map_err(|e| {
            Report::new(KernelError::from(e)).attach(format!("saving attributes of {}", object.object_id()))
        })
    }

    /// Restore attributes from JSON produced by [`Context::save_object_json`]
    pub fn load_object_json(&self, object: &dyn Object, json: &str) -> KernelResult<usize> {
        let values: BTreeMap<String, Variant> = serde_json::from_str(json).map_err(|e| {
            Report::new(KernelError::from(e)).attach(format!("loading attributes of {}", object.object_id()))
        })?;
        Ok(self.registry.load_attributes(object, &values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::AttributeInfo;
    use crate::impl_object;
    use crate::object::{ObjectBase, Registrable};
    use parking_lot::Mutex;

    struct Lamp {
        base: ObjectBase,
        on: Mutex<bool>,
    }

    impl_object!(Lamp);

    impl Registrable for Lamp {
        const TYPE_NAME: &'static str = "Lamp";

        fn create(base: ObjectBase) -> Self {
            Self {
                base,
                on: Mutex::new(false),
            }
        }

        fn register_attributes(registry: &TypeRegistry) {
            registry.register_attribute(
                Self::TYPE_ID,
                AttributeInfo::with_accessors::<Lamp, _, _>(
                    "On",
                    Variant::Bool(false),
                    |lamp| Variant::Bool(*lamp.on.lock()),
                    |lamp, value| {
                        if let Some(on) = value.as_bool() {
                            *lamp.on.lock() = on;
                        }
                    },
                ),
            );
        }
    }

    #[test]
    fn test_json_round_trip() {
        let context = Context::new();
        context.registry().register_type::<Lamp>(None).unwrap();
        Lamp::register_attributes(context.registry());

        let lamp = context.registry().create::<Lamp>().unwrap();
        *lamp.on.lock() = true;
        let json = context.save_object_json(lamp.as_ref()).unwrap();

        let other = context.registry().create::<Lamp>().unwrap();
        assert_eq!(context.load_object_json(other.as_ref(), &json).unwrap(), 1);
        assert!(*other.on.lock());
    }

    #[test]
    fn test_malformed_json_reports_context() {
        let context = Context::new();
        context.registry().register_type::<Lamp>(None).unwrap();
        let lamp = context.create_object(Lamp::TYPE_ID).unwrap();

        let report = context.load_object_json(lamp.as_ref(), "{").unwrap_err();
        assert!(matches!(report.current_context(), KernelError::Serialization(_)));
        assert!(format!("{report:?}").contains("loading attributes"));
    }
}
