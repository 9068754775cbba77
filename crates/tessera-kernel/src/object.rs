//! Reference-counted object model
//!
//! Objects are shared as [`SharedObject`] (`Arc<dyn Object>`) and are only
//! constructed through a factory registered with the
//! [`TypeRegistry`](crate::registry::TypeRegistry): the registry hands the
//! factory an [`ObjectBase`] that carries the object's identity, its link to
//! the event hub and the plugin generation that produced it.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::event::EventHub;
use crate::hash::{StringHash, TypeId};
use crate::registry::TypeRegistry;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique object identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(u64);

impl ObjectId {
    fn next() -> Self {
        Self(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj:{}", self.0)
    }
}

/// One load cycle of a plugin module
///
/// Factories registered while a module generation is active are tagged with
/// it, and every object they construct holds a reference to it. Once the
/// module is unloaded the generation is retired: no new instances may be
/// created from its factories, while existing instances stay valid until
/// they are dropped. The loader keeps the module image mapped for as long
/// as any reference to the generation is alive.
#[derive(Debug)]
pub struct Generation {
    id: u64,
    module: String,
    retired: AtomicBool,
}

impl Generation {
    pub fn new(id: u64, module: &str) -> Arc<Self> {
        Arc::new(Self {
            id,
            module: module.to_string(),
            retired: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn retire(&self) {
        if !self.retired.swap(true, Ordering::AcqRel) {
            debug!(module = %self.module, generation = self.id, "Generation retired");
        }
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.module, self.id)
    }
}

/// State shared by every object
///
/// Dropping the base removes every event subscription in which the object
/// is the receiver or the sender, so no handler outlives its target.
pub struct ObjectBase {
    id: ObjectId,
    type_id: TypeId,
    events: Weak<EventHub>,
    generation: Option<Arc<Generation>>,
}

impl ObjectBase {
    pub(crate) fn new(
        type_id: TypeId,
        events: &Arc<EventHub>,
        generation: Option<Arc<Generation>>,
    ) -> Self {
        Self {
            id: ObjectId::next(),
            type_id,
            events: Arc::downgrade(events),
            generation,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Generation of the module whose factory constructed this object
    pub fn generation(&self) -> Option<&Arc<Generation>> {
        self.generation.as_ref()
    }

    /// Event hub this object is attached to, if still alive
    pub fn events(&self) -> Option<Arc<EventHub>> {
        self.events.upgrade()
    }
}

impl fmt::Debug for ObjectBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectBase")
            .field("id", &self.id)
            .field("type_id", &self.type_id)
            .field("generation", &self.generation.as_ref().map(|g| g.id()))
            .finish()
    }
}

impl Drop for ObjectBase {
    fn drop(&mut self) {
        if let Some(events) = self.events.upgrade() {
            events.remove_object(self.id);
        }
    }
}

/// Core object trait
pub trait Object: Any + Send + Sync {
    /// Shared object state
    fn base(&self) -> &ObjectBase;

    /// Convert to Any (for downcasting)
    fn as_any(&self) -> &dyn Any;

    /// Convert a shared object into a shared Any (for downcasting)
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    fn object_id(&self) -> ObjectId {
        self.base().id()
    }

    fn object_type(&self) -> TypeId {
        self.base().type_id()
    }
}

/// Shared, reference-counted object
pub type SharedObject = Arc<dyn Object>;

/// Downcast a shared object to its concrete type
pub fn downcast_object<T: Object>(object: SharedObject) -> Option<Arc<T>> {
    object.into_any_arc().downcast::<T>().ok()
}

/// Type that can be registered through the generic registration helpers
pub trait Registrable: Object + Sized {
    /// Registered type name
    const TYPE_NAME: &'static str;

    /// Stable identifier derived from [`Self::TYPE_NAME`]
    const TYPE_ID: TypeId = StringHash::new(Self::TYPE_NAME);

    /// Construct an instance around the base handed out by the registry
    fn create(base: ObjectBase) -> Self;

    /// Register attribute descriptors for this type
    fn register_attributes(_registry: &TypeRegistry) {}
}

/// Implement [`Object`] for a struct holding its [`ObjectBase`] in a `base` field
#[macro_export]
macro_rules! impl_object {
    ($ty:ty) => {
        impl $crate::object::Object for $ty {
            fn base(&self) -> &$crate::object::ObjectBase {
                &self.base
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }

            fn into_any_arc(
                self: ::std::sync::Arc<Self>,
            ) -> ::std::sync::Arc<dyn ::std::any::Any + Send + Sync> {
                self
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_ids_are_unique() {
        let a = ObjectId::next();
        let b = ObjectId::next();
        assert_ne!(a, b);
        assert!(b.value() > a.value());
    }

    #[test]
    fn test_generation_retire_is_sticky() {
        let generation = Generation::new(3, "gameplay");
        assert!(!generation.is_retired());
        generation.retire();
        generation.retire();
        assert!(generation.is_retired());
        assert_eq!(generation.to_string(), "gameplay@3");
    }
}
