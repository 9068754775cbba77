//! Attribute descriptors
//!
//! An attribute pairs metadata (name, variant tag, default, mode) with a
//! type-erased accessor so generic code can read and write a field of an
//! object without knowing its concrete type.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::object::Object;
use crate::variant::{Variant, VariantType};

bitflags! {
    /// Attribute usage flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct AttributeMode: u32 {
        /// Saved and loaded with the object
        const FILE = 0x1;
        /// Replicated over the network
        const NET = 0x2;
        /// Only the latest value matters when replicating
        const LATEST_DATA = 0x4;
        /// Hidden from editors
        const NO_EDIT = 0x8;
    }
}

impl AttributeMode {
    pub const DEFAULT: AttributeMode = AttributeMode::FILE.union(AttributeMode::NET);

    pub fn is_serializable(self) -> bool {
        self.contains(AttributeMode::FILE)
    }

    pub fn is_editable(self) -> bool {
        !self.contains(AttributeMode::NO_EDIT)
    }

    pub fn is_network_synced(self) -> bool {
        self.contains(AttributeMode::NET)
    }
}

impl Default for AttributeMode {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Type-erased get/set pair
pub trait AttributeAccessor: Send + Sync {
    fn get(&self, object: &dyn Object) -> Variant;

    fn set(&self, object: &dyn Object, value: &Variant);
}

/// Accessor built from typed closures
///
/// Objects are shared, so setters go through interior mutability of `T`.
/// Calls on an object of another type are ignored.
pub struct FnAccessor<T, G, S> {
    getter: G,
    setter: S,
    _marker: PhantomData<fn(&T)>,
}

impl<T, G, S> FnAccessor<T, G, S>
where
    T: Object,
    G: Fn(&T) -> Variant + Send + Sync,
    S: Fn(&T, &Variant) + Send + Sync,
{
    pub fn new(getter: G, setter: S) -> Self {
        Self {
            getter,
            setter,
            _marker: PhantomData,
        }
    }
}

impl<T, G, S> AttributeAccessor for FnAccessor<T, G, S>
where
    T: Object,
    G: Fn(&T) -> Variant + Send + Sync,
    S: Fn(&T, &Variant) + Send + Sync,
{
    fn get(&self, object: &dyn Object) -> Variant {
        object
            .as_any()
            .downcast_ref::<T>()
            .map(|target| (self.getter)(target))
            .unwrap_or_default()
    }

    fn set(&self, object: &dyn Object, value: &Variant) {
        if let Some(target) = object.as_any().downcast_ref::<T>() {
            (self.setter)(target, value);
        }
    }
}

/// Attribute descriptor
#[derive(Clone)]
pub struct AttributeInfo {
    pub variant_type: VariantType,
    pub name: String,
    pub accessor: Arc<dyn AttributeAccessor>,
    /// Names of the enumerators for enum-backed attributes, in value order
    pub enum_names: Vec<String>,
    pub default_value: Variant,
    pub mode: AttributeMode,
}

impl AttributeInfo {
    pub fn new(
        variant_type: VariantType,
        name: &str,
        accessor: Arc<dyn AttributeAccessor>,
        default_value: Variant,
    ) -> Self {
        Self {
            variant_type,
            name: name.to_string(),
            accessor,
            enum_names: Vec::new(),
            default_value,
            mode: AttributeMode::DEFAULT,
        }
    }

    /// Descriptor backed by typed closures; the tag comes from the default value
    pub fn with_accessors<T, G, S>(name: &str, default_value: Variant, getter: G, setter: S) -> Self
    where
        T: Object,
        G: Fn(&T) -> Variant + Send + Sync + 'static,
        S: Fn(&T, &Variant) + Send + Sync + 'static,
    {
        Self::new(
            default_value.variant_type(),
            name,
            Arc::new(FnAccessor::new(getter, setter)),
            default_value,
        )
    }

    pub fn with_mode(mut self, mode: AttributeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_enum_names<I, N>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        self.enum_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn get(&self, object: &dyn Object) -> Variant {
        self.accessor.get(object)
    }

    pub fn set(&self, object: &dyn Object, value: &Variant) {
        self.accessor.set(object, value)
    }
}

impl fmt::Debug for AttributeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeInfo")
            .field("variant_type", &self.variant_type)
            .field("name", &self.name)
            .field("enum_names", &self.enum_names)
            .field("default_value", &self.default_value)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}
