//! Type registry
//!
//! Process-wide table mapping a [`TypeId`] to its factory, its attribute
//! descriptors and (optionally) a subsystem singleton. Every mutating call
//! takes the registry-wide write lock for the duration of that call only;
//! factories and attribute accessors always run with the lock released, so
//! user code may call back into the registry.
//!
//! Removal operations are idempotent: teardown paths run them
//! unconditionally, including against partially initialised state.

mod error;

pub use error::{RegistryError, RegistryResult};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use crate::attribute::AttributeInfo;
use crate::event::EventHub;
use crate::hash::{StringHash, TypeId};
use crate::object::{Generation, Object, ObjectBase, Registrable, SharedObject};
use crate::variant::Variant;

/// Object constructor stored in the registry
pub type ObjectFactory = Arc<dyn Fn(ObjectBase) -> SharedObject + Send + Sync>;

/// Factory record
#[derive(Clone)]
pub struct FactoryEntry {
    type_id: TypeId,
    type_name: String,
    factory: ObjectFactory,
    category: Option<String>,
    generation: Option<Arc<Generation>>,
}

impl FactoryEntry {
    pub fn new(type_name: &str, factory: ObjectFactory) -> Self {
        Self {
            type_id: StringHash::new(type_name),
            type_name: type_name.to_string(),
            factory,
            category: None,
            generation: None,
        }
    }

    /// Entry constructing `T` through [`Registrable::create`]
    pub fn of<T: Registrable>() -> Self {
        let factory: ObjectFactory = Arc::new(|base| Arc::new(T::create(base)) as SharedObject);
        Self {
            type_id: T::TYPE_ID,
            type_name: T::TYPE_NAME.to_string(),
            factory,
            category: None,
            generation: None,
        }
    }

    pub fn with_category(mut self, category: Option<&str>) -> Self {
        self.category = category.filter(|c| !c.is_empty()).map(str::to_string);
        self
    }

    pub fn with_generation(mut self, generation: Option<Arc<Generation>>) -> Self {
        self.generation = generation;
        self
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    pub fn generation(&self) -> Option<&Arc<Generation>> {
        self.generation.as_ref()
    }
}

impl fmt::Debug for FactoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryEntry")
            .field("type_id", &self.type_id)
            .field("type_name", &self.type_name)
            .field("category", &self.category)
            .field("generation", &self.generation.as_ref().map(|g| g.id()))
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct RegistryInner {
    factories: HashMap<TypeId, FactoryEntry>,
    categories: BTreeMap<String, Vec<TypeId>>,
    attributes: HashMap<TypeId, Vec<AttributeInfo>>,
    subsystems: HashMap<TypeId, SharedObject>,
}

/// Registry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub factories: usize,
    pub categories: usize,
    pub attributed_types: usize,
    pub attributes: usize,
    pub subsystems: usize,
}

/// Type registry
pub struct TypeRegistry {
    inner: RwLock<RegistryInner>,
    events: Arc<EventHub>,
}

impl TypeRegistry {
    pub fn new(events: Arc<EventHub>) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            events,
        }
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    // ========================================================================
    // Factories
    // ========================================================================

    /// Register a factory
    ///
    /// Fails without touching the registry when the type already has a live
    /// factory.
    pub fn register_factory(&self, entry: FactoryEntry) -> RegistryResult<()> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.factories.get(&entry.type_id) {
            warn!(
                type_id = %entry.type_id,
                type_name = %entry.type_name,
                "Factory already registered"
            );
            return Err(RegistryError::AlreadyRegistered {
                type_id: entry.type_id,
                type_name: existing.type_name.clone(),
            });
        }

        if let Some(category) = &entry.category {
            let members = inner.categories.entry(category.clone()).or_default();
            if !members.contains(&entry.type_id) {
                members.push(entry.type_id);
            }
        }

        debug!(
            type_id = %entry.type_id,
            type_name = %entry.type_name,
            category = entry.category.as_deref().unwrap_or(""),
            "Registered factory"
        );
        inner.factories.insert(entry.type_id, entry);
        Ok(())
    }

    /// Register the factory of `T`
    pub fn register_type<T: Registrable>(&self, category: Option<&str>) -> RegistryResult<()> {
        self.register_factory(FactoryEntry::of::<T>().with_category(category))
    }

    /// Remove a factory; returns whether one was removed
    ///
    /// With a category, the type also leaves that category. Without one, it
    /// leaves the category it was registered under.
    pub fn remove_factory(&self, type_id: TypeId, category: Option<&str>) -> bool {
        let mut inner = self.inner.write();
        let removed = inner.factories.remove(&type_id);
        let category = category
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .or_else(|| removed.as_ref().and_then(|e| e.category.clone()));

        if let Some(category) = category {
            if let Some(members) = inner.categories.get_mut(&category) {
                members.retain(|t| *t != type_id);
                if members.is_empty() {
                    inner.categories.remove(&category);
                }
            }
        }

        match removed {
            Some(entry) => {
                debug!(type_id = %type_id, type_name = %entry.type_name, "Removed factory");
                true
            }
            None => {
                trace!(type_id = %type_id, "No factory to remove");
                false
            }
        }
    }

    pub fn contains(&self, type_id: TypeId) -> bool {
        self.inner.read().factories.contains_key(&type_id)
    }

    pub fn factory(&self, type_id: TypeId) -> Option<FactoryEntry> {
        self.inner.read().factories.get(&type_id).cloned()
    }

    pub fn type_name(&self, type_id: TypeId) -> Option<String> {
        self.inner
            .read()
            .factories
            .get(&type_id)
            .map(|e| e.type_name.clone())
    }

    /// Identifier of a registered type, looked up by name
    pub fn find_type(&self, name: &str) -> Option<TypeId> {
        let type_id = StringHash::new(name);
        self.contains(type_id).then_some(type_id)
    }

    pub fn registered_types(&self) -> Vec<TypeId> {
        self.inner.read().factories.keys().copied().collect()
    }

    pub fn types_in_category(&self, category: &str) -> Vec<TypeId> {
        self.inner
            .read()
            .categories
            .get(category)
            .cloned()
            .unwrap_or_default()
    }

    pub fn categories(&self) -> Vec<String> {
        self.inner.read().categories.keys().cloned().collect()
    }

    /// Construct a new instance of a registered type
    pub fn create_object(&self, type_id: TypeId) -> RegistryResult<SharedObject> {
        let entry = self
            .factory(type_id)
            .ok_or(RegistryError::UnknownType(type_id))?;

        if let Some(generation) = entry.generation.as_ref().filter(|g| g.is_retired()) {
            return Err(RegistryError::RetiredGeneration {
                type_id,
                generation: generation.id(),
            });
        }

        let base = ObjectBase::new(type_id, &self.events, entry.generation.clone());
        let object = (entry.factory)(base);
        trace!(type_id = %type_id, object = %object.object_id(), "Created object");
        Ok(object)
    }

    /// Construct a new instance of `T` and downcast it
    pub fn create<T: Registrable>(&self) -> RegistryResult<Arc<T>> {
        let object = self.create_object(T::TYPE_ID)?;
        crate::object::downcast_object::<T>(object).ok_or(RegistryError::UnknownType(T::TYPE_ID))
    }

    // ========================================================================
    // Attributes
    // ========================================================================

    /// Append an attribute descriptor to a type
    pub fn register_attribute(&self, type_id: TypeId, attribute: AttributeInfo) {
        let mut inner = self.inner.write();
        let attributes = inner.attributes.entry(type_id).or_default();
        if attributes.iter().any(|a| a.name == attribute.name) {
            debug!(type_id = %type_id, name = %attribute.name, "Attribute name registered twice");
        }
        attributes.push(attribute);
    }

    /// Install a full descriptor set unless the type already has attributes
    ///
    /// Check and insert happen under one lock, so concurrent callers racing
    /// to describe the same type install it exactly once. Returns whether
    /// the set was installed.
    pub fn register_attributes_once(&self, type_id: TypeId, attributes: Vec<AttributeInfo>) -> bool {
        if attributes.is_empty() {
            return false;
        }
        let mut inner = self.inner.write();
        let slot = inner.attributes.entry(type_id).or_default();
        if !slot.is_empty() {
            return false;
        }
        *slot = attributes;
        true
    }

    /// Remove one attribute by name; returns whether it existed
    pub fn remove_attribute(&self, type_id: TypeId, name: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(attributes) = inner.attributes.get_mut(&type_id) else {
            return false;
        };
        let before = attributes.len();
        attributes.retain(|a| a.name != name);
        let removed = attributes.len() != before;
        if attributes.is_empty() {
            inner.attributes.remove(&type_id);
        }
        removed
    }

    /// Remove every attribute of a type; returns how many were removed
    pub fn remove_all_attributes(&self, type_id: TypeId) -> usize {
        let removed = self.inner.write().attributes.remove(&type_id);
        let count = removed.as_ref().map_or(0, Vec::len);
        if count > 0 {
            debug!(type_id = %type_id, count, "Removed attributes");
        }
        count
    }

    pub fn has_attributes(&self, type_id: TypeId) -> bool {
        self.inner
            .read()
            .attributes
            .get(&type_id)
            .is_some_and(|a| !a.is_empty())
    }

    pub fn attributes(&self, type_id: TypeId) -> Vec<AttributeInfo> {
        self.inner
            .read()
            .attributes
            .get(&type_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn attribute(&self, type_id: TypeId, name: &str) -> Option<AttributeInfo> {
        self.inner
            .read()
            .attributes
            .get(&type_id)
            .and_then(|attributes| attributes.iter().find(|a| a.name == name).cloned())
    }

    /// Read every serializable attribute of an object
    pub fn save_attributes(&self, object: &dyn Object) -> BTreeMap<String, Variant> {
        self.attributes(object.object_type())
            .into_iter()
            .filter(|a| a.mode.is_serializable())
            .map(|a| {
                let value = a.get(object);
                (a.name, value)
            })
            .collect()
    }

    /// Write serializable attributes from a saved map
    ///
    /// Values whose tag does not match the descriptor are skipped. Returns
    /// how many attributes were written.
    pub fn load_attributes(&self, object: &dyn Object, values: &BTreeMap<String, Variant>) -> usize {
        let mut written = 0;
        for attribute in self.attributes(object.object_type()) {
            if !attribute.mode.is_serializable() {
                continue;
            }
            let Some(value) = values.get(&attribute.name) else {
                continue;
            };
            if value.variant_type() != attribute.variant_type {
                warn!(
                    name = %attribute.name,
                    expected = %attribute.variant_type,
                    actual = %value.variant_type(),
                    "Skipping attribute with mismatched type"
                );
                continue;
            }
            attribute.set(object, value);
            written += 1;
        }
        written
    }

    /// Restore every attribute of an object to its default value
    pub fn reset_to_default(&self, object: &dyn Object) {
        for attribute in self.attributes(object.object_type()) {
            attribute.set(object, &attribute.default_value);
        }
    }

    // ========================================================================
    // Subsystems
    // ========================================================================

    /// Register an existing object as the subsystem for its type
    pub fn register_subsystem(&self, object: SharedObject) -> Option<SharedObject> {
        let type_id = object.object_type();
        let previous = self.inner.write().subsystems.insert(type_id, object);
        info!(type_id = %type_id, replaced = previous.is_some(), "Registered subsystem");
        previous
    }

    /// Create the subsystem for a registered type through its factory
    pub fn register_subsystem_type(&self, type_id: TypeId) -> RegistryResult<SharedObject> {
        let object = self.create_object(type_id)?;
        self.register_subsystem(object.clone());
        Ok(object)
    }

    /// Remove a subsystem; returns whether one was removed
    pub fn remove_subsystem(&self, type_id: TypeId) -> bool {
        let removed = self.inner.write().subsystems.remove(&type_id);
        let existed = removed.is_some();
        if existed {
            debug!(type_id = %type_id, "Removed subsystem");
        }
        // Drop outside the lock: destructors may raise events or call back in.
        drop(removed);
        existed
    }

    pub fn subsystem(&self, type_id: TypeId) -> Option<SharedObject> {
        self.inner.read().subsystems.get(&type_id).cloned()
    }

    pub fn has_subsystem(&self, type_id: TypeId) -> bool {
        self.inner.read().subsystems.contains_key(&type_id)
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.read();
        RegistryStats {
            factories: inner.factories.len(),
            categories: inner.categories.len(),
            attributed_types: inner.attributes.len(),
            attributes: inner.attributes.values().map(Vec::len).sum(),
            subsystems: inner.subsystems.len(),
        }
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
