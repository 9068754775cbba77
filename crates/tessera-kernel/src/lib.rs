//! Tessera kernel
//!
//! Core of the cross-runtime object bridge: the type registry and object
//! model, the event hub, attribute descriptors and their reflection from
//! externally defined types, and the handle primitives through which a
//! managed runtime owns native event subscriptions.

// hash module
pub mod hash;
pub use hash::{EventId, StringHash, TypeId};

// variant module
pub mod variant;
pub use variant::{Variant, VariantMap, VariantType};

// object module
pub mod object;
pub use object::{Generation, Object, ObjectBase, ObjectId, Registrable, SharedObject, downcast_object};

// event module
pub mod event;
pub use event::{EventHandler, EventHub, FnEventHandler};

// attribute module
pub mod attribute;
pub use attribute::{AttributeAccessor, AttributeInfo, AttributeMode};

// registry module
pub mod registry;
pub use registry::{FactoryEntry, ObjectFactory, RegistryError, RegistryResult, TypeRegistry};

// managed handle bridge
pub mod handle;
pub mod adapter;
pub use adapter::{EventAdapter, ManagedEventCallback};
pub use handle::{HandleRuntime, ManagedHandle, RawHandle};

// reflection module
pub mod reflection;

// context module
pub mod context;
pub use context::Context;

// error module
pub mod error;
pub use error::{KernelError, KernelResult};

// config module
#[cfg(feature = "config")]
pub mod config;
